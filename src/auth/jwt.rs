use base64::Engine as _;
use serde_json::Value;

// Metadata extraction only. The tokens are validated by the upstream's own
// trust anchor; no signature check happens here.

/// Decode the payload segment of a JWT without verification.
pub fn decode_payload(token: &str) -> Option<Value> {
    let payload = token.split('.').nth(1)?;
    let decoded = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .ok()?;
    serde_json::from_slice(&decoded).ok()
}

pub fn extract_email(claims: &Value) -> Option<String> {
    claims
        .get("email")
        .or_else(|| claims.get("https://api.openai.com/profile").and_then(|p| p.get("email")))
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

pub fn extract_account_id(claims: &Value) -> Option<String> {
    claims
        .get("account_id")
        .or_else(|| {
            claims
                .get("https://api.openai.com/auth")
                .and_then(|a| a.get("chatgpt_account_id"))
        })
        .or_else(|| claims.get("sub"))
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// `exp` claim converted to milliseconds.
pub fn extract_expiry_millis(claims: &Value) -> Option<i64> {
    claims.get("exp").and_then(|v| v.as_i64()).map(|s| s * 1000)
}
