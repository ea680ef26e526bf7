use serde::Serialize;

use crate::error::UpstreamError;

/// Failure taxonomy driving retry, rotation and cooldown policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// 401/403 or OAuth invalid_grant.
    Authentication,
    /// 429 carrying a retry hint that did not resolve to an authoritative reset.
    RateLimit,
    /// 429/403 with an authoritative reset timestamp.
    Quota,
    /// Bare 429 with no hint at all.
    TransientQuota,
    /// 5xx, connection reset, empty-response sentinel.
    ServerError,
    Timeout,
    /// 400 with context/size error text.
    ContextLength,
    /// Provider safety refusal.
    ContentFilter,
    /// 404 model/endpoint.
    NotFound,
    Unknown,
}

impl ErrorKind {
    /// May the executor retry the same credential (deadline permitting)?
    pub fn retry_same_credential(&self) -> bool {
        matches!(
            self,
            ErrorKind::ServerError | ErrorKind::Timeout | ErrorKind::TransientQuota | ErrorKind::Unknown
        )
    }

    /// Should the executor rotate to another credential after this failure?
    pub fn rotate(&self) -> bool {
        !matches!(
            self,
            ErrorKind::ContextLength | ErrorKind::ContentFilter | ErrorKind::NotFound
        )
    }

    /// Non-retryable failures surface to the client immediately.
    pub fn surface_immediately(&self) -> bool {
        matches!(
            self,
            ErrorKind::ContextLength | ErrorKind::ContentFilter | ErrorKind::NotFound
        )
    }

    /// Conventional client-facing HTTP status.
    pub fn http_status(&self) -> u16 {
        match self {
            ErrorKind::Authentication => 401,
            ErrorKind::RateLimit | ErrorKind::Quota | ErrorKind::TransientQuota => 429,
            ErrorKind::ContextLength | ErrorKind::ContentFilter => 400,
            ErrorKind::NotFound => 404,
            ErrorKind::Timeout => 504,
            ErrorKind::ServerError | ErrorKind::Unknown => 503,
        }
    }
}

/// Classify an upstream HTTP failure. `reset_at` is the authoritative reset
/// the adapter parsed from the body, when there was one; `had_retry_hint`
/// distinguishes a hinted 429 from a bare one.
pub fn classify_http(
    status: u16,
    body: &str,
    reset_at: Option<i64>,
    had_retry_hint: bool,
) -> UpstreamError {
    let lower = body.to_ascii_lowercase();
    let kind = match status {
        401 | 403 if reset_at.is_none() => ErrorKind::Authentication,
        403 => ErrorKind::Quota,
        429 if reset_at.is_some() => ErrorKind::Quota,
        429 if had_retry_hint => ErrorKind::RateLimit,
        429 => ErrorKind::TransientQuota,
        404 => ErrorKind::NotFound,
        400 if is_context_length_text(&lower) => ErrorKind::ContextLength,
        400 if is_content_filter_text(&lower) => ErrorKind::ContentFilter,
        500..=599 => ErrorKind::ServerError,
        _ if is_content_filter_text(&lower) => ErrorKind::ContentFilter,
        _ => ErrorKind::Unknown,
    };
    UpstreamError::new(kind, Some(status), trim_message(body)).with_reset(reset_at)
}

/// Classify a transport-level failure from reqwest.
pub fn classify_transport(error: &reqwest::Error) -> UpstreamError {
    let kind = if error.is_timeout() {
        ErrorKind::Timeout
    } else if error.is_connect() || error.is_body() || error.is_decode() {
        ErrorKind::ServerError
    } else {
        ErrorKind::Unknown
    };
    UpstreamError::new(kind, error.status().map(|s| s.as_u16()), error.to_string())
}

fn is_context_length_text(lower: &str) -> bool {
    lower.contains("context length")
        || lower.contains("context window")
        || lower.contains("maximum context")
        || lower.contains("too many tokens")
        || lower.contains("prompt is too long")
        || lower.contains("request too large")
}

fn is_content_filter_text(lower: &str) -> bool {
    lower.contains("content_filter")
        || lower.contains("content policy")
        || lower.contains("safety")
        || lower.contains("blocked by")
        || lower.contains("prohibited")
}

fn trim_message(body: &str) -> String {
    // Prefer the provider's own message when the body is an error envelope.
    if let Ok(json) = serde_json::from_str::<serde_json::Value>(body) {
        if let Some(message) = json
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(|m| m.as_str())
        {
            return message.chars().take(500).collect();
        }
    }
    body.chars().take(500).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hinted_429_is_rate_limit_bare_is_transient() {
        assert_eq!(
            classify_http(429, "slow down, retry in 5s", None, true).kind,
            ErrorKind::RateLimit
        );
        assert_eq!(
            classify_http(429, "too many requests", None, false).kind,
            ErrorKind::TransientQuota
        );
    }

    #[test]
    fn authoritative_reset_promotes_to_quota() {
        let error = classify_http(429, "quota exceeded", Some(99_000), true);
        assert_eq!(error.kind, ErrorKind::Quota);
        assert_eq!(error.reset_at, Some(99_000));
    }

    #[test]
    fn auth_statuses_classify_as_authentication() {
        assert_eq!(
            classify_http(401, "token expired", None, false).kind,
            ErrorKind::Authentication
        );
        assert_eq!(
            classify_http(403, "permission denied", None, false).kind,
            ErrorKind::Authentication
        );
        // 403 carrying a reset is a quota signal, not an auth one.
        assert_eq!(
            classify_http(403, "quota", Some(5_000), false).kind,
            ErrorKind::Quota
        );
    }

    #[test]
    fn context_and_filter_texts_are_terminal() {
        let context = classify_http(400, "This model's maximum context length is 8192", None, false);
        assert_eq!(context.kind, ErrorKind::ContextLength);
        assert!(!context.kind.rotate());

        let filtered = classify_http(400, "rejected by content policy", None, false);
        assert_eq!(filtered.kind, ErrorKind::ContentFilter);
        assert!(filtered.kind.surface_immediately());
    }

    #[test]
    fn server_errors_retry_and_rotate() {
        let error = classify_http(503, "overloaded", None, false);
        assert_eq!(error.kind, ErrorKind::ServerError);
        assert!(error.kind.retry_same_credential());
        assert!(error.kind.rotate());
        assert_eq!(error.kind.http_status(), 503);
    }

    #[test]
    fn provider_message_is_preserved() {
        let body = r#"{"error":{"message":"quota exceeded for project 123","code":429}}"#;
        let error = classify_http(429, body, None, false);
        assert_eq!(error.message, "quota exceeded for project 123");
    }
}
