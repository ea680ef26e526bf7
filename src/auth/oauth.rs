use serde::Deserialize;
use tracing::{debug, warn};

use crate::constants::REFRESH_BACKOFF_SECS;
use crate::error::{GatewayError, GatewayResult};

#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub expires_in: i64,
    #[serde(default)]
    pub token_type: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub id_token: Option<String>,
}

/// Exchange a refresh token at the provider's token endpoint.
///
/// Retries transient failures up to three times with exponential backoff and
/// honors `Retry-After` on 429. A 400 `invalid_grant` or a 401/403 means the
/// grant is dead and the credential needs interactive re-authorization.
pub async fn refresh_access_token(
    client: &reqwest::Client,
    token_uri: &str,
    refresh_token: &str,
    credential_id: &str,
) -> GatewayResult<TokenResponse> {
    let params = [
        ("grant_type", "refresh_token"),
        ("refresh_token", refresh_token),
    ];

    let mut last_error: Option<GatewayError> = None;
    let attempts = REFRESH_BACKOFF_SECS.len();

    for (attempt, backoff_secs) in REFRESH_BACKOFF_SECS.iter().enumerate() {
        let last_attempt = attempt + 1 == attempts;
        let response = match client.post(token_uri).form(&params).send().await {
            Ok(r) => r,
            Err(e) => {
                warn!(
                    "[Refresh] attempt {} network failure for {}: {}",
                    attempt + 1,
                    credential_id,
                    e
                );
                last_error = Some(e.into());
                if !last_attempt {
                    tokio::time::sleep(std::time::Duration::from_secs(*backoff_secs)).await;
                }
                continue;
            }
        };

        let status = response.status();
        if status.is_success() {
            let token = response.json::<TokenResponse>().await?;
            debug!("[Refresh] token refreshed for {}", credential_id);
            return Ok(token);
        }

        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        let body = response.text().await.unwrap_or_default();

        if status.as_u16() == 400 && body.contains("invalid_grant") {
            return Err(GatewayError::NeedsReauth(credential_id.to_string()));
        }
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(GatewayError::NeedsReauth(credential_id.to_string()));
        }

        let wait_secs = if status.as_u16() == 429 {
            retry_after.unwrap_or(*backoff_secs)
        } else {
            *backoff_secs
        };
        warn!(
            "[Refresh] attempt {} failed for {} ({}): {}",
            attempt + 1,
            credential_id,
            status,
            body.chars().take(200).collect::<String>()
        );
        last_error = Some(GatewayError::Config(format!(
            "token refresh failed ({}): {}",
            status, body
        )));
        if !last_attempt {
            tokio::time::sleep(std::time::Duration::from_secs(wait_secs)).await;
        }
    }

    Err(last_error
        .unwrap_or_else(|| GatewayError::Config("token refresh exhausted retries".to_string())))
}
