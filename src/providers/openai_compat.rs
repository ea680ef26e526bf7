use async_trait::async_trait;
use serde_json::Value;

use crate::dispatch::classify;
use crate::error::{GatewayError, GatewayResult, UpstreamError};
use crate::providers::{
    NormalizedRequest, ProviderAdapter, ProviderCall, RequestKind, RotationMode, StreamFrame,
};
use crate::store::credentials::CredentialRecord;
use crate::usage::types::{ResetMode, TierPolicy};

/// Static-key adapter for OpenAI-compatible upstreams. Requests and
/// responses pass through in the internal dialect; only auth and error
/// shapes need handling.
pub struct OpenAiCompatAdapter {
    base_url: String,
}

impl OpenAiCompatAdapter {
    pub fn new() -> Self {
        let base_url = std::env::var("OPENAI_BASE_URL")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| "https://api.openai.com/v1".to_string());
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

impl Default for OpenAiCompatAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProviderAdapter for OpenAiCompatAdapter {
    fn tag(&self) -> &'static str {
        "openai"
    }

    fn models(&self) -> Vec<String> {
        [
            "gpt-4o",
            "gpt-4o-mini",
            "gpt-4.1",
            "gpt-4.1-mini",
            "o4-mini",
            "text-embedding-3-small",
            "text-embedding-3-large",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }

    fn rotation_mode(&self) -> RotationMode {
        RotationMode::Balanced
    }

    fn credential_tier(&self, _record: &CredentialRecord) -> u8 {
        // API keys are indistinguishable from the outside; one tier.
        1
    }

    fn tier_policy(&self, _tier: u8) -> TierPolicy {
        TierPolicy {
            // Minute-granular provider limits; a rolling minute window.
            reset: ResetMode::PerModel { window_secs: 60 },
            concurrency_multiplier: 4,
        }
    }

    fn max_concurrent(&self) -> u32 {
        4
    }

    fn pricing(&self, model: &str) -> Option<(f64, f64)> {
        match model {
            "gpt-4o" => Some((2.50, 10.00)),
            "gpt-4o-mini" => Some((0.15, 0.60)),
            "gpt-4.1" => Some((2.00, 8.00)),
            "gpt-4.1-mini" => Some((0.40, 1.60)),
            "o4-mini" => Some((1.10, 4.40)),
            "text-embedding-3-small" => Some((0.02, 0.0)),
            "text-embedding-3-large" => Some((0.13, 0.0)),
            _ => None,
        }
    }

    fn build_request(
        &self,
        request: &NormalizedRequest,
        _record: &CredentialRecord,
        auth_header: &str,
    ) -> GatewayResult<ProviderCall> {
        let path = match request.kind {
            RequestKind::Chat => "/chat/completions",
            RequestKind::Embedding => "/embeddings",
        };
        let mut body = request.body.clone();
        let obj = body
            .as_object_mut()
            .ok_or_else(|| GatewayError::InvalidRequest("request body must be an object".into()))?;
        obj.insert("model".to_string(), Value::String(request.model.clone()));
        if request.streaming {
            obj.insert("stream".to_string(), Value::Bool(true));
        } else {
            obj.remove("stream");
        }

        Ok(ProviderCall {
            url: format!("{}{}", self.base_url, path),
            headers: vec![
                ("Authorization".to_string(), auth_header.to_string()),
                ("Content-Type".to_string(), "application/json".to_string()),
            ],
            body,
        })
    }

    fn parse_response(&self, status: u16, body: &str) -> Result<Value, UpstreamError> {
        if (200..300).contains(&status) {
            return serde_json::from_str(body).map_err(|e| {
                UpstreamError::new(
                    crate::dispatch::classify::ErrorKind::ServerError,
                    Some(status),
                    format!("unparseable upstream response: {}", e),
                )
            });
        }
        let hint = self.parse_quota_error(status, None, body);
        Err(classify::classify_http(status, body, hint.reset_at, hint.had_hint))
    }

    fn streams_internal_dialect(&self) -> bool {
        true
    }

    fn parse_stream_frame(&self, data: &str) -> StreamFrame {
        let trimmed = data.trim();
        if trimmed == "[DONE]" {
            return StreamFrame::Done;
        }
        match serde_json::from_str::<Value>(trimmed) {
            Ok(json) => {
                if json.get("error").is_some() {
                    let message = json
                        .get("error")
                        .and_then(|e| e.get("message"))
                        .and_then(|m| m.as_str())
                        .unwrap_or("upstream stream error")
                        .to_string();
                    let mut error = classify::classify_http(500, &message, None, false);
                    error.streamed = true;
                    return StreamFrame::Error(error);
                }
                StreamFrame::Chunk(json)
            }
            Err(_) => StreamFrame::Skip,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::credentials::{CredentialKind, ProxyMetadata};
    use serde_json::json;

    fn record() -> CredentialRecord {
        CredentialRecord {
            provider: "openai".into(),
            kind: CredentialKind::StaticKey,
            id: "env://openai/0".into(),
            oauth: None,
            api_key: Some("sk-test".into()),
            metadata: ProxyMetadata::default(),
        }
    }

    fn chat_request(streaming: bool) -> NormalizedRequest {
        NormalizedRequest {
            provider: "openai".into(),
            model: "gpt-4o".into(),
            kind: RequestKind::Chat,
            body: json!({
                "model": "openai/gpt-4o",
                "messages": [{"role": "user", "content": "hi"}]
            }),
            streaming,
        }
    }

    #[test]
    fn chat_request_targets_completions_with_bare_model() {
        let adapter = OpenAiCompatAdapter::new();
        let call = adapter
            .build_request(&chat_request(false), &record(), "Bearer sk-test")
            .unwrap();

        assert!(call.url.ends_with("/chat/completions"));
        assert_eq!(call.body["model"], "gpt-4o");
        assert!(call.body.get("stream").is_none());
        assert!(call
            .headers
            .iter()
            .any(|(k, v)| k == "Authorization" && v == "Bearer sk-test"));
    }

    #[test]
    fn streaming_flag_is_set_on_wire() {
        let adapter = OpenAiCompatAdapter::new();
        let call = adapter
            .build_request(&chat_request(true), &record(), "Bearer sk-test")
            .unwrap();
        assert_eq!(call.body["stream"], true);
    }

    #[test]
    fn error_response_is_classified() {
        let adapter = OpenAiCompatAdapter::new();
        let err = adapter
            .parse_response(401, r#"{"error":{"message":"bad key"}}"#)
            .unwrap_err();
        assert_eq!(err.kind, crate::dispatch::classify::ErrorKind::Authentication);
        assert_eq!(err.message, "bad key");
    }

    #[test]
    fn stream_frames_parse_done_error_and_chunks() {
        let adapter = OpenAiCompatAdapter::new();
        assert!(matches!(adapter.parse_stream_frame("[DONE]"), StreamFrame::Done));
        assert!(matches!(
            adapter.parse_stream_frame(r#"{"error":{"message":"mid-stream"}}"#),
            StreamFrame::Error(_)
        ));
        assert!(matches!(
            adapter.parse_stream_frame(r#"{"choices":[{"delta":{"content":"x"}}]}"#),
            StreamFrame::Chunk(_)
        ));
        assert!(matches!(adapter.parse_stream_frame("not json"), StreamFrame::Skip));
    }
}
