use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::dispatch::classify;
use crate::error::{GatewayError, GatewayResult, UpstreamError};
use crate::providers::{
    BackgroundJob, NormalizedRequest, ProviderAdapter, ProviderCall, RequestKind, RotationMode,
    StreamFrame,
};
use crate::store::credentials::CredentialRecord;
use crate::usage::types::{ResetMode, TierPolicy};
use crate::usage::UsageManager;

const PRO_GROUP: &str = "gemini-pro";

/// OAuth adapter for the Google code-assist endpoint family. Translates the
/// internal dialect into `contents`/`systemInstruction` form and understands
/// `google.rpc` quota error envelopes.
pub struct GoogleOauthAdapter {
    base_url: String,
}

impl GoogleOauthAdapter {
    pub fn new() -> Self {
        let base_url = std::env::var("GEMINI_CLI_BASE_URL")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| "https://cloudcode-pa.googleapis.com/v1internal".to_string());
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// OpenAI messages -> google `contents` + `systemInstruction`.
    fn to_google_body(&self, request: &NormalizedRequest) -> GatewayResult<Value> {
        let messages = request
            .body
            .get("messages")
            .and_then(|m| m.as_array())
            .ok_or_else(|| GatewayError::InvalidRequest("messages array required".into()))?;

        let mut system_parts: Vec<Value> = Vec::new();
        let mut contents: Vec<Value> = Vec::new();

        for message in messages {
            let role = message.get("role").and_then(|r| r.as_str()).unwrap_or("user");
            let text = flatten_content(message.get("content"));

            match role {
                "system" => {
                    if !text.is_empty() {
                        system_parts.push(json!({"text": text}));
                    }
                }
                "assistant" => {
                    let mut parts: Vec<Value> = Vec::new();
                    if !text.is_empty() {
                        parts.push(json!({"text": text}));
                    }
                    if let Some(calls) = message.get("tool_calls").and_then(|t| t.as_array()) {
                        for call in calls {
                            let name = call
                                .pointer("/function/name")
                                .and_then(|v| v.as_str())
                                .unwrap_or("unknown");
                            let args: Value = call
                                .pointer("/function/arguments")
                                .and_then(|v| v.as_str())
                                .and_then(|s| serde_json::from_str(s).ok())
                                .unwrap_or_else(|| json!({}));
                            parts.push(json!({"functionCall": {"name": name, "args": args}}));
                        }
                    }
                    if !parts.is_empty() {
                        contents.push(json!({"role": "model", "parts": parts}));
                    }
                }
                "tool" => {
                    let name = message
                        .get("name")
                        .and_then(|v| v.as_str())
                        .unwrap_or("tool");
                    contents.push(json!({
                        "role": "user",
                        "parts": [{"functionResponse": {"name": name, "response": {"result": text}}}]
                    }));
                }
                _ => {
                    contents.push(json!({"role": "user", "parts": [{"text": text}]}));
                }
            }
        }

        let mut body = json!({"contents": contents});
        if !system_parts.is_empty() {
            body["systemInstruction"] = json!({"parts": system_parts});
        }

        let mut generation_config = serde_json::Map::new();
        if let Some(t) = request.body.get("temperature").and_then(|v| v.as_f64()) {
            generation_config.insert("temperature".into(), json!(t));
        }
        if let Some(m) = request.body.get("max_tokens").and_then(|v| v.as_u64()) {
            generation_config.insert("maxOutputTokens".into(), json!(m));
        }
        if let Some(p) = request.body.get("top_p").and_then(|v| v.as_f64()) {
            generation_config.insert("topP".into(), json!(p));
        }
        if !generation_config.is_empty() {
            body["generationConfig"] = Value::Object(generation_config);
        }

        if let Some(tools) = request.body.get("tools").and_then(|t| t.as_array()) {
            let declarations: Vec<Value> = tools
                .iter()
                .filter_map(|tool| {
                    let function = tool.get("function")?;
                    Some(json!({
                        "name": function.get("name")?,
                        "description": function.get("description").cloned().unwrap_or(Value::Null),
                        "parameters": function.get("parameters").cloned().unwrap_or_else(|| json!({})),
                    }))
                })
                .collect();
            if !declarations.is_empty() {
                body["tools"] = json!([{"functionDeclarations": declarations}]);
            }
        }

        Ok(body)
    }

    /// One google candidate frame -> normalized chunk delta.
    fn candidate_to_delta(candidate: &Value) -> (Value, Option<String>) {
        let mut delta = serde_json::Map::new();
        let mut text = String::new();
        let mut thought = String::new();
        let mut tool_calls: Vec<Value> = Vec::new();

        if let Some(parts) = candidate.pointer("/content/parts").and_then(|p| p.as_array()) {
            for part in parts {
                let is_thought = part.get("thought").and_then(|v| v.as_bool()).unwrap_or(false);
                if let Some(t) = part.get("text").and_then(|t| t.as_str()) {
                    if is_thought {
                        thought.push_str(t);
                    } else {
                        text.push_str(t);
                    }
                }
                if let Some(call) = part.get("functionCall") {
                    let name = call.get("name").and_then(|v| v.as_str()).unwrap_or("unknown");
                    let args = call.get("args").cloned().unwrap_or_else(|| json!({}));
                    tool_calls.push(json!({
                        "index": tool_calls.len(),
                        "id": format!("call_{}", uuid::Uuid::new_v4().simple()),
                        "type": "function",
                        "function": {
                            "name": name,
                            "arguments": serde_json::to_string(&args).unwrap_or_default(),
                        }
                    }));
                }
            }
        }

        if !text.is_empty() {
            delta.insert("content".into(), json!(text));
        }
        if !thought.is_empty() {
            delta.insert("reasoning_content".into(), json!(thought));
        }
        if !tool_calls.is_empty() {
            delta.insert("role".into(), json!("assistant"));
            delta.insert("tool_calls".into(), Value::Array(tool_calls));
        }

        let finish_reason = candidate
            .get("finishReason")
            .and_then(|f| f.as_str())
            .map(map_finish_reason);
        (Value::Object(delta), finish_reason)
    }
}

fn map_finish_reason(reason: &str) -> String {
    match reason {
        "STOP" => "stop",
        "MAX_TOKENS" => "length",
        "SAFETY" | "RECITATION" => "content_filter",
        other => other,
    }
    .to_ascii_lowercase()
}

fn flatten_content(content: Option<&Value>) -> String {
    match content {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join(""),
        _ => String::new(),
    }
}

fn usage_from_metadata(metadata: &Value) -> Value {
    let prompt = metadata
        .get("promptTokenCount")
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let completion = metadata
        .get("candidatesTokenCount")
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    json!({
        "prompt_tokens": prompt,
        "completion_tokens": completion,
        "total_tokens": metadata.get("totalTokenCount").and_then(|v| v.as_u64()).unwrap_or(prompt + completion),
    })
}

impl Default for GoogleOauthAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProviderAdapter for GoogleOauthAdapter {
    fn tag(&self) -> &'static str {
        "gemini_cli"
    }

    fn models(&self) -> Vec<String> {
        [
            "gemini-2.5-pro",
            "gemini-2.5-pro-thinking",
            "gemini-2.5-flash",
            "gemini-2.5-flash-lite",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }

    fn rotation_mode(&self) -> RotationMode {
        RotationMode::Sequential
    }

    fn credential_tier(&self, record: &CredentialRecord) -> u8 {
        let tier = record
            .oauth
            .as_ref()
            .and_then(|o| o.tier.as_deref())
            .unwrap_or("")
            .to_ascii_lowercase();
        if tier.contains("ultra") || tier.contains("pro") {
            1
        } else {
            2
        }
    }

    fn tier_policy(&self, tier: u8) -> TierPolicy {
        match tier {
            1 => TierPolicy {
                reset: ResetMode::PerModel { window_secs: 3600 },
                concurrency_multiplier: 3,
            },
            // Free accounts reset daily at 07:00 UTC.
            _ => TierPolicy {
                reset: ResetMode::Daily { utc_hour: 7 },
                concurrency_multiplier: 1,
            },
        }
    }

    fn min_tier_for_model(&self, model: &str) -> Option<u8> {
        match model {
            "gemini-2.5-pro-thinking" => Some(1),
            _ => None,
        }
    }

    fn quota_groups(&self) -> Vec<(String, Vec<String>)> {
        vec![(
            PRO_GROUP.to_string(),
            vec![
                "gemini-2.5-pro".to_string(),
                "gemini-2.5-pro-thinking".to_string(),
            ],
        )]
    }

    fn max_concurrent(&self) -> u32 {
        2
    }

    fn pricing(&self, model: &str) -> Option<(f64, f64)> {
        match model {
            "gemini-2.5-pro" | "gemini-2.5-pro-thinking" => Some((1.25, 10.00)),
            "gemini-2.5-flash" => Some((0.30, 2.50)),
            "gemini-2.5-flash-lite" => Some((0.10, 0.40)),
            _ => None,
        }
    }

    fn build_request(
        &self,
        request: &NormalizedRequest,
        record: &CredentialRecord,
        auth_header: &str,
    ) -> GatewayResult<ProviderCall> {
        if request.kind != RequestKind::Chat {
            return Err(GatewayError::InvalidRequest(
                "gemini_cli only serves chat requests".into(),
            ));
        }
        let inner = self.to_google_body(request)?;
        let method = if request.streaming {
            ":streamGenerateContent?alt=sse"
        } else {
            ":generateContent"
        };

        let mut headers = vec![
            ("Authorization".to_string(), auth_header.to_string()),
            ("Content-Type".to_string(), "application/json".to_string()),
        ];
        if let Some(account_id) = &record.metadata.account_id {
            headers.push(("X-Goog-Account-Id".to_string(), account_id.clone()));
        }

        let project = record
            .oauth
            .as_ref()
            .and_then(|o| o.project_id.clone())
            .unwrap_or_default();

        Ok(ProviderCall {
            url: format!("{}{}", self.base_url, method),
            headers,
            body: json!({
                "model": request.model,
                "project": project,
                "request": inner,
            }),
        })
    }

    fn parse_response(&self, status: u16, body: &str) -> Result<Value, UpstreamError> {
        if !(200..300).contains(&status) {
            let hint = self.parse_quota_error(status, None, body);
            return Err(classify::classify_http(
                status,
                body,
                hint.reset_at,
                hint.had_hint,
            ));
        }

        let mut json: Value = serde_json::from_str(body).map_err(|e| {
            UpstreamError::new(
                classify::ErrorKind::ServerError,
                Some(status),
                format!("unparseable upstream response: {}", e),
            )
        })?;
        let actual = if let Some(inner) = json.get_mut("response").map(|v| v.take()) {
            inner
        } else {
            json
        };

        let Some(candidate) = actual
            .get("candidates")
            .and_then(|c| c.as_array())
            .and_then(|c| c.first())
        else {
            return Err(UpstreamError::new(
                classify::ErrorKind::ServerError,
                Some(status),
                "empty candidates in upstream response",
            ));
        };
        let (delta, finish_reason) = Self::candidate_to_delta(candidate);

        let mut message = json!({"role": "assistant"});
        if let Some(content) = delta.get("content") {
            message["content"] = content.clone();
        } else {
            message["content"] = Value::Null;
        }
        if let Some(reasoning) = delta.get("reasoning_content") {
            message["reasoning_content"] = reasoning.clone();
        }
        if let Some(tool_calls) = delta.get("tool_calls") {
            message["tool_calls"] = tool_calls.clone();
        }

        let mut out = json!({
            "id": actual.get("responseId").cloned().unwrap_or_else(|| json!(format!("chatcmpl-{}", uuid::Uuid::new_v4()))),
            "object": "chat.completion",
            "created": chrono::Utc::now().timestamp(),
            "model": actual.get("modelVersion").cloned().unwrap_or(Value::Null),
            "choices": [{
                "index": 0,
                "message": message,
                "finish_reason": finish_reason.unwrap_or_else(|| "stop".to_string()),
            }],
        });
        if let Some(metadata) = actual.get("usageMetadata") {
            out["usage"] = usage_from_metadata(metadata);
        }
        Ok(out)
    }

    fn parse_stream_frame(&self, data: &str) -> StreamFrame {
        let trimmed = data.trim();
        if trimmed == "[DONE]" {
            return StreamFrame::Done;
        }
        let Ok(mut json) = serde_json::from_str::<Value>(trimmed) else {
            return StreamFrame::Skip;
        };
        let actual = if let Some(inner) = json.get_mut("response").map(|v| v.take()) {
            inner
        } else {
            json
        };

        if let Some(error) = actual.get("error") {
            let status = error.get("code").and_then(|c| c.as_u64()).unwrap_or(500) as u16;
            let body = error.to_string();
            let hint = self.parse_quota_error(status, None, &format!("{{\"error\":{}}}", body));
            let mut err = classify::classify_http(status, &body, hint.reset_at, hint.had_hint);
            err.streamed = true;
            return StreamFrame::Error(err);
        }

        let Some(candidate) = actual
            .get("candidates")
            .and_then(|c| c.as_array())
            .and_then(|c| c.first())
        else {
            // Usage-only trailer frames still carry metadata worth forwarding.
            if let Some(metadata) = actual.get("usageMetadata") {
                return StreamFrame::Chunk(json!({
                    "object": "chat.completion.chunk",
                    "choices": [],
                    "usage": usage_from_metadata(metadata),
                }));
            }
            return StreamFrame::Skip;
        };

        let (delta, finish_reason) = Self::candidate_to_delta(candidate);
        let mut chunk = json!({
            "object": "chat.completion.chunk",
            "choices": [{
                "index": 0,
                "delta": delta,
                "finish_reason": finish_reason,
            }],
        });
        if let Some(metadata) = actual.get("usageMetadata") {
            chunk["usage"] = usage_from_metadata(metadata);
        }
        StreamFrame::Chunk(chunk)
    }

    fn background_job(&self) -> Option<BackgroundJob> {
        Some(BackgroundJob {
            name: "quota_baseline",
            interval_secs: 600,
            run_on_start: true,
        })
    }

    async fn run_background_job(
        &self,
        credentials: &[CredentialRecord],
        usage: &UsageManager,
        http: &reqwest::Client,
    ) -> GatewayResult<()> {
        for record in credentials {
            let Some(oauth) = record.oauth.as_ref() else {
                continue;
            };
            let response = http
                .post(format!("{}:loadCodeAssist", self.base_url))
                .bearer_auth(&oauth.access_token)
                .json(&json!({"metadata": {"pluginType": "GEMINI"}}))
                .send()
                .await;
            let Ok(response) = response else {
                debug!("[Baseline] fetch failed for {}", record.display_name());
                continue;
            };
            if !response.status().is_success() {
                debug!(
                    "[Baseline] {} returned {} for {}",
                    self.base_url,
                    response.status(),
                    record.display_name()
                );
                continue;
            }
            let Ok(payload) = response.json::<Value>().await else {
                continue;
            };
            if let Some(models) = payload.get("quotas").and_then(|q| q.as_array()) {
                for entry in models {
                    let Some(model) = entry.get("model").and_then(|m| m.as_str()) else {
                        continue;
                    };
                    let remaining = entry
                        .get("remainingFraction")
                        .and_then(|v| v.as_f64())
                        .unwrap_or(1.0);
                    let max_requests = entry.get("maxRequests").and_then(|v| v.as_u64());
                    usage
                        .set_quota_baseline(&record.id, model, remaining, max_requests)
                        .await;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::credentials::{CredentialKind, OAuthTokens, ProxyMetadata};

    fn record(tier: Option<&str>) -> CredentialRecord {
        CredentialRecord {
            provider: "gemini_cli".into(),
            kind: CredentialKind::OAuth,
            id: "env://gemini_cli/0".into(),
            oauth: Some(OAuthTokens {
                access_token: "at".into(),
                refresh_token: "rt".into(),
                id_token: None,
                expiry_date: 4_102_444_800_000,
                token_uri: "https://oauth2.googleapis.com/token".into(),
                project_id: Some("proj-1".into()),
                tier: tier.map(str::to_string),
            }),
            api_key: None,
            metadata: ProxyMetadata {
                account_id: Some("acct-9".into()),
                ..Default::default()
            },
        }
    }

    fn request(streaming: bool) -> NormalizedRequest {
        NormalizedRequest {
            provider: "gemini_cli".into(),
            model: "gemini-2.5-pro".into(),
            kind: RequestKind::Chat,
            body: json!({
                "messages": [
                    {"role": "system", "content": "be terse"},
                    {"role": "user", "content": "hello"},
                ],
                "temperature": 0.5,
                "max_tokens": 256,
            }),
            streaming,
        }
    }

    #[test]
    fn messages_become_contents_with_system_instruction() {
        let adapter = GoogleOauthAdapter::new();
        let call = adapter
            .build_request(&request(false), &record(Some("PRO")), "Bearer at")
            .unwrap();

        assert!(call.url.ends_with(":generateContent"));
        let inner = &call.body["request"];
        assert_eq!(inner["systemInstruction"]["parts"][0]["text"], "be terse");
        assert_eq!(inner["contents"][0]["role"], "user");
        assert_eq!(inner["contents"][0]["parts"][0]["text"], "hello");
        assert_eq!(inner["generationConfig"]["maxOutputTokens"], 256);
        assert_eq!(call.body["project"], "proj-1");
        assert!(call
            .headers
            .iter()
            .any(|(k, v)| k == "X-Goog-Account-Id" && v == "acct-9"));
    }

    #[test]
    fn streaming_uses_sse_endpoint() {
        let adapter = GoogleOauthAdapter::new();
        let call = adapter
            .build_request(&request(true), &record(None), "Bearer at")
            .unwrap();
        assert!(call.url.ends_with(":streamGenerateContent?alt=sse"));
    }

    #[test]
    fn tier_assignment_follows_subscription() {
        let adapter = GoogleOauthAdapter::new();
        assert_eq!(adapter.credential_tier(&record(Some("ULTRA"))), 1);
        assert_eq!(adapter.credential_tier(&record(Some("PRO"))), 1);
        assert_eq!(adapter.credential_tier(&record(Some("FREE"))), 2);
        assert_eq!(adapter.credential_tier(&record(None)), 2);
    }

    #[test]
    fn response_normalizes_to_internal_dialect() {
        let adapter = GoogleOauthAdapter::new();
        let body = json!({
            "response": {
                "responseId": "resp-1",
                "modelVersion": "gemini-2.5-pro",
                "candidates": [{
                    "content": {"parts": [{"text": "hi there"}]},
                    "finishReason": "STOP",
                }],
                "usageMetadata": {"promptTokenCount": 12, "candidatesTokenCount": 4},
            }
        })
        .to_string();

        let parsed = adapter.parse_response(200, &body).unwrap();
        assert_eq!(parsed["choices"][0]["message"]["content"], "hi there");
        assert_eq!(parsed["choices"][0]["finish_reason"], "stop");
        assert_eq!(parsed["usage"]["prompt_tokens"], 12);
        assert_eq!(parsed["usage"]["completion_tokens"], 4);
    }

    #[test]
    fn quota_error_carries_authoritative_reset() {
        let adapter = GoogleOauthAdapter::new();
        let body = r#"{"error":{"message":"quota","details":[{"@type":"type.googleapis.com/google.rpc.RetryInfo","retryDelay":"3600s"}]}}"#;
        let err = adapter.parse_response(429, body).unwrap_err();
        assert_eq!(err.kind, classify::ErrorKind::Quota);
        assert!(err.reset_at.is_some());
    }

    #[test]
    fn stream_frame_maps_parts_and_finish() {
        let adapter = GoogleOauthAdapter::new();
        let frame = json!({
            "candidates": [{
                "content": {"parts": [
                    {"text": "thinking...", "thought": true},
                    {"text": "answer"},
                ]},
                "finishReason": "MAX_TOKENS",
            }]
        })
        .to_string();

        match adapter.parse_stream_frame(&frame) {
            StreamFrame::Chunk(chunk) => {
                let delta = &chunk["choices"][0]["delta"];
                assert_eq!(delta["content"], "answer");
                assert_eq!(delta["reasoning_content"], "thinking...");
                assert_eq!(chunk["choices"][0]["finish_reason"], "length");
            }
            other => panic!("expected chunk, got {:?}", other),
        }
    }

    #[test]
    fn mid_stream_error_frame_is_detected() {
        let adapter = GoogleOauthAdapter::new();
        let frame = r#"{"error":{"code":429,"message":"quota exhausted"}}"#;
        match adapter.parse_stream_frame(frame) {
            StreamFrame::Error(err) => assert!(err.streamed),
            other => panic!("expected error, got {:?}", other),
        }
    }

    #[test]
    fn tool_declarations_are_translated() {
        let adapter = GoogleOauthAdapter::new();
        let mut req = request(false);
        req.body["tools"] = json!([{
            "type": "function",
            "function": {
                "name": "get_weather",
                "description": "weather lookup",
                "parameters": {"type": "object", "properties": {"city": {"type": "string"}}},
            }
        }]);
        let call = adapter.build_request(&req, &record(None), "Bearer at").unwrap();
        let decl = &call.body["request"]["tools"][0]["functionDeclarations"][0];
        assert_eq!(decl["name"], "get_weather");
        assert_eq!(decl["parameters"]["properties"]["city"]["type"], "string");
    }
}
