use serde_json::{json, Value};
use uuid::Uuid;

use crate::translate::models::map_finish_to_stop_reason;

/// Translate a non-streaming internal (OpenAI-shaped) chat completion into
/// an Anthropic Messages response.
pub fn openai_to_anthropic(response: &Value, requested_model: &str) -> Value {
    let choice = response
        .pointer("/choices/0")
        .cloned()
        .unwrap_or_else(|| json!({}));
    let message = choice.get("message").cloned().unwrap_or_else(|| json!({}));

    let mut content: Vec<Value> = Vec::new();

    if let Some(thinking) = message.get("reasoning_content").and_then(|r| r.as_str()) {
        if !thinking.is_empty() {
            content.push(json!({"type": "thinking", "thinking": thinking, "signature": ""}));
        }
    }

    match message.get("content") {
        Some(Value::String(text)) if !text.is_empty() => {
            content.push(json!({"type": "text", "text": text}));
        }
        Some(Value::Array(parts)) => {
            for part in parts {
                if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
                    content.push(json!({"type": "text", "text": text}));
                }
            }
        }
        _ => {}
    }

    if let Some(calls) = message.get("tool_calls").and_then(|t| t.as_array()) {
        for call in calls {
            let input: Value = call
                .pointer("/function/arguments")
                .and_then(|a| a.as_str())
                .and_then(|s| serde_json::from_str(s).ok())
                .unwrap_or_else(|| json!({}));
            content.push(json!({
                "type": "tool_use",
                "id": call
                    .get("id")
                    .and_then(|v| v.as_str())
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("toolu_{}", Uuid::new_v4().simple())),
                "name": call.pointer("/function/name").and_then(|v| v.as_str()).unwrap_or(""),
                "input": input,
            }));
        }
    }

    let finish = choice
        .get("finish_reason")
        .and_then(|f| f.as_str())
        .unwrap_or("stop");

    let usage = response.get("usage");
    let input_tokens = usage
        .and_then(|u| u.get("prompt_tokens"))
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let output_tokens = usage
        .and_then(|u| u.get("completion_tokens"))
        .and_then(|v| v.as_u64())
        .unwrap_or(0);

    json!({
        "id": response
            .get("id")
            .and_then(|v| v.as_str())
            .map(|id| id.replace("chatcmpl-", "msg_"))
            .unwrap_or_else(|| format!("msg_{}", Uuid::new_v4().simple())),
        "type": "message",
        "role": "assistant",
        "model": requested_model,
        "content": content,
        "stop_reason": map_finish_to_stop_reason(finish),
        "stop_sequence": null,
        "usage": {
            "input_tokens": input_tokens,
            "output_tokens": output_tokens,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_and_reasoning_become_blocks() {
        let response = json!({
            "id": "chatcmpl-abc",
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": "final answer",
                    "reasoning_content": "step by step",
                },
                "finish_reason": "stop",
            }],
            "usage": {"prompt_tokens": 10, "completion_tokens": 20},
        });

        let out = openai_to_anthropic(&response, "anthropic/claude-x");
        assert_eq!(out["id"], "msg_abc");
        assert_eq!(out["content"][0]["type"], "thinking");
        assert_eq!(out["content"][0]["thinking"], "step by step");
        assert_eq!(out["content"][1]["type"], "text");
        assert_eq!(out["content"][1]["text"], "final answer");
        assert_eq!(out["stop_reason"], "end_turn");
        assert_eq!(out["usage"]["input_tokens"], 10);
        assert_eq!(out["usage"]["output_tokens"], 20);
    }

    #[test]
    fn tool_calls_become_tool_use_with_parsed_arguments() {
        let response = json!({
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": {"name": "get_weather", "arguments": "{\"city\":\"Paris\"}"},
                    }],
                },
                "finish_reason": "tool_calls",
            }],
        });

        let out = openai_to_anthropic(&response, "m");
        assert_eq!(out["content"][0]["type"], "tool_use");
        assert_eq!(out["content"][0]["name"], "get_weather");
        assert_eq!(out["content"][0]["input"]["city"], "Paris");
        assert_eq!(out["stop_reason"], "tool_use");
    }

    #[test]
    fn length_maps_to_max_tokens() {
        let response = json!({
            "choices": [{"message": {"content": "cut off"}, "finish_reason": "length"}],
        });
        let out = openai_to_anthropic(&response, "m");
        assert_eq!(out["stop_reason"], "max_tokens");
    }

    #[test]
    fn malformed_tool_arguments_degrade_to_empty_input() {
        let response = json!({
            "choices": [{
                "message": {
                    "tool_calls": [{
                        "id": "call_1",
                        "function": {"name": "f", "arguments": "not json"},
                    }],
                },
                "finish_reason": "tool_calls",
            }],
        });
        let out = openai_to_anthropic(&response, "m");
        assert_eq!(out["content"][0]["input"], json!({}));
    }
}
