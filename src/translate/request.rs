use serde_json::{json, Map, Value};

use crate::error::{GatewayError, GatewayResult};
use crate::translate::models::{
    AnthropicMessage, AnthropicMessagesRequest, AnthropicTool, ThinkingConfig,
};

/// Translate an Anthropic Messages request into the internal OpenAI-shaped
/// chat body. The `model` field is carried through untouched; the caller
/// splits the provider prefix.
pub fn anthropic_to_openai(request: &AnthropicMessagesRequest) -> GatewayResult<Value> {
    let mut messages: Vec<Value> = Vec::new();

    if let Some(system) = &request.system {
        let text = flatten_system(system);
        if !text.is_empty() {
            messages.push(json!({"role": "system", "content": text}));
        }
    }

    for message in &request.messages {
        translate_message(message, &mut messages)?;
    }

    let mut body = Map::new();
    body.insert("model".into(), json!(request.model));
    body.insert("messages".into(), Value::Array(messages));
    body.insert("max_tokens".into(), json!(request.max_tokens));
    if let Some(t) = request.temperature {
        body.insert("temperature".into(), json!(t));
    }
    if let Some(p) = request.top_p {
        body.insert("top_p".into(), json!(p));
    }
    if !request.stop_sequences.is_empty() {
        body.insert("stop".into(), json!(request.stop_sequences));
    }
    if request.stream {
        body.insert("stream".into(), json!(true));
    }

    if let Some(tools) = &request.tools {
        let translated: Vec<Value> = tools.iter().map(translate_tool).collect();
        if !translated.is_empty() {
            body.insert("tools".into(), Value::Array(translated));
        }
    }
    if let Some(choice) = &request.tool_choice {
        if let Some(mapped) = translate_tool_choice(choice) {
            body.insert("tool_choice".into(), mapped);
        }
    }
    if let Some(thinking) = &request.thinking {
        if let Some(effort) = thinking_to_effort(thinking) {
            body.insert("reasoning_effort".into(), json!(effort));
        }
    }

    Ok(Value::Object(body))
}

fn translate_message(message: &AnthropicMessage, out: &mut Vec<Value>) -> GatewayResult<()> {
    let role = message.role.as_str();
    match &message.content {
        Value::String(text) => {
            out.push(json!({"role": role, "content": text}));
            Ok(())
        }
        Value::Array(blocks) => {
            let mut content_parts: Vec<Value> = Vec::new();
            let mut tool_calls: Vec<Value> = Vec::new();
            let mut tool_results: Vec<Value> = Vec::new();

            for block in blocks {
                match block.get("type").and_then(|t| t.as_str()) {
                    Some("text") => {
                        content_parts.push(json!({
                            "type": "text",
                            "text": block.get("text").and_then(|t| t.as_str()).unwrap_or(""),
                        }));
                    }
                    Some("image") => {
                        let media_type = block
                            .pointer("/source/media_type")
                            .and_then(|v| v.as_str())
                            .unwrap_or("image/png");
                        let data = block
                            .pointer("/source/data")
                            .and_then(|v| v.as_str())
                            .unwrap_or("");
                        content_parts.push(json!({
                            "type": "image_url",
                            "image_url": {"url": format!("data:{};base64,{}", media_type, data)},
                        }));
                    }
                    Some("tool_use") => {
                        tool_calls.push(json!({
                            "id": block.get("id").and_then(|v| v.as_str()).unwrap_or(""),
                            "type": "function",
                            "function": {
                                "name": block.get("name").and_then(|v| v.as_str()).unwrap_or(""),
                                "arguments": serde_json::to_string(
                                    block.get("input").unwrap_or(&json!({}))
                                )
                                .unwrap_or_default(),
                            },
                        }));
                    }
                    Some("tool_result") => {
                        tool_results.push(json!({
                            "role": "tool",
                            "tool_call_id": block
                                .get("tool_use_id")
                                .and_then(|v| v.as_str())
                                .unwrap_or(""),
                            "content": flatten_tool_result(block.get("content")),
                        }));
                    }
                    Some("thinking") => {
                        // Thinking blocks are provider output; on the way up
                        // they become assistant reasoning context.
                        if let Some(text) = block.get("thinking").and_then(|t| t.as_str()) {
                            content_parts.push(json!({"type": "text", "text": text}));
                        }
                    }
                    _ => {
                        return Err(GatewayError::InvalidRequest(format!(
                            "unsupported content block type: {}",
                            block.get("type").and_then(|t| t.as_str()).unwrap_or("?")
                        )));
                    }
                }
            }

            // Tool results stand alone as `tool` role messages.
            if !tool_results.is_empty() {
                out.extend(tool_results);
            }
            if !content_parts.is_empty() || !tool_calls.is_empty() {
                let mut entry = Map::new();
                entry.insert("role".into(), json!(role));
                entry.insert("content".into(), simplify_parts(content_parts));
                if !tool_calls.is_empty() {
                    entry.insert("tool_calls".into(), Value::Array(tool_calls));
                }
                out.push(Value::Object(entry));
            }
            Ok(())
        }
        _ => Err(GatewayError::InvalidRequest(
            "message content must be a string or block array".into(),
        )),
    }
}

/// A single text part collapses to a plain string; anything richer keeps the
/// parts array.
fn simplify_parts(parts: Vec<Value>) -> Value {
    if parts.is_empty() {
        return Value::Null;
    }
    if parts.len() == 1 {
        if let Some("text") = parts[0].get("type").and_then(|t| t.as_str()) {
            return parts[0].get("text").cloned().unwrap_or(Value::Null);
        }
    }
    Value::Array(parts)
}

fn translate_tool(tool: &AnthropicTool) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": tool.name,
            "description": tool.description.clone().unwrap_or_default(),
            "parameters": tool.input_schema,
        },
    })
}

fn translate_tool_choice(choice: &Value) -> Option<Value> {
    match choice.get("type").and_then(|t| t.as_str())? {
        "auto" => Some(json!("auto")),
        "any" => Some(json!("required")),
        "none" => Some(json!("none")),
        "tool" => {
            let name = choice.get("name").and_then(|n| n.as_str())?;
            Some(json!({"type": "function", "function": {"name": name}}))
        }
        _ => None,
    }
}

fn thinking_to_effort(thinking: &ThinkingConfig) -> Option<&'static str> {
    if thinking.kind != "enabled" {
        return None;
    }
    Some(match thinking.budget_tokens.unwrap_or(0) {
        0..=4095 => "low",
        4096..=16383 => "medium",
        _ => "high",
    })
}

fn flatten_system(system: &Value) -> String {
    match system {
        Value::String(s) => s.clone(),
        Value::Array(blocks) => blocks
            .iter()
            .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

fn flatten_tool_result(content: Option<&Value>) -> String {
    match content {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(blocks)) => blocks
            .iter()
            .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join(""),
        _ => String::new(),
    }
}

/// Inverse direction: an internal OpenAI-shaped body back into an Anthropic
/// Messages request. Used for round-trip verification and the reverse
/// surface.
pub fn openai_to_anthropic(body: &Value) -> GatewayResult<AnthropicMessagesRequest> {
    let model = body
        .get("model")
        .and_then(|m| m.as_str())
        .unwrap_or_default()
        .to_string();
    let mut system: Option<Value> = None;
    let mut messages: Vec<AnthropicMessage> = Vec::new();

    let source = body
        .get("messages")
        .and_then(|m| m.as_array())
        .ok_or_else(|| GatewayError::InvalidRequest("messages array required".into()))?;

    let mut pending_tool_results: Vec<Value> = Vec::new();
    for message in source {
        let role = message.get("role").and_then(|r| r.as_str()).unwrap_or("user");
        match role {
            "system" => {
                let text = message
                    .get("content")
                    .and_then(|c| c.as_str())
                    .unwrap_or_default();
                system = Some(json!(text));
            }
            "tool" => {
                pending_tool_results.push(json!({
                    "type": "tool_result",
                    "tool_use_id": message
                        .get("tool_call_id")
                        .and_then(|v| v.as_str())
                        .unwrap_or(""),
                    "content": message.get("content").cloned().unwrap_or(json!("")),
                }));
            }
            _ => {
                if !pending_tool_results.is_empty() {
                    messages.push(AnthropicMessage {
                        role: "user".into(),
                        content: Value::Array(std::mem::take(&mut pending_tool_results)),
                    });
                }
                messages.push(AnthropicMessage {
                    role: role.to_string(),
                    content: openai_content_to_blocks(message),
                });
            }
        }
    }
    if !pending_tool_results.is_empty() {
        messages.push(AnthropicMessage {
            role: "user".into(),
            content: Value::Array(pending_tool_results),
        });
    }

    let tools = body.get("tools").and_then(|t| t.as_array()).map(|tools| {
        tools
            .iter()
            .filter_map(|tool| {
                let function = tool.get("function")?;
                Some(crate::translate::models::AnthropicTool {
                    name: function.get("name")?.as_str()?.to_string(),
                    description: function
                        .get("description")
                        .and_then(|d| d.as_str())
                        .filter(|d| !d.is_empty())
                        .map(str::to_string),
                    input_schema: function.get("parameters").cloned().unwrap_or(json!({})),
                })
            })
            .collect::<Vec<_>>()
    });

    let tool_choice = body.get("tool_choice").map(|choice| match choice {
        Value::String(s) => match s.as_str() {
            "required" => json!({"type": "any"}),
            "none" => json!({"type": "none"}),
            _ => json!({"type": "auto"}),
        },
        other => {
            let name = other
                .pointer("/function/name")
                .and_then(|n| n.as_str())
                .unwrap_or("");
            json!({"type": "tool", "name": name})
        }
    });

    Ok(AnthropicMessagesRequest {
        model,
        messages,
        system,
        max_tokens: body.get("max_tokens").and_then(|v| v.as_u64()).unwrap_or(4096),
        temperature: body.get("temperature").and_then(|v| v.as_f64()),
        top_p: body.get("top_p").and_then(|v| v.as_f64()),
        stop_sequences: body
            .get("stop")
            .and_then(|s| s.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default(),
        stream: body.get("stream").and_then(|v| v.as_bool()).unwrap_or(false),
        tools,
        tool_choice,
        thinking: None,
        metadata: None,
    })
}

fn openai_content_to_blocks(message: &Value) -> Value {
    let mut blocks: Vec<Value> = Vec::new();
    match message.get("content") {
        Some(Value::String(text)) => {
            if !text.is_empty() {
                blocks.push(json!({"type": "text", "text": text}));
            }
        }
        Some(Value::Array(parts)) => {
            for part in parts {
                match part.get("type").and_then(|t| t.as_str()) {
                    Some("text") => blocks.push(json!({
                        "type": "text",
                        "text": part.get("text").and_then(|t| t.as_str()).unwrap_or(""),
                    })),
                    Some("image_url") => {
                        let url = part
                            .pointer("/image_url/url")
                            .and_then(|u| u.as_str())
                            .unwrap_or("");
                        if let Some((meta, data)) = url
                            .strip_prefix("data:")
                            .and_then(|rest| rest.split_once(";base64,"))
                        {
                            blocks.push(json!({
                                "type": "image",
                                "source": {
                                    "type": "base64",
                                    "media_type": meta,
                                    "data": data,
                                },
                            }));
                        }
                    }
                    _ => {}
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
            blocks.push(json!({
                "type": "tool_use",
                "id": call.get("id").and_then(|v| v.as_str()).unwrap_or(""),
                "name": call.pointer("/function/name").and_then(|v| v.as_str()).unwrap_or(""),
                "input": input,
            }));
        }
    }

    if blocks.len() == 1 && blocks[0].get("type").and_then(|t| t.as_str()) == Some("text") {
        return blocks[0].get("text").cloned().unwrap_or(Value::Null);
    }
    Value::Array(blocks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn base_request() -> AnthropicMessagesRequest {
        serde_json::from_value(json!({
            "model": "openai/gpt-4o",
            "max_tokens": 512,
            "temperature": 0.7,
            "system": "You are terse.",
            "messages": [
                {"role": "user", "content": "What's the weather in Paris?"},
            ],
            "tools": [{
                "name": "get_weather",
                "description": "Look up weather",
                "input_schema": {"type": "object", "properties": {"city": {"type": "string"}}},
            }],
            "tool_choice": {"type": "any"},
        }))
        .unwrap()
    }

    #[test]
    fn system_becomes_leading_system_message() {
        let body = anthropic_to_openai(&base_request()).unwrap();
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[0]["content"], "You are terse.");
        assert_eq!(messages[1]["role"], "user");
    }

    #[test]
    fn tools_and_tool_choice_map_to_openai_forms() {
        let body = anthropic_to_openai(&base_request()).unwrap();
        assert_eq!(body["tools"][0]["type"], "function");
        assert_eq!(body["tools"][0]["function"]["name"], "get_weather");
        assert_eq!(
            body["tools"][0]["function"]["parameters"]["properties"]["city"]["type"],
            "string"
        );
        // any -> required
        assert_eq!(body["tool_choice"], "required");
    }

    #[test]
    fn named_tool_choice_maps_to_function_selector() {
        let mut request = base_request();
        request.tool_choice = Some(json!({"type": "tool", "name": "get_weather"}));
        let body = anthropic_to_openai(&request).unwrap();
        assert_eq!(
            body["tool_choice"],
            json!({"type": "function", "function": {"name": "get_weather"}})
        );
    }

    #[test]
    fn tool_use_and_result_round_through_roles() {
        let request: AnthropicMessagesRequest = serde_json::from_value(json!({
            "model": "openai/gpt-4o",
            "max_tokens": 128,
            "messages": [
                {"role": "user", "content": "weather?"},
                {"role": "assistant", "content": [
                    {"type": "tool_use", "id": "toolu_1", "name": "get_weather", "input": {"city": "Paris"}},
                ]},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "toolu_1", "content": "22C, clear"},
                ]},
            ],
        }))
        .unwrap();

        let body = anthropic_to_openai(&request).unwrap();
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages[1]["tool_calls"][0]["function"]["name"], "get_weather");
        assert_eq!(
            messages[1]["tool_calls"][0]["function"]["arguments"],
            "{\"city\":\"Paris\"}"
        );
        assert_eq!(messages[2]["role"], "tool");
        assert_eq!(messages[2]["tool_call_id"], "toolu_1");
        assert_eq!(messages[2]["content"], "22C, clear");
    }

    #[test]
    fn image_blocks_become_data_urls() {
        let request: AnthropicMessagesRequest = serde_json::from_value(json!({
            "model": "openai/gpt-4o",
            "max_tokens": 128,
            "messages": [
                {"role": "user", "content": [
                    {"type": "text", "text": "what is this?"},
                    {"type": "image", "source": {"type": "base64", "media_type": "image/jpeg", "data": "QUJD"}},
                ]},
            ],
        }))
        .unwrap();

        let body = anthropic_to_openai(&request).unwrap();
        let parts = body["messages"][0]["content"].as_array().unwrap();
        assert_eq!(parts[1]["type"], "image_url");
        assert_eq!(
            parts[1]["image_url"]["url"],
            "data:image/jpeg;base64,QUJD"
        );
    }

    #[test]
    fn thinking_maps_to_reasoning_effort() {
        let mut request = base_request();
        request.thinking = Some(ThinkingConfig {
            kind: "enabled".into(),
            budget_tokens: Some(20_000),
        });
        let body = anthropic_to_openai(&request).unwrap();
        assert_eq!(body["reasoning_effort"], "high");

        request.thinking = Some(ThinkingConfig {
            kind: "disabled".into(),
            budget_tokens: None,
        });
        let body = anthropic_to_openai(&request).unwrap();
        assert!(body.get("reasoning_effort").is_none());
    }

    #[test]
    fn round_trip_preserves_common_fields() {
        // Property: for requests using only features common to both
        // dialects, A -> OpenAI -> A' is structurally stable on messages,
        // tools, tool_choice, model, temperature, max_tokens.
        let original = base_request();
        let openai = anthropic_to_openai(&original).unwrap();
        let back = openai_to_anthropic(&openai).unwrap();

        assert_eq!(back.model, original.model);
        assert_eq!(back.max_tokens, original.max_tokens);
        assert_eq!(back.temperature, original.temperature);
        assert_eq!(back.system, Some(json!("You are terse.")));
        assert_eq!(back.messages.len(), original.messages.len());
        assert_eq!(back.messages[0].role, "user");
        assert_eq!(back.messages[0].content, original.messages[0].content);

        let tools = back.tools.as_ref().unwrap();
        let original_tools = original.tools.as_ref().unwrap();
        assert_eq!(tools[0].name, original_tools[0].name);
        assert_eq!(tools[0].input_schema, original_tools[0].input_schema);
        assert_eq!(back.tool_choice, original.tool_choice);
    }
}
