use bytes::Bytes;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::streaming::BytesStream;
use crate::translate::models::map_finish_to_stop_reason;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockType {
    None,
    Text,
    Thinking,
    Tool,
}

/// Converts internal (OpenAI-shaped) delta chunks into the Anthropic event
/// sequence: `message_start`, then content blocks opened and closed as the
/// delta kinds change, then `message_delta` + `message_stop`.
///
/// Block indices are tracked here; tool-call argument fragments are forwarded
/// as `input_json_delta` events against the open tool block.
pub struct AnthropicStreamState {
    block_type: BlockType,
    block_index: usize,
    message_start_sent: bool,
    message_stop_sent: bool,
    /// OpenAI tool-call index currently streaming into the open tool block.
    open_tool_index: Option<u64>,
    finish_reason: Option<String>,
    input_tokens: u64,
    output_tokens: u64,
    message_id: String,
    model: String,
}

impl AnthropicStreamState {
    pub fn new(model: &str) -> Self {
        Self {
            block_type: BlockType::None,
            block_index: 0,
            message_start_sent: false,
            message_stop_sent: false,
            open_tool_index: None,
            finish_reason: None,
            input_tokens: 0,
            output_tokens: 0,
            message_id: format!("msg_{}", Uuid::new_v4().simple()),
            model: model.to_string(),
        }
    }

    fn emit(&self, event_type: &str, data: Value) -> Bytes {
        Bytes::from(format!(
            "event: {}\ndata: {}\n\n",
            event_type,
            serde_json::to_string(&data).unwrap_or_default()
        ))
    }

    fn emit_message_start(&mut self) -> Option<Bytes> {
        if self.message_start_sent {
            return None;
        }
        self.message_start_sent = true;
        Some(self.emit(
            "message_start",
            json!({
                "type": "message_start",
                "message": {
                    "id": self.message_id,
                    "type": "message",
                    "role": "assistant",
                    "model": self.model,
                    "content": [],
                    "stop_reason": null,
                    "stop_sequence": null,
                    "usage": {"input_tokens": 0, "output_tokens": 0},
                },
            }),
        ))
    }

    fn start_block(&mut self, block_type: BlockType, content_block: Value) -> Vec<Bytes> {
        let mut out = Vec::new();
        out.extend(self.end_block());
        out.push(self.emit(
            "content_block_start",
            json!({
                "type": "content_block_start",
                "index": self.block_index,
                "content_block": content_block,
            }),
        ));
        self.block_type = block_type;
        out
    }

    fn end_block(&mut self) -> Vec<Bytes> {
        if self.block_type == BlockType::None {
            return Vec::new();
        }
        let event = self.emit(
            "content_block_stop",
            json!({"type": "content_block_stop", "index": self.block_index}),
        );
        self.block_type = BlockType::None;
        self.block_index += 1;
        self.open_tool_index = None;
        vec![event]
    }

    fn delta_event(&self, delta: Value) -> Bytes {
        self.emit(
            "content_block_delta",
            json!({
                "type": "content_block_delta",
                "index": self.block_index,
                "delta": delta,
            }),
        )
    }

    /// Fold one normalized chunk into the event stream.
    pub fn process_chunk(&mut self, chunk: &Value) -> Vec<Bytes> {
        let mut out = Vec::new();
        if let Some(start) = self.emit_message_start() {
            out.push(start);
        }

        if let Some(usage) = chunk.get("usage") {
            if let Some(prompt) = usage.get("prompt_tokens").and_then(|v| v.as_u64()) {
                self.input_tokens = self.input_tokens.max(prompt);
            }
            if let Some(completion) = usage.get("completion_tokens").and_then(|v| v.as_u64()) {
                self.output_tokens = self.output_tokens.max(completion);
            }
        }

        let Some(choice) = chunk.pointer("/choices/0") else {
            return out;
        };
        if let Some(finish) = choice.get("finish_reason").and_then(|f| f.as_str()) {
            self.finish_reason = Some(finish.to_string());
        }
        let Some(delta) = choice.get("delta") else {
            return out;
        };

        if let Some(thinking) = delta.get("reasoning_content").and_then(|r| r.as_str()) {
            if !thinking.is_empty() {
                if self.block_type != BlockType::Thinking {
                    out.extend(self.start_block(
                        BlockType::Thinking,
                        json!({"type": "thinking", "thinking": ""}),
                    ));
                }
                out.push(self.delta_event(json!({"type": "thinking_delta", "thinking": thinking})));
            }
        }

        if let Some(text) = delta.get("content").and_then(|c| c.as_str()) {
            if !text.is_empty() {
                if self.block_type != BlockType::Text {
                    out.extend(
                        self.start_block(BlockType::Text, json!({"type": "text", "text": ""})),
                    );
                }
                out.push(self.delta_event(json!({"type": "text_delta", "text": text})));
            }
        }

        if let Some(calls) = delta.get("tool_calls").and_then(|t| t.as_array()) {
            for call in calls {
                let index = call.get("index").and_then(|i| i.as_u64()).unwrap_or(0);
                let is_new = self.block_type != BlockType::Tool || self.open_tool_index != Some(index);
                if is_new {
                    let block = json!({
                        "type": "tool_use",
                        "id": call
                            .get("id")
                            .and_then(|v| v.as_str())
                            .map(str::to_string)
                            .unwrap_or_else(|| format!("toolu_{}", Uuid::new_v4().simple())),
                        "name": call.pointer("/function/name").and_then(|v| v.as_str()).unwrap_or(""),
                        "input": {},
                    });
                    out.extend(self.start_block(BlockType::Tool, block));
                    self.open_tool_index = Some(index);
                }
                if let Some(fragment) = call
                    .pointer("/function/arguments")
                    .and_then(|a| a.as_str())
                    .filter(|s| !s.is_empty())
                {
                    out.push(self.delta_event(json!({
                        "type": "input_json_delta",
                        "partial_json": fragment,
                    })));
                }
            }
        }

        out
    }

    /// Close any open block and terminate the message.
    pub fn finish(&mut self) -> Vec<Bytes> {
        if self.message_stop_sent {
            return Vec::new();
        }
        let mut out = Vec::new();
        if let Some(start) = self.emit_message_start() {
            out.push(start);
        }
        out.extend(self.end_block());

        let stop_reason = self
            .finish_reason
            .as_deref()
            .map(map_finish_to_stop_reason)
            .unwrap_or("end_turn");
        out.push(self.emit(
            "message_delta",
            json!({
                "type": "message_delta",
                "delta": {"stop_reason": stop_reason, "stop_sequence": null},
                "usage": {"input_tokens": self.input_tokens, "output_tokens": self.output_tokens},
            }),
        ));
        out.push(self.emit("message_stop", json!({"type": "message_stop"})));
        self.message_stop_sent = true;
        out
    }

    /// Surface a mid-stream failure as an Anthropic error event.
    pub fn error_event(&self, error_type: &str, message: &str) -> Bytes {
        self.emit(
            "error",
            json!({"type": "error", "error": {"type": error_type, "message": message}}),
        )
    }
}

/// Wrap an internal SSE byte stream into the Anthropic event wire format.
pub fn to_anthropic_stream(mut internal: BytesStream, model: String) -> BytesStream {
    use futures::StreamExt;

    let stream = async_stream::stream! {
        let mut state = AnthropicStreamState::new(&model);
        let mut buffer = bytes::BytesMut::new();

        while let Some(item) = internal.next().await {
            match item {
                Ok(bytes) => {
                    buffer.extend_from_slice(&bytes);
                    while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
                        let line_raw = buffer.split_to(pos + 1);
                        let Ok(line) = std::str::from_utf8(&line_raw) else { continue };
                        let line = line.trim();
                        let Some(payload) = line.strip_prefix("data:") else { continue };
                        let payload = payload.trim();
                        if payload == "[DONE]" {
                            for event in state.finish() {
                                yield Ok(event);
                            }
                            return;
                        }
                        if let Ok(chunk) = serde_json::from_str::<Value>(payload) {
                            for event in state.process_chunk(&chunk) {
                                yield Ok(event);
                            }
                        }
                    }
                }
                Err(error) => {
                    yield Ok(state.error_event("api_error", &error.message));
                    for event in state.finish() {
                        yield Ok(event);
                    }
                    return;
                }
            }
        }
        for event in state.finish() {
            yield Ok(event);
        }
    };
    Box::pin(stream)
}
