use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::StreamExt;
use serde_json::{json, Value};
use tokio::time::{Duration, Instant};

use crate::dispatch::executor::ExecuteResponse;
use crate::engine::Engine;
use crate::error::GatewayError;
use crate::providers::{NormalizedRequest, RequestKind};
use crate::server::errors::{to_response, ErrorDialect};
use crate::streaming::BytesStream;
use crate::translate::models::{AnthropicCountTokensRequest, AnthropicMessagesRequest};

fn deadline_for(engine: &Engine) -> Instant {
    Instant::now() + Duration::from_secs(engine.config.proxy.global_timeout_secs)
}

/// Build an SSE response body from the internal byte stream, rendering a
/// terminal error as a final error frame instead of a broken connection.
fn sse_response(stream: BytesStream, dialect: ErrorDialect) -> Response {
    let body_stream = stream.map(move |item| match item {
        Ok(bytes) => Ok::<_, std::convert::Infallible>(bytes),
        Err(error) => {
            let frame = match dialect {
                ErrorDialect::OpenAi => format!(
                    "data: {}\n\n",
                    json!({"error": {"message": error.message, "type": "upstream_error", "code": error.kind.http_status()}})
                ),
                ErrorDialect::Anthropic => format!(
                    "event: error\ndata: {}\n\n",
                    json!({"type": "error", "error": {"type": "api_error", "message": error.message}})
                ),
            };
            Ok(bytes::Bytes::from(frame))
        }
    });

    Response::builder()
        .header("Content-Type", "text/event-stream")
        .header("Cache-Control", "no-cache")
        .header("Connection", "keep-alive")
        .header("X-Accel-Buffering", "no")
        .body(Body::from_stream(body_stream))
        .unwrap()
}

pub async fn chat_completions(
    State(engine): State<Arc<Engine>>,
    Json(body): Json<Value>,
) -> Response {
    let wire_model = body
        .get("model")
        .and_then(|m| m.as_str())
        .unwrap_or_default()
        .to_string();
    let (provider, model) = match engine.split_model(&wire_model) {
        Ok(split) => split,
        Err(e) => return to_response(&e, ErrorDialect::OpenAi),
    };
    let streaming = body.get("stream").and_then(|s| s.as_bool()).unwrap_or(false);

    let request = NormalizedRequest {
        provider,
        model,
        kind: RequestKind::Chat,
        body,
        streaming,
    };

    match engine.executor.execute(request, deadline_for(&engine)).await {
        Ok(ExecuteResponse::Json(mut value)) => {
            // The client asked for the wire id; give it back unchanged.
            value["model"] = json!(wire_model);
            Json(value).into_response()
        }
        Ok(ExecuteResponse::Stream(stream)) => sse_response(stream, ErrorDialect::OpenAi),
        Err(e) => to_response(&e, ErrorDialect::OpenAi),
    }
}

pub async fn embeddings(State(engine): State<Arc<Engine>>, Json(body): Json<Value>) -> Response {
    let wire_model = body
        .get("model")
        .and_then(|m| m.as_str())
        .unwrap_or_default()
        .to_string();
    let (provider, model) = match engine.split_model(&wire_model) {
        Ok(split) => split,
        Err(e) => return to_response(&e, ErrorDialect::OpenAi),
    };

    match engine.batcher.submit(&provider, &model, &body).await {
        Ok(mut response) => {
            response["model"] = json!(wire_model);
            Json(response).into_response()
        }
        Err(e) => to_response(&e, ErrorDialect::OpenAi),
    }
}

pub async fn anthropic_messages(
    State(engine): State<Arc<Engine>>,
    Json(request): Json<AnthropicMessagesRequest>,
) -> Response {
    let wire_model = request.model.clone();
    let (provider, model) = match engine.split_model(&wire_model) {
        Ok(split) => split,
        Err(e) => return to_response(&e, ErrorDialect::Anthropic),
    };

    let body = match crate::translate::request::anthropic_to_openai(&request) {
        Ok(body) => body,
        Err(e) => return to_response(&e, ErrorDialect::Anthropic),
    };

    let normalized = NormalizedRequest {
        provider,
        model,
        kind: RequestKind::Chat,
        body,
        streaming: request.stream,
    };

    match engine
        .executor
        .execute(normalized, deadline_for(&engine))
        .await
    {
        Ok(ExecuteResponse::Json(value)) => Json(crate::translate::response::openai_to_anthropic(
            &value,
            &wire_model,
        ))
        .into_response(),
        Ok(ExecuteResponse::Stream(stream)) => sse_response(
            crate::translate::streaming::to_anthropic_stream(stream, wire_model),
            ErrorDialect::Anthropic,
        ),
        Err(e) => to_response(&e, ErrorDialect::Anthropic),
    }
}

pub async fn anthropic_count_tokens(
    State(engine): State<Arc<Engine>>,
    Json(request): Json<AnthropicCountTokensRequest>,
) -> Response {
    if let Err(e) = engine.split_model(&request.model) {
        return to_response(&e, ErrorDialect::Anthropic);
    }
    let mut total = 0usize;
    if let Some(system) = &request.system {
        total += approximate_tokens_of(system);
    }
    for message in &request.messages {
        total += approximate_tokens_of(&message.content);
    }
    if let Some(tools) = &request.tools {
        for tool in tools {
            total += approximate_tokens_of(&tool.input_schema);
            total += tool.name.len() / 4;
        }
    }
    Json(json!({"input_tokens": total})).into_response()
}

pub async fn list_models(State(engine): State<Arc<Engine>>) -> Response {
    let data: Vec<Value> = engine
        .all_models()
        .into_iter()
        .map(|id| {
            let owned_by = id.split('/').next().unwrap_or("unknown").to_string();
            json!({"id": id, "object": "model", "owned_by": owned_by})
        })
        .collect();
    Json(json!({"object": "list", "data": data})).into_response()
}

pub async fn get_model(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<String>,
) -> Response {
    let id = id.trim_start_matches('/').to_string();
    if engine.all_models().contains(&id) {
        let owned_by = id.split('/').next().unwrap_or("unknown").to_string();
        Json(json!({"id": id, "object": "model", "owned_by": owned_by})).into_response()
    } else {
        let body = json!({
            "error": {
                "message": format!("model '{}' not found", id),
                "type": "not_found_error",
                "code": 404,
            }
        });
        (StatusCode::NOT_FOUND, Json(body)).into_response()
    }
}

pub async fn list_providers(State(engine): State<Arc<Engine>>) -> Response {
    let providers: Vec<Value> = engine
        .providers()
        .iter()
        .filter_map(|tag| {
            let adapter = engine.registry.get(tag)?;
            Some(json!({
                "provider": tag,
                "models": engine.models_for(tag),
                "rotation_mode": match adapter.rotation_mode() {
                    crate::providers::RotationMode::Balanced => "balanced",
                    crate::providers::RotationMode::Sequential => "sequential",
                },
            }))
        })
        .collect();
    Json(json!({"providers": providers})).into_response()
}

pub async fn token_count(State(engine): State<Arc<Engine>>, Json(body): Json<Value>) -> Response {
    let model = body.get("model").and_then(|m| m.as_str()).unwrap_or("");
    if model.is_empty() {
        return to_response(
            &GatewayError::InvalidRequest("'model' is required".into()),
            ErrorDialect::OpenAi,
        );
    }
    if let Err(e) = engine.split_model(model) {
        return to_response(&e, ErrorDialect::OpenAi);
    }

    let count = if let Some(messages) = body.get("messages") {
        approximate_tokens_of(messages)
    } else if let Some(text) = body.get("text") {
        approximate_tokens_of(text)
    } else {
        return to_response(
            &GatewayError::InvalidRequest("either 'text' or 'messages' must be provided".into()),
            ErrorDialect::OpenAi,
        );
    };
    Json(json!({"model": model, "token_count": count})).into_response()
}

pub async fn cost_estimate(State(engine): State<Arc<Engine>>, Json(body): Json<Value>) -> Response {
    let wire_model = body.get("model").and_then(|m| m.as_str()).unwrap_or("");
    let (provider, model) = match engine.split_model(wire_model) {
        Ok(split) => split,
        Err(e) => return to_response(&e, ErrorDialect::OpenAi),
    };
    let input_tokens = body
        .get("input_tokens")
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let output_tokens = body
        .get("output_tokens")
        .and_then(|v| v.as_u64())
        .unwrap_or(0);

    let Some(adapter) = engine.registry.get(&provider) else {
        return to_response(
            &GatewayError::UnknownProvider(provider),
            ErrorDialect::OpenAi,
        );
    };
    match adapter.pricing(&model) {
        Some((input_rate, output_rate)) => {
            let input_cost = input_tokens as f64 / 1_000_000.0 * input_rate;
            let output_cost = output_tokens as f64 / 1_000_000.0 * output_rate;
            Json(json!({
                "model": wire_model,
                "input_cost": input_cost,
                "output_cost": output_cost,
                "total_cost": input_cost + output_cost,
                "currency": "USD",
            }))
            .into_response()
        }
        None => Json(json!({
            "model": wire_model,
            "input_cost": Value::Null,
            "output_cost": Value::Null,
            "total_cost": Value::Null,
            "currency": "USD",
        }))
        .into_response(),
    }
}

pub async fn usage_stats(State(engine): State<Arc<Engine>>) -> Response {
    Json(engine.usage_stats().await).into_response()
}

pub async fn health() -> Response {
    Json(json!({"status": "ok"})).into_response()
}

/// Rough chars/4 heuristic over any JSON content. Providers are the source
/// of truth for exact counts; this is a stateless helper.
fn approximate_tokens_of(value: &Value) -> usize {
    match value {
        Value::String(s) => s.chars().count().div_ceil(4),
        Value::Array(items) => items.iter().map(approximate_tokens_of).sum(),
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| k.len() / 4 + approximate_tokens_of(v))
            .sum(),
        _ => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_heuristic_counts_strings_and_structures() {
        assert_eq!(approximate_tokens_of(&json!("abcdefgh")), 2);
        let messages = json!([
            {"role": "user", "content": "hello world!"},
        ]);
        assert!(approximate_tokens_of(&messages) >= 3);
    }
}
