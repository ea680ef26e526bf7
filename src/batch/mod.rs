use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::dispatch::executor::{ExecuteResponse, Executor};
use crate::error::{GatewayError, GatewayResult};
use crate::providers::{NormalizedRequest, RequestKind};

struct PendingItem {
    inputs: Vec<Value>,
    respond: oneshot::Sender<GatewayResult<Value>>,
}

/// Coalesces embedding requests per (provider, model, option-hash)
/// fingerprint. A batch flushes when it reaches `batch_size` or when
/// `timeout` has elapsed since its first item; every caller gets its own
/// slice of the combined result and upstream token usage is attributed to
/// the batch exactly once.
pub struct EmbeddingBatcher {
    executor: Arc<Executor>,
    queues: DashMap<String, mpsc::UnboundedSender<PendingItem>>,
    batch_size: usize,
    timeout: Duration,
    request_timeout: Duration,
}

impl EmbeddingBatcher {
    pub fn new(
        executor: Arc<Executor>,
        batch_size: usize,
        timeout: Duration,
        request_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            executor,
            queues: DashMap::new(),
            batch_size: batch_size.max(1),
            timeout,
            request_timeout,
        })
    }

    /// Submit one embedding request body and await its slice of the batch.
    pub async fn submit(
        self: &Arc<Self>,
        provider: &str,
        model: &str,
        body: &Value,
    ) -> GatewayResult<Value> {
        let inputs = extract_inputs(body)?;
        let options = extract_options(body);
        let key = fingerprint(provider, model, &options);

        let sender = self
            .queues
            .entry(key)
            .or_insert_with(|| {
                let (tx, rx) = mpsc::unbounded_channel();
                self.spawn_worker(provider.to_string(), model.to_string(), options.clone(), rx);
                tx
            })
            .clone();

        let (respond, receive) = oneshot::channel();
        sender
            .send(PendingItem { inputs, respond })
            .map_err(|_| GatewayError::Config("embedding batch worker is gone".into()))?;
        receive
            .await
            .map_err(|_| GatewayError::Config("embedding batch dropped the request".into()))?
    }

    fn spawn_worker(
        self: &Arc<Self>,
        provider: String,
        model: String,
        options: Value,
        mut rx: mpsc::UnboundedReceiver<PendingItem>,
    ) {
        let batcher = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let Some(first) = rx.recv().await else {
                    return;
                };
                let mut batch = vec![first];
                let mut total: usize = batch[0].inputs.len();
                let flush_at = Instant::now() + batcher.timeout;

                while total < batcher.batch_size {
                    match tokio::time::timeout_at(flush_at, rx.recv()).await {
                        Ok(Some(item)) => {
                            total += item.inputs.len();
                            batch.push(item);
                        }
                        Ok(None) => break,
                        Err(_) => break,
                    }
                }

                debug!(
                    "[Batch] flushing {} request(s) / {} input(s) for {}/{}",
                    batch.len(),
                    total,
                    provider,
                    model
                );
                batcher.flush(&provider, &model, &options, batch).await;
            }
        });
    }

    async fn flush(&self, provider: &str, model: &str, options: &Value, batch: Vec<PendingItem>) {
        let all_inputs: Vec<Value> = batch.iter().flat_map(|item| item.inputs.clone()).collect();

        let mut body = json!({
            "model": format!("{}/{}", provider, model),
            "input": all_inputs,
        });
        if let (Some(target), Some(source)) = (body.as_object_mut(), options.as_object()) {
            for (k, v) in source {
                target.insert(k.clone(), v.clone());
            }
        }

        let request = NormalizedRequest {
            provider: provider.to_string(),
            model: model.to_string(),
            kind: RequestKind::Embedding,
            body,
            streaming: false,
        };

        let deadline = Instant::now() + self.request_timeout;
        let result = self.executor.execute(request, deadline).await;

        match result {
            Ok(ExecuteResponse::Json(response)) => {
                distribute(model, response, batch);
            }
            Ok(ExecuteResponse::Stream(_)) => {
                warn!("[Batch] upstream unexpectedly streamed an embedding response");
                for item in batch {
                    let _ = item.respond.send(Err(GatewayError::Config(
                        "unexpected streaming embedding response".into(),
                    )));
                }
            }
            Err(e) => {
                // One upstream failure fails every coalesced caller.
                let message = e.to_string();
                for item in batch {
                    let _ = item
                        .respond
                        .send(Err(GatewayError::Config(message.clone())));
                }
            }
        }
    }

}

/// Hand each caller its slice of the combined result. Usage belongs to the
/// batch once; only the first caller sees it.
fn distribute(model: &str, response: Value, batch: Vec<PendingItem>) {
    let empty = Vec::new();
    let data = response
        .get("data")
        .and_then(|d| d.as_array())
        .unwrap_or(&empty);
    let usage = response.get("usage").cloned().unwrap_or(Value::Null);

    let mut offset = 0usize;
    for (position, item) in batch.into_iter().enumerate() {
        let take = item.inputs.len();
        let slice: Vec<Value> = data
            .iter()
            .skip(offset)
            .take(take)
            .enumerate()
            .map(|(i, entry)| {
                let mut entry = entry.clone();
                entry["index"] = json!(i);
                entry
            })
            .collect();
        offset += take;

        if slice.len() != take {
            let _ = item.respond.send(Err(GatewayError::Config(format!(
                "upstream returned {} vectors for {} inputs",
                data.len(),
                offset
            ))));
            continue;
        }

        let item_usage = if position == 0 { usage.clone() } else { Value::Null };
        let _ = item.respond.send(Ok(json!({
            "object": "list",
            "model": model,
            "data": slice,
            "usage": item_usage,
        })));
    }
}

fn extract_inputs(body: &Value) -> GatewayResult<Vec<Value>> {
    match body.get("input") {
        Some(Value::String(s)) => Ok(vec![json!(s)]),
        Some(Value::Array(items)) if !items.is_empty() => Ok(items.clone()),
        _ => Err(GatewayError::InvalidRequest(
            "embedding request requires a non-empty input".into(),
        )),
    }
}

/// Options that must match for two requests to share an upstream call.
fn extract_options(body: &Value) -> Value {
    let mut options = serde_json::Map::new();
    for key in ["dimensions", "encoding_format", "input_type", "user"] {
        if let Some(value) = body.get(key) {
            options.insert(key.to_string(), value.clone());
        }
    }
    Value::Object(options)
}

fn fingerprint(provider: &str, model: &str, options: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(provider.as_bytes());
    hasher.update(b"/");
    hasher.update(model.as_bytes());
    hasher.update(serde_json::to_vec(options).unwrap_or_default());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_separates_models_and_options() {
        let a = fingerprint("openai", "text-embedding-3-small", &json!({}));
        let b = fingerprint("openai", "text-embedding-3-large", &json!({}));
        let c = fingerprint("openai", "text-embedding-3-small", &json!({"dimensions": 256}));
        assert_ne!(a, b);
        assert_ne!(a, c);
        // Deterministic: key order in the options map does not matter.
        let c2 = fingerprint("openai", "text-embedding-3-small", &json!({"dimensions": 256}));
        assert_eq!(c, c2);
    }

    #[test]
    fn inputs_normalize_strings_and_arrays() {
        assert_eq!(
            extract_inputs(&json!({"input": "hello"})).unwrap(),
            vec![json!("hello")]
        );
        assert_eq!(
            extract_inputs(&json!({"input": ["a", "b"]})).unwrap().len(),
            2
        );
        assert!(extract_inputs(&json!({"input": []})).is_err());
        assert!(extract_inputs(&json!({})).is_err());
    }

    #[test]
    fn irrelevant_body_keys_do_not_change_the_fingerprint() {
        let base = extract_options(&json!({"input": "x", "model": "m"}));
        let with_noise = extract_options(&json!({"input": "y", "model": "m", "stream": true}));
        assert_eq!(base, with_noise);
    }

    #[tokio::test]
    async fn distribution_slices_vectors_and_attributes_usage_once() {
        let (tx1, rx1) = oneshot::channel();
        let (tx2, rx2) = oneshot::channel();
        let batch = vec![
            PendingItem {
                inputs: vec![json!("a"), json!("b")],
                respond: tx1,
            },
            PendingItem {
                inputs: vec![json!("c")],
                respond: tx2,
            },
        ];
        let response = json!({
            "object": "list",
            "data": [
                {"object": "embedding", "index": 0, "embedding": [0.1]},
                {"object": "embedding", "index": 1, "embedding": [0.2]},
                {"object": "embedding", "index": 2, "embedding": [0.3]},
            ],
            "usage": {"prompt_tokens": 9, "total_tokens": 9},
        });

        distribute("text-embedding-3-small", response, batch);

        let first = rx1.await.unwrap().unwrap();
        let second = rx2.await.unwrap().unwrap();

        // Each caller gets its own re-indexed slice.
        assert_eq!(first["data"].as_array().unwrap().len(), 2);
        assert_eq!(first["data"][0]["embedding"][0], 0.1);
        assert_eq!(first["data"][1]["index"], 1);
        assert_eq!(second["data"].as_array().unwrap().len(), 1);
        assert_eq!(second["data"][0]["embedding"][0], 0.3);
        assert_eq!(second["data"][0]["index"], 0);

        // Upstream usage is attributed exactly once, not per caller.
        assert_eq!(first["usage"]["prompt_tokens"], 9);
        assert_eq!(second["usage"], Value::Null);
    }

    #[tokio::test]
    async fn short_vector_count_fails_the_affected_caller() {
        let (tx, rx) = oneshot::channel();
        let batch = vec![PendingItem {
            inputs: vec![json!("a"), json!("b")],
            respond: tx,
        }];
        let response = json!({
            "data": [{"object": "embedding", "index": 0, "embedding": [0.1]}],
        });

        distribute("m", response, batch);
        assert!(rx.await.unwrap().is_err());
    }
}
