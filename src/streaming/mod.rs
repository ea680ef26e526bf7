use std::pin::Pin;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use serde_json::Value;
use tracing::{debug, warn};

use crate::dispatch::classify::{self, ErrorKind};
use crate::error::UpstreamError;
use crate::providers::{ProviderAdapter, StreamFrame};

pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String, UpstreamError>> + Send>>;
pub type BytesStream = Pin<Box<dyn Stream<Item = Result<Bytes, UpstreamError>> + Send>>;

/// Observes a guarded stream for accounting. `on_complete` fires exactly
/// once when the stream terminates, normally or with an upstream error; it
/// does not fire when the consumer drops the stream early (the owner's drop
/// handling covers that case).
pub trait StreamMonitor: Send + 'static {
    fn on_complete(&self, prompt_tokens: u64, completion_tokens: u64, error: Option<UpstreamError>);
}

/// Monitor for callers with no accounting to do.
pub struct NoopMonitor;

impl StreamMonitor for NoopMonitor {
    fn on_complete(&self, _prompt_tokens: u64, _completion_tokens: u64, _error: Option<UpstreamError>) {}
}

/// Prompt/completion token counts from a normalized-dialect payload.
pub fn usage_tokens(value: &Value) -> (u64, u64) {
    let usage = value.get("usage");
    let prompt = usage
        .and_then(|u| u.get("prompt_tokens"))
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let completion = usage
        .and_then(|u| u.get("completion_tokens"))
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    (prompt, completion)
}

/// Reassemble an upstream byte stream into SSE `data:` payloads.
///
/// Buffers partial lines, enforces the inter-chunk read timeout, and maps
/// transport failures into the error taxonomy. Dropping the returned stream
/// drops the upstream body, which cancels the upstream connection.
pub fn sse_frames<S>(upstream: S, idle_timeout: Duration) -> FrameStream
where
    S: Stream<Item = Result<Bytes, reqwest::Error>> + Send + 'static,
{
    let mut upstream = Box::pin(upstream);
    let stream = async_stream::stream! {
        let mut buffer = BytesMut::new();
        loop {
            let item = match tokio::time::timeout(idle_timeout, upstream.next()).await {
                Ok(item) => item,
                Err(_) => {
                    warn!("[Stream] inter-chunk timeout after {:?}", idle_timeout);
                    let mut error = UpstreamError::new(
                        ErrorKind::Timeout,
                        None,
                        format!("no data from upstream for {}s", idle_timeout.as_secs()),
                    );
                    error.streamed = true;
                    yield Err(error);
                    return;
                }
            };

            match item {
                Some(Ok(bytes)) => {
                    buffer.extend_from_slice(&bytes);
                    while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
                        let line_raw = buffer.split_to(pos + 1);
                        let Ok(line) = std::str::from_utf8(&line_raw) else {
                            continue;
                        };
                        let line = line.trim();
                        if line.is_empty() || line.starts_with(':') {
                            // Heartbeats and separators.
                            continue;
                        }
                        if let Some(payload) = line.strip_prefix("data:") {
                            yield Ok(payload.trim().to_string());
                        }
                    }
                }
                Some(Err(e)) => {
                    let mut error = classify::classify_transport(&e);
                    error.streamed = true;
                    yield Err(error);
                    return;
                }
                None => {
                    // Flush any trailing unterminated data line.
                    if let Ok(rest) = std::str::from_utf8(&buffer) {
                        let rest = rest.trim();
                        if let Some(payload) = rest.strip_prefix("data:") {
                            yield Ok(payload.trim().to_string());
                        }
                    }
                    return;
                }
            }
        }
    };
    Box::pin(stream)
}

/// Pull frames until the first meaningful one. Lets the executor decide
/// whether a stream failed before any bytes reached the client (retryable)
/// or after (terminal).
pub async fn peek_first_frame(
    frames: &mut FrameStream,
    adapter: &dyn ProviderAdapter,
) -> Result<Option<StreamFrame>, UpstreamError> {
    loop {
        match frames.next().await {
            Some(Ok(payload)) => match adapter.parse_stream_frame(&payload) {
                StreamFrame::Skip => continue,
                StreamFrame::Error(error) => {
                    debug!("[Stream] error frame during peek: {}", error);
                    return Err(error);
                }
                frame => return Ok(Some(frame)),
            },
            Some(Err(error)) => return Err(error),
            None => return Ok(None),
        }
    }
}

/// Wrap a post-peek frame stream for delivery in the internal dialect.
///
/// When `passthrough` is set, payloads are forwarded without JSON re-parsing
/// and errors/usage are detected with a cheap substring probe; otherwise
/// each frame goes through the adapter's parser. Token usage from parsed
/// chunks accumulates and is reported to the monitor together with the
/// terminal outcome.
pub fn guard_frames(
    mut frames: FrameStream,
    adapter: std::sync::Arc<dyn ProviderAdapter>,
    passthrough: bool,
    first: Option<StreamFrame>,
    monitor: Box<dyn StreamMonitor>,
) -> BytesStream {
    let stream = async_stream::stream! {
        let monitor = monitor;
        let mut prompt_tokens: u64 = 0;
        let mut completion_tokens: u64 = 0;

        match first {
            Some(StreamFrame::Chunk(chunk)) => {
                let (p, c) = usage_tokens(&chunk);
                prompt_tokens = prompt_tokens.max(p);
                completion_tokens = completion_tokens.max(c);
                let encoded = serde_json::to_string(&chunk).unwrap_or_default();
                yield Ok(Bytes::from(format!("data: {}\n\n", encoded)));
            }
            Some(StreamFrame::Done) | None => {
                monitor.on_complete(0, 0, None);
                yield Ok(Bytes::from_static(b"data: [DONE]\n\n"));
                return;
            }
            // The peek already filtered these out.
            Some(StreamFrame::Error(_)) | Some(StreamFrame::Skip) => {}
        }

        loop {
            match frames.next().await {
                Some(Ok(payload)) => {
                    if passthrough
                        && !payload.contains("\"error\"")
                        && !payload.contains("\"usage\"")
                    {
                        // Fast path: no re-parse, forward bytes as-is.
                        if payload.trim() == "[DONE]" {
                            monitor.on_complete(prompt_tokens, completion_tokens, None);
                            yield Ok(Bytes::from_static(b"data: [DONE]\n\n"));
                            return;
                        }
                        yield Ok(Bytes::from(format!("data: {}\n\n", payload)));
                        continue;
                    }
                    match adapter.parse_stream_frame(&payload) {
                        StreamFrame::Chunk(chunk) => {
                            let (p, c) = usage_tokens(&chunk);
                            prompt_tokens = prompt_tokens.max(p);
                            completion_tokens = completion_tokens.max(c);
                            let encoded = serde_json::to_string(&chunk).unwrap_or_default();
                            yield Ok(Bytes::from(format!("data: {}\n\n", encoded)));
                        }
                        StreamFrame::Done => {
                            monitor.on_complete(prompt_tokens, completion_tokens, None);
                            yield Ok(Bytes::from_static(b"data: [DONE]\n\n"));
                            return;
                        }
                        StreamFrame::Error(error) => {
                            monitor.on_complete(
                                prompt_tokens,
                                completion_tokens,
                                Some(error.clone()),
                            );
                            yield Err(error);
                            return;
                        }
                        StreamFrame::Skip => {}
                    }
                }
                Some(Err(error)) => {
                    monitor.on_complete(prompt_tokens, completion_tokens, Some(error.clone()));
                    yield Err(error);
                    return;
                }
                None => {
                    monitor.on_complete(prompt_tokens, completion_tokens, None);
                    return;
                }
            }
        }
    };
    Box::pin(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    fn byte_stream(
        chunks: Vec<Result<Bytes, reqwest::Error>>,
    ) -> impl Stream<Item = Result<Bytes, reqwest::Error>> {
        futures::stream::iter(chunks)
    }

    /// Records the single on_complete call for assertions.
    struct RecordingMonitor {
        seen: std::sync::Arc<Mutex<Vec<(u64, u64, Option<String>)>>>,
    }

    impl RecordingMonitor {
        fn new() -> (Box<Self>, std::sync::Arc<Mutex<Vec<(u64, u64, Option<String>)>>>) {
            let seen = std::sync::Arc::new(Mutex::new(Vec::new()));
            (
                Box::new(Self { seen: seen.clone() }),
                seen,
            )
        }
    }

    impl StreamMonitor for RecordingMonitor {
        fn on_complete(
            &self,
            prompt_tokens: u64,
            completion_tokens: u64,
            error: Option<UpstreamError>,
        ) {
            self.seen.lock().unwrap().push((
                prompt_tokens,
                completion_tokens,
                error.map(|e| e.message),
            ));
        }
    }

    #[tokio::test]
    async fn frames_reassemble_across_chunk_boundaries() {
        let chunks = vec![
            Ok(Bytes::from_static(b"data: {\"a\":")),
            Ok(Bytes::from_static(b"1}\n\ndata: {\"b\":2}\n\n")),
        ];
        let mut frames = sse_frames(byte_stream(chunks), Duration::from_secs(5));

        assert_eq!(frames.next().await.unwrap().unwrap(), "{\"a\":1}");
        assert_eq!(frames.next().await.unwrap().unwrap(), "{\"b\":2}");
        assert!(frames.next().await.is_none());
    }

    #[tokio::test]
    async fn heartbeats_and_blank_lines_are_skipped() {
        let chunks = vec![Ok(Bytes::from_static(
            b": keepalive\n\ndata: {\"x\":1}\n\n: ping\n",
        ))];
        let mut frames = sse_frames(byte_stream(chunks), Duration::from_secs(5));

        assert_eq!(frames.next().await.unwrap().unwrap(), "{\"x\":1}");
        assert!(frames.next().await.is_none());
    }

    #[tokio::test]
    async fn idle_timeout_fails_the_stream() {
        let pending =
            futures::stream::pending::<Result<Bytes, reqwest::Error>>();
        let mut frames = sse_frames(pending, Duration::from_millis(50));

        let error = frames.next().await.unwrap().unwrap_err();
        assert_eq!(error.kind, ErrorKind::Timeout);
        assert!(error.streamed);
    }

    #[tokio::test]
    async fn trailing_unterminated_frame_is_flushed() {
        let chunks = vec![Ok(Bytes::from_static(b"data: {\"tail\":true}"))];
        let mut frames = sse_frames(byte_stream(chunks), Duration::from_secs(5));
        assert_eq!(frames.next().await.unwrap().unwrap(), "{\"tail\":true}");
        assert!(frames.next().await.is_none());
    }

    #[tokio::test]
    async fn peek_skips_heartbeat_frames_and_surfaces_errors() {
        let adapter = crate::providers::openai_compat::OpenAiCompatAdapter::new();
        let chunks = vec![Ok(Bytes::from(format!(
            "data: {}\n\n",
            json!({"error": {"message": "boom"}})
        )))];
        let mut frames = sse_frames(byte_stream(chunks), Duration::from_secs(5));
        let result = peek_first_frame(&mut frames, &adapter).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn guard_passthrough_forwards_payloads_verbatim() {
        let adapter: std::sync::Arc<dyn ProviderAdapter> =
            std::sync::Arc::new(crate::providers::openai_compat::OpenAiCompatAdapter::new());
        let chunks = vec![Ok(Bytes::from_static(
            b"data: {\"choices\":[{\"delta\":{\"content\":\"hi\"}}]}\n\ndata: [DONE]\n\n",
        ))];
        let frames = sse_frames(byte_stream(chunks), Duration::from_secs(5));
        let mut guarded = guard_frames(frames, adapter, true, None, Box::new(NoopMonitor));

        let first = guarded.next().await.unwrap().unwrap();
        assert_eq!(
            std::str::from_utf8(&first).unwrap(),
            "data: {\"choices\":[{\"delta\":{\"content\":\"hi\"}}]}\n\n"
        );
        let done = guarded.next().await.unwrap().unwrap();
        assert_eq!(std::str::from_utf8(&done).unwrap(), "data: [DONE]\n\n");
    }

    #[tokio::test]
    async fn concatenated_guarded_output_matches_upstream_frames() {
        // Round-trip property: parsed-and-reencoded frames carry the same
        // payloads the upstream emitted, error frames excepted.
        let adapter: std::sync::Arc<dyn ProviderAdapter> =
            std::sync::Arc::new(crate::providers::openai_compat::OpenAiCompatAdapter::new());
        let payloads = vec![
            json!({"choices":[{"delta":{"content":"a"}}]}),
            json!({"choices":[{"delta":{"content":"b"}}]}),
        ];
        let wire: String = payloads
            .iter()
            .map(|p| format!("data: {}\n\n", p))
            .chain(std::iter::once("data: [DONE]\n\n".to_string()))
            .collect();
        let chunks = vec![Ok(Bytes::from(wire))];
        let frames = sse_frames(byte_stream(chunks), Duration::from_secs(5));
        let mut guarded = guard_frames(frames, adapter, false, None, Box::new(NoopMonitor));

        let mut collected = Vec::new();
        while let Some(item) = guarded.next().await {
            collected.push(String::from_utf8(item.unwrap().to_vec()).unwrap());
        }
        assert_eq!(collected.len(), 3);
        for (out, original) in collected.iter().zip(payloads.iter()) {
            let body: serde_json::Value =
                serde_json::from_str(out.trim_start_matches("data: ").trim()).unwrap();
            assert_eq!(&body, original);
        }
        assert_eq!(collected.last().unwrap(), "data: [DONE]\n\n");
    }

    #[tokio::test]
    async fn monitor_sees_accumulated_usage_on_clean_finish() {
        let adapter: std::sync::Arc<dyn ProviderAdapter> =
            std::sync::Arc::new(crate::providers::openai_compat::OpenAiCompatAdapter::new());
        let wire = format!(
            "data: {}\n\ndata: {}\n\ndata: [DONE]\n\n",
            json!({"choices":[{"delta":{"content":"hi"}}]}),
            json!({"choices":[], "usage": {"prompt_tokens": 7, "completion_tokens": 3}}),
        );
        let frames = sse_frames(
            byte_stream(vec![Ok(Bytes::from(wire))]),
            Duration::from_secs(5),
        );
        let (monitor, seen) = RecordingMonitor::new();
        // Passthrough on: the usage probe must still route that frame
        // through the parser.
        let mut guarded = guard_frames(frames, adapter, true, None, monitor);
        while guarded.next().await.is_some() {}

        let calls = seen.lock().unwrap();
        assert_eq!(calls.as_slice(), &[(7, 3, None)]);
    }

    #[tokio::test]
    async fn monitor_sees_mid_stream_error() {
        let adapter: std::sync::Arc<dyn ProviderAdapter> =
            std::sync::Arc::new(crate::providers::openai_compat::OpenAiCompatAdapter::new());
        let wire = format!(
            "data: {}\n\ndata: {}\n\n",
            json!({"choices":[{"delta":{"content":"hi"}}]}),
            json!({"error": {"message": "mid-stream failure"}}),
        );
        let frames = sse_frames(
            byte_stream(vec![Ok(Bytes::from(wire))]),
            Duration::from_secs(5),
        );
        let (monitor, seen) = RecordingMonitor::new();
        let mut guarded = guard_frames(frames, adapter, false, None, monitor);

        let first = guarded.next().await.unwrap();
        assert!(first.is_ok());
        let second = guarded.next().await.unwrap();
        assert!(second.is_err());
        assert!(guarded.next().await.is_none());

        let calls = seen.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].2.as_deref(), Some("mid-stream failure"));
    }
}
