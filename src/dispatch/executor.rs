use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::auth::token_manager::TokenManager;
use crate::constants::{RETRY_BACKOFF_MIN_MS, STREAM_READ_TIMEOUT_SECS};
use crate::dispatch::classify::{self, ErrorKind};
use crate::error::{GatewayError, GatewayResult, UpstreamError};
use crate::providers::{AdapterRegistry, NormalizedRequest, ProviderAdapter};
use crate::scheduler::{CredentialLease, Scheduler};
use crate::store::credentials::CredentialKind;
use crate::streaming::{self, BytesStream, StreamMonitor};
use crate::usage::types::AttemptOutcome;

pub enum ExecuteResponse {
    Json(Value),
    /// Normalized-dialect SSE bytes; the lease is released when the stream
    /// finishes, fails, or the client goes away.
    Stream(BytesStream),
}

/// Orchestrates attempts for one client request under a global deadline:
/// acquire a credential, refresh its token, call the provider, classify the
/// outcome, then retry on the same credential or rotate.
pub struct Executor {
    scheduler: Arc<Scheduler>,
    tokens: Arc<TokenManager>,
    registry: Arc<AdapterRegistry>,
    http: reqwest::Client,
    http_streaming: reqwest::Client,
    max_retries_per_key: u32,
    enable_request_logging: bool,
}

impl Executor {
    pub fn new(
        scheduler: Arc<Scheduler>,
        tokens: Arc<TokenManager>,
        registry: Arc<AdapterRegistry>,
        http: reqwest::Client,
        http_streaming: reqwest::Client,
        max_retries_per_key: u32,
        enable_request_logging: bool,
    ) -> Self {
        Self {
            scheduler,
            tokens,
            registry,
            http,
            http_streaming,
            max_retries_per_key,
            enable_request_logging,
        }
    }

    pub async fn execute(
        &self,
        request: NormalizedRequest,
        deadline: Instant,
    ) -> GatewayResult<ExecuteResponse> {
        let adapter = self
            .registry
            .get(&request.provider)
            .ok_or_else(|| GatewayError::UnknownProvider(request.provider.clone()))?;

        let mut last_error: Option<UpstreamError> = None;

        loop {
            if Instant::now() >= deadline {
                return Err(self.deadline_failure(last_error));
            }

            let lease = match self
                .scheduler
                .acquire(&request.provider, &request.model, deadline)
                .await
            {
                Ok(lease) => lease,
                Err(GatewayError::NoKeyAvailable { provider, reason }) => {
                    return Err(match last_error {
                        Some(error) => GatewayError::Upstream(error),
                        None => GatewayError::NoKeyAvailable { provider, reason },
                    });
                }
                Err(e) => return Err(e),
            };

            let auth_header = match self.tokens.get_auth_header(&lease.record.id).await {
                Ok(header) => header,
                Err(GatewayError::NeedsReauth(id)) => {
                    // Token is dead; the lockout keeps the scheduler away
                    // from this credential while re-auth is pending.
                    let error =
                        UpstreamError::new(ErrorKind::Authentication, None, "token refresh failed");
                    last_error = Some(error.clone());
                    self.scheduler
                        .release(lease, AttemptOutcome::Failure(error))
                        .await;
                    debug!("[Dispatch] {} needs re-auth, rotating", id);
                    continue;
                }
                Err(e) => {
                    self.scheduler.release(lease, AttemptOutcome::Aborted).await;
                    return Err(e);
                }
            };

            let call = match adapter.build_request(&request, &lease.record, &auth_header) {
                Ok(call) => call,
                Err(e) => {
                    self.scheduler.release(lease, AttemptOutcome::Aborted).await;
                    return Err(e);
                }
            };

            // Bounded retries against this credential, then rotate.
            let mut rotate = false;
            let mut attempt: u32 = 0;
            while !rotate {
                if Instant::now() >= deadline {
                    self.scheduler.release(lease, AttemptOutcome::Aborted).await;
                    return Err(self.deadline_failure(last_error));
                }

                let error: UpstreamError = if request.streaming {
                    match self.try_streaming_attempt(&adapter, &call, &lease).await {
                        Ok(response) => return Ok(response),
                        Err(error) => error,
                    }
                } else {
                    match self.try_json_attempt(&adapter, &call, deadline).await {
                        Ok(value) => {
                            let (prompt, completion) = streaming::usage_tokens(&value);
                            self.scheduler
                                .release(
                                    lease,
                                    AttemptOutcome::Success {
                                        prompt_tokens: prompt,
                                        completion_tokens: completion,
                                    },
                                )
                                .await;
                            return Ok(ExecuteResponse::Json(value));
                        }
                        Err(error) => error,
                    }
                };
                last_error = Some(error.clone());

                if error.kind.surface_immediately() {
                    self.scheduler
                        .release(lease, AttemptOutcome::Failure(error.clone()))
                        .await;
                    return Err(GatewayError::Upstream(error));
                }

                if error.kind == ErrorKind::Authentication {
                    if lease.record.kind == CredentialKind::OAuth {
                        self.tokens.enqueue_reauth(&lease.record.id).await;
                    }
                    warn!(
                        "[Dispatch] auth failure on {}, locking out and rotating",
                        lease.record.display_name()
                    );
                    self.scheduler
                        .release(lease, AttemptOutcome::Failure(error))
                        .await;
                    break;
                }

                let can_retry = error.kind.retry_same_credential()
                    && attempt < self.max_retries_per_key
                    && !error.streamed;
                if can_retry {
                    let backoff =
                        Duration::from_millis(RETRY_BACKOFF_MIN_MS << attempt.min(6));
                    if Instant::now() + backoff >= deadline {
                        // The backoff would blow the deadline: rotate now.
                        rotate = true;
                    } else {
                        debug!(
                            "[Dispatch] retrying {} on {} after {:?} (attempt {}/{})",
                            request.model,
                            lease.record.display_name(),
                            backoff,
                            attempt + 1,
                            self.max_retries_per_key
                        );
                        tokio::time::sleep(backoff).await;
                        attempt += 1;
                        continue;
                    }
                } else {
                    rotate = true;
                }

                if rotate {
                    info!(
                        "[Dispatch] rotating away from {} after {:?}",
                        lease.record.display_name(),
                        error.kind
                    );
                    self.scheduler
                        .release(lease, AttemptOutcome::Failure(error))
                        .await;
                    break;
                }
            }
        }
    }

    async fn try_json_attempt(
        &self,
        adapter: &Arc<dyn ProviderAdapter>,
        call: &crate::providers::ProviderCall,
        deadline: Instant,
    ) -> Result<Value, UpstreamError> {
        let mut builder = self.http.post(&call.url).json(&call.body);
        for (name, value) in &call.headers {
            builder = builder.header(name, value);
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        builder = builder.timeout(remaining);

        let response = builder.send().await.map_err(|e| classify::classify_transport(&e))?;
        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response
            .text()
            .await
            .map_err(|e| classify::classify_transport(&e))?;

        if !(200..300).contains(&status) {
            let hint = adapter.parse_quota_error(status, retry_after.as_deref(), &body);
            return Err(classify::classify_http(
                status,
                &body,
                hint.reset_at,
                hint.had_hint,
            ));
        }
        if body.trim().is_empty() {
            // Empty-response sentinel: providers sometimes close with 200
            // and no payload under load.
            return Err(UpstreamError::new(
                ErrorKind::ServerError,
                Some(status),
                "empty upstream response",
            ));
        }
        adapter.parse_response(status, &body)
    }

    // The dispatch deadline bounds attempt setup only; an established stream
    // may legitimately outlive it.
    async fn try_streaming_attempt(
        &self,
        adapter: &Arc<dyn ProviderAdapter>,
        call: &crate::providers::ProviderCall,
        lease: &CredentialLease,
    ) -> Result<ExecuteResponse, UpstreamError> {
        let mut builder = self.http_streaming.post(&call.url).json(&call.body);
        for (name, value) in &call.headers {
            builder = builder.header(name, value);
        }

        let response = builder.send().await.map_err(|e| classify::classify_transport(&e))?;
        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let body = response.text().await.unwrap_or_default();
            let hint = adapter.parse_quota_error(status, retry_after.as_deref(), &body);
            return Err(classify::classify_http(
                status,
                &body,
                hint.reset_at,
                hint.had_hint,
            ));
        }

        let mut frames = streaming::sse_frames(
            response.bytes_stream(),
            Duration::from_secs(STREAM_READ_TIMEOUT_SECS),
        );

        // Nothing has reached the client yet; a failure here is retryable.
        let first = streaming::peek_first_frame(&mut frames, adapter.as_ref()).await?;

        // The releaser rides inside the guarded stream: the monitor callback
        // records the outcome on normal termination, and its drop handling
        // releases the lease if the client disconnects mid-flight.
        let releaser = LeaseReleaser::new(
            Arc::clone(&self.scheduler),
            CredentialLease {
                record: lease.record.clone(),
                provider: lease.provider.clone(),
                model: lease.model.clone(),
            },
        );
        // Byte passthrough needs both observability off and an upstream that
        // already speaks the internal dialect.
        let passthrough = !self.enable_request_logging && adapter.streams_internal_dialect();

        Ok(ExecuteResponse::Stream(streaming::guard_frames(
            frames,
            Arc::clone(adapter),
            passthrough,
            first,
            Box::new(releaser),
        )))
    }

    fn deadline_failure(&self, last_error: Option<UpstreamError>) -> GatewayError {
        match last_error {
            Some(error) => GatewayError::Upstream(error),
            None => GatewayError::DeadlineExceeded,
        }
    }
}

/// Releases a streaming lease exactly once. The stream guard reports the
/// terminal outcome through `StreamMonitor`; if the client drops the stream
/// before then, `Drop` hands the release to a task with an `Aborted`
/// outcome.
struct LeaseReleaser {
    scheduler: Arc<Scheduler>,
    lease: Option<CredentialLease>,
    outcome: std::sync::Mutex<Option<AttemptOutcome>>,
}

impl LeaseReleaser {
    fn new(scheduler: Arc<Scheduler>, lease: CredentialLease) -> Self {
        Self {
            scheduler,
            lease: Some(lease),
            outcome: std::sync::Mutex::new(None),
        }
    }
}

impl StreamMonitor for LeaseReleaser {
    fn on_complete(
        &self,
        prompt_tokens: u64,
        completion_tokens: u64,
        error: Option<UpstreamError>,
    ) {
        let outcome = match error {
            None => AttemptOutcome::Success {
                prompt_tokens,
                completion_tokens,
            },
            Some(error) => AttemptOutcome::Failure(error),
        };
        *self.outcome.lock().unwrap() = Some(outcome);
    }
}

impl Drop for LeaseReleaser {
    fn drop(&mut self) {
        if let Some(lease) = self.lease.take() {
            let outcome = self
                .outcome
                .lock()
                .unwrap()
                .take()
                .unwrap_or(AttemptOutcome::Aborted);
            let scheduler = Arc::clone(&self.scheduler);
            tokio::spawn(async move {
                scheduler.release(lease, outcome).await;
            });
        }
    }
}
