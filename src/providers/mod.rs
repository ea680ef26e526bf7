pub mod google_oauth;
pub mod openai_compat;
pub mod quota;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{GatewayResult, UpstreamError};
use crate::store::credentials::CredentialRecord;
use crate::usage::types::TierPolicy;
use crate::usage::UsageManager;

/// How the scheduler orders candidates within a sub-tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationMode {
    /// Weighted-random biased toward least-used.
    Balanced,
    /// Sticky: prefer the most-used credential still available.
    Sequential,
}

/// What the gateway is asking the provider to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Chat,
    Embedding,
}

/// A client request normalized to the internal (OpenAI-shaped) dialect with
/// the provider prefix already split off the model id.
#[derive(Debug, Clone)]
pub struct NormalizedRequest {
    pub provider: String,
    pub model: String,
    pub kind: RequestKind,
    pub body: Value,
    pub streaming: bool,
}

/// A fully-built upstream HTTP call.
#[derive(Debug, Clone)]
pub struct ProviderCall {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Value,
}

/// One parsed server-sent frame from an upstream stream.
#[derive(Debug, Clone)]
pub enum StreamFrame {
    /// A normalized (OpenAI-shaped) chunk ready for the client.
    Chunk(Value),
    Done,
    /// Upstream emitted an error object inside the stream.
    Error(UpstreamError),
    /// Heartbeat or frame with nothing to forward.
    Skip,
}

/// Adapter-declared periodic job, executed by the engine's ticker.
#[derive(Debug, Clone, Copy)]
pub struct BackgroundJob {
    pub name: &'static str,
    pub interval_secs: u64,
    pub run_on_start: bool,
}

/// Contract between the dispatch engine and one upstream provider. Adapters
/// are values in a registry keyed by provider tag; all provider-specific wire
/// knowledge lives behind this trait.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn tag(&self) -> &'static str;

    fn models(&self) -> Vec<String>;

    fn rotation_mode(&self) -> RotationMode;

    /// Priority tier for a credential; lower is higher priority.
    fn credential_tier(&self, record: &CredentialRecord) -> u8;

    fn tier_policy(&self, tier: u8) -> TierPolicy;

    /// Minimum tier required to use a model, when gated.
    fn min_tier_for_model(&self, _model: &str) -> Option<u8> {
        None
    }

    /// (group name, member models) pairs sharing one quota bucket.
    fn quota_groups(&self) -> Vec<(String, Vec<String>)> {
        Vec::new()
    }

    /// Base concurrent attempts per credential before the tier multiplier.
    fn max_concurrent(&self) -> u32 {
        1
    }

    /// USD per million (input, output) tokens, for the cost-estimate helper.
    fn pricing(&self, _model: &str) -> Option<(f64, f64)> {
        None
    }

    fn build_request(
        &self,
        request: &NormalizedRequest,
        record: &CredentialRecord,
        auth_header: &str,
    ) -> GatewayResult<ProviderCall>;

    /// Parse a non-streaming response body into the normalized dialect.
    fn parse_response(&self, status: u16, body: &str) -> Result<Value, UpstreamError>;

    /// Parse one SSE `data:` payload from a streaming response.
    fn parse_stream_frame(&self, data: &str) -> StreamFrame;

    /// True when upstream stream payloads are already in the internal
    /// dialect, making byte passthrough safe.
    fn streams_internal_dialect(&self) -> bool {
        false
    }

    /// Extract a quota hint from an error response.
    fn parse_quota_error(
        &self,
        status: u16,
        retry_after_header: Option<&str>,
        body: &str,
    ) -> quota::QuotaHint {
        quota::parse_quota_hint(status, retry_after_header, body)
    }

    fn background_job(&self) -> Option<BackgroundJob> {
        None
    }

    /// Execute the declared background job once.
    async fn run_background_job(
        &self,
        _credentials: &[CredentialRecord],
        _usage: &UsageManager,
        _http: &reqwest::Client,
    ) -> GatewayResult<()> {
        Ok(())
    }
}

/// Registry of adapters keyed by provider tag.
pub struct AdapterRegistry {
    adapters: HashMap<&'static str, Arc<dyn ProviderAdapter>>,
}

impl AdapterRegistry {
    pub fn with_defaults() -> Self {
        let mut adapters: HashMap<&'static str, Arc<dyn ProviderAdapter>> = HashMap::new();
        let openai = Arc::new(openai_compat::OpenAiCompatAdapter::new());
        let google = Arc::new(google_oauth::GoogleOauthAdapter::new());
        adapters.insert(openai.tag(), openai);
        adapters.insert(google.tag(), google);
        Self { adapters }
    }

    pub fn get(&self, tag: &str) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters.get(tag).cloned()
    }

    pub fn tags(&self) -> Vec<&'static str> {
        let mut tags: Vec<&'static str> = self.adapters.keys().copied().collect();
        tags.sort_unstable();
        tags
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_knows_both_default_adapters() {
        let registry = AdapterRegistry::with_defaults();
        assert_eq!(registry.tags(), vec!["gemini_cli", "openai"]);
        assert!(registry.get("openai").is_some());
        assert!(registry.get("gemini_cli").is_some());
        assert!(registry.get("nope").is_none());
    }
}
