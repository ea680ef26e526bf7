use serde::Serialize;
use thiserror::Error;

use crate::dispatch::classify::ErrorKind;

/// Structured upstream failure carried through classification, cooldown
/// bookkeeping and the client-facing error mapping.
#[derive(Debug, Clone)]
pub struct UpstreamError {
    pub kind: ErrorKind,
    pub status: Option<u16>,
    pub message: String,
    /// Authoritative reset or retry hint parsed from the provider, unix secs.
    pub reset_at: Option<i64>,
    /// True when the error surfaced mid-stream after headers were sent.
    pub streamed: bool,
}

impl UpstreamError {
    pub fn new(kind: ErrorKind, status: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            kind,
            status,
            message: message.into(),
            reset_at: None,
            streamed: false,
        }
    }

    pub fn with_reset(mut self, reset_at: Option<i64>) -> Self {
        self.reset_at = reset_at;
        self
    }
}

impl std::fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status {
            Some(status) => write!(f, "{:?} ({}): {}", self.kind, status, self.message),
            None => write!(f, "{:?}: {}", self.kind, self.message),
        }
    }
}

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("no credential available for {provider}: {reason}")]
    NoKeyAvailable { provider: String, reason: String },

    #[error("request deadline exceeded")]
    DeadlineExceeded,

    #[error("credential {0} requires re-authorization")]
    NeedsReauth(String),

    #[error("all credential slots busy")]
    Overloaded,

    #[error("upstream error: {0}")]
    Upstream(UpstreamError),

    #[error("unknown provider: {0}")]
    UnknownProvider(String),

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl Serialize for GatewayError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.to_string().as_str())
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;

/// Mask a credential identifier for log output. Keeps enough of the tail to
/// tell keys apart without leaking the secret.
pub fn mask_credential(id: &str) -> String {
    if id.starts_with("env://") || id.contains('/') || id.contains('@') {
        // Paths, env URIs and emails are identifiers, not secrets.
        return id.to_string();
    }
    if id.len() <= 8 {
        return "****".to_string();
    }
    format!("{}...{}", &id[..4], &id[id.len() - 4..])
}
