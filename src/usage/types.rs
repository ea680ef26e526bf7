use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::error::UpstreamError;

/// Reset behavior for a tier's usage windows.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum ResetMode {
    /// Independent window per model; authoritative provider resets trusted.
    PerModel { window_secs: i64 },
    /// One rolling window per credential.
    Credential { window_secs: i64 },
    /// Legacy: reset at a fixed UTC hour.
    Daily { utc_hour: u32 },
}

impl ResetMode {
    pub fn window_secs(&self) -> i64 {
        match self {
            ResetMode::PerModel { window_secs } | ResetMode::Credential { window_secs } => {
                *window_secs
            }
            ResetMode::Daily { .. } => 86_400,
        }
    }
}

/// Per-tier usage policy, declared by the adapter.
#[derive(Debug, Clone, Copy)]
pub struct TierPolicy {
    pub reset: ResetMode,
    /// Multiplies the provider's base concurrency cap.
    pub concurrency_multiplier: u32,
}

impl Default for TierPolicy {
    fn default() -> Self {
        Self {
            reset: ResetMode::PerModel { window_secs: 3600 },
            concurrency_multiplier: 1,
        }
    }
}

/// Usage counters for one (credential, model) window.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WindowStats {
    pub window_start_ts: i64,
    /// Authoritative reset reported by the provider; 0 means unknown.
    #[serde(default)]
    pub quota_reset_ts: i64,
    pub request_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baseline_remaining_fraction: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baseline_fetched_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests_at_baseline: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quota_max_requests: Option<u64>,
}

impl WindowStats {
    /// Reset counters for a new window. A still-future authoritative reset
    /// survives the rollover.
    pub fn rollover(&mut self, now: i64) {
        let preserved_reset = if self.quota_reset_ts > now {
            self.quota_reset_ts
        } else {
            0
        };
        let max_requests = self.quota_max_requests;
        *self = WindowStats {
            window_start_ts: now,
            quota_reset_ts: preserved_reset,
            quota_max_requests: max_requests,
            ..WindowStats::default()
        };
    }
}

/// Credential-lifetime aggregate (never reset).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TotalStats {
    pub request_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_used_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CooldownReason {
    /// Escalating backoff after rate-limit failures without a usable reset.
    Transient,
    /// Credential-wide lockout after an authentication failure.
    AuthLockout,
    /// Authoritative reset parsed from the provider.
    QuotaReset,
    /// Configured request cap reached.
    CustomCap,
    /// Several distinct models failed in quick succession.
    DeadKey,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CooldownInfo {
    pub reason: CooldownReason,
    pub until: i64,
    pub started_at: i64,
    /// Ladder position for escalating cooldowns.
    #[serde(default)]
    pub backoff_count: u32,
}

/// Scope key for cooldowns inside a credential's state: a model name, or
/// `CREDENTIAL_SCOPE` for credential-wide exclusions.
pub const CREDENTIAL_SCOPE: &str = "*";

/// Everything the usage manager tracks for one credential. Guarded by the
/// credential's mutex in the manager.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CredentialUsage {
    pub tier: u8,
    pub model_usage: HashMap<String, WindowStats>,
    pub totals: TotalStats,
    pub cooldowns: HashMap<String, CooldownInfo>,
    /// Credential-window anchor for `ResetMode::Credential` and `Daily`.
    #[serde(default)]
    pub window_start_ts: i64,
    /// In-flight attempt counts; never persisted.
    #[serde(skip)]
    pub active: HashMap<String, u32>,
    #[serde(skip)]
    pub active_total: u32,
    /// (model, ts) failures inside the dead-key window; never persisted.
    #[serde(skip)]
    pub recent_failures: VecDeque<(String, i64)>,
}

impl CredentialUsage {
    pub fn active_cooldown(&self, scope: &str, now: i64) -> Option<&CooldownInfo> {
        self.cooldowns.get(scope).filter(|cd| cd.until > now)
    }

    pub fn window_request_count(&self, model: &str) -> u64 {
        self.model_usage
            .get(model)
            .map(|w| w.request_count)
            .unwrap_or(0)
    }
}

/// Result of one upstream attempt, fed back through `end_attempt`.
#[derive(Debug, Clone)]
pub enum AttemptOutcome {
    Success {
        prompt_tokens: u64,
        completion_tokens: u64,
    },
    Failure(UpstreamError),
    /// Released without an upstream verdict (client went away).
    Aborted,
}
