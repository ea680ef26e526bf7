pub mod caps;
pub mod cooldown;
pub mod fair_cycle;
pub mod persistence;
pub mod types;

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::constants::{
    DEAD_KEY_MODEL_THRESHOLD, DEAD_KEY_WINDOW_SECS, EXHAUSTION_COOLDOWN_THRESHOLD_SECS,
};
use crate::error::{GatewayError, GatewayResult};
use crate::models::CustomCapConfig;
use crate::store::writer::ResilientWriter;
use crate::usage::fair_cycle::FairCycleTracker;
use crate::usage::persistence::UsagePersistence;
use crate::usage::types::{
    AttemptOutcome, CooldownInfo, CooldownReason, CredentialUsage, ResetMode, TierPolicy,
    CREDENTIAL_SCOPE,
};
use crate::utils::time::{next_utc_hour, now_secs};

/// Static usage settings for one provider, assembled from the adapter
/// declaration and the app config.
#[derive(Debug, Clone)]
pub struct UsageSettings {
    /// Base concurrent-attempt cap per credential, before tier multipliers.
    pub max_concurrent: u32,
    pub policies: HashMap<u8, TierPolicy>,
    pub default_policy: TierPolicy,
    /// model -> quota group name
    pub model_groups: HashMap<String, String>,
    /// group name -> member models
    pub group_members: HashMap<String, Vec<String>>,
    pub custom_caps: Vec<CustomCapConfig>,
    pub fair_cycle_enabled: bool,
}

impl Default for UsageSettings {
    fn default() -> Self {
        Self {
            max_concurrent: 1,
            policies: HashMap::new(),
            default_policy: TierPolicy::default(),
            model_groups: HashMap::new(),
            group_members: HashMap::new(),
            custom_caps: Vec::new(),
            fair_cycle_enabled: false,
        }
    }
}

/// Per-provider usage, quota and cooldown state. Owns every counter and
/// cooldown; the scheduler and executor only call through this API. Locks
/// are per credential and never held across network calls.
pub struct UsageManager {
    provider: String,
    settings: UsageSettings,
    states: DashMap<String, Arc<Mutex<CredentialUsage>>>,
    fair_cycle: Mutex<FairCycleTracker>,
    persistence: UsagePersistence,
}

impl UsageManager {
    pub fn new(
        provider: &str,
        settings: UsageSettings,
        data_dir: &std::path::Path,
        writer: Arc<ResilientWriter>,
    ) -> Self {
        Self {
            provider: provider.to_string(),
            settings,
            states: DashMap::new(),
            fair_cycle: Mutex::new(FairCycleTracker::new()),
            persistence: UsagePersistence::new(data_dir, provider, writer),
        }
    }

    /// Register credentials and merge any persisted state for them.
    pub async fn initialize(&self, credentials: &[(String, u8)]) {
        let (mut persisted, fair_cycle) = self.persistence.load();
        self.fair_cycle.lock().await.restore(fair_cycle);

        for (id, tier) in credentials {
            let mut state = persisted.remove(id).unwrap_or_default();
            state.tier = *tier;
            state.active.clear();
            state.active_total = 0;
            self.states.insert(id.clone(), Arc::new(Mutex::new(state)));
        }
        info!(
            "[Usage] {} initialized with {} credential(s)",
            self.provider,
            self.states.len()
        );
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn credential_ids(&self) -> Vec<String> {
        self.states.iter().map(|e| e.key().clone()).collect()
    }

    pub async fn tier(&self, id: &str) -> u8 {
        match self.state(id) {
            Some(state) => state.lock().await.tier,
            None => u8::MAX,
        }
    }

    fn state(&self, id: &str) -> Option<Arc<Mutex<CredentialUsage>>> {
        self.states.get(id).map(|s| s.clone())
    }

    fn policy(&self, tier: u8) -> TierPolicy {
        self.settings
            .policies
            .get(&tier)
            .copied()
            .unwrap_or(self.settings.default_policy)
    }

    pub fn group_of(&self, model: &str) -> Option<&str> {
        self.settings.model_groups.get(model).map(|s| s.as_str())
    }

    /// Fair-cycle tracking scope for a model under a tier's reset mode.
    fn cycle_scope(&self, tier: u8, model: &str) -> String {
        match self.policy(tier).reset {
            ResetMode::Credential { .. } | ResetMode::Daily { .. } => "credential".to_string(),
            ResetMode::PerModel { .. } => self
                .group_of(model)
                .unwrap_or(model)
                .to_string(),
        }
    }

    /// Reserve a concurrency slot for an attempt. The scheduler retries
    /// selection on `Overloaded`.
    pub async fn begin_attempt(&self, id: &str, model: &str) -> GatewayResult<()> {
        let state = self
            .state(id)
            .ok_or_else(|| GatewayError::Config(format!("unknown credential: {}", id)))?;
        let mut usage = state.lock().await;
        let cap =
            self.settings.max_concurrent as u64 * self.policy(usage.tier).concurrency_multiplier as u64;
        if usage.active_total as u64 >= cap {
            return Err(GatewayError::Overloaded);
        }
        usage.active_total += 1;
        *usage.active.entry(model.to_string()).or_insert(0) += 1;
        Ok(())
    }

    /// Release the slot and fold the outcome into counters and cooldowns.
    pub async fn end_attempt(&self, id: &str, model: &str, outcome: AttemptOutcome) {
        let Some(state) = self.state(id) else {
            return;
        };
        let now = now_secs();
        let mut exhausted_scope: Option<String> = None;

        {
            let mut usage = state.lock().await;
            usage.active_total = usage.active_total.saturating_sub(1);
            if let Some(count) = usage.active.get_mut(model) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    usage.active.remove(model);
                }
            }

            let policy = self.policy(usage.tier);
            self.roll_windows(&mut usage, &policy, model, now);

            match outcome {
                AttemptOutcome::Success {
                    prompt_tokens,
                    completion_tokens,
                } => {
                    let stats = usage.model_usage.entry(model.to_string()).or_default();
                    if stats.window_start_ts == 0 {
                        stats.window_start_ts = now;
                    }
                    stats.request_count += 1;
                    stats.success_count += 1;
                    stats.prompt_tokens += prompt_tokens;
                    stats.completion_tokens += completion_tokens;
                    stats.total_tokens += prompt_tokens + completion_tokens;
                    let (window_start, count) = (stats.window_start_ts, stats.request_count);

                    usage.totals.request_count += 1;
                    usage.totals.success_count += 1;
                    usage.totals.prompt_tokens += prompt_tokens;
                    usage.totals.completion_tokens += completion_tokens;
                    usage.totals.total_tokens += prompt_tokens + completion_tokens;
                    usage.totals.first_used_at.get_or_insert(now);
                    usage.totals.last_used_at = Some(now);

                    // A success resets the transient ladder for this model.
                    if usage
                        .cooldowns
                        .get(model)
                        .is_some_and(|cd| cd.reason == CooldownReason::Transient && cd.until <= now)
                    {
                        usage.cooldowns.remove(model);
                    }
                    usage.recent_failures.clear();

                    if let Some(until) = self.cap_breach_until(&usage, model, window_start, count, now)
                    {
                        debug!(
                            "[Usage] {} hit custom cap for {} until {}",
                            id, model, until
                        );
                        usage.cooldowns.insert(
                            model.to_string(),
                            CooldownInfo {
                                reason: CooldownReason::CustomCap,
                                until,
                                started_at: now,
                                backoff_count: 0,
                            },
                        );
                        if until - now >= EXHAUSTION_COOLDOWN_THRESHOLD_SECS {
                            exhausted_scope = Some(self.cycle_scope(usage.tier, model));
                        }
                    }
                }
                AttemptOutcome::Failure(error) => {
                    let stats = usage.model_usage.entry(model.to_string()).or_default();
                    if stats.window_start_ts == 0 {
                        stats.window_start_ts = now;
                    }
                    stats.failure_count += 1;
                    usage.totals.failure_count += 1;

                    let prior = usage
                        .cooldowns
                        .get(model)
                        .map(|cd| cd.backoff_count)
                        .unwrap_or(0);
                    if let Some(decision) = cooldown::decide(&error, model, prior, now) {
                        if decision.propagate_group {
                            self.apply_reset_locked(&mut usage, model, decision.info.until, now);
                        } else {
                            usage
                                .cooldowns
                                .insert(decision.scope.clone(), decision.info.clone());
                        }
                        if decision.info.until - now >= EXHAUSTION_COOLDOWN_THRESHOLD_SECS {
                            exhausted_scope = Some(self.cycle_scope(usage.tier, model));
                        }
                    }

                    // Dead-key heuristic: several distinct models failing on
                    // one credential in quick succession.
                    usage.recent_failures.push_back((model.to_string(), now));
                    while usage
                        .recent_failures
                        .front()
                        .is_some_and(|(_, ts)| now - ts > DEAD_KEY_WINDOW_SECS)
                    {
                        usage.recent_failures.pop_front();
                    }
                    let distinct: std::collections::HashSet<&str> = usage
                        .recent_failures
                        .iter()
                        .map(|(m, _)| m.as_str())
                        .collect();
                    if distinct.len() >= DEAD_KEY_MODEL_THRESHOLD {
                        warn!(
                            "[Usage] {} failing across {} models, credential-wide lockout",
                            id,
                            distinct.len()
                        );
                        usage.cooldowns.insert(
                            CREDENTIAL_SCOPE.to_string(),
                            CooldownInfo {
                                reason: CooldownReason::DeadKey,
                                until: now + crate::constants::AUTH_LOCKOUT_SECS,
                                started_at: now,
                                backoff_count: 0,
                            },
                        );
                        usage.recent_failures.clear();
                    }
                }
                AttemptOutcome::Aborted => {}
            }
        }

        if let Some(scope) = exhausted_scope {
            self.fair_cycle.lock().await.mark_exhausted(&scope, id, now);
        }

        self.persistence.mark_dirty();
        self.save(false).await;
    }

    /// Apply an authoritative quota reset to the model and every member of
    /// its quota group, preserving farther-future resets.
    pub async fn apply_quota_reset(&self, id: &str, model: &str, reset_ts: i64) {
        let Some(state) = self.state(id) else {
            return;
        };
        let now = now_secs();
        let tier = {
            let mut usage = state.lock().await;
            self.apply_reset_locked(&mut usage, model, reset_ts, now);
            usage.tier
        };

        if reset_ts - now >= EXHAUSTION_COOLDOWN_THRESHOLD_SECS {
            let scope = self.cycle_scope(tier, model);
            self.fair_cycle.lock().await.mark_exhausted(&scope, id, now);
        }
        self.persistence.mark_dirty();
        self.save(false).await;
    }

    fn apply_reset_locked(&self, usage: &mut CredentialUsage, model: &str, reset_ts: i64, now: i64) {
        let mut targets: Vec<String> = vec![model.to_string()];
        if let Some(group) = self.group_of(model) {
            if let Some(members) = self.settings.group_members.get(group) {
                for member in members {
                    if member != model {
                        targets.push(member.clone());
                    }
                }
            }
        }

        for target in targets {
            let stats = usage.model_usage.entry(target.clone()).or_default();
            if stats.window_start_ts == 0 {
                stats.window_start_ts = now;
            }
            stats.quota_reset_ts = stats.quota_reset_ts.max(reset_ts);

            let farther = usage
                .cooldowns
                .get(&target)
                .map(|cd| cd.until)
                .unwrap_or(0)
                .max(reset_ts);
            usage.cooldowns.insert(
                target,
                CooldownInfo {
                    reason: CooldownReason::QuotaReset,
                    until: farther,
                    started_at: now,
                    backoff_count: 0,
                },
            );
        }
    }

    /// Record a quota baseline reported by the adapter's background job.
    pub async fn set_quota_baseline(
        &self,
        id: &str,
        model: &str,
        remaining_fraction: f64,
        max_requests: Option<u64>,
    ) {
        let Some(state) = self.state(id) else {
            return;
        };
        let now = now_secs();
        let mut usage = state.lock().await;
        let stats = usage.model_usage.entry(model.to_string()).or_default();
        if stats.window_start_ts == 0 {
            stats.window_start_ts = now;
        }
        stats.baseline_remaining_fraction = Some(remaining_fraction);
        stats.baseline_fetched_at = Some(now);
        stats.requests_at_baseline = Some(stats.request_count);
        if max_requests.is_some() {
            stats.quota_max_requests = max_requests;
        }
        drop(usage);
        self.persistence.mark_dirty();
    }

    /// Whether the (credential, model) pair may be attempted right now.
    pub async fn is_available(&self, id: &str, model: &str, now: i64) -> bool {
        let Some(state) = self.state(id) else {
            return false;
        };
        let mut usage = state.lock().await;
        let policy = self.policy(usage.tier);
        self.roll_windows(&mut usage, &policy, model, now);

        if usage.active_cooldown(CREDENTIAL_SCOPE, now).is_some() {
            return false;
        }
        if usage.active_cooldown(model, now).is_some() {
            return false;
        }

        // Past a configured cap: excluded even before the breach cooldown is
        // recorded, so a reloaded state behaves the same as a live one.
        let (window_start, count) = usage
            .model_usage
            .get(model)
            .map(|w| (w.window_start_ts, w.request_count))
            .unwrap_or((now, 0));
        if self
            .cap_breach_until(&usage, model, window_start, count, now)
            .is_some()
        {
            return false;
        }
        true
    }

    /// Fair-cycle exclusion test for the scheduler; no-op when disabled.
    pub async fn fair_cycle_excluded(&self, id: &str, model: &str, now: i64) -> bool {
        if !self.settings.fair_cycle_enabled {
            return false;
        }
        let tier = self.tier(id).await;
        let scope = self.cycle_scope(tier, model);
        let all: Vec<String> = self.credential_ids();
        self.fair_cycle
            .lock()
            .await
            .is_excluded(&scope, id, &all, now)
    }

    /// Stats the scheduler uses for sub-tiering and rotation ordering.
    pub async fn selection_stats(&self, id: &str, model: &str) -> (u32, u64) {
        match self.state(id) {
            Some(state) => {
                let usage = state.lock().await;
                (usage.active_total, usage.window_request_count(model))
            }
            None => (u32::MAX, u64::MAX),
        }
    }

    /// Earliest instant any credential could become available for the model.
    pub async fn next_available_at(&self, model: &str, now: i64) -> Option<i64> {
        let mut earliest: Option<i64> = None;
        for entry in self.states.iter() {
            let usage = entry.value().lock().await;
            let mut blocked_until = 0i64;
            if let Some(cd) = usage.active_cooldown(CREDENTIAL_SCOPE, now) {
                blocked_until = blocked_until.max(cd.until);
            }
            if let Some(cd) = usage.active_cooldown(model, now) {
                blocked_until = blocked_until.max(cd.until);
            }
            if blocked_until == 0 {
                // Available already (cooldown-wise).
                return Some(now);
            }
            earliest = Some(earliest.map_or(blocked_until, |e: i64| e.min(blocked_until)));
        }
        earliest
    }

    fn cap_breach_until(
        &self,
        usage: &CredentialUsage,
        model: &str,
        window_start: i64,
        count: u64,
        now: i64,
    ) -> Option<i64> {
        let resolved = caps::resolve_cap(
            &self.settings.custom_caps,
            &self.provider,
            usage.tier,
            model,
            self.group_of(model),
        )?;
        let real_max = usage
            .model_usage
            .get(model)
            .and_then(|w| w.quota_max_requests)
            .unwrap_or(u64::MAX);
        let effective = resolved.cap.min(real_max);
        if count < effective {
            return None;
        }
        let policy = self.policy(usage.tier);
        let natural_reset = usage
            .model_usage
            .get(model)
            .map(|w| w.quota_reset_ts)
            .filter(|ts| *ts > now)
            .unwrap_or(window_start + policy.reset.window_secs());
        Some(caps::cap_cooldown_until(
            &resolved.cooldown,
            window_start,
            natural_reset,
        ))
    }

    fn roll_windows(
        &self,
        usage: &mut CredentialUsage,
        policy: &TierPolicy,
        model: &str,
        now: i64,
    ) {
        match policy.reset {
            ResetMode::PerModel { window_secs } => {
                if let Some(stats) = usage.model_usage.get_mut(model) {
                    if stats.window_start_ts == 0 {
                        stats.window_start_ts = now;
                        return;
                    }
                    let due = if stats.quota_reset_ts > 0 {
                        now >= stats.quota_reset_ts
                    } else {
                        now >= stats.window_start_ts + window_secs
                    };
                    if due {
                        stats.rollover(now);
                    }
                }
            }
            ResetMode::Credential { window_secs } => {
                if usage.window_start_ts == 0 {
                    usage.window_start_ts = now;
                    return;
                }
                if now >= usage.window_start_ts + window_secs {
                    usage.window_start_ts = now;
                    for stats in usage.model_usage.values_mut() {
                        stats.rollover(now);
                    }
                }
            }
            ResetMode::Daily { utc_hour } => {
                if usage.window_start_ts == 0 {
                    usage.window_start_ts = now;
                    return;
                }
                if now >= next_utc_hour(usage.window_start_ts, utc_hour) {
                    usage.window_start_ts = now;
                    for stats in usage.model_usage.values_mut() {
                        stats.rollover(now);
                    }
                }
            }
        }
    }

    /// Operator-facing aggregate for the stats endpoint.
    pub async fn stats_snapshot(&self) -> serde_json::Value {
        let now = now_secs();
        let mut total_requests = 0u64;
        let mut total_tokens = 0u64;
        let mut active = 0usize;
        let mut cooling = 0usize;
        let mut credentials = serde_json::Map::new();

        for entry in self.states.iter() {
            let usage = entry.value().lock().await;
            total_requests += usage.totals.request_count;
            total_tokens += usage.totals.total_tokens;
            if usage.active_total > 0 {
                active += 1;
            }
            let on_cooldown = usage.cooldowns.values().any(|cd| cd.until > now);
            if on_cooldown {
                cooling += 1;
            }
            credentials.insert(
                crate::error::mask_credential(entry.key()),
                serde_json::json!({
                    "tier": usage.tier,
                    "requests": usage.totals.request_count,
                    "failures": usage.totals.failure_count,
                    "total_tokens": usage.totals.total_tokens,
                    "in_flight": usage.active_total,
                    "on_cooldown": on_cooldown,
                }),
            );
        }

        serde_json::json!({
            "credential_count": self.states.len(),
            "in_flight_credentials": active,
            "cooling_credentials": cooling,
            "total_requests": total_requests,
            "total_tokens": total_tokens,
            "credentials": credentials,
        })
    }

    /// Persist the current state. Debounced unless forced.
    pub async fn save(&self, force: bool) {
        if !force && !self.persistence.is_dirty() {
            return;
        }
        let mut snapshot = HashMap::new();
        for entry in self.states.iter() {
            let usage = entry.value().lock().await;
            snapshot.insert(entry.key().clone(), usage.clone());
        }
        let fair_cycle = self.fair_cycle.lock().await.snapshot().clone();
        self.persistence.save(snapshot, fair_cycle, force).await;
    }

    pub async fn shutdown(&self) {
        self.save(true).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::classify::ErrorKind;
    use crate::error::UpstreamError;

    fn settings_with_group() -> UsageSettings {
        let mut settings = UsageSettings {
            max_concurrent: 2,
            fair_cycle_enabled: true,
            ..Default::default()
        };
        settings
            .model_groups
            .insert("model-a".into(), "shared".into());
        settings
            .model_groups
            .insert("model-b".into(), "shared".into());
        settings
            .model_groups
            .insert("model-c".into(), "shared".into());
        settings.group_members.insert(
            "shared".into(),
            vec!["model-a".into(), "model-b".into(), "model-c".into()],
        );
        settings
    }

    async fn manager(settings: UsageSettings) -> (UsageManager, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let manager = UsageManager::new(
            "gemini_cli",
            settings,
            dir.path(),
            ResilientWriter::new(false),
        );
        manager
            .initialize(&[("cred-1".to_string(), 1), ("cred-2".to_string(), 1)])
            .await;
        (manager, dir)
    }

    #[tokio::test]
    async fn slot_reservation_respects_concurrency_cap() {
        let (manager, _dir) = manager(UsageSettings {
            max_concurrent: 2,
            ..Default::default()
        })
        .await;

        manager.begin_attempt("cred-1", "m").await.unwrap();
        manager.begin_attempt("cred-1", "m").await.unwrap();
        assert!(matches!(
            manager.begin_attempt("cred-1", "m").await,
            Err(GatewayError::Overloaded)
        ));

        manager
            .end_attempt("cred-1", "m", AttemptOutcome::Aborted)
            .await;
        manager.begin_attempt("cred-1", "m").await.unwrap();
    }

    #[tokio::test]
    async fn quota_reset_propagates_to_group_members() {
        let (manager, _dir) = manager(settings_with_group()).await;
        let now = now_secs();
        let reset = now + 3600;

        manager.apply_quota_reset("cred-1", "model-a", reset).await;

        // Scenario: lockout on one member blocks every member until the
        // shared reset, and leaves the other credential untouched.
        for model in ["model-a", "model-b", "model-c"] {
            assert!(!manager.is_available("cred-1", model, now + 10).await);
            assert!(manager.is_available("cred-2", model, now + 10).await);
        }
        assert!(manager.is_available("cred-1", "model-a", reset + 1).await);
    }

    #[tokio::test]
    async fn farther_future_reset_is_preserved() {
        let (manager, _dir) = manager(settings_with_group()).await;
        let now = now_secs();

        manager
            .apply_quota_reset("cred-1", "model-a", now + 7200)
            .await;
        manager
            .apply_quota_reset("cred-1", "model-b", now + 600)
            .await;

        // model-a keeps the farther reset applied first.
        assert!(!manager.is_available("cred-1", "model-a", now + 3600).await);
    }

    #[tokio::test]
    async fn success_counters_are_monotone_until_rollover() {
        let settings = UsageSettings {
            max_concurrent: 4,
            default_policy: TierPolicy {
                reset: ResetMode::PerModel { window_secs: 3600 },
                concurrency_multiplier: 1,
            },
            ..Default::default()
        };
        let (manager, _dir) = manager(settings).await;

        for _ in 0..3 {
            manager.begin_attempt("cred-1", "m").await.unwrap();
            manager
                .end_attempt(
                    "cred-1",
                    "m",
                    AttemptOutcome::Success {
                        prompt_tokens: 10,
                        completion_tokens: 5,
                    },
                )
                .await;
        }
        let (_, count) = manager.selection_stats("cred-1", "m").await;
        assert_eq!(count, 3);
    }

    #[tokio::test]
    async fn auth_failure_locks_credential_wide() {
        let (manager, _dir) = manager(UsageSettings::default()).await;
        let now = now_secs();

        manager.begin_attempt("cred-1", "model-x").await.unwrap();
        manager
            .end_attempt(
                "cred-1",
                "model-x",
                AttemptOutcome::Failure(UpstreamError::new(
                    ErrorKind::Authentication,
                    Some(401),
                    "expired",
                )),
            )
            .await;

        // Every model on the credential is blocked, not just the failing one.
        assert!(!manager.is_available("cred-1", "model-x", now + 1).await);
        assert!(!manager.is_available("cred-1", "model-y", now + 1).await);
        assert!(manager.is_available("cred-2", "model-x", now + 1).await);
    }

    #[tokio::test]
    async fn transient_quota_applies_no_cooldown() {
        let (manager, _dir) = manager(UsageSettings::default()).await;
        let now = now_secs();

        manager.begin_attempt("cred-1", "m").await.unwrap();
        manager
            .end_attempt(
                "cred-1",
                "m",
                AttemptOutcome::Failure(UpstreamError::new(
                    ErrorKind::TransientQuota,
                    Some(429),
                    "bare 429",
                )),
            )
            .await;

        assert!(manager.is_available("cred-1", "m", now + 1).await);
    }

    #[tokio::test]
    async fn dead_key_heuristic_locks_after_three_distinct_models() {
        let (manager, _dir) = manager(UsageSettings {
            max_concurrent: 4,
            ..Default::default()
        })
        .await;
        let now = now_secs();

        for model in ["m1", "m2", "m3"] {
            manager.begin_attempt("cred-1", model).await.unwrap();
            manager
                .end_attempt(
                    "cred-1",
                    model,
                    AttemptOutcome::Failure(UpstreamError::new(
                        ErrorKind::ServerError,
                        Some(500),
                        "boom",
                    )),
                )
                .await;
        }

        // Credential-wide dead-key lockout covers untouched models too.
        assert!(!manager.is_available("cred-1", "m4", now + 1).await);
    }

    #[tokio::test]
    async fn fair_cycle_excludes_exhausted_until_all_exhaust() {
        let (manager, _dir) = manager(settings_with_group()).await;
        let now = now_secs();

        manager
            .apply_quota_reset("cred-1", "model-a", now + 3600)
            .await;
        assert!(manager.fair_cycle_excluded("cred-1", "model-a", now).await);
        assert!(!manager.fair_cycle_excluded("cred-2", "model-a", now).await);

        manager
            .apply_quota_reset("cred-2", "model-a", now + 3600)
            .await;
        // All exhausted: cycle resets atomically, nobody stays excluded.
        assert!(!manager.fair_cycle_excluded("cred-1", "model-a", now).await);
        assert!(!manager.fair_cycle_excluded("cred-2", "model-a", now).await);
    }

    #[tokio::test]
    async fn next_available_at_reports_earliest_reset() {
        let (manager, _dir) = manager(settings_with_group()).await;
        let now = now_secs();

        manager
            .apply_quota_reset("cred-1", "model-a", now + 600)
            .await;
        manager
            .apply_quota_reset("cred-2", "model-a", now + 1200)
            .await;

        let next = manager.next_available_at("model-a", now + 1).await.unwrap();
        assert_eq!(next, now + 600);
    }
}
