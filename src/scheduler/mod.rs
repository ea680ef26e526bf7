use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use rand::Rng;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::auth::token_manager::TokenManager;
use crate::error::{GatewayError, GatewayResult};
use crate::providers::{AdapterRegistry, RotationMode};
use crate::store::credentials::CredentialRecord;
use crate::usage::types::AttemptOutcome;
use crate::usage::UsageManager;
use crate::utils::time::now_secs;

/// A reserved (credential, model) slot. The executor must hand it back via
/// `Scheduler::release` exactly once.
pub struct CredentialLease {
    pub record: CredentialRecord,
    pub provider: String,
    pub model: String,
}

struct Candidate {
    id: String,
    tier: u8,
    active: u32,
    used: u64,
}

/// Credential acquisition: filtering, fair-cycle, tier partitioning,
/// idle/busy sub-tiers and rotation-mode selection, with a per-provider
/// wait when nothing is usable. The scheduler is the only component holding
/// both the token manager and the usage managers.
pub struct Scheduler {
    tokens: Arc<TokenManager>,
    usage: HashMap<String, Arc<UsageManager>>,
    registry: Arc<AdapterRegistry>,
    notifiers: DashMap<String, Arc<Notify>>,
    rotation_tolerance: f64,
}

impl Scheduler {
    pub fn new(
        tokens: Arc<TokenManager>,
        usage: HashMap<String, Arc<UsageManager>>,
        registry: Arc<AdapterRegistry>,
        rotation_tolerance: f64,
    ) -> Self {
        Self {
            tokens,
            usage,
            registry,
            notifiers: DashMap::new(),
            rotation_tolerance,
        }
    }

    pub fn usage_for(&self, provider: &str) -> Option<Arc<UsageManager>> {
        self.usage.get(provider).cloned()
    }

    fn notifier(&self, provider: &str) -> Arc<Notify> {
        self.notifiers
            .entry(provider.to_string())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    /// Acquire a credential for the model, waiting until `deadline` when the
    /// whole pool is busy or cooling down. Waiters are not FIFO: every wake
    /// re-runs the filter so freshly cooled-down credentials are seen.
    pub async fn acquire(
        &self,
        provider: &str,
        model: &str,
        deadline: Instant,
    ) -> GatewayResult<CredentialLease> {
        let usage = self
            .usage
            .get(provider)
            .ok_or_else(|| GatewayError::UnknownProvider(provider.to_string()))?;
        let adapter = self
            .registry
            .get(provider)
            .ok_or_else(|| GatewayError::UnknownProvider(provider.to_string()))?;
        let notifier = self.notifier(provider);

        loop {
            let mut candidates = self.eligible_candidates(provider, model, usage, &adapter).await;

            // Tiers ascend numerically; idle credentials beat busy ones
            // within a tier; the rotation mode orders the rest.
            candidates.sort_by_key(|c| c.tier);
            while !candidates.is_empty() {
                let tier = candidates[0].tier;
                let tier_len = candidates.iter().take_while(|c| c.tier == tier).count();

                let Some(index) =
                    self.pick_within_tier(&candidates[..tier_len], adapter.rotation_mode())
                else {
                    candidates.drain(..tier_len);
                    continue;
                };
                let chosen_id = candidates[index].id.clone();
                let (chosen_tier, chosen_active, chosen_used) = (
                    candidates[index].tier,
                    candidates[index].active,
                    candidates[index].used,
                );

                match usage.begin_attempt(&chosen_id, model).await {
                    Ok(()) => {
                        let Some(record) = self.tokens.snapshot(&chosen_id).await else {
                            usage
                                .end_attempt(&chosen_id, model, AttemptOutcome::Aborted)
                                .await;
                            return Err(GatewayError::Config(format!(
                                "credential {} vanished from token manager",
                                chosen_id
                            )));
                        };
                        trace!(
                            "[Scheduler] {} -> {} (tier {}, active {}, used {})",
                            model,
                            record.display_name(),
                            chosen_tier,
                            chosen_active,
                            chosen_used
                        );
                        return Ok(CredentialLease {
                            record,
                            provider: provider.to_string(),
                            model: model.to_string(),
                        });
                    }
                    Err(GatewayError::Overloaded) => {
                        // Slots raced away; drop this candidate and keep
                        // trying the rest of the pool.
                        candidates.retain(|c| c.id != chosen_id);
                    }
                    Err(e) => return Err(e),
                }
            }

            // Nothing usable right now: wait for a release, the earliest
            // cooldown expiry, or the deadline, whichever fires first.
            let now = Instant::now();
            if now >= deadline {
                return Err(self.no_key_error(provider, model, usage).await);
            }
            let mut wait = deadline - now;
            if let Some(reset_at) = usage.next_available_at(model, now_secs()).await {
                let until_reset = (reset_at - now_secs()).max(1) as u64;
                wait = wait.min(std::time::Duration::from_secs(until_reset));
            }

            debug!(
                "[Scheduler] no usable credential for {}/{}, waiting up to {:?}",
                provider, model, wait
            );
            tokio::select! {
                _ = notifier.notified() => {}
                _ = tokio::time::sleep(wait) => {}
            }
            if Instant::now() >= deadline {
                return Err(self.no_key_error(provider, model, usage).await);
            }
        }
    }

    /// Release a lease and wake every waiter on the provider.
    pub async fn release(&self, lease: CredentialLease, outcome: AttemptOutcome) {
        if let Some(usage) = self.usage.get(&lease.provider) {
            usage
                .end_attempt(&lease.record.id, &lease.model, outcome)
                .await;
        }
        self.notifier(&lease.provider).notify_waiters();
    }

    async fn eligible_candidates(
        &self,
        _provider: &str,
        model: &str,
        usage: &Arc<UsageManager>,
        adapter: &Arc<dyn crate::providers::ProviderAdapter>,
    ) -> Vec<Candidate> {
        let now = now_secs();
        let mut out = Vec::new();
        for id in usage.credential_ids() {
            if !self.tokens.is_available(&id).await {
                continue;
            }
            if !usage.is_available(&id, model, now).await {
                continue;
            }
            if usage.fair_cycle_excluded(&id, model, now).await {
                continue;
            }
            let tier = usage.tier(&id).await;
            if let Some(min_tier) = adapter.min_tier_for_model(model) {
                if tier > min_tier {
                    continue;
                }
            }
            let (active, used) = usage.selection_stats(&id, model).await;
            out.push(Candidate {
                id,
                tier,
                active,
                used,
            });
        }
        out
    }

    /// Pick inside one tier: idle sub-tier first, then busy; ordering by the
    /// adapter's rotation mode.
    fn pick_within_tier(&self, tier: &[Candidate], mode: RotationMode) -> Option<usize> {
        if tier.is_empty() {
            return None;
        }
        let idle: Vec<usize> = (0..tier.len()).filter(|&i| tier[i].active == 0).collect();
        let busy: Vec<usize> = (0..tier.len()).filter(|&i| tier[i].active > 0).collect();

        for sub_tier in [idle, busy] {
            if sub_tier.is_empty() {
                continue;
            }
            let picked = match mode {
                RotationMode::Balanced => self.pick_balanced(tier, &sub_tier),
                RotationMode::Sequential => sub_tier
                    .iter()
                    .copied()
                    .max_by_key(|&i| (tier[i].used, std::cmp::Reverse(tier[i].id.clone()))),
            };
            if picked.is_some() {
                return picked;
            }
        }
        None
    }

    /// Weighted random biased toward least-used; tolerance 0 degenerates to
    /// the deterministic least-used pick.
    fn pick_balanced(&self, tier: &[Candidate], sub_tier: &[usize]) -> Option<usize> {
        if self.rotation_tolerance <= f64::EPSILON {
            return sub_tier
                .iter()
                .copied()
                .min_by_key(|&i| (tier[i].used, tier[i].id.clone()));
        }
        let exponent = 1.0 / self.rotation_tolerance;
        let weights: Vec<f64> = sub_tier
            .iter()
            .map(|&i| (1.0 / (1.0 + tier[i].used as f64)).powf(exponent.min(64.0)))
            .collect();
        let total: f64 = weights.iter().sum();
        if total <= 0.0 {
            return sub_tier.first().copied();
        }
        let mut roll = rand::thread_rng().gen_range(0.0..total);
        for (slot, weight) in sub_tier.iter().zip(weights.iter()) {
            if roll < *weight {
                return Some(*slot);
            }
            roll -= weight;
        }
        sub_tier.last().copied()
    }

    async fn no_key_error(
        &self,
        provider: &str,
        model: &str,
        usage: &Arc<UsageManager>,
    ) -> GatewayError {
        let reason = match usage.next_available_at(model, now_secs()).await {
            Some(reset_at) if reset_at > now_secs() => {
                let when = chrono::DateTime::from_timestamp(reset_at, 0)
                    .map(|dt| dt.to_rfc3339())
                    .unwrap_or_else(|| reset_at.to_string());
                format!("all credentials cooling down; next reset at {}", when)
            }
            _ => "deadline elapsed while waiting for a credential".to_string(),
        };
        GatewayError::NoKeyAvailable {
            provider: provider.to_string(),
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::AdapterRegistry;
    use crate::store::credentials::{CredentialKind, ProxyMetadata};
    use crate::store::writer::ResilientWriter;
    use crate::usage::UsageSettings;
    use std::time::Duration;

    fn static_record(id: &str) -> CredentialRecord {
        CredentialRecord {
            provider: "openai".into(),
            kind: CredentialKind::StaticKey,
            id: id.into(),
            oauth: None,
            api_key: Some(format!("sk-{}", id)),
            metadata: ProxyMetadata::default(),
        }
    }

    async fn build_scheduler(
        ids: &[&str],
        tolerance: f64,
        max_concurrent: u32,
    ) -> (Scheduler, Arc<UsageManager>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let writer = ResilientWriter::new(false);
        let tokens = Arc::new(TokenManager::new(writer.clone(), reqwest::Client::new()));
        for id in ids {
            tokens.register(static_record(id));
        }

        let usage = Arc::new(UsageManager::new(
            "openai",
            UsageSettings {
                max_concurrent,
                ..Default::default()
            },
            dir.path(),
            writer,
        ));
        usage
            .initialize(
                &ids.iter()
                    .map(|id| (id.to_string(), 1u8))
                    .collect::<Vec<_>>(),
            )
            .await;

        let mut managers = HashMap::new();
        managers.insert("openai".to_string(), usage.clone());
        let scheduler = Scheduler::new(
            tokens,
            managers,
            Arc::new(AdapterRegistry::with_defaults()),
            tolerance,
        );
        (scheduler, usage, dir)
    }

    fn soon(secs: u64) -> Instant {
        Instant::now() + Duration::from_secs(secs)
    }

    #[tokio::test]
    async fn acquire_returns_a_lease_and_release_frees_the_slot() {
        let (scheduler, _usage, _dir) = build_scheduler(&["k1"], 0.0, 1).await;

        let lease = scheduler.acquire("openai", "gpt-4o", soon(5)).await.unwrap();
        assert_eq!(lease.record.id, "k1");

        // Pool of one, slot taken: the next acquire must wait out its deadline.
        let t0 = Instant::now();
        let denied = scheduler
            .acquire("openai", "gpt-4o", Instant::now() + Duration::from_millis(200))
            .await;
        assert!(matches!(denied, Err(GatewayError::NoKeyAvailable { .. })));
        assert!(t0.elapsed() >= Duration::from_millis(180));

        scheduler.release(lease, AttemptOutcome::Aborted).await;
        let again = scheduler.acquire("openai", "gpt-4o", soon(5)).await;
        assert!(again.is_ok());
    }

    #[tokio::test]
    async fn release_wakes_a_waiter() {
        let (scheduler, _usage, _dir) = build_scheduler(&["k1"], 0.0, 1).await;
        let scheduler = Arc::new(scheduler);

        let lease = scheduler.acquire("openai", "gpt-4o", soon(5)).await.unwrap();

        let waiter = {
            let scheduler = Arc::clone(&scheduler);
            tokio::spawn(async move { scheduler.acquire("openai", "gpt-4o", soon(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        scheduler.release(lease, AttemptOutcome::Aborted).await;

        let acquired = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .expect("waiter should wake promptly")
            .unwrap();
        assert!(acquired.is_ok());
    }

    #[tokio::test]
    async fn strict_least_used_rotates_across_the_pool() {
        let (scheduler, _usage, _dir) = build_scheduler(&["k1", "k2", "k3"], 0.0, 4).await;

        // Three sequential request cycles with success accounting must visit
        // all three credentials before reusing one.
        let mut seen = std::collections::HashSet::new();
        for _ in 0..3 {
            let lease = scheduler.acquire("openai", "gpt-4o", soon(5)).await.unwrap();
            seen.insert(lease.record.id.clone());
            scheduler
                .release(
                    lease,
                    AttemptOutcome::Success {
                        prompt_tokens: 1,
                        completion_tokens: 1,
                    },
                )
                .await;
        }
        assert_eq!(seen.len(), 3);
    }

    #[tokio::test]
    async fn idle_credentials_beat_busy_ones() {
        let (scheduler, _usage, _dir) = build_scheduler(&["k1", "k2"], 0.0, 4).await;

        let first = scheduler.acquire("openai", "gpt-4o", soon(5)).await.unwrap();
        let second = scheduler.acquire("openai", "gpt-4o", soon(5)).await.unwrap();
        // The second lease must land on the idle credential.
        assert_ne!(first.record.id, second.record.id);
        scheduler.release(first, AttemptOutcome::Aborted).await;
        scheduler.release(second, AttemptOutcome::Aborted).await;
    }

    #[tokio::test]
    async fn unknown_provider_is_rejected() {
        let (scheduler, _usage, _dir) = build_scheduler(&["k1"], 0.0, 1).await;
        assert!(matches!(
            scheduler.acquire("nope", "m", soon(1)).await,
            Err(GatewayError::UnknownProvider(_))
        ));
    }
}
