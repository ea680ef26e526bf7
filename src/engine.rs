use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::auth::token_manager::TokenManager;
use crate::batch::EmbeddingBatcher;
use crate::constants::MODEL_LIST_TTL_SECS;
use crate::dispatch::executor::Executor;
use crate::error::{GatewayError, GatewayResult};
use crate::models::AppConfig;
use crate::providers::AdapterRegistry;
use crate::scheduler::Scheduler;
use crate::store::credentials::CredentialStore;
use crate::store::writer::ResilientWriter;
use crate::usage::types::TierPolicy;
use crate::usage::{UsageManager, UsageSettings};
use crate::utils::time::now_secs;

/// The composed gateway: every process-wide singleton lives here and is
/// passed by reference. Constructed once at startup; no ambient globals.
pub struct Engine {
    pub config: AppConfig,
    pub writer: Arc<ResilientWriter>,
    pub tokens: Arc<TokenManager>,
    pub registry: Arc<AdapterRegistry>,
    pub scheduler: Arc<Scheduler>,
    pub executor: Arc<Executor>,
    pub batcher: Arc<EmbeddingBatcher>,
    usage: HashMap<String, Arc<UsageManager>>,
    /// provider -> (models, fetched_at) with TTL.
    model_catalog: DashMap<String, (Vec<String>, i64)>,
    /// Providers that actually have credentials.
    active_providers: Vec<String>,
}

impl Engine {
    pub async fn new(config: AppConfig) -> GatewayResult<Arc<Self>> {
        let data_dir = config.proxy.data_dir.clone();
        let writer = ResilientWriter::new(true);
        writer.start_retry_ticker();

        let registry = Arc::new(AdapterRegistry::with_defaults());
        let tokens = Arc::new(TokenManager::new(
            Arc::clone(&writer),
            crate::utils::http::get_client(),
        ));

        let mut store = CredentialStore::new(&data_dir);
        store.discover();

        let mut usage: HashMap<String, Arc<UsageManager>> = HashMap::new();
        let mut active_providers = Vec::new();
        let mut provider_credentials: HashMap<String, Vec<crate::store::credentials::CredentialRecord>> =
            HashMap::new();

        for provider in store.providers() {
            let Some(adapter) = registry.get(&provider) else {
                warn!(
                    "[Engine] credentials found for unknown provider '{}', skipping",
                    provider
                );
                continue;
            };

            let mut initialized: Vec<(String, u8)> = Vec::new();
            let mut records = Vec::new();
            for id in store.list(&provider) {
                match store.load(&provider, &id) {
                    Ok(record) => {
                        let tier = adapter.credential_tier(&record);
                        tokens.register(record.clone());
                        initialized.push((id, tier));
                        records.push(record);
                    }
                    Err(e) => warn!("[Engine] failed_to_load_credential {}: {}", id, e),
                }
            }
            if initialized.is_empty() {
                continue;
            }

            let mut policies: HashMap<u8, TierPolicy> = HashMap::new();
            for tier in 1..=4u8 {
                policies.insert(tier, adapter.tier_policy(tier));
            }
            let mut model_groups = HashMap::new();
            let mut group_members = HashMap::new();
            for (group, members) in adapter.quota_groups() {
                for member in &members {
                    model_groups.insert(member.clone(), group.clone());
                }
                group_members.insert(group, members);
            }

            let settings = UsageSettings {
                max_concurrent: config
                    .max_concurrent_per_key
                    .get(&provider)
                    .copied()
                    .unwrap_or(adapter.max_concurrent() as usize) as u32,
                policies,
                default_policy: adapter.tier_policy(u8::MAX),
                model_groups,
                group_members,
                custom_caps: config.custom_caps.clone(),
                fair_cycle_enabled: config.fair_cycle_providers.contains(&provider),
            };

            let manager = Arc::new(UsageManager::new(
                &provider,
                settings,
                &data_dir,
                Arc::clone(&writer),
            ));
            manager.initialize(&initialized).await;
            usage.insert(provider.clone(), manager);
            provider_credentials.insert(provider.clone(), records);
            active_providers.push(provider);
        }

        if active_providers.is_empty() {
            warn!("[Engine] no provider credentials configured; requests will fail");
        }

        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&tokens),
            usage.clone(),
            Arc::clone(&registry),
            config.rotation.tolerance,
        ));

        let executor = Arc::new(Executor::new(
            Arc::clone(&scheduler),
            Arc::clone(&tokens),
            Arc::clone(&registry),
            crate::utils::http::get_client(),
            crate::utils::http::get_streaming_client(),
            config.proxy.max_retries_per_key,
            config.proxy.enable_request_logging,
        ));

        let batcher = EmbeddingBatcher::new(
            Arc::clone(&executor),
            config.batch.size,
            Duration::from_millis(config.batch.timeout_ms),
            Duration::from_secs(config.proxy.global_timeout_secs),
        );

        active_providers.sort();
        let engine = Arc::new(Self {
            config,
            writer,
            tokens,
            registry,
            scheduler,
            executor,
            batcher,
            usage,
            model_catalog: DashMap::new(),
            active_providers,
        });

        engine.spawn_background_jobs(provider_credentials);
        engine.spawn_usage_flusher();
        Ok(engine)
    }

    pub fn providers(&self) -> &[String] {
        &self.active_providers
    }

    pub fn usage_manager(&self, provider: &str) -> Option<Arc<UsageManager>> {
        self.usage.get(provider).cloned()
    }

    /// Model catalog for a provider, filtered and cached with a TTL.
    pub fn models_for(&self, provider: &str) -> Vec<String> {
        let now = now_secs();
        if let Some(entry) = self.model_catalog.get(provider) {
            let (models, fetched_at) = entry.value();
            if now - fetched_at < MODEL_LIST_TTL_SECS {
                return models.clone();
            }
        }
        let Some(adapter) = self.registry.get(provider) else {
            return Vec::new();
        };
        let ignored = self.config.ignore_models.get(provider);
        let whitelist = self.config.whitelist_models.get(provider);
        let models: Vec<String> = adapter
            .models()
            .into_iter()
            .filter(|m| ignored.map_or(true, |list| !list.contains(m)))
            .filter(|m| whitelist.map_or(true, |list| list.is_empty() || list.contains(m)))
            .collect();
        self.model_catalog
            .insert(provider.to_string(), (models.clone(), now));
        models
    }

    /// Full wire-format catalog: `provider/model` ids.
    pub fn all_models(&self) -> Vec<String> {
        let mut out = Vec::new();
        for provider in &self.active_providers {
            for model in self.models_for(provider) {
                out.push(format!("{}/{}", provider, model));
            }
        }
        out
    }

    /// Aggregated usage snapshot for the stats endpoint.
    pub async fn usage_stats(&self) -> serde_json::Value {
        let mut providers = serde_json::Map::new();
        for (provider, manager) in &self.usage {
            providers.insert(provider.clone(), manager.stats_snapshot().await);
        }
        serde_json::json!({
            "providers": providers,
            "timestamp": now_secs(),
        })
    }

    fn spawn_background_jobs(
        self: &Arc<Self>,
        provider_credentials: HashMap<String, Vec<crate::store::credentials::CredentialRecord>>,
    ) {
        for (provider, records) in provider_credentials {
            let Some(adapter) = self.registry.get(&provider) else {
                continue;
            };
            let Some(job) = adapter.background_job() else {
                continue;
            };
            let Some(manager) = self.usage.get(&provider).cloned() else {
                continue;
            };
            let http = crate::utils::http::get_client();
            info!(
                "[Engine] scheduling background job '{}' for {} every {}s",
                job.name, provider, job.interval_secs
            );
            tokio::spawn(async move {
                let mut interval =
                    tokio::time::interval(Duration::from_secs(job.interval_secs));
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                if !job.run_on_start {
                    interval.tick().await;
                }
                loop {
                    interval.tick().await;
                    if let Err(e) = adapter
                        .run_background_job(&records, manager.as_ref(), &http)
                        .await
                    {
                        debug!("[Engine] background job '{}' failed: {}", job.name, e);
                    }
                }
            });
        }
    }

    fn spawn_usage_flusher(self: &Arc<Self>) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(15));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                for manager in engine.usage.values() {
                    manager.save(false).await;
                }
            }
        });
    }

    /// Flush all state. Returns the number of writes still pending; the
    /// process exits non-zero when this is not zero.
    pub async fn shutdown(&self) -> usize {
        info!("[Engine] flushing state before exit");
        for manager in self.usage.values() {
            manager.shutdown().await;
        }
        self.writer.shutdown_ticker();
        self.writer.flush_all()
    }

    /// Split a wire model id (`provider/model`) and check the provider.
    pub fn split_model(&self, wire_model: &str) -> GatewayResult<(String, String)> {
        let (provider, model) = wire_model.split_once('/').ok_or_else(|| {
            GatewayError::InvalidRequest(format!(
                "model '{}' must use the provider/model format",
                wire_model
            ))
        })?;
        if self.registry.get(provider).is_none() {
            return Err(GatewayError::UnknownProvider(provider.to_string()));
        }
        Ok((provider.to_string(), model.to_string()))
    }
}
