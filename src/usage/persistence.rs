use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{info, warn};

use crate::constants::USAGE_SAVE_DEBOUNCE_SECS;
use crate::store::writer::ResilientWriter;
use crate::usage::fair_cycle::ScopeState;
use crate::usage::types::CredentialUsage;
use crate::utils::time::now_secs;

const SCHEMA_VERSION: u64 = 1;

/// Debounced persistence for one provider's usage store, layered on the
/// resilient writer. Layout: `<data_dir>/usage/usage_<provider>.json`.
pub struct UsagePersistence {
    path: PathBuf,
    writer: Arc<ResilientWriter>,
    last_save: AtomicI64,
    dirty: AtomicBool,
}

impl UsagePersistence {
    pub fn new(data_dir: &std::path::Path, provider: &str, writer: Arc<ResilientWriter>) -> Self {
        Self {
            path: data_dir
                .join("usage")
                .join(format!("usage_{}.json", provider)),
            writer,
            last_save: AtomicI64::new(0),
            dirty: AtomicBool::new(false),
        }
    }

    /// Load persisted state. Missing or unparseable files start fresh.
    pub fn load(&self) -> (HashMap<String, CredentialUsage>, HashMap<String, ScopeState>) {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(_) => return (HashMap::new(), HashMap::new()),
        };
        let data: Value = match serde_json::from_str(&content) {
            Ok(v) => v,
            Err(e) => {
                warn!(
                    "[Usage] failed_to_parse_usage_file {}: {}",
                    self.path.display(),
                    e
                );
                return (HashMap::new(), HashMap::new());
            }
        };

        let mut states = HashMap::new();
        if let Some(credentials) = data.get("credentials").and_then(|c| c.as_object()) {
            for (id, raw) in credentials {
                match serde_json::from_value::<CredentialUsage>(raw.clone()) {
                    Ok(state) => {
                        states.insert(id.clone(), state);
                    }
                    Err(e) => warn!("[Usage] skipping_unparseable_credential {}: {}", id, e),
                }
            }
        }

        let fair_cycle = data
            .get("fair_cycle")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();

        if !states.is_empty() {
            info!(
                "[Usage] loaded {} credential state(s) from {}",
                states.len(),
                self.path.display()
            );
        }
        (states, fair_cycle)
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Relaxed);
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Relaxed)
    }

    /// Persist a snapshot. Debounced unless forced; encoding and disk IO run
    /// off the scheduling threads.
    pub async fn save(
        &self,
        states: HashMap<String, CredentialUsage>,
        fair_cycle: HashMap<String, ScopeState>,
        force: bool,
    ) -> bool {
        let now = now_secs();
        if !force && now - self.last_save.load(Ordering::Relaxed) < USAGE_SAVE_DEBOUNCE_SECS {
            self.dirty.store(true, Ordering::Relaxed);
            return false;
        }

        let payload = json!({
            "schema_version": SCHEMA_VERSION,
            "updated_at": chrono::Utc::now().to_rfc3339(),
            "credentials": states,
            "fair_cycle": fair_cycle,
        });

        let writer = Arc::clone(&self.writer);
        let path = self.path.clone();
        let joined = tokio::task::spawn_blocking(move || writer.write(&path, payload)).await;
        if joined.is_err() {
            warn!("[Usage] persistence task panicked for {}", self.path.display());
            return false;
        }

        self.last_save.store(now, Ordering::Relaxed);
        self.dirty.store(false, Ordering::Relaxed);
        true
    }
}
