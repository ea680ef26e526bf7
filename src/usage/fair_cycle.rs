use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::constants::FAIR_CYCLE_DURATION_SECS;

/// Fair-cycle bookkeeping for one tracking scope (a model quota group, or the
/// credential-wide scope). A credential that exhausts its quota is skipped
/// until every peer in the scope has also exhausted or the cycle ages out;
/// either condition clears the whole set in one step.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScopeState {
    pub exhausted: HashSet<String>,
    pub cycle_started_at: i64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct FairCycleTracker {
    scopes: HashMap<String, ScopeState>,
}

impl FairCycleTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_exhausted(&mut self, scope: &str, credential_id: &str, now: i64) {
        let state = self.scopes.entry(scope.to_string()).or_default();
        if state.exhausted.is_empty() {
            state.cycle_started_at = now;
        }
        if state.exhausted.insert(credential_id.to_string()) {
            debug!(
                "[FairCycle] {} exhausted in scope '{}' ({} total)",
                credential_id,
                scope,
                state.exhausted.len()
            );
        }
    }

    /// Whether the credential should be skipped this cycle. Clears the cycle
    /// atomically when the exhausted set covers the full member list or the
    /// cycle has aged past `FAIR_CYCLE_DURATION_SECS`.
    pub fn is_excluded(
        &mut self,
        scope: &str,
        credential_id: &str,
        all_members: &[String],
        now: i64,
    ) -> bool {
        let Some(state) = self.scopes.get_mut(scope) else {
            return false;
        };
        if state.exhausted.is_empty() {
            return false;
        }

        let aged_out = now - state.cycle_started_at > FAIR_CYCLE_DURATION_SECS;
        let all_exhausted = !all_members.is_empty()
            && all_members.iter().all(|m| state.exhausted.contains(m));
        if aged_out || all_exhausted {
            debug!(
                "[FairCycle] cycle reset for scope '{}' (aged_out={}, all_exhausted={})",
                scope, aged_out, all_exhausted
            );
            state.exhausted.clear();
            state.cycle_started_at = now;
            return false;
        }

        state.exhausted.contains(credential_id)
    }

    pub fn snapshot(&self) -> &HashMap<String, ScopeState> {
        &self.scopes
    }

    pub fn restore(&mut self, scopes: HashMap<String, ScopeState>) {
        self.scopes = scopes;
    }
}
