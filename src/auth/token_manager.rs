use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::json;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

use crate::constants::PROACTIVE_REFRESH_BUFFER_SECS;
use crate::error::{mask_credential, GatewayError, GatewayResult};
use crate::store::credentials::{CredentialKind, CredentialRecord};
use crate::store::writer::ResilientWriter;
use crate::utils::time::now_secs;

/// Owns every credential's OAuth token fields. All mutation goes through the
/// per-credential mutex; refreshed tokens are persisted before the in-memory
/// record is swapped so a crash mid-refresh never leaves a newer disk state
/// behind a staler cache.
pub struct TokenManager {
    records: DashMap<String, Arc<Mutex<CredentialRecord>>>,
    /// Coalesces concurrent refreshes per credential id.
    in_flight: DashMap<String, Arc<Notify>>,
    reauth_set: DashMap<String, i64>,
    reauth_order: Mutex<VecDeque<String>>,
    /// Interactive re-authorization is serialized process-wide; holding this
    /// lock stands in for the single browser/device flow.
    reauth_flow_lock: Arc<Mutex<()>>,
    writer: Arc<ResilientWriter>,
    http: reqwest::Client,
}

impl TokenManager {
    pub fn new(writer: Arc<ResilientWriter>, http: reqwest::Client) -> Self {
        Self {
            records: DashMap::new(),
            in_flight: DashMap::new(),
            reauth_set: DashMap::new(),
            reauth_order: Mutex::new(VecDeque::new()),
            reauth_flow_lock: Arc::new(Mutex::new(())),
            writer,
            http,
        }
    }

    pub fn register(&self, record: CredentialRecord) {
        self.records
            .insert(record.id.clone(), Arc::new(Mutex::new(record)));
    }

    pub fn remove(&self, id: &str) {
        self.records.remove(id);
        self.reauth_set.remove(id);
    }

    pub async fn snapshot(&self, id: &str) -> Option<CredentialRecord> {
        let record = self.records.get(id)?.clone();
        let guard = record.lock().await;
        Some(guard.clone())
    }

    /// A valid `Authorization` header value, refreshing first when the token
    /// is already expired and scheduling a background refresh when it is
    /// inside the proactive buffer.
    pub async fn get_auth_header(self: &Arc<Self>, id: &str) -> GatewayResult<String> {
        if self.reauth_set.contains_key(id) {
            return Err(GatewayError::NeedsReauth(id.to_string()));
        }

        let record = self
            .records
            .get(id)
            .map(|r| r.clone())
            .ok_or_else(|| GatewayError::Config(format!("unknown credential: {}", id)))?;

        let (kind, header, expiry_secs) = {
            let guard = record.lock().await;
            match guard.kind {
                CredentialKind::StaticKey => {
                    let key = guard.api_key.clone().ok_or_else(|| {
                        GatewayError::Config(format!("static credential {} has no key", id))
                    })?;
                    return Ok(format!("Bearer {}", key));
                }
                CredentialKind::OAuth => {
                    let oauth = guard.oauth.as_ref().ok_or_else(|| {
                        GatewayError::Config(format!("oauth credential {} has no tokens", id))
                    })?;
                    (
                        guard.kind,
                        format!("Bearer {}", oauth.access_token),
                        oauth.expiry_date / 1000,
                    )
                }
            }
        };
        debug_assert_eq!(kind, CredentialKind::OAuth);

        let now = now_secs();
        if expiry_secs <= now {
            // Hard expired: refresh inline before answering.
            self.refresh(id).await?;
            let guard = record.lock().await;
            let oauth = guard
                .oauth
                .as_ref()
                .ok_or_else(|| GatewayError::NeedsReauth(id.to_string()))?;
            return Ok(format!("Bearer {}", oauth.access_token));
        }

        if expiry_secs - now < PROACTIVE_REFRESH_BUFFER_SECS {
            self.proactively_refresh(id);
        }
        Ok(header)
    }

    /// Fire-and-forget refresh; concurrent calls for the same id coalesce.
    pub fn proactively_refresh(self: &Arc<Self>, id: &str) {
        let manager = Arc::clone(self);
        let id = id.to_string();
        tokio::spawn(async move {
            if let Err(e) = manager.refresh(&id).await {
                debug!(
                    "[Refresh] proactive refresh failed for {}: {}",
                    mask_credential(&id),
                    e
                );
            }
        });
    }

    /// Refresh the credential's access token. On `invalid_grant`/401/403 the
    /// credential is queued for re-authorization and the call fails with
    /// `NeedsReauth`.
    pub async fn refresh(self: &Arc<Self>, id: &str) -> GatewayResult<()> {
        // Coalesce: the second caller waits for the first to finish. The
        // wait is bounded so a notification racing ahead of `notified()`
        // cannot strand the waiter.
        let notify = match self.in_flight.entry(id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(existing) => {
                let notify = existing.get().clone();
                drop(existing);
                let _ = tokio::time::timeout(
                    std::time::Duration::from_secs(30),
                    notify.notified(),
                )
                .await;
                if self.reauth_set.contains_key(id) {
                    return Err(GatewayError::NeedsReauth(id.to_string()));
                }
                return Ok(());
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let notify = Arc::new(Notify::new());
                slot.insert(notify.clone());
                notify
            }
        };

        let result = self.refresh_inner(id).await;

        self.in_flight.remove(id);
        notify.notify_waiters();
        result
    }

    async fn refresh_inner(&self, id: &str) -> GatewayResult<()> {
        let record = self
            .records
            .get(id)
            .map(|r| r.clone())
            .ok_or_else(|| GatewayError::Config(format!("unknown credential: {}", id)))?;

        let (token_uri, refresh_token, env_backed) = {
            let guard = record.lock().await;
            let oauth = guard
                .oauth
                .as_ref()
                .ok_or_else(|| GatewayError::Config(format!("{} is not an oauth credential", id)))?;
            (
                oauth.token_uri.clone(),
                oauth.refresh_token.clone(),
                guard.is_env_backed(),
            )
        };

        let response =
            match crate::auth::oauth::refresh_access_token(&self.http, &token_uri, &refresh_token, id)
                .await
            {
                Ok(r) => r,
                Err(GatewayError::NeedsReauth(cred)) => {
                    self.enqueue_reauth(&cred).await;
                    return Err(GatewayError::NeedsReauth(cred));
                }
                Err(e) => return Err(e),
            };

        let mut guard = record.lock().await;
        let metadata_email = guard.metadata.email.clone();
        let metadata_account_id = guard.metadata.account_id.clone();
        let Some(oauth) = guard.oauth.as_mut() else {
            return Err(GatewayError::Config(format!("{} lost its oauth record", id)));
        };

        let mut updated = oauth.clone();
        updated.access_token = response.access_token;
        updated.expiry_date = (now_secs() + response.expires_in) * 1000;
        if let Some(refresh) = response.refresh_token {
            updated.refresh_token = refresh;
        }
        if let Some(id_token) = response.id_token {
            updated.id_token = Some(id_token);
        }

        // Persist first, swap second. Env-backed credentials never hit disk.
        if !env_backed {
            let payload = json!({
                "access_token": updated.access_token,
                "refresh_token": updated.refresh_token,
                "id_token": updated.id_token,
                "expiry_date": updated.expiry_date,
                "token_uri": updated.token_uri,
                "project_id": updated.project_id,
                "tier": updated.tier,
                "_proxy_metadata": {
                    "email": metadata_email,
                    "account_id": metadata_account_id,
                    "last_check_timestamp": now_secs(),
                    "loaded_from_env": false,
                    "env_credential_index": serde_json::Value::Null,
                },
            });
            let writer = Arc::clone(&self.writer);
            let path = PathBuf::from(id);
            tokio::task::spawn_blocking(move || writer.write(&path, payload))
                .await
                .map_err(|e| GatewayError::Config(format!("persist task failed: {}", e)))?;
        }

        *oauth = updated;
        guard.metadata.last_check_timestamp = Some(now_secs());
        self.reauth_set.remove(id);
        info!("[Refresh] credential {} refreshed", guard.display_name());
        Ok(())
    }

    pub async fn enqueue_reauth(&self, id: &str) {
        if self.reauth_set.insert(id.to_string(), now_secs()).is_none() {
            self.reauth_order.lock().await.push_back(id.to_string());
            warn!(
                "[Reauth] credential {} queued for re-authorization",
                mask_credential(id)
            );
        }
    }

    pub fn needs_reauth(&self, id: &str) -> bool {
        self.reauth_set.contains_key(id)
    }

    pub async fn reauth_queue(&self) -> Vec<String> {
        self.reauth_order.lock().await.iter().cloned().collect()
    }

    /// The process-wide lock any interactive re-auth flow must hold; keeps
    /// concurrent browser launches from racing.
    pub fn reauth_flow_lock(&self) -> Arc<Mutex<()>> {
        Arc::clone(&self.reauth_flow_lock)
    }

    /// False when the credential cannot produce a usable token: queued for
    /// re-auth, or expired without a refresh token.
    pub async fn is_available(&self, id: &str) -> bool {
        if self.reauth_set.contains_key(id) {
            return false;
        }
        let Some(record) = self.records.get(id).map(|r| r.clone()) else {
            return false;
        };
        let guard = record.lock().await;
        match guard.kind {
            CredentialKind::StaticKey => guard.api_key.is_some(),
            CredentialKind::OAuth => match guard.oauth.as_ref() {
                Some(oauth) => {
                    oauth.expiry_date / 1000 > now_secs() || !oauth.refresh_token.is_empty()
                }
                None => false,
            },
        }
    }
}
