use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::auth::jwt;
use crate::error::{GatewayError, GatewayResult};
use crate::utils::time::now_secs;

/// One upstream authentication identity. OAuth credentials live in files
/// under `<data_dir>/oauth_creds/` or behind `env://provider/N` URIs; static
/// keys are environment-only and never touch disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialRecord {
    pub provider: String,
    pub kind: CredentialKind,
    /// Stable identifier: absolute file path or `env://provider/N`.
    pub id: String,
    #[serde(default)]
    pub oauth: Option<OAuthTokens>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub metadata: ProxyMetadata,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialKind {
    StaticKey,
    OAuth,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthTokens {
    pub access_token: String,
    pub refresh_token: String,
    #[serde(default)]
    pub id_token: Option<String>,
    /// Milliseconds since the unix epoch. Always present for OAuth records.
    pub expiry_date: i64,
    pub token_uri: String,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub tier: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProxyMetadata {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub account_id: Option<String>,
    #[serde(default)]
    pub last_check_timestamp: Option<i64>,
    #[serde(default)]
    pub loaded_from_env: bool,
    #[serde(default)]
    pub env_credential_index: Option<u32>,
}

impl CredentialRecord {
    pub fn is_env_backed(&self) -> bool {
        self.metadata.loaded_from_env || self.id.starts_with("env://")
    }

    /// Preferred display name for logs: email, then account id, then the
    /// identifier tail.
    pub fn display_name(&self) -> String {
        self.metadata
            .email
            .clone()
            .or_else(|| self.metadata.account_id.clone())
            .unwrap_or_else(|| {
                Path::new(&self.id)
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| self.id.clone())
            })
    }
}

/// Providers with environment-credential support and their variable prefix.
/// OAuth providers additionally get file discovery and one-time import.
const ENV_OAUTH_PROVIDERS: &[(&str, &str)] = &[("gemini_cli", "GEMINI_CLI")];
const ENV_STATIC_PROVIDERS: &[(&str, &str)] = &[("openai", "OPENAI")];

/// Well-known external files copied (read-only) into the managed directory
/// on first run, when no local credentials exist for the provider.
fn default_import_sources(provider: &str) -> Vec<PathBuf> {
    let Some(home) = std::env::var_os("HOME").map(PathBuf::from) else {
        return Vec::new();
    };
    match provider {
        "gemini_cli" => vec![home.join(".gemini").join("oauth_creds.json")],
        _ => Vec::new(),
    }
}

pub struct CredentialStore {
    oauth_dir: PathBuf,
    /// provider -> ordered identifiers
    discovered: HashMap<String, Vec<String>>,
    env_vars: HashMap<String, String>,
}

impl CredentialStore {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            oauth_dir: data_dir.join("oauth_creds"),
            discovered: HashMap::new(),
            env_vars: std::env::vars().collect(),
        }
    }

    #[cfg(test)]
    pub fn with_env(data_dir: &Path, env_vars: HashMap<String, String>) -> Self {
        Self {
            oauth_dir: data_dir.join("oauth_creds"),
            discovered: HashMap::new(),
            env_vars,
        }
    }

    /// Run the full discovery pass. Priority: local credential files first,
    /// env-backed virtual credentials second. Returns providers discovered.
    pub fn discover(&mut self) -> Vec<String> {
        info!("Starting credential discovery...");
        if let Err(e) = std::fs::create_dir_all(&self.oauth_dir) {
            warn!(
                "[W-CRED-DIR] failed_to_create_oauth_dir {}: {}",
                self.oauth_dir.display(),
                e
            );
        }
        self.discovered.clear();

        for (provider, prefix) in ENV_OAUTH_PROVIDERS {
            let mut ids = self.discover_local_files(provider);
            if ids.is_empty() {
                ids = self.import_external_sources(provider);
            }
            ids.extend(self.discover_env_oauth(provider, prefix));
            let ids = self.dedupe(provider, ids);
            if !ids.is_empty() {
                info!("Discovered {} credential(s) for {}", ids.len(), provider);
                self.discovered.insert(provider.to_string(), ids);
            }
        }

        for (provider, prefix) in ENV_STATIC_PROVIDERS {
            let ids = self.discover_env_static(provider, prefix);
            if !ids.is_empty() {
                info!("Discovered {} API key(s) for {}", ids.len(), provider);
                self.discovered.insert(provider.to_string(), ids);
            }
        }

        info!("Credential discovery complete.");
        self.discovered.keys().cloned().collect()
    }

    pub fn list(&self, provider: &str) -> Vec<String> {
        self.discovered.get(provider).cloned().unwrap_or_default()
    }

    pub fn providers(&self) -> Vec<String> {
        let mut providers: Vec<String> = self.discovered.keys().cloned().collect();
        providers.sort();
        providers
    }

    /// Load a single credential record from its identifier.
    pub fn load(&self, provider: &str, id: &str) -> GatewayResult<CredentialRecord> {
        if let Some(index) = parse_env_uri(id, provider) {
            return self.load_from_env(provider, index);
        }
        self.load_from_file(provider, Path::new(id))
    }

    fn discover_local_files(&self, provider: &str) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(&self.oauth_dir) else {
            return Vec::new();
        };
        let prefix = format!("{}_oauth_", provider);
        let mut paths: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.extension().is_some_and(|e| e == "json")
                    && p.file_stem()
                        .is_some_and(|s| s.to_string_lossy().starts_with(&prefix))
            })
            .collect();
        paths.sort();
        if !paths.is_empty() {
            debug!(
                "Found {} existing local credential file(s) for {}",
                paths.len(),
                provider
            );
        }
        paths
            .into_iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect()
    }

    /// One-time copy of well-known external credential files into the
    /// managed directory. Source files are never modified.
    fn import_external_sources(&self, provider: &str) -> Vec<String> {
        let mut imported = Vec::new();
        for (i, source) in default_import_sources(provider).iter().enumerate() {
            if !source.exists() {
                continue;
            }
            let local = self
                .oauth_dir
                .join(format!("{}_oauth_{}.json", provider, i + 1));
            match std::fs::copy(source, &local) {
                Ok(_) => {
                    info!(
                        "Imported '{}' into local pool at '{}'",
                        source.display(),
                        local.display()
                    );
                    imported.push(local.to_string_lossy().into_owned());
                }
                Err(e) => warn!(
                    "[W-CRED-IMPORT] failed_to_copy {} -> {}: {}",
                    source.display(),
                    local.display(),
                    e
                ),
            }
        }
        imported
    }

    /// Numbered `PREFIX_N_ACCESS_TOKEN` pairs win over the legacy single
    /// `PREFIX_ACCESS_TOKEN` pair (index 0).
    fn discover_env_oauth(&self, provider: &str, prefix: &str) -> Vec<String> {
        let numbered = Regex::new(&format!(r"^{}_(\d+)_ACCESS_TOKEN$", prefix)).unwrap();
        let mut indices: Vec<u32> = self
            .env_vars
            .keys()
            .filter_map(|k| numbered.captures(k))
            .filter_map(|c| c[1].parse::<u32>().ok())
            .filter(|i| {
                let refresh = format!("{}_{}_REFRESH_TOKEN", prefix, i);
                self.env_vars.get(&refresh).is_some_and(|v| !v.is_empty())
            })
            .collect();
        indices.sort_unstable();
        indices.dedup();

        if indices.is_empty() {
            let access = format!("{}_ACCESS_TOKEN", prefix);
            let refresh = format!("{}_REFRESH_TOKEN", prefix);
            if self.env_vars.get(&access).is_some_and(|v| !v.is_empty())
                && self.env_vars.get(&refresh).is_some_and(|v| !v.is_empty())
            {
                indices.push(0);
            }
        }

        if !indices.is_empty() {
            info!(
                "Found {} env-based credential(s) for {}",
                indices.len(),
                provider
            );
        }
        indices
            .into_iter()
            .map(|i| format!("env://{}/{}", provider, i))
            .collect()
    }

    fn discover_env_static(&self, provider: &str, prefix: &str) -> Vec<String> {
        let numbered = Regex::new(&format!(r"^{}_(\d+)_API_KEY$", prefix)).unwrap();
        let mut indices: Vec<u32> = self
            .env_vars
            .keys()
            .filter_map(|k| numbered.captures(k))
            .filter_map(|c| c[1].parse::<u32>().ok())
            .filter(|i| {
                self.env_vars
                    .get(&format!("{}_{}_API_KEY", prefix, i))
                    .is_some_and(|v| !v.is_empty())
            })
            .collect();
        indices.sort_unstable();
        indices.dedup();

        if indices.is_empty()
            && self
                .env_vars
                .get(&format!("{}_API_KEY", prefix))
                .is_some_and(|v| !v.is_empty())
        {
            indices.push(0);
        }

        indices
            .into_iter()
            .map(|i| format!("env://{}/{}", provider, i))
            .collect()
    }

    /// Drop duplicate identities within a provider, keyed by account id
    /// falling back to email. First discovery wins.
    fn dedupe(&self, provider: &str, ids: Vec<String>) -> Vec<String> {
        let mut seen: HashSet<String> = HashSet::new();
        let mut unique = Vec::new();
        for id in ids {
            let identity = self
                .load(provider, &id)
                .ok()
                .and_then(|r| r.metadata.account_id.or(r.metadata.email));
            match identity {
                Some(key) => {
                    if seen.insert(key.clone()) {
                        unique.push(id);
                    } else {
                        warn!(
                            "[W-CRED-DUP] dropping_duplicate_credential provider={} id={} identity={}",
                            provider, id, key
                        );
                    }
                }
                // No identity to compare on; keep it.
                None => unique.push(id),
            }
        }
        unique
    }

    fn load_from_file(&self, provider: &str, path: &Path) -> GatewayResult<CredentialRecord> {
        let content = std::fs::read_to_string(path)?;
        let mut record: FileCredential = serde_json::from_str(&content)?;

        // Backfill identity metadata from the tokens when the file has none.
        if record.proxy_metadata.email.is_none() || record.proxy_metadata.account_id.is_none() {
            let claims = record
                .id_token
                .as_deref()
                .and_then(jwt::decode_payload)
                .or_else(|| jwt::decode_payload(&record.access_token));
            if let Some(claims) = claims {
                if record.proxy_metadata.email.is_none() {
                    record.proxy_metadata.email = jwt::extract_email(&claims);
                }
                if record.proxy_metadata.account_id.is_none() {
                    record.proxy_metadata.account_id = jwt::extract_account_id(&claims);
                }
            }
        }

        Ok(CredentialRecord {
            provider: provider.to_string(),
            kind: CredentialKind::OAuth,
            id: path.to_string_lossy().into_owned(),
            oauth: Some(OAuthTokens {
                access_token: record.access_token,
                refresh_token: record.refresh_token,
                id_token: record.id_token,
                expiry_date: record.expiry_date,
                token_uri: record.token_uri,
                project_id: record.project_id,
                tier: record.tier,
            }),
            api_key: None,
            metadata: record.proxy_metadata,
        })
    }

    fn load_from_env(&self, provider: &str, index: u32) -> GatewayResult<CredentialRecord> {
        let prefix = ENV_OAUTH_PROVIDERS
            .iter()
            .chain(ENV_STATIC_PROVIDERS)
            .find(|(p, _)| *p == provider)
            .map(|(_, prefix)| *prefix)
            .ok_or_else(|| GatewayError::UnknownProvider(provider.to_string()))?;

        let var = |suffix: &str| -> Option<String> {
            let key = if index == 0 {
                format!("{}_{}", prefix, suffix)
            } else {
                format!("{}_{}_{}", prefix, index, suffix)
            };
            self.env_vars.get(&key).filter(|v| !v.is_empty()).cloned()
        };

        let id = format!("env://{}/{}", provider, index);

        if let Some(api_key) = var("API_KEY") {
            return Ok(CredentialRecord {
                provider: provider.to_string(),
                kind: CredentialKind::StaticKey,
                id,
                oauth: None,
                api_key: Some(api_key),
                metadata: ProxyMetadata {
                    loaded_from_env: true,
                    env_credential_index: Some(index),
                    ..Default::default()
                },
            });
        }

        let access_token = var("ACCESS_TOKEN").ok_or_else(|| {
            GatewayError::Config(format!("missing {}_ACCESS_TOKEN for index {}", prefix, index))
        })?;
        let refresh_token = var("REFRESH_TOKEN").ok_or_else(|| {
            GatewayError::Config(format!(
                "missing {}_REFRESH_TOKEN for index {}",
                prefix, index
            ))
        })?;
        let id_token = var("ID_TOKEN");

        let claims = id_token
            .as_deref()
            .and_then(jwt::decode_payload)
            .or_else(|| jwt::decode_payload(&access_token));
        let email = claims.as_ref().and_then(jwt::extract_email);
        let account_id = claims.as_ref().and_then(jwt::extract_account_id);
        // Env credentials carry no expiry; mark them due for immediate
        // refresh unless the JWT says otherwise.
        let expiry_date = claims
            .as_ref()
            .and_then(jwt::extract_expiry_millis)
            .unwrap_or_else(|| (now_secs() + 300) * 1000);

        Ok(CredentialRecord {
            provider: provider.to_string(),
            kind: CredentialKind::OAuth,
            id,
            oauth: Some(OAuthTokens {
                access_token,
                refresh_token,
                id_token,
                expiry_date,
                token_uri: var("TOKEN_URI")
                    .unwrap_or_else(|| "https://oauth2.googleapis.com/token".to_string()),
                project_id: var("PROJECT_ID"),
                tier: var("TIER"),
            }),
            api_key: None,
            metadata: ProxyMetadata {
                email,
                account_id,
                last_check_timestamp: Some(now_secs()),
                loaded_from_env: true,
                env_credential_index: Some(index),
            },
        })
    }
}

fn parse_env_uri(id: &str, provider: &str) -> Option<u32> {
    let rest = id.strip_prefix("env://")?;
    let (p, index) = rest.split_once('/')?;
    if p != provider {
        return None;
    }
    index.parse().ok()
}

/// On-disk OAuth credential schema.
#[derive(Debug, Serialize, Deserialize)]
struct FileCredential {
    access_token: String,
    refresh_token: String,
    #[serde(default)]
    id_token: Option<String>,
    expiry_date: i64,
    #[serde(default = "default_token_uri")]
    token_uri: String,
    #[serde(default)]
    project_id: Option<String>,
    #[serde(default)]
    tier: Option<String>,
    #[serde(rename = "_proxy_metadata", default)]
    proxy_metadata: ProxyMetadata,
}

fn default_token_uri() -> String {
    "https://oauth2.googleapis.com/token".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn write_cred(dir: &Path, name: &str, email: &str) -> PathBuf {
        let path = dir.join("oauth_creds").join(name);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(
            &path,
            serde_json::to_string_pretty(&json!({
                "access_token": "at",
                "refresh_token": "rt",
                "expiry_date": 4_102_444_800_000_i64,
                "token_uri": "https://oauth2.googleapis.com/token",
                "_proxy_metadata": {
                    "email": email,
                    "last_check_timestamp": 0,
                    "loaded_from_env": false
                }
            }))
            .unwrap(),
        )
        .unwrap();
        path
    }

    #[test]
    fn local_files_are_discovered_in_order() {
        let dir = tempfile::tempdir().unwrap();
        write_cred(dir.path(), "gemini_cli_oauth_2.json", "b@example.com");
        write_cred(dir.path(), "gemini_cli_oauth_1.json", "a@example.com");

        let mut store = CredentialStore::with_env(dir.path(), HashMap::new());
        store.discover();

        let ids = store.list("gemini_cli");
        assert_eq!(ids.len(), 2);
        assert!(ids[0].ends_with("gemini_cli_oauth_1.json"));
        assert!(ids[1].ends_with("gemini_cli_oauth_2.json"));
    }

    #[test]
    fn duplicate_identities_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        write_cred(dir.path(), "gemini_cli_oauth_1.json", "same@example.com");
        write_cred(dir.path(), "gemini_cli_oauth_2.json", "same@example.com");

        let mut store = CredentialStore::with_env(dir.path(), HashMap::new());
        store.discover();

        assert_eq!(store.list("gemini_cli").len(), 1);
    }

    #[test]
    fn numbered_env_credentials_win_over_legacy() {
        let dir = tempfile::tempdir().unwrap();
        let mut env = HashMap::new();
        env.insert("GEMINI_CLI_ACCESS_TOKEN".into(), "legacy-a".into());
        env.insert("GEMINI_CLI_REFRESH_TOKEN".into(), "legacy-r".into());
        env.insert("GEMINI_CLI_1_ACCESS_TOKEN".into(), "a1".into());
        env.insert("GEMINI_CLI_1_REFRESH_TOKEN".into(), "r1".into());
        env.insert("GEMINI_CLI_2_ACCESS_TOKEN".into(), "a2".into());
        env.insert("GEMINI_CLI_2_REFRESH_TOKEN".into(), "r2".into());

        let mut store = CredentialStore::with_env(dir.path(), env);
        store.discover();

        assert_eq!(
            store.list("gemini_cli"),
            vec!["env://gemini_cli/1", "env://gemini_cli/2"]
        );
    }

    #[test]
    fn legacy_env_pair_maps_to_index_zero() {
        let dir = tempfile::tempdir().unwrap();
        let mut env = HashMap::new();
        env.insert("GEMINI_CLI_ACCESS_TOKEN".into(), "a".into());
        env.insert("GEMINI_CLI_REFRESH_TOKEN".into(), "r".into());

        let mut store = CredentialStore::with_env(dir.path(), env);
        store.discover();

        assert_eq!(store.list("gemini_cli"), vec!["env://gemini_cli/0"]);
        let record = store.load("gemini_cli", "env://gemini_cli/0").unwrap();
        assert!(record.is_env_backed());
        assert_eq!(record.kind, CredentialKind::OAuth);
        assert_eq!(record.oauth.unwrap().access_token, "a");
    }

    #[test]
    fn static_keys_are_env_only() {
        let dir = tempfile::tempdir().unwrap();
        let mut env = HashMap::new();
        env.insert("OPENAI_API_KEY".into(), "sk-test".into());

        let mut store = CredentialStore::with_env(dir.path(), env);
        store.discover();

        let record = store.load("openai", "env://openai/0").unwrap();
        assert_eq!(record.kind, CredentialKind::StaticKey);
        assert_eq!(record.api_key.as_deref(), Some("sk-test"));
        assert!(record.oauth.is_none());
    }

    #[test]
    fn refresh_token_is_required_for_env_oauth() {
        let dir = tempfile::tempdir().unwrap();
        let mut env = HashMap::new();
        env.insert("GEMINI_CLI_1_ACCESS_TOKEN".into(), "a1".into());
        // No matching refresh token: index must not be discovered.

        let mut store = CredentialStore::with_env(dir.path(), env);
        store.discover();

        assert!(store.list("gemini_cli").is_empty());
    }
}
