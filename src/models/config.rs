use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub rotation: RotationConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    /// Per-provider concurrent-request cap per credential (before the tier
    /// multiplier is applied).
    #[serde(default)]
    pub max_concurrent_per_key: HashMap<String, usize>,
    /// Declared custom caps, resolved by the usage manager at cooldown time.
    #[serde(default)]
    pub custom_caps: Vec<CustomCapConfig>,
    /// Providers with fair-cycle rotation enabled.
    #[serde(default)]
    pub fair_cycle_providers: Vec<String>,
    #[serde(default)]
    pub ignore_models: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub whitelist_models: HashMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,
    /// Empty string disables client authentication entirely. This mirrors
    /// the upstream behavior and is logged loudly at startup.
    pub api_key: String,
    pub data_dir: PathBuf,
    pub global_timeout_secs: u64,
    pub max_retries_per_key: u32,
    pub enable_request_logging: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8020,
            api_key: String::new(),
            data_dir: PathBuf::from("./data"),
            global_timeout_secs: crate::constants::DEFAULT_GLOBAL_TIMEOUT_SECS,
            max_retries_per_key: crate::constants::DEFAULT_MAX_RETRIES_PER_KEY,
            enable_request_logging: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotationConfig {
    /// 0.0 picks the strictly least-used credential; larger values blend in
    /// randomization to spread warm-up across the pool.
    pub tolerance: f64,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            tolerance: crate::constants::DEFAULT_ROTATION_TOLERANCE,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    pub size: usize,
    pub timeout_ms: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            size: crate::constants::BATCH_SIZE,
            timeout_ms: crate::constants::BATCH_TIMEOUT_MS,
        }
    }
}

/// One declared request cap for a (tier, model-or-group) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomCapConfig {
    pub provider: String,
    /// None applies the cap as the provider default for all tiers.
    pub tier: Option<u8>,
    /// Model name or quota-group name; resolution order is handled by the
    /// usage manager (tier+model > tier+group > default+model > default+group).
    pub target: String,
    pub cap: u64,
    #[serde(default)]
    pub cooldown: CustomCooldownMode,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode", content = "secs")]
pub enum CustomCooldownMode {
    /// Wait for the natural quota reset.
    #[default]
    QuotaReset,
    /// Reset time plus a fixed offset.
    Offset(i64),
    /// Window start plus a fixed duration.
    Fixed(i64),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            proxy: ProxyConfig::default(),
            rotation: RotationConfig::default(),
            batch: BatchConfig::default(),
            max_concurrent_per_key: HashMap::new(),
            custom_caps: Vec::new(),
            fair_cycle_providers: Vec::new(),
            ignore_models: HashMap::new(),
            whitelist_models: HashMap::new(),
        }
    }
}

/// Load config from `<data_dir>/config.json` when present, then apply
/// environment overrides. Missing file is not an error; defaults apply.
pub fn load_app_config(data_dir: &Path) -> Result<AppConfig, String> {
    let path = data_dir.join("config.json");
    let mut config = if path.exists() {
        let content = std::fs::read_to_string(&path)
            .map_err(|e| format!("failed_to_read_config {}: {}", path.display(), e))?;
        serde_json::from_str::<AppConfig>(&content)
            .map_err(|e| format!("failed_to_parse_config {}: {}", path.display(), e))?
    } else {
        AppConfig::default()
    };
    config.proxy.data_dir = data_dir.to_path_buf();
    apply_env_overrides(&mut config);
    Ok(config)
}

fn apply_env_overrides(config: &mut AppConfig) {
    if let Ok(key) = std::env::var("KEYLOOM_API_KEY") {
        info!("Using proxy API key from environment");
        config.proxy.api_key = key.trim().to_string();
    }
    if let Ok(port) = std::env::var("KEYLOOM_PORT") {
        match port.trim().parse::<u16>() {
            Ok(p) if p > 0 => {
                config.proxy.port = p;
                info!("Using proxy port from environment: {}", p);
            }
            _ => warn!("[W-PORT-INVALID] ignoring_invalid_port_value: {}", port),
        }
    }
    if let Ok(host) = std::env::var("KEYLOOM_HOST") {
        if !host.trim().is_empty() {
            config.proxy.host = host.trim().to_string();
        }
    }
    if let Ok(timeout) = std::env::var("KEYLOOM_GLOBAL_TIMEOUT") {
        match timeout.trim().parse::<u64>() {
            Ok(t) if t > 0 => config.proxy.global_timeout_secs = t,
            _ => warn!(
                "[W-TIMEOUT-INVALID] ignoring_invalid_global_timeout: {}",
                timeout
            ),
        }
    }
    if let Ok(tolerance) = std::env::var("KEYLOOM_ROTATION_TOLERANCE") {
        match tolerance.trim().parse::<f64>() {
            Ok(t) if (0.0..=1.0).contains(&t) => config.rotation.tolerance = t,
            _ => warn!(
                "[W-TOLERANCE-INVALID] ignoring_invalid_rotation_tolerance: {}",
                tolerance
            ),
        }
    }
}

pub fn validate_app_config(config: &AppConfig) -> Result<(), Vec<String>> {
    let mut errors = Vec::new();

    if config.proxy.port == 0 {
        errors.push("proxy.port must be non-zero".to_string());
    }
    if config.rotation.tolerance < 0.0 || config.rotation.tolerance > 1.0 {
        errors.push(format!(
            "rotation.tolerance must be in [0.0, 1.0], got {}",
            config.rotation.tolerance
        ));
    }
    if config.batch.size == 0 {
        errors.push("batch.size must be at least 1".to_string());
    }
    for (provider, max) in &config.max_concurrent_per_key {
        if *max == 0 {
            errors.push(format!(
                "max_concurrent_per_key for '{}' must be at least 1",
                provider
            ));
        }
    }
    for cap in &config.custom_caps {
        if cap.cap == 0 {
            errors.push(format!(
                "custom cap for {}/{} must be non-zero",
                cap.provider, cap.target
            ));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
