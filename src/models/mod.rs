mod config;

pub use config::{
    load_app_config, validate_app_config, AppConfig, BatchConfig, CustomCapConfig,
    CustomCooldownMode, ProxyConfig, RotationConfig,
};
