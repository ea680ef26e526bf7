pub mod auth;
pub mod batch;
pub mod constants;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod models;
pub mod providers;
pub mod scheduler;
pub mod server;
pub mod store;
pub mod streaming;
pub mod translate;
pub mod usage;
pub mod utils;

#[cfg(test)]
mod tests;

use std::path::PathBuf;

use tracing::{error, info};

fn init_logger() {
    use tracing_subscriber::{fmt, EnvFilter};
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,keyloom=info"));
    fmt().with_env_filter(filter).with_target(false).init();
}

fn resolve_data_dir() -> PathBuf {
    std::env::var("KEYLOOM_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./data"))
}

/// Headless entry point: load config, compose the engine, serve until a
/// signal arrives, then flush. Returns the process exit code.
pub fn run() -> i32 {
    init_logger();

    let data_dir = resolve_data_dir();
    let config = match crate::models::load_app_config(&data_dir) {
        Ok(config) => config,
        Err(e) => {
            error!("[E-CONFIG] failed_to_load_config: {}", e);
            return 1;
        }
    };
    if let Err(errors) = crate::models::validate_app_config(&config) {
        error!(
            "[E-CONFIG] configuration_validation_failed:\n{}",
            errors.join("\n")
        );
        return 1;
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("[E-RUNTIME] failed_to_create_tokio_runtime: {}", e);
            return 1;
        }
    };

    runtime.block_on(async {
        let engine = match crate::engine::Engine::new(config).await {
            Ok(engine) => engine,
            Err(e) => {
                error!("[E-STARTUP] engine_construction_failed: {}", e);
                return 1;
            }
        };
        info!(
            "keyloom {} starting with providers: {:?}",
            env!("CARGO_PKG_VERSION"),
            engine.providers()
        );
        crate::server::serve(engine).await
    })
}
