pub mod errors;
pub mod middleware;
pub mod routes;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::engine::Engine;

pub fn build_router(engine: Arc<Engine>) -> Router {
    if engine.config.proxy.api_key.is_empty() {
        warn!("[W-AUTH-DISABLED] proxy_api_key_empty_client_auth_disabled");
    }

    Router::new()
        .route("/v1/chat/completions", post(routes::chat_completions))
        .route("/v1/embeddings", post(routes::embeddings))
        .route("/v1/messages", post(routes::anthropic_messages))
        .route(
            "/v1/messages/count_tokens",
            post(routes::anthropic_count_tokens),
        )
        .route("/v1/models", get(routes::list_models))
        .route("/v1/models/*id", get(routes::get_model))
        .route("/v1/providers", get(routes::list_providers))
        .route("/v1/token-count", post(routes::token_count))
        .route("/v1/cost-estimate", post(routes::cost_estimate))
        .route("/v1/usage", get(routes::usage_stats))
        .route("/health", get(routes::health))
        .layer(axum::middleware::from_fn_with_state(
            engine.clone(),
            middleware::auth_middleware,
        ))
        .layer(CorsLayer::permissive())
        .with_state(engine)
}

/// Serve until SIGINT/SIGTERM, then drain and flush. Returns the process
/// exit code: non-zero when the final flush left pending writes.
pub async fn serve(engine: Arc<Engine>) -> i32 {
    let addr = format!(
        "{}:{}",
        engine.config.proxy.host, engine.config.proxy.port
    );
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("[E-BIND] failed_to_bind {}: {}", addr, e);
            return 1;
        }
    };
    info!("Gateway listening on {}", addr);

    let router = build_router(Arc::clone(&engine));
    let shutdown = shutdown_signal();
    if let Err(e) = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
    {
        tracing::error!("[E-SERVE] server_error: {}", e);
    }

    // Graceful drain happened inside axum; give stragglers a moment, then
    // flush all persisted state.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    let pending = engine.shutdown().await;
    if pending > 0 {
        warn!(
            "[W-SHUTDOWN-DIRTY] exiting_with_{}_unpersisted_state_file(s)",
            pending
        );
        return 1;
    }
    0
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
