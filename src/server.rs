use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tracing::info;

use crate::config::GatewayConfig;
use crate::handlers::chat::handle_chat_completions;
use crate::handlers::meta::{
    handle_fallback, handle_health, handle_index, handle_method_not_allowed, handle_stats,
};
use crate::handlers::verify::handle_verify;
use crate::middleware::cors_layer;
use crate::pool::{spawn_sweeper, CredentialPool};
use crate::upstream::UpstreamClient;

#[derive(Clone)]
pub struct AppState {
    pub pool: Arc<CredentialPool>,
    pub upstream: Arc<UpstreamClient>,
    pub config: Arc<GatewayConfig>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            pool: Arc::new(CredentialPool::new(config.scheduler.clone())),
            upstream: Arc::new(UpstreamClient::new(&config.upstream)),
            config: Arc::new(config),
            started_at: Instant::now(),
        }
    }
}

pub fn router(state: AppState) -> Router {
    let server = &state.config.server;
    Router::new()
        .route("/", get(handle_index))
        .route(&server.health_check_path, get(handle_health))
        .route(&server.stats_path, get(handle_stats))
        .route("/chat/completions", post(handle_chat_completions))
        .route("/v1/chat/completions", post(handle_chat_completions))
        .route("/verify", post(handle_verify))
        .fallback(handle_fallback)
        .method_not_allowed_fallback(handle_method_not_allowed)
        .layer(cors_layer(&server.cors_origin))
        .layer(DefaultBodyLimit::max(server.body_size_limit))
        .with_state(state)
}

/// Bind, start the recovery sweeper, and serve until Ctrl-C.
pub async fn serve(config: GatewayConfig) -> Result<(), String> {
    let port = config.server.port;
    let state = AppState::new(config);
    let sweeper = spawn_sweeper(state.pool.clone());

    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .map_err(|e| format!("failed to bind port {}: {}", port, e))?;
    info!(
        "Gateway listening on 0.0.0.0:{} | policy: {} | upstream: {}",
        port,
        state.pool.policy().as_str(),
        state.config.upstream.base_url
    );

    let result = axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down");
        })
        .await
        .map_err(|e| format!("server error: {}", e));

    sweeper.abort();
    result
}
