use axum::extract::State;
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;

use crate::error::GatewayError;
use crate::server::AppState;

pub async fn handle_index(State(state): State<AppState>) -> Json<serde_json::Value> {
    let server = &state.config.server;
    Json(json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "chat": "/v1/chat/completions",
            "chat_legacy": "/chat/completions",
            "verify": "/verify",
            "health": server.health_check_path,
            "stats": server.stats_path,
        },
    }))
}

pub async fn handle_health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let stats = state.pool.stats();
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "credentials": {
            "total": stats.total,
            "eligible": stats.eligible,
            "tripped": stats.tripped,
            "probing": stats.probing,
        },
    }))
}

pub async fn handle_stats(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!(state.pool.stats()))
}

pub async fn handle_fallback() -> Response {
    GatewayError::NotFound.into_response()
}

pub async fn handle_method_not_allowed() -> Response {
    GatewayError::MethodNotAllowed.into_response()
}
