//! Admin API for the key pool
//!
//! Runs on a separate listener (`server.admin_listen_addr`) that should not be
//! reachable from the public internet.
//!
//! Endpoints:
//! - GET  /admin/keys       : per-key status list
//! - POST /admin/keys/reset : clear the exhausted set immediately
//! - GET  /admin/pool       : pool status summary

use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use key_pool::KeyPool;
use tokio::time::Instant;
use tracing::info;

/// Shared state for admin API handlers.
#[derive(Clone)]
pub struct AdminState {
    pool: Arc<KeyPool>,
}

impl AdminState {
    pub fn new(pool: Arc<KeyPool>) -> Self {
        Self { pool }
    }
}

/// Build the admin axum router.
pub fn build_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/keys", get(list_keys))
        .route("/admin/keys/reset", post(reset_keys))
        .route("/admin/pool", get(pool_status))
        .with_state(state)
}

fn json(status: StatusCode, body: serde_json::Value) -> impl IntoResponse {
    (
        status,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// GET /admin/keys: 1-based key positions with their status. Never exposes
/// key values.
async fn list_keys(State(state): State<AdminState>) -> impl IntoResponse {
    let health = state.pool.health().await;
    let keys = health
        .get("keys")
        .cloned()
        .unwrap_or(serde_json::json!([]));
    json(StatusCode::OK, serde_json::json!({ "keys": keys }))
}

/// POST /admin/keys/reset: mark every key available again and restart the
/// cooldown window.
async fn reset_keys(State(state): State<AdminState>) -> impl IntoResponse {
    let cleared = state.pool.reset_exhausted(Instant::now()).await;
    info!(cleared, "exhausted keys reset via admin API");
    json(
        StatusCode::OK,
        serde_json::json!({
            "cleared": cleared,
            "pool": state.pool.health().await,
        }),
    )
}

/// GET /admin/pool: pool summary without the per-key list.
async fn pool_status(State(state): State<AdminState>) -> impl IntoResponse {
    let mut health = state.pool.health().await;
    if let Some(obj) = health.as_object_mut() {
        obj.remove("keys");
        obj.insert(
            "cooldown_secs".to_string(),
            state.pool.cooldown().as_secs().into(),
        );
    }
    json(StatusCode::OK, health)
}
