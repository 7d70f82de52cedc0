//! Admin API for credential pool introspection
//!
//! Runs on a separate listener (default 127.0.0.1:9090) and is meant for
//! operators only. Credentials are always reduced to fingerprints here.
//!
//! Endpoints:
//! - GET /admin/keys: per-credential usage statistics
//! - GET /admin/pools: per-pool health summary

use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;

use key_pool::KeyPoolManager;

/// Shared state for admin API handlers.
#[derive(Clone)]
pub struct AdminState {
    manager: Arc<KeyPoolManager>,
}

impl AdminState {
    pub fn new(manager: Arc<KeyPoolManager>) -> Self {
        Self { manager }
    }
}

/// Build the admin axum router.
pub fn build_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/keys", get(key_stats))
        .route("/admin/pools", get(pool_status))
        .with_state(state)
}

/// GET /admin/keys: redacted usage statistics for every credential.
async fn key_stats(State(state): State<AdminState>) -> impl IntoResponse {
    let policy = state.manager.policy();
    let body = serde_json::json!({
        "error_threshold": policy.error_threshold,
        "cooldown_secs": policy.cooldown.as_secs(),
        "pools": state.manager.stats_redacted(),
    });

    (
        StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// GET /admin/pools: pool health summary.
async fn pool_status(State(state): State<AdminState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        state.manager.health().to_string(),
    )
}
