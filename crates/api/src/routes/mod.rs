pub mod health;

use axum::routing::{get, post};
use axum::Router;

use crate::handlers;
use crate::state::AppState;
use crate::ws;

/// Build the `/api/v1` route tree.
///
/// Route hierarchy:
///
/// ```text
/// /ws                      WebSocket event subscription (scope + last_seq)
///
/// /batches                 submit a batch (POST)
/// /batches/{id}            batch snapshot with derived counts
/// /batches/{id}/cancel     idempotent batch cancel (POST)
///
/// /jobs/active             currently non-terminal jobs
/// /jobs/cancel-all         emergency stop (POST)
/// /jobs/{id}               job snapshot
/// /jobs/{id}/cancel        idempotent job cancel (POST)
///
/// /scheduler/stats         pool occupancy and lifetime counters
/// ```
pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/ws", get(ws::ws_handler))
        .route("/batches", post(handlers::batches::submit_batch))
        .route("/batches/{id}", get(handlers::batches::get_batch))
        .route("/batches/{id}/cancel", post(handlers::batches::cancel_batch))
        .route("/jobs/active", get(handlers::jobs::list_active))
        .route("/jobs/cancel-all", post(handlers::jobs::cancel_all))
        .route("/jobs/{id}", get(handlers::jobs::get_job))
        .route("/jobs/{id}/cancel", post(handlers::jobs::cancel_job))
        .route("/scheduler/stats", get(handlers::scheduler::stats))
}
