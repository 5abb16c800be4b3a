use std::sync::Arc;

use cytoseg_events::EventHub;
use cytoseg_scheduler::Scheduler;

use crate::config::ServerConfig;
use crate::ws::WsManager;

/// Shared application state available to all Axum handlers via
/// `State<AppState>`.
///
/// Cheaply cloneable (inner data is behind `Arc`).
#[derive(Clone)]
pub struct AppState {
    /// The process-wide job scheduler.
    pub scheduler: Arc<Scheduler>,
    /// Event hub for WebSocket subscriptions.
    pub hub: Arc<EventHub>,
    /// Server configuration.
    pub config: Arc<ServerConfig>,
    /// WebSocket connection manager.
    pub ws_manager: Arc<WsManager>,
    /// Database pool when running against Postgres; `None` with the
    /// in-memory store.
    pub pool: Option<sqlx::PgPool>,
}
