//! WebSocket infrastructure for real-time job event delivery.
//!
//! Provides connection management, heartbeat monitoring, and the HTTP
//! upgrade handler used by Axum routes. Each connection subscribes to one
//! event scope (a batch, or a single job's own id) and receives replayed
//! and live transition events as JSON frames.

mod handler;
mod heartbeat;
pub mod manager;

pub use handler::ws_handler;
pub use heartbeat::start_heartbeat;
pub use manager::WsManager;
