use std::sync::Arc;
use std::time::Duration;

use crate::ws::manager::WsManager;

/// Spawn a background task that sends a Ping frame to every connected
/// WebSocket client each `interval` (see `WS_HEARTBEAT_SECS`).
///
/// The task runs until aborted during shutdown; the returned `JoinHandle`
/// is kept by the entrypoint for that purpose.
pub fn start_heartbeat(
    ws_manager: Arc<WsManager>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);

        loop {
            ticker.tick().await;
            let count = ws_manager.connection_count().await;
            tracing::debug!(count, "WebSocket heartbeat ping");
            ws_manager.ping_all().await;
        }
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::ws::Message;

    #[tokio::test]
    async fn heartbeat_pings_registered_connections() {
        let manager = Arc::new(WsManager::new());
        let (_tx, mut rx) = manager.add("conn-1".to_string(), uuid::Uuid::new_v4()).await;

        let handle = start_heartbeat(Arc::clone(&manager), Duration::from_millis(10));

        let frame = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("ping within the interval")
            .expect("channel open");
        assert!(matches!(frame, Message::Ping(_)));

        handle.abort();
    }
}
