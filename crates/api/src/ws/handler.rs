//! WebSocket upgrade handler and per-connection event delivery.
//!
//! A client subscribes to one scope with the last event seq it has seen.
//! The subscription is registered atomically with the replay read, so the
//! delivery is gap-free: replayed frames first, then live frames, with
//! seq-based deduplication at the seam. A `last_seq` older than the
//! retention window gets a full snapshot frame instead of a replay.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};

use cytoseg_core::job::Job;
use cytoseg_core::types::BatchId;
use cytoseg_events::JobEvent;

use crate::state::AppState;
use crate::ws::manager::WsSender;

/// Query parameters of `GET /api/v1/ws`.
#[derive(Debug, Deserialize)]
pub struct SubscribeParams {
    /// Event scope: a batch id, or a single job's own id.
    pub scope: BatchId,
    /// Highest seq the client has already seen (0 for a fresh
    /// subscription).
    #[serde(default)]
    pub last_seq: u64,
}

/// Outbound JSON frames.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WsFrame {
    /// One replayed or live transition event.
    Event { event: JobEvent },
    /// Full current state, sent when the requested replay window is gone.
    /// The client resumes live delivery from `resume_seq`.
    Snapshot { resume_seq: u64, jobs: Vec<Job> },
    /// The live channel fell too far behind; the client should reconnect
    /// with its last seq.
    ReplayGap,
}

fn send_frame(tx: &WsSender, frame: &WsFrame) -> bool {
    match serde_json::to_string(frame) {
        Ok(text) => tx.send(Message::Text(text.into())).is_ok(),
        Err(e) => {
            tracing::error!(error = %e, "Unserializable WebSocket frame");
            false
        }
    }
}

/// HTTP handler that upgrades the connection to WebSocket.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<SubscribeParams>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, params))
}

/// Manage a single WebSocket connection after upgrade.
///
/// Splits the socket into a sink (outbound) and stream (inbound), then:
///   1. Registers the connection with `WsManager`.
///   2. Spawns a sender task that forwards channel messages to the sink.
///   3. Subscribes to the scope and spawns the event forwarder.
///   4. Processes inbound messages on the current task.
///   5. Cleans up on disconnect.
async fn handle_socket(socket: WebSocket, state: AppState, params: SubscribeParams) {
    let conn_id = uuid::Uuid::new_v4().to_string();
    tracing::info!(
        conn_id = %conn_id,
        scope = %params.scope,
        last_seq = params.last_seq,
        "WebSocket connected",
    );

    let (tx, mut rx) = state.ws_manager.add(conn_id.clone(), params.scope).await;

    let (mut sink, mut stream) = socket.split();

    // Sender task: forward channel messages to the WebSocket sink.
    let sender_conn_id = conn_id.clone();
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sink.send(msg).await.is_err() {
                tracing::debug!(conn_id = %sender_conn_id, "WebSocket sink closed");
                break;
            }
        }
    });

    // Replay (or snapshot) plus the live receiver, registered atomically.
    let mut subscription = state.hub.subscribe(params.scope, params.last_seq);
    let resume_seq = subscription.resume_seq;

    if subscription.snapshot_required {
        let jobs = scope_jobs(&state, params.scope).await;
        tracing::debug!(
            conn_id = %conn_id,
            scope = %params.scope,
            resume_seq,
            "Replay gap unrecoverable, serving snapshot",
        );
        if !send_frame(&tx, &WsFrame::Snapshot { resume_seq, jobs }) {
            cleanup(&state, &conn_id, send_task, None).await;
            return;
        }
    } else {
        for event in subscription.replay.drain(..) {
            if !send_frame(&tx, &WsFrame::Event { event }) {
                cleanup(&state, &conn_id, send_task, None).await;
                return;
            }
        }
    }

    // Live forwarder: deliver events after the seam, dedup by seq.
    let live_tx = tx.clone();
    let live_conn_id = conn_id.clone();
    let mut live = subscription.live;
    let live_task = tokio::spawn(async move {
        loop {
            match live.recv().await {
                Ok(event) => {
                    // Events at or below resume_seq were already replayed.
                    if event.seq <= resume_seq {
                        continue;
                    }
                    if !send_frame(&live_tx, &WsFrame::Event { event }) {
                        break;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(
                        conn_id = %live_conn_id,
                        skipped,
                        "WebSocket subscriber lagged, advising reconnect",
                    );
                    let _ = send_frame(&live_tx, &WsFrame::ReplayGap);
                    break;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    // Receiver loop: process inbound messages.
    while let Some(result) = stream.next().await {
        match result {
            Ok(Message::Close(_)) => break,
            Ok(Message::Pong(_)) => {
                tracing::trace!(conn_id = %conn_id, "Pong received");
            }
            Ok(_msg) => {
                // The subscription is read-only; inbound data is ignored.
            }
            Err(e) => {
                tracing::debug!(conn_id = %conn_id, error = %e, "WebSocket receive error");
                break;
            }
        }
    }

    cleanup(&state, &conn_id, send_task, Some(live_task)).await;
    tracing::info!(conn_id = %conn_id, "WebSocket disconnected");
}

/// Current jobs of a scope, for the snapshot frame. A scope with no batch
/// rows falls back to the single job with that id.
async fn scope_jobs(state: &AppState, scope: BatchId) -> Vec<Job> {
    match state.scheduler.batch_snapshot(scope).await {
        Ok(Some(snapshot)) => snapshot.jobs,
        Ok(None) => match state.scheduler.job(scope).await {
            Ok(Some(job)) => vec![job],
            Ok(None) => Vec::new(),
            Err(e) => {
                tracing::error!(scope = %scope, error = %e, "Snapshot job read failed");
                Vec::new()
            }
        },
        Err(e) => {
            tracing::error!(scope = %scope, error = %e, "Snapshot batch read failed");
            Vec::new()
        }
    }
}

async fn cleanup(
    state: &AppState,
    conn_id: &str,
    send_task: tokio::task::JoinHandle<()>,
    live_task: Option<tokio::task::JoinHandle<()>>,
) {
    state.ws_manager.remove(conn_id).await;
    send_task.abort();
    if let Some(task) = live_task {
        task.abort();
    }
}
