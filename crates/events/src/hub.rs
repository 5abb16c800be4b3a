//! Per-scope sequenced event log with replay-capable fan-out.
//!
//! The hub is an independent subscriber of the state machine: the scheduler
//! appends one event per accepted transition and nothing else ever writes
//! here, which breaks the dispatcher↔hub callback cycle by construction.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use cytoseg_core::job::JobState;
use cytoseg_core::types::{BatchId, DbId, JobId, Timestamp};

// ---------------------------------------------------------------------------
// JobEvent
// ---------------------------------------------------------------------------

/// One job lifecycle transition, as delivered to subscribers.
///
/// `seq` is a per-scope monotonically increasing counter starting at 1;
/// a subscriber that reconnects with the last seq it saw receives exactly
/// the events after it, in order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEvent {
    pub job_id: JobId,
    pub batch_id: Option<BatchId>,
    pub owner_id: DbId,
    pub state: JobState,
    pub seq: u64,
    pub timestamp: Timestamp,
    /// Transition-specific data: result payload for `completed`, failure
    /// record for `failed`, reason for `cancelled`, empty otherwise.
    pub detail: serde_json::Value,
}

// ---------------------------------------------------------------------------
// EventHub
// ---------------------------------------------------------------------------

/// Default number of events retained per scope for replay.
const DEFAULT_RETENTION: usize = 1024;

/// Capacity of each scope's live broadcast channel.
const BROADCAST_CAPACITY: usize = 256;

/// Per-scope sequenced log state.
struct ScopeLog {
    /// Next seq to assign (starts at 1).
    next_seq: u64,
    /// Retained tail of the append-only log, oldest first.
    buffer: VecDeque<JobEvent>,
    /// Live delivery channel for this scope.
    sender: broadcast::Sender<JobEvent>,
}

impl ScopeLog {
    fn new() -> Self {
        let (sender, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self { next_seq: 1, buffer: VecDeque::new(), sender }
    }
}

/// Outcome of `subscribe`: buffered replay plus a live receiver.
///
/// When `snapshot_required` is set, the requested `last_seq` predates the
/// retention window: `replay` is empty and the caller must deliver a full
/// state snapshot instead, then resume live from `resume_seq`.
pub struct Subscription {
    /// Buffered events with `seq > last_seq`, in seq order.
    pub replay: Vec<JobEvent>,
    /// The gap is unrecoverable; serve a snapshot instead of a replay.
    pub snapshot_required: bool,
    /// Highest seq the subscriber is considered caught up to. Live events
    /// with `seq <= resume_seq` are duplicates from the seam and must be
    /// skipped.
    pub resume_seq: u64,
    /// Live delivery receiver, registered atomically with the replay read.
    pub live: broadcast::Receiver<JobEvent>,
}

/// Append-only, replay-capable event hub.
///
/// Scope granularity is the batch (single jobs use their own id as scope).
/// Critical sections are short and never held across `.await`.
pub struct EventHub {
    scopes: Mutex<HashMap<BatchId, ScopeLog>>,
    retention: usize,
}

impl EventHub {
    /// Create a hub retaining `retention` events per scope.
    pub fn new(retention: usize) -> Self {
        Self { scopes: Mutex::new(HashMap::new()), retention: retention.max(1) }
    }

    /// Append a transition event to `scope`, assign its seq, and fan it out
    /// to live subscribers. Returns the assigned seq.
    ///
    /// Events older than the retention window are evicted; subscribers that
    /// fell that far behind are served the snapshot path on resubscribe.
    pub fn publish(
        &self,
        scope: BatchId,
        job_id: JobId,
        batch_id: Option<BatchId>,
        owner_id: DbId,
        state: JobState,
        detail: serde_json::Value,
    ) -> u64 {
        let mut scopes = self.scopes.lock().expect("event hub lock poisoned");
        let log = scopes.entry(scope).or_insert_with(ScopeLog::new);

        let event = JobEvent {
            job_id,
            batch_id,
            owner_id,
            state,
            seq: log.next_seq,
            timestamp: chrono::Utc::now(),
            detail,
        };
        log.next_seq += 1;

        log.buffer.push_back(event.clone());
        while log.buffer.len() > self.retention {
            log.buffer.pop_front();
        }

        // Ignore the SendError — it only means there are zero live
        // receivers; the replay buffer still has the event.
        let _ = log.sender.send(event.clone());

        tracing::trace!(
            scope = %scope,
            job_id = %job_id,
            state = state.as_str(),
            seq = event.seq,
            "Event published",
        );
        event.seq
    }

    /// Subscribe to `scope`, resuming after `last_seq` (0 for a fresh
    /// subscription).
    ///
    /// The replay read and the live-receiver registration happen under one
    /// lock, so the seam between them has no gap: every event is either in
    /// `replay` or will arrive on `live`, and overlaps are filtered by
    /// `resume_seq`.
    pub fn subscribe(&self, scope: BatchId, last_seq: u64) -> Subscription {
        let mut scopes = self.scopes.lock().expect("event hub lock poisoned");
        let log = scopes.entry(scope).or_insert_with(ScopeLog::new);

        let latest_seq = log.next_seq - 1;
        let oldest_buffered = log.buffer.front().map(|e| e.seq);

        // The gap is unrecoverable when events the subscriber has not seen
        // were already evicted from the buffer.
        let evicted_up_to = match oldest_buffered {
            Some(oldest) => oldest - 1,
            None => latest_seq,
        };
        if last_seq < evicted_up_to {
            tracing::debug!(
                scope = %scope,
                last_seq,
                evicted_up_to,
                "Replay gap unrecoverable, snapshot required",
            );
            return Subscription {
                replay: Vec::new(),
                snapshot_required: true,
                resume_seq: latest_seq,
                live: log.sender.subscribe(),
            };
        }

        let replay: Vec<JobEvent> =
            log.buffer.iter().filter(|e| e.seq > last_seq).cloned().collect();

        Subscription {
            replay,
            snapshot_required: false,
            resume_seq: latest_seq,
            live: log.sender.subscribe(),
        }
    }

    /// Highest seq assigned so far for `scope` (0 if none).
    pub fn latest_seq(&self, scope: BatchId) -> u64 {
        let scopes = self.scopes.lock().expect("event hub lock poisoned");
        scopes.get(&scope).map(|log| log.next_seq - 1).unwrap_or(0)
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(DEFAULT_RETENTION)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn publish_n(hub: &EventHub, scope: BatchId, n: u64) {
        let job_id = uuid::Uuid::new_v4();
        for _ in 0..n {
            hub.publish(
                scope,
                job_id,
                Some(scope),
                1,
                JobState::Processing,
                serde_json::Value::Null,
            );
        }
    }

    // -- publish --------------------------------------------------------------

    #[test]
    fn seq_starts_at_one_and_is_monotonic_per_scope() {
        let hub = EventHub::default();
        let scope_a = uuid::Uuid::new_v4();
        let scope_b = uuid::Uuid::new_v4();
        let job = uuid::Uuid::new_v4();

        let s1 = hub.publish(scope_a, job, Some(scope_a), 1, JobState::Queued, serde_json::Value::Null);
        let s2 = hub.publish(scope_a, job, Some(scope_a), 1, JobState::Dispatched, serde_json::Value::Null);
        let other = hub.publish(scope_b, job, Some(scope_b), 1, JobState::Queued, serde_json::Value::Null);

        assert_eq!(s1, 1);
        assert_eq!(s2, 2);
        // Scopes have independent counters.
        assert_eq!(other, 1);
    }

    #[test]
    fn publish_with_no_subscribers_does_not_panic() {
        let hub = EventHub::default();
        publish_n(&hub, uuid::Uuid::new_v4(), 3);
    }

    // -- subscribe / replay ---------------------------------------------------

    #[test]
    fn fresh_subscription_replays_everything() {
        let hub = EventHub::default();
        let scope = uuid::Uuid::new_v4();
        publish_n(&hub, scope, 4);

        let sub = hub.subscribe(scope, 0);
        assert!(!sub.snapshot_required);
        let seqs: Vec<u64> = sub.replay.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4]);
        assert_eq!(sub.resume_seq, 4);
    }

    #[test]
    fn reconnect_replays_only_events_after_last_seq() {
        let hub = EventHub::default();
        let scope = uuid::Uuid::new_v4();
        publish_n(&hub, scope, 6);

        let sub = hub.subscribe(scope, 3);
        let seqs: Vec<u64> = sub.replay.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![4, 5, 6]);
    }

    #[test]
    fn subscribe_to_unknown_scope_is_empty_not_snapshot() {
        let hub = EventHub::default();
        let sub = hub.subscribe(uuid::Uuid::new_v4(), 0);
        assert!(!sub.snapshot_required);
        assert!(sub.replay.is_empty());
        assert_eq!(sub.resume_seq, 0);
    }

    #[test]
    fn caught_up_subscriber_gets_empty_replay() {
        let hub = EventHub::default();
        let scope = uuid::Uuid::new_v4();
        publish_n(&hub, scope, 2);

        let sub = hub.subscribe(scope, 2);
        assert!(!sub.snapshot_required);
        assert!(sub.replay.is_empty());
    }

    // -- retention / snapshot fallback ---------------------------------------

    #[test]
    fn last_seq_before_retention_window_requires_snapshot() {
        let hub = EventHub::new(3);
        let scope = uuid::Uuid::new_v4();
        publish_n(&hub, scope, 10); // buffer now holds seqs 8..=10

        let sub = hub.subscribe(scope, 2);
        assert!(sub.snapshot_required);
        assert!(sub.replay.is_empty());
        assert_eq!(sub.resume_seq, 10);
    }

    #[test]
    fn last_seq_at_retention_edge_still_replays() {
        let hub = EventHub::new(3);
        let scope = uuid::Uuid::new_v4();
        publish_n(&hub, scope, 10); // retained: 8, 9, 10

        let sub = hub.subscribe(scope, 7);
        assert!(!sub.snapshot_required);
        let seqs: Vec<u64> = sub.replay.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![8, 9, 10]);
    }

    // -- live delivery --------------------------------------------------------

    #[tokio::test]
    async fn live_events_arrive_after_replay_with_no_gap() {
        let hub = EventHub::default();
        let scope = uuid::Uuid::new_v4();
        let job = uuid::Uuid::new_v4();
        publish_n(&hub, scope, 2);

        let mut sub = hub.subscribe(scope, 0);
        assert_eq!(sub.replay.len(), 2);

        hub.publish(scope, job, Some(scope), 1, JobState::Completed, serde_json::Value::Null);

        let live = sub.live.recv().await.expect("live event");
        assert_eq!(live.seq, 3);
        assert!(live.seq > sub.resume_seq);
    }

    #[test]
    fn latest_seq_tracks_publishes() {
        let hub = EventHub::default();
        let scope = uuid::Uuid::new_v4();
        assert_eq!(hub.latest_seq(scope), 0);
        publish_n(&hub, scope, 5);
        assert_eq!(hub.latest_seq(scope), 5);
    }
}
