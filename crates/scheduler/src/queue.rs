//! Owner-fair dispatch queue.
//!
//! Jobs wait here between admission and dispatch. Ordering is round-robin
//! across distinct owners (so one user's large batch cannot starve another
//! user's small one) and `priority DESC, admission order` within each owner.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use cytoseg_core::types::{DbId, JobId};

struct Entry {
    priority: i32,
    job_id: JobId,
}

#[derive(Default)]
struct QueueState {
    /// Pending jobs per owner, highest priority first.
    per_owner: HashMap<DbId, VecDeque<Entry>>,
    /// Owners with pending jobs, in round-robin order.
    rotation: VecDeque<DbId>,
}

/// Fairness-ordered queue of dispatchable job ids.
///
/// Critical sections are short and never held across `.await`. Waking is
/// notify-driven with a caller-supplied poll interval as a safety net.
pub(crate) struct FairQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl FairQueue {
    pub(crate) fn new() -> Self {
        Self { state: Mutex::new(QueueState::default()), notify: Notify::new() }
    }

    /// Enqueue a job for `owner_id`, keeping the owner's queue sorted by
    /// priority (stable: equal priorities stay in admission order).
    pub(crate) fn push(&self, owner_id: DbId, job_id: JobId, priority: i32) {
        let mut state = self.state.lock().expect("queue lock poisoned");
        let queue = state.per_owner.entry(owner_id).or_default();
        let at = queue.partition_point(|e| e.priority >= priority);
        queue.insert(at, Entry { priority, job_id });

        if !state.rotation.contains(&owner_id) {
            state.rotation.push_back(owner_id);
        }
        drop(state);
        self.notify.notify_one();
    }

    /// Dequeue the next eligible job per the fairness policy.
    pub(crate) fn pop(&self) -> Option<JobId> {
        let mut state = self.state.lock().expect("queue lock poisoned");
        while let Some(owner_id) = state.rotation.pop_front() {
            let taken = state
                .per_owner
                .get_mut(&owner_id)
                .and_then(|queue| queue.pop_front().map(|e| (e.job_id, !queue.is_empty())));
            match taken {
                Some((job_id, owner_has_more)) => {
                    if owner_has_more {
                        state.rotation.push_back(owner_id);
                    } else {
                        state.per_owner.remove(&owner_id);
                    }
                    return Some(job_id);
                }
                // Stale rotation entry for an owner with nothing pending.
                None => {
                    state.per_owner.remove(&owner_id);
                }
            }
        }
        None
    }

    /// Await the next eligible job, or `None` once `cancel` fires.
    pub(crate) async fn pop_wait(
        &self,
        cancel: &CancellationToken,
        poll_interval: Duration,
    ) -> Option<JobId> {
        loop {
            if let Some(job_id) = self.pop() {
                return Some(job_id);
            }
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }
    }

    /// Number of jobs currently waiting.
    pub(crate) fn len(&self) -> usize {
        let state = self.state.lock().expect("queue lock poisoned");
        state.per_owner.values().map(|q| q.len()).sum()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
