//! Scheduler facade and transition core.
//!
//! [`SchedulerCore`] is the one place a state transition and its event meet:
//! the compare-and-swap and the hub publish happen under a single async lock,
//! so the per-scope event order always matches the order transitions were
//! accepted in. Everything else (dispatcher workers, cancellation, admission)
//! goes through it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use cytoseg_core::job::{BatchCounts, Job, JobKindTag, JobState, TransitionDetail};
use cytoseg_core::store::{JobStore, StoreError};
use cytoseg_core::types::{BatchId, DbId, JobId};
use cytoseg_events::EventHub;

use crate::admission::{self, AdmissionError, BatchDescriptor, BatchReceipt};
use crate::cancel::{BatchCancelSummary, CancelOutcome, CancellationCoordinator};
use crate::dispatcher::{PoolRuntime, PoolSpec};

// ---------------------------------------------------------------------------
// SchedulerCore
// ---------------------------------------------------------------------------

/// Shared transition core: store, hub, and the lock that keeps their order
/// consistent.
pub(crate) struct SchedulerCore {
    pub(crate) store: Arc<dyn JobStore>,
    pub(crate) hub: Arc<EventHub>,
    /// Serializes CAS + publish so event seq order equals transition order.
    transition_lock: tokio::sync::Mutex<()>,
    /// Lifetime count of accepted cancellations.
    cancelled: AtomicU64,
}

impl SchedulerCore {
    pub(crate) fn new(store: Arc<dyn JobStore>, hub: Arc<EventHub>) -> Self {
        Self {
            store,
            hub,
            transition_lock: tokio::sync::Mutex::new(()),
            cancelled: AtomicU64::new(0),
        }
    }

    /// Apply a state transition through the store's CAS and, if accepted,
    /// publish exactly one event for it. A rejected CAS publishes nothing.
    pub(crate) async fn apply_transition(
        &self,
        id: JobId,
        expected_generation: u64,
        new_state: JobState,
        detail: TransitionDetail,
    ) -> Result<Option<Job>, StoreError> {
        let _order = self.transition_lock.lock().await;
        let detail_json = detail_payload(&detail);
        let updated = self.store.try_transition(id, expected_generation, new_state, detail).await?;

        if let Some(job) = &updated {
            self.hub.publish(job.scope(), job.id, job.batch_id, job.owner_id, job.state, detail_json);
            if job.state == JobState::Cancelled {
                self.cancelled.fetch_add(1, Ordering::Relaxed);
            }
        }
        Ok(updated)
    }

    /// Publish the initial `Queued` event for a freshly admitted job.
    pub(crate) fn publish_queued(&self, job: &Job) {
        self.hub.publish(
            job.scope(),
            job.id,
            job.batch_id,
            job.owner_id,
            job.state,
            serde_json::Value::Null,
        );
    }
}

/// Event payload carried alongside a transition.
fn detail_payload(detail: &TransitionDetail) -> serde_json::Value {
    match detail {
        TransitionDetail::None => serde_json::Value::Null,
        TransitionDetail::Completed(result) => serde_json::json!({ "result": result }),
        TransitionDetail::Failed(error) => serde_json::json!({ "error": error }),
        TransitionDetail::Cancelled { reason } => serde_json::json!({ "reason": reason }),
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Scheduler-wide configuration: the pools to run and the worker wake-up
/// safety net.
pub struct SchedulerConfig {
    pub pools: Vec<PoolSpec>,
    /// Workers re-check their queue at least this often even without a
    /// notification.
    pub poll_interval: Duration,
}

impl SchedulerConfig {
    pub fn new(pools: Vec<PoolSpec>) -> Self {
        Self { pools, poll_interval: Duration::from_secs(1) }
    }
}

// ---------------------------------------------------------------------------
// Snapshots
// ---------------------------------------------------------------------------

/// Point-in-time view of one batch with derived aggregate counts.
#[derive(Debug, Clone, Serialize)]
pub struct BatchSnapshot {
    pub batch_id: BatchId,
    pub counts: BatchCounts,
    pub jobs: Vec<Job>,
}

/// Occupancy and lifetime counters of one pool.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatsSnapshot {
    pub name: String,
    pub capacity: usize,
    pub allocated: usize,
    pub queued: usize,
    pub dispatched: u64,
    pub completed: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub retries: u64,
    pub discarded: u64,
}

/// Scheduler-wide statistics.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatsSnapshot {
    pub cancelled: u64,
    pub pools: Vec<PoolStatsSnapshot>,
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// The process-wide scheduler: admission, dispatch, cancellation, and
/// introspection behind one handle.
pub struct Scheduler {
    core: Arc<SchedulerCore>,
    /// Job-kind routing to the pool that handles it.
    routes: HashMap<JobKindTag, Arc<PoolRuntime>>,
    pools: Vec<Arc<PoolRuntime>>,
    cancel: CancellationCoordinator,
    shutdown: CancellationToken,
    workers: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(store: Arc<dyn JobStore>, hub: Arc<EventHub>, config: SchedulerConfig) -> Self {
        let core = Arc::new(SchedulerCore::new(store, hub));
        let mut routes = HashMap::new();
        let mut pools = Vec::new();
        for spec in config.pools {
            let runtime =
                Arc::new(PoolRuntime::new(spec, Arc::clone(&core), config.poll_interval));
            for tag in runtime.spec.handlers.keys() {
                routes.insert(*tag, Arc::clone(&runtime));
            }
            pools.push(runtime);
        }

        Self {
            cancel: CancellationCoordinator::new(Arc::clone(&core)),
            core,
            routes,
            pools,
            shutdown: CancellationToken::new(),
            workers: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Spawn the worker tasks: one per slot of each pool.
    pub fn start(&self) {
        let mut workers = self.workers.lock().expect("worker list lock poisoned");
        for pool in &self.pools {
            for worker in 0..pool.spec.capacity {
                let runtime = Arc::clone(pool);
                let shutdown = self.shutdown.clone();
                workers.push(tokio::spawn(runtime.run_worker(worker, shutdown)));
            }
        }
        tracing::info!(
            pools = self.pools.len(),
            workers = workers.len(),
            "Scheduler started",
        );
    }

    /// Validate and admit a batch; returns without waiting for capacity.
    pub async fn submit(
        &self,
        owner_id: DbId,
        descriptor: BatchDescriptor,
    ) -> Result<BatchReceipt, AdmissionError> {
        admission::admit(&self.core, &self.routes, owner_id, descriptor).await
    }

    pub async fn cancel_job(&self, id: JobId, reason: &str) -> Result<CancelOutcome, StoreError> {
        self.cancel.cancel_job(id, reason).await
    }

    pub async fn cancel_batch(
        &self,
        batch_id: BatchId,
        reason: &str,
    ) -> Result<BatchCancelSummary, StoreError> {
        self.cancel.cancel_batch(batch_id, reason).await
    }

    /// Emergency stop across all batches.
    pub async fn cancel_all(&self, reason: &str) -> Result<BatchCancelSummary, StoreError> {
        self.cancel.cancel_all(reason).await
    }

    pub async fn job(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        self.core.store.get(id).await
    }

    /// Batch view with counts derived from the constituent jobs.
    pub async fn batch_snapshot(
        &self,
        batch_id: BatchId,
    ) -> Result<Option<BatchSnapshot>, StoreError> {
        let jobs = self.core.store.list_by_batch(batch_id).await?;
        if jobs.is_empty() {
            return Ok(None);
        }
        let counts = BatchCounts::from_jobs(&jobs);
        Ok(Some(BatchSnapshot { batch_id, counts, jobs }))
    }

    pub async fn active_jobs(&self) -> Result<Vec<Job>, StoreError> {
        self.core.store.list_active().await
    }

    pub fn stats(&self) -> SchedulerStatsSnapshot {
        let pools = self
            .pools
            .iter()
            .map(|pool| PoolStatsSnapshot {
                name: pool.spec.name.clone(),
                capacity: pool.pool.capacity(),
                allocated: pool.pool.allocated(),
                queued: pool.queue.len(),
                dispatched: pool.stats.dispatched.load(Ordering::Relaxed),
                completed: pool.stats.completed.load(Ordering::Relaxed),
                failed: pool.stats.failed.load(Ordering::Relaxed),
                timed_out: pool.stats.timed_out.load(Ordering::Relaxed),
                retries: pool.stats.retries.load(Ordering::Relaxed),
                discarded: pool.stats.discarded.load(Ordering::Relaxed),
            })
            .collect();

        SchedulerStatsSnapshot { cancelled: self.core.cancelled.load(Ordering::Relaxed), pools }
    }

    pub fn hub(&self) -> Arc<EventHub> {
        Arc::clone(&self.core.hub)
    }

    /// Stop accepting dispatch work and wait (bounded) for workers to exit.
    /// Jobs already Processing run to their terminal CAS; Queued jobs stay
    /// Queued for the next process.
    pub async fn shutdown(&self) {
        tracing::info!("Scheduler shutting down");
        self.shutdown.cancel();

        let handles: Vec<JoinHandle<()>> = {
            let mut workers = self.workers.lock().expect("worker list lock poisoned");
            workers.drain(..).collect()
        };
        for handle in handles {
            if tokio::time::timeout(Duration::from_secs(10), handle).await.is_err() {
                tracing::warn!("Worker did not stop within the shutdown window");
            }
        }
        tracing::info!("Scheduler stopped");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use cytoseg_core::store::JobStore as _;

    use crate::store::MemoryJobStore;

    fn core() -> SchedulerCore {
        SchedulerCore::new(Arc::new(MemoryJobStore::new()), Arc::new(EventHub::default()))
    }

    fn job() -> Job {
        Job::new(
            uuid::Uuid::now_v7(),
            None,
            1,
            cytoseg_core::job::JobKind::SegmentationItem {
                image_id: uuid::Uuid::new_v4(),
                model: "cbam-resunet".to_string(),
                threshold: None,
            },
            0,
        )
    }

    // -- apply_transition -----------------------------------------------------

    #[tokio::test]
    async fn accepted_transition_publishes_one_event() {
        let core = core();
        let j = job();
        let (id, scope) = (j.id, j.scope());
        core.store.insert(j).await.unwrap();

        core.apply_transition(id, 0, JobState::Dispatched, TransitionDetail::None)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(core.hub.latest_seq(scope), 1);
    }

    #[tokio::test]
    async fn rejected_transition_publishes_nothing() {
        let core = core();
        let j = job();
        let (id, scope) = (j.id, j.scope());
        core.store.insert(j).await.unwrap();

        let rejected = core
            .apply_transition(id, 5, JobState::Dispatched, TransitionDetail::None)
            .await
            .unwrap();
        assert!(rejected.is_none());
        assert_eq!(core.hub.latest_seq(scope), 0);
    }

    #[tokio::test]
    async fn event_order_matches_transition_order() {
        let core = core();
        let j = job();
        let (id, scope) = (j.id, j.scope());
        core.store.insert(j).await.unwrap();

        core.apply_transition(id, 0, JobState::Dispatched, TransitionDetail::None)
            .await
            .unwrap();
        core.apply_transition(id, 1, JobState::Processing, TransitionDetail::None)
            .await
            .unwrap();
        core.apply_transition(
            id,
            2,
            JobState::Completed,
            TransitionDetail::Completed(serde_json::Value::Null),
        )
        .await
        .unwrap();

        let replay = core.hub.subscribe(scope, 0).replay;
        let states: Vec<JobState> = replay.iter().map(|e| e.state).collect();
        assert_eq!(
            states,
            vec![JobState::Dispatched, JobState::Processing, JobState::Completed]
        );
    }

    // -- detail_payload -------------------------------------------------------

    #[test]
    fn cancellation_detail_carries_reason() {
        let payload = detail_payload(&TransitionDetail::Cancelled {
            reason: "user request".to_string(),
        });
        assert_eq!(payload["reason"], "user request");
    }

    #[test]
    fn completion_detail_carries_result() {
        let payload = detail_payload(&TransitionDetail::Completed(
            serde_json::json!({"mask_count": 2}),
        ));
        assert_eq!(payload["result"]["mask_count"], 2);
    }
}
