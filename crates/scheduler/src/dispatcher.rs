//! Dispatcher / parallel executor.
//!
//! Each resource pool runs `capacity` worker tasks. A worker picks the next
//! eligible Queued job per the fairness policy, claims a slot, walks the job
//! through `Dispatched → Processing`, and invokes the external work function
//! under the pool's timeout. Every terminal write is a compare-and-swap at
//! the generation captured when processing began, so a result that arrives
//! after a cancellation loses the CAS and is discarded. The slot guard is
//! dropped on every exit path, so release happens exactly once per claim.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use cytoseg_core::job::{Job, JobError, JobErrorCode, JobKindTag, JobState, TransitionDetail};
use cytoseg_core::work::{WorkError, WorkFunction};
use cytoseg_core::types::JobId;

use crate::pool::ResourcePool;
use crate::queue::FairQueue;
use crate::scheduler::SchedulerCore;

// ---------------------------------------------------------------------------
// PoolSpec
// ---------------------------------------------------------------------------

/// Upper bound on exponential backoff between transient retries.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Static configuration of one resource pool.
///
/// A pool owns a bounded set of slots for one downstream resource and the
/// work-function handlers for the job kinds routed to it.
pub struct PoolSpec {
    pub name: String,
    pub capacity: usize,
    /// Deadline for a single work-function call; expiry forces `Failed`.
    pub job_timeout: Duration,
    /// Transient failures retried at most this many times.
    pub max_transient_retries: u32,
    pub retry_base_delay: Duration,
    pub handlers: HashMap<JobKindTag, Arc<dyn WorkFunction>>,
}

impl PoolSpec {
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        Self {
            name: name.into(),
            capacity,
            job_timeout: Duration::from_secs(300),
            max_transient_retries: 3,
            retry_base_delay: Duration::from_millis(500),
            handlers: HashMap::new(),
        }
    }

    /// Route jobs of `tag` to `handler` on this pool.
    pub fn handler(mut self, tag: JobKindTag, handler: Arc<dyn WorkFunction>) -> Self {
        self.handlers.insert(tag, handler);
        self
    }

    pub fn job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    pub fn retries(mut self, max_transient_retries: u32, base_delay: Duration) -> Self {
        self.max_transient_retries = max_transient_retries;
        self.retry_base_delay = base_delay;
        self
    }
}

/// Exponential backoff for transient retries: `base * 2^(attempt-1)`,
/// capped at [`MAX_RETRY_DELAY`].
pub(crate) fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let factor = 1u32 << attempt.saturating_sub(1).min(16);
    base.saturating_mul(factor).min(MAX_RETRY_DELAY)
}

// ---------------------------------------------------------------------------
// Pool statistics
// ---------------------------------------------------------------------------

/// Lifetime counters for one pool. All relaxed; read for reporting only.
#[derive(Default)]
pub(crate) struct PoolStats {
    pub(crate) dispatched: AtomicU64,
    pub(crate) completed: AtomicU64,
    pub(crate) failed: AtomicU64,
    pub(crate) timed_out: AtomicU64,
    pub(crate) retries: AtomicU64,
    /// Results discarded because the job was cancelled mid-flight.
    pub(crate) discarded: AtomicU64,
}

impl PoolStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

// ---------------------------------------------------------------------------
// PoolRuntime
// ---------------------------------------------------------------------------

/// One running pool: its dispatch queue, slot pool, and counters.
pub(crate) struct PoolRuntime {
    pub(crate) spec: PoolSpec,
    pub(crate) queue: FairQueue,
    pub(crate) pool: ResourcePool,
    pub(crate) stats: PoolStats,
    core: Arc<SchedulerCore>,
    poll_interval: Duration,
}

impl PoolRuntime {
    pub(crate) fn new(spec: PoolSpec, core: Arc<SchedulerCore>, poll_interval: Duration) -> Self {
        let pool = ResourcePool::new(spec.capacity);
        Self { spec, queue: FairQueue::new(), pool, stats: PoolStats::default(), core, poll_interval }
    }

    /// Queue an admitted job for dispatch on this pool.
    pub(crate) fn enqueue(&self, job: &Job) {
        self.queue.push(job.owner_id, job.id, job.priority);
    }

    /// One worker task: loop until shutdown, executing jobs as the fairness
    /// policy yields them.
    pub(crate) async fn run_worker(self: Arc<Self>, worker: usize, shutdown: CancellationToken) {
        tracing::debug!(pool = %self.spec.name, worker, "Worker started");
        while let Some(job_id) = self.queue.pop_wait(&shutdown, self.poll_interval).await {
            self.execute(job_id).await;
        }
        tracing::debug!(pool = %self.spec.name, worker, "Worker stopped");
    }

    /// Drive one job from `Queued` to a terminal state.
    async fn execute(&self, job_id: JobId) {
        let job = match self.core.store.get(job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => return,
            Err(err) => {
                tracing::warn!(job_id = %job_id, error = %err, "Store read failed, requeueing skipped");
                return;
            }
        };
        // Cancelled while waiting in the queue.
        if job.state != JobState::Queued {
            return;
        }

        // Claim before any state change, so a job blocked on a busy pool
        // stays visibly Queued rather than Dispatched. Held until this
        // function returns on any path.
        let _slot = self.pool.claim(job.owner_id).await;

        // A cancel may have landed while we waited for the slot.
        let dispatched = match self
            .core
            .apply_transition(job.id, job.generation, JobState::Dispatched, TransitionDetail::None)
            .await
        {
            Ok(Some(job)) => job,
            Ok(None) => {
                tracing::debug!(job_id = %job_id, "Dispatch CAS rejected, slot released");
                return;
            }
            Err(err) => {
                tracing::warn!(job_id = %job_id, error = %err, "Dispatch transition failed");
                return;
            }
        };
        PoolStats::bump(&self.stats.dispatched);

        let processing = match self
            .core
            .apply_transition(
                dispatched.id,
                dispatched.generation,
                JobState::Processing,
                TransitionDetail::None,
            )
            .await
        {
            Ok(Some(job)) => job,
            Ok(None) => {
                tracing::debug!(job_id = %job_id, "Cancelled before processing, slot released");
                PoolStats::bump(&self.stats.discarded);
                return;
            }
            Err(err) => {
                tracing::warn!(job_id = %job_id, error = %err, "Processing transition failed");
                return;
            }
        };

        self.run_work(processing).await;
    }

    /// Invoke the work function under timeout and retry policy, then write
    /// the terminal state through the CAS.
    async fn run_work(&self, job: Job) {
        // All terminal writes for this run carry the generation captured
        // here; a cancel bumps it and wins.
        let generation = job.generation;

        let Some(handler) = self.spec.handlers.get(&job.kind.tag()).map(Arc::clone) else {
            tracing::error!(
                job_id = %job.id,
                pool = %self.spec.name,
                kind = ?job.kind.tag(),
                "No handler registered for job kind on this pool",
            );
            let detail = TransitionDetail::Failed(JobError::new(
                JobErrorCode::Permanent,
                "No handler registered for this job kind",
            ));
            self.finish(&job, generation, JobState::Failed, detail).await;
            return;
        };

        let payload = match serde_json::to_value(&job.kind) {
            Ok(payload) => payload,
            Err(err) => {
                let detail = TransitionDetail::Failed(JobError::new(
                    JobErrorCode::Permanent,
                    format!("Unserializable job payload: {err}"),
                ));
                self.finish(&job, generation, JobState::Failed, detail).await;
                return;
            }
        };

        let mut attempt: u32 = 0;
        let (state, detail) = loop {
            let call = handler.invoke(payload.clone(), generation);
            match tokio::time::timeout(self.spec.job_timeout, call).await {
                // Deadline expired; the job fails now, whatever the call
                // eventually returns.
                Err(_) => {
                    PoolStats::bump(&self.stats.timed_out);
                    tracing::warn!(
                        job_id = %job.id,
                        timeout_secs = self.spec.job_timeout.as_secs(),
                        "Work function timed out",
                    );
                    break (
                        JobState::Failed,
                        TransitionDetail::Failed(JobError::timeout(self.spec.job_timeout.as_secs())),
                    );
                }
                Ok(Ok(result)) => {
                    break (JobState::Completed, TransitionDetail::Completed(result));
                }
                Ok(Err(WorkError::Permanent(message))) => {
                    break (
                        JobState::Failed,
                        TransitionDetail::Failed(JobError::new(JobErrorCode::Permanent, message)),
                    );
                }
                Ok(Err(WorkError::Transient(message))) => {
                    if attempt >= self.spec.max_transient_retries {
                        break (
                            JobState::Failed,
                            TransitionDetail::Failed(JobError::new(
                                JobErrorCode::RetriesExhausted,
                                format!(
                                    "Transient failure persisted after {attempt} retries: {message}"
                                ),
                            )),
                        );
                    }
                    attempt += 1;
                    PoolStats::bump(&self.stats.retries);
                    let delay = backoff_delay(self.spec.retry_base_delay, attempt);
                    tracing::debug!(
                        job_id = %job.id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %message,
                        "Transient work failure, backing off",
                    );
                    tokio::time::sleep(delay).await;

                    // Stop retrying a job that was cancelled during backoff.
                    if let Ok(Some(current)) = self.core.store.get(job.id).await {
                        if current.state.is_terminal() {
                            PoolStats::bump(&self.stats.discarded);
                            return;
                        }
                    }
                }
            }
        };

        self.finish(&job, generation, state, detail).await;
    }

    /// Terminal CAS. A rejection means the job was cancelled mid-flight; the
    /// computed result is discarded without further effect.
    async fn finish(
        &self,
        job: &Job,
        generation: u64,
        state: JobState,
        detail: TransitionDetail,
    ) {
        match self.core.apply_transition(job.id, generation, state, detail).await {
            Ok(Some(updated)) => match updated.state {
                JobState::Completed => {
                    PoolStats::bump(&self.stats.completed);
                    tracing::info!(job_id = %job.id, pool = %self.spec.name, "Job completed");
                }
                JobState::Failed => {
                    PoolStats::bump(&self.stats.failed);
                    let code = updated.error.as_ref().map(|e| e.code);
                    tracing::warn!(job_id = %job.id, pool = %self.spec.name, code = ?code, "Job failed");
                }
                _ => {}
            },
            Ok(None) => {
                PoolStats::bump(&self.stats.discarded);
                tracing::debug!(job_id = %job.id, "Late result discarded after cancellation");
            }
            Err(err) => {
                tracing::error!(job_id = %job.id, error = %err, "Terminal transition failed");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use cytoseg_core::job::JobKind;
    use cytoseg_core::store::JobStore;
    use cytoseg_events::EventHub;

    use crate::store::MemoryJobStore;

    // -- backoff_delay --------------------------------------------------------

    #[test]
    fn backoff_doubles_per_attempt() {
        let base = Duration::from_millis(500);
        assert_eq!(backoff_delay(base, 1), Duration::from_millis(500));
        assert_eq!(backoff_delay(base, 2), Duration::from_millis(1000));
        assert_eq!(backoff_delay(base, 3), Duration::from_millis(2000));
    }

    #[test]
    fn backoff_is_capped() {
        let base = Duration::from_secs(1);
        assert_eq!(backoff_delay(base, 10), MAX_RETRY_DELAY);
        assert_eq!(backoff_delay(base, 60), MAX_RETRY_DELAY);
    }

    // -- execute --------------------------------------------------------------

    struct ScriptedWork {
        result: Result<serde_json::Value, &'static str>,
    }

    #[async_trait]
    impl WorkFunction for ScriptedWork {
        async fn invoke(
            &self,
            _payload: serde_json::Value,
            _generation: u64,
        ) -> Result<serde_json::Value, WorkError> {
            self.result.clone().map_err(|m| WorkError::Permanent(m.to_string()))
        }
    }

    fn kind() -> JobKind {
        JobKind::SegmentationItem {
            image_id: uuid::Uuid::new_v4(),
            model: "cbam-resunet".to_string(),
            threshold: None,
        }
    }

    async fn runtime_with(handler: Arc<dyn WorkFunction>) -> (Arc<PoolRuntime>, Arc<SchedulerCore>) {
        let core = Arc::new(SchedulerCore::new(
            Arc::new(MemoryJobStore::new()),
            Arc::new(EventHub::default()),
        ));
        let spec = PoolSpec::new("test", 1).handler(JobKindTag::Segmentation, handler);
        let runtime =
            Arc::new(PoolRuntime::new(spec, Arc::clone(&core), Duration::from_millis(50)));
        (runtime, core)
    }

    #[tokio::test]
    async fn successful_job_walks_the_full_lifecycle() {
        let (runtime, core) = runtime_with(Arc::new(ScriptedWork {
            result: Ok(serde_json::json!({"mask_count": 7})),
        }))
        .await;

        let job = Job::new(uuid::Uuid::now_v7(), None, 1, kind(), 0);
        let id = job.id;
        core.store.insert(job).await.unwrap();

        runtime.execute(id).await;

        let done = core.store.get(id).await.unwrap().unwrap();
        assert_eq!(done.state, JobState::Completed);
        assert_eq!(done.result, Some(serde_json::json!({"mask_count": 7})));
        // Queued event at admission is published elsewhere; here we see
        // Dispatched, Processing, Completed.
        assert_eq!(core.hub.latest_seq(id), 3);
        assert_eq!(runtime.stats.completed.load(Ordering::Relaxed), 1);
        assert_eq!(runtime.pool.allocated(), 0);
    }

    #[tokio::test]
    async fn permanent_failure_is_terminal_failed() {
        let (runtime, core) =
            runtime_with(Arc::new(ScriptedWork { result: Err("model not found") })).await;

        let job = Job::new(uuid::Uuid::now_v7(), None, 1, kind(), 0);
        let id = job.id;
        core.store.insert(job).await.unwrap();

        runtime.execute(id).await;

        let done = core.store.get(id).await.unwrap().unwrap();
        assert_eq!(done.state, JobState::Failed);
        assert_eq!(done.error.unwrap().code, JobErrorCode::Permanent);
        assert_eq!(runtime.stats.failed.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn job_without_handler_fails_permanently() {
        let core = Arc::new(SchedulerCore::new(
            Arc::new(MemoryJobStore::new()),
            Arc::new(EventHub::default()),
        ));
        // Pool with no handlers at all.
        let runtime = Arc::new(PoolRuntime::new(
            PoolSpec::new("empty", 1),
            Arc::clone(&core),
            Duration::from_millis(50),
        ));

        let job = Job::new(uuid::Uuid::now_v7(), None, 1, kind(), 0);
        let id = job.id;
        core.store.insert(job).await.unwrap();

        runtime.execute(id).await;

        let done = core.store.get(id).await.unwrap().unwrap();
        assert_eq!(done.state, JobState::Failed);
    }

    #[tokio::test]
    async fn job_stays_queued_while_pool_is_busy() {
        let (runtime, core) = runtime_with(Arc::new(ScriptedWork {
            result: Ok(serde_json::Value::Null),
        }))
        .await;
        // Occupy the pool's only slot before the worker gets the job.
        let held = runtime.pool.claim(99).await;

        let job = Job::new(uuid::Uuid::now_v7(), None, 1, kind(), 0);
        let id = job.id;
        core.store.insert(job).await.unwrap();

        let exec = {
            let runtime = Arc::clone(&runtime);
            tokio::spawn(async move { runtime.execute(id).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Blocked on the slot claim: no Dispatched transition yet.
        let waiting = core.store.get(id).await.unwrap().unwrap();
        assert_eq!(waiting.state, JobState::Queued);
        assert_eq!(runtime.stats.dispatched.load(Ordering::Relaxed), 0);

        drop(held);
        exec.await.expect("executor task");

        let done = core.store.get(id).await.unwrap().unwrap();
        assert_eq!(done.state, JobState::Completed);
    }

    #[tokio::test]
    async fn cancelled_job_is_skipped_without_dispatch() {
        let (runtime, core) = runtime_with(Arc::new(ScriptedWork {
            result: Ok(serde_json::Value::Null),
        }))
        .await;

        let job = Job::new(uuid::Uuid::now_v7(), None, 1, kind(), 0);
        let id = job.id;
        core.store.insert(job).await.unwrap();
        core.apply_transition(
            id,
            0,
            JobState::Cancelled,
            TransitionDetail::Cancelled { reason: "user".to_string() },
        )
        .await
        .unwrap();

        runtime.execute(id).await;

        let current = core.store.get(id).await.unwrap().unwrap();
        assert_eq!(current.state, JobState::Cancelled);
        assert_eq!(runtime.stats.dispatched.load(Ordering::Relaxed), 0);
    }
}
