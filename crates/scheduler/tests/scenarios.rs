//! End-to-end scheduler scenarios against the in-memory store.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use cytoseg_core::job::{JobErrorCode, JobKindTag, JobState};
use cytoseg_core::work::{WorkError, WorkFunction};
use cytoseg_events::EventHub;
use cytoseg_scheduler::{
    BatchDescriptor, BatchItem, CancelOutcome, MemoryJobStore, PoolSpec, Scheduler,
    SchedulerConfig,
};

// ---------------------------------------------------------------------------
// Test work functions
// ---------------------------------------------------------------------------

/// Sleeps briefly and records the peak number of concurrent invocations.
struct ConcurrencyProbe {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl ConcurrencyProbe {
    fn new() -> Arc<Self> {
        Arc::new(Self { in_flight: AtomicUsize::new(0), peak: AtomicUsize::new(0) })
    }
}

#[async_trait]
impl WorkFunction for ConcurrencyProbe {
    async fn invoke(
        &self,
        _payload: serde_json::Value,
        _generation: u64,
    ) -> Result<serde_json::Value, WorkError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(serde_json::Value::Null)
    }
}

/// Blocks each invocation until the test hands out a permit.
struct GatedWork {
    gate: tokio::sync::Semaphore,
}

impl GatedWork {
    fn new() -> Arc<Self> {
        Arc::new(Self { gate: tokio::sync::Semaphore::new(0) })
    }

    fn release_one(&self) {
        self.gate.add_permits(1);
    }
}

#[async_trait]
impl WorkFunction for GatedWork {
    async fn invoke(
        &self,
        _payload: serde_json::Value,
        _generation: u64,
    ) -> Result<serde_json::Value, WorkError> {
        let _permit = self.gate.acquire().await.map_err(|_| {
            WorkError::Transient("gate closed".to_string())
        })?;
        Ok(serde_json::json!({"mask_count": 1}))
    }
}

/// Records the model name of each invocation, in order.
struct OrderRecorder {
    order: std::sync::Mutex<Vec<String>>,
}

impl OrderRecorder {
    fn new() -> Arc<Self> {
        Arc::new(Self { order: std::sync::Mutex::new(Vec::new()) })
    }
}

#[async_trait]
impl WorkFunction for OrderRecorder {
    async fn invoke(
        &self,
        payload: serde_json::Value,
        _generation: u64,
    ) -> Result<serde_json::Value, WorkError> {
        let model = payload["model"].as_str().unwrap_or("?").to_string();
        self.order.lock().expect("order lock").push(model);
        Ok(serde_json::Value::Null)
    }
}

/// Fails transiently a fixed number of times, then succeeds.
struct FlakyWork {
    failures_left: AtomicUsize,
    attempts: AtomicUsize,
}

impl FlakyWork {
    fn new(failures: usize) -> Arc<Self> {
        Arc::new(Self { failures_left: AtomicUsize::new(failures), attempts: AtomicUsize::new(0) })
    }
}

#[async_trait]
impl WorkFunction for FlakyWork {
    async fn invoke(
        &self,
        _payload: serde_json::Value,
        _generation: u64,
    ) -> Result<serde_json::Value, WorkError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            return Err(WorkError::Transient("inference service unavailable".to_string()));
        }
        Ok(serde_json::Value::Null)
    }
}

/// Never returns within any reasonable deadline.
struct StuckWork;

#[async_trait]
impl WorkFunction for StuckWork {
    async fn invoke(
        &self,
        _payload: serde_json::Value,
        _generation: u64,
    ) -> Result<serde_json::Value, WorkError> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(serde_json::Value::Null)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn segmentation_item(model: &str) -> BatchItem {
    serde_json::from_value(serde_json::json!({
        "kind": "segmentation_item",
        "image_id": uuid::Uuid::new_v4(),
        "model": model,
        "priority": 0,
    }))
    .expect("valid batch item")
}

fn scheduler_with(spec: PoolSpec) -> Scheduler {
    let store = Arc::new(MemoryJobStore::new());
    let hub = Arc::new(EventHub::default());
    let mut config = SchedulerConfig::new(vec![spec]);
    config.poll_interval = Duration::from_millis(20);
    Scheduler::new(store, hub, config)
}

fn gpu_spec(capacity: usize, handler: Arc<dyn WorkFunction>) -> PoolSpec {
    PoolSpec::new("gpu", capacity)
        .handler(JobKindTag::Segmentation, handler)
        .job_timeout(Duration::from_secs(5))
        .retries(3, Duration::from_millis(10))
}

/// Poll until every job of the batch is terminal.
async fn wait_settled(scheduler: &Scheduler, batch_id: uuid::Uuid) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let snapshot = scheduler
            .batch_snapshot(batch_id)
            .await
            .expect("store")
            .expect("batch exists");
        if snapshot.counts.is_settled() {
            return;
        }
        assert!(tokio::time::Instant::now() < deadline, "batch did not settle in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn wait_for_state(scheduler: &Scheduler, id: uuid::Uuid, state: JobState) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let job = scheduler.job(id).await.expect("store").expect("job exists");
        if job.state == state {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "job never reached {state:?}, stuck at {:?}",
            job.state
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

// Four jobs on a two-slot pool: all complete, never more than two at once.
#[tokio::test]
async fn concurrency_never_exceeds_pool_capacity() {
    let probe = ConcurrencyProbe::new();
    let scheduler = scheduler_with(gpu_spec(2, Arc::clone(&probe) as Arc<dyn WorkFunction>));
    scheduler.start();

    let receipt = scheduler
        .submit(
            1,
            BatchDescriptor {
                items: (0..4).map(|i| segmentation_item(&format!("m{i}"))).collect(),
            },
        )
        .await
        .expect("admitted");

    wait_settled(&scheduler, receipt.batch_id).await;

    let snapshot = scheduler.batch_snapshot(receipt.batch_id).await.unwrap().unwrap();
    assert_eq!(snapshot.counts.completed, 4);
    assert!(probe.peak.load(Ordering::SeqCst) <= 2);
    assert!(probe.peak.load(Ordering::SeqCst) >= 1);

    scheduler.shutdown().await;
}

// A cancel that lands while the job is Processing wins over the work
// function's later success: the job is Cancelled, the result is discarded,
// and exactly one terminal event is emitted.
#[tokio::test]
async fn cancel_wins_over_late_completion() {
    let gate = GatedWork::new();
    let scheduler = scheduler_with(gpu_spec(1, Arc::clone(&gate) as Arc<dyn WorkFunction>));
    scheduler.start();

    let receipt = scheduler
        .submit(1, BatchDescriptor { items: vec![segmentation_item("unet")] })
        .await
        .expect("admitted");
    let job_id = receipt.job_ids[0];

    wait_for_state(&scheduler, job_id, JobState::Processing).await;

    let outcome = scheduler.cancel_job(job_id, "user request").await.expect("cancel");
    assert!(matches!(outcome, CancelOutcome::Cancelled(_)));

    // Let the work function finish; its success must be discarded.
    gate.release_one();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let job = scheduler.job(job_id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Cancelled);
    assert!(job.result.is_none());

    // Queued, Dispatched, Processing, Cancelled — and nothing after.
    let replay = scheduler.hub().subscribe(receipt.batch_id, 0).replay;
    let states: Vec<JobState> = replay.iter().map(|e| e.state).collect();
    assert_eq!(
        states,
        vec![JobState::Queued, JobState::Dispatched, JobState::Processing, JobState::Cancelled]
    );
    let terminal_events = states.iter().filter(|s| s.is_terminal()).count();
    assert_eq!(terminal_events, 1);

    scheduler.shutdown().await;
}

// One slot, two owners: owner 2's single job is served before owner 1's
// backlog drains.
#[tokio::test]
async fn dispatch_is_owner_fair() {
    let recorder = OrderRecorder::new();
    let scheduler = scheduler_with(gpu_spec(1, Arc::clone(&recorder) as Arc<dyn WorkFunction>));

    // Enqueue everything before starting the workers so the order is fixed.
    let batch_a = scheduler
        .submit(
            1,
            BatchDescriptor {
                items: vec![
                    segmentation_item("a1"),
                    segmentation_item("a2"),
                    segmentation_item("a3"),
                ],
            },
        )
        .await
        .expect("admitted");
    let batch_b = scheduler
        .submit(2, BatchDescriptor { items: vec![segmentation_item("b1")] })
        .await
        .expect("admitted");

    scheduler.start();
    wait_settled(&scheduler, batch_a.batch_id).await;
    wait_settled(&scheduler, batch_b.batch_id).await;

    let order = recorder.order.lock().expect("order lock").clone();
    assert_eq!(order, vec!["a1", "b1", "a2", "a3"]);

    scheduler.shutdown().await;
}

// A reconnecting subscriber with last_seq replays exactly the events after
// it, in order, with no duplicates.
#[tokio::test]
async fn reconnect_replays_events_after_last_seq() {
    let scheduler = scheduler_with(gpu_spec(1, OrderRecorder::new() as Arc<dyn WorkFunction>));
    scheduler.start();

    let receipt = scheduler
        .submit(
            1,
            BatchDescriptor { items: vec![segmentation_item("m1"), segmentation_item("m2")] },
        )
        .await
        .expect("admitted");
    wait_settled(&scheduler, receipt.batch_id).await;

    // 2 jobs x (Queued, Dispatched, Processing, Completed) = 8 events.
    let hub = scheduler.hub();
    assert_eq!(hub.latest_seq(receipt.batch_id), 8);

    let sub = hub.subscribe(receipt.batch_id, 3);
    assert!(!sub.snapshot_required);
    let seqs: Vec<u64> = sub.replay.iter().map(|e| e.seq).collect();
    assert_eq!(seqs, vec![4, 5, 6, 7, 8]);

    scheduler.shutdown().await;
}

// Whichever side wins the race, a job settles in exactly one terminal state
// and emits exactly one terminal event.
#[tokio::test]
async fn racing_cancel_and_completion_yield_one_terminal_state() {
    let recorder = OrderRecorder::new();
    let scheduler = scheduler_with(gpu_spec(2, recorder as Arc<dyn WorkFunction>));
    scheduler.start();

    for round in 0..10 {
        let receipt = scheduler
            .submit(
                1,
                BatchDescriptor { items: vec![segmentation_item(&format!("r{round}"))] },
            )
            .await
            .expect("admitted");
        let job_id = receipt.job_ids[0];

        let _ = scheduler.cancel_job(job_id, "race").await.expect("cancel");
        wait_settled(&scheduler, receipt.batch_id).await;

        let job = scheduler.job(job_id).await.unwrap().unwrap();
        assert!(job.state.is_terminal());
        assert!(matches!(job.state, JobState::Completed | JobState::Cancelled));

        let replay = scheduler.hub().subscribe(receipt.batch_id, 0).replay;
        let terminal_events =
            replay.iter().filter(|e| e.state.is_terminal()).count();
        assert_eq!(terminal_events, 1, "round {round}");
    }

    scheduler.shutdown().await;
}

// Batch cancel sweeps queued jobs that never reach the pool.
#[tokio::test]
async fn batch_cancel_stops_queued_jobs_before_dispatch() {
    let gate = GatedWork::new();
    let scheduler = scheduler_with(gpu_spec(1, Arc::clone(&gate) as Arc<dyn WorkFunction>));
    scheduler.start();

    let receipt = scheduler
        .submit(
            1,
            BatchDescriptor {
                items: (0..3).map(|i| segmentation_item(&format!("m{i}"))).collect(),
            },
        )
        .await
        .expect("admitted");

    // First job occupies the only slot; the rest are Queued.
    wait_for_state(&scheduler, receipt.job_ids[0], JobState::Processing).await;

    let summary = scheduler.cancel_batch(receipt.batch_id, "batch stop").await.expect("cancel");
    assert_eq!(summary.cancelled, 3);

    gate.release_one();
    wait_settled(&scheduler, receipt.batch_id).await;

    let snapshot = scheduler.batch_snapshot(receipt.batch_id).await.unwrap().unwrap();
    assert_eq!(snapshot.counts.cancelled, 3);
    assert_eq!(snapshot.counts.completed, 0);

    scheduler.shutdown().await;
}

// A work function that never returns is cut off at the pool deadline and
// recorded as a timeout failure.
#[tokio::test]
async fn timeout_forces_failed_with_timeout_code() {
    let spec = PoolSpec::new("gpu", 1)
        .handler(JobKindTag::Segmentation, Arc::new(StuckWork))
        .job_timeout(Duration::from_millis(100));
    let scheduler = scheduler_with(spec);
    scheduler.start();

    let receipt = scheduler
        .submit(1, BatchDescriptor { items: vec![segmentation_item("unet")] })
        .await
        .expect("admitted");
    wait_settled(&scheduler, receipt.batch_id).await;

    let job = scheduler.job(receipt.job_ids[0]).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.error.expect("failure record").code, JobErrorCode::Timeout);

    let stats = scheduler.stats();
    assert_eq!(stats.pools[0].timed_out, 1);

    scheduler.shutdown().await;
}

// Transient failures are retried with backoff and the job still completes.
#[tokio::test]
async fn transient_failures_are_retried_then_succeed() {
    let flaky = FlakyWork::new(2);
    let scheduler = scheduler_with(gpu_spec(1, Arc::clone(&flaky) as Arc<dyn WorkFunction>));
    scheduler.start();

    let receipt = scheduler
        .submit(1, BatchDescriptor { items: vec![segmentation_item("unet")] })
        .await
        .expect("admitted");
    wait_settled(&scheduler, receipt.batch_id).await;

    let job = scheduler.job(receipt.job_ids[0]).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Completed);
    assert_eq!(flaky.attempts.load(Ordering::SeqCst), 3);
    assert_eq!(scheduler.stats().pools[0].retries, 2);

    scheduler.shutdown().await;
}

// Retries have a bound; persistent transient failure becomes Failed.
#[tokio::test]
async fn exhausted_retries_become_failed() {
    let flaky = FlakyWork::new(100);
    let spec = PoolSpec::new("gpu", 1)
        .handler(JobKindTag::Segmentation, Arc::clone(&flaky) as Arc<dyn WorkFunction>)
        .retries(2, Duration::from_millis(5));
    let scheduler = scheduler_with(spec);
    scheduler.start();

    let receipt = scheduler
        .submit(1, BatchDescriptor { items: vec![segmentation_item("unet")] })
        .await
        .expect("admitted");
    wait_settled(&scheduler, receipt.batch_id).await;

    let job = scheduler.job(receipt.job_ids[0]).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.error.expect("failure record").code, JobErrorCode::RetriesExhausted);
    // Initial attempt plus two retries.
    assert_eq!(flaky.attempts.load(Ordering::SeqCst), 3);

    scheduler.shutdown().await;
}

// cancel_all settles everything that is still in flight or queued.
#[tokio::test]
async fn emergency_stop_cancels_across_batches() {
    let gate = GatedWork::new();
    let scheduler = scheduler_with(gpu_spec(1, Arc::clone(&gate) as Arc<dyn WorkFunction>));
    scheduler.start();

    let batch_a = scheduler
        .submit(1, BatchDescriptor { items: vec![segmentation_item("a1")] })
        .await
        .expect("admitted");
    let batch_b = scheduler
        .submit(2, BatchDescriptor { items: vec![segmentation_item("b1")] })
        .await
        .expect("admitted");

    wait_for_state(&scheduler, batch_a.job_ids[0], JobState::Processing).await;

    let summary = scheduler.cancel_all("emergency stop").await.expect("cancel all");
    assert_eq!(summary.cancelled, 2);

    gate.release_one();
    wait_settled(&scheduler, batch_a.batch_id).await;
    wait_settled(&scheduler, batch_b.batch_id).await;
    assert!(scheduler.active_jobs().await.unwrap().is_empty());

    scheduler.shutdown().await;
}
