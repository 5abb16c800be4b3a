//! Idempotent cancellation coordinator.
//!
//! Cancellation is a compare-and-swap like every other transition: read the
//! current generation, CAS to `Cancelled`. A Queued job never reaches the
//! pool afterwards; a Processing job keeps running, but its eventual result
//! loses the CAS and is discarded. Cancelling a job that is already terminal
//! is an idempotent success, never an error.

use std::sync::Arc;

use cytoseg_core::job::{Job, JobState, TransitionDetail};
use cytoseg_core::store::StoreError;
use cytoseg_core::types::{BatchId, JobId};

use crate::scheduler::SchedulerCore;

/// Result of one cancellation request.
#[derive(Debug)]
pub enum CancelOutcome {
    /// The CAS was accepted; exactly one terminal event was emitted.
    Cancelled(Job),
    /// The job had already reached a terminal state; nothing was emitted.
    AlreadyTerminal(Job),
    /// No such job.
    NotFound,
}

impl CancelOutcome {
    /// Whether the request is a success from the caller's point of view
    /// (both fresh and redundant cancels are).
    pub fn is_success(&self) -> bool {
        !matches!(self, Self::NotFound)
    }
}

/// Aggregate outcome of a batch-wide or global cancel.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct BatchCancelSummary {
    /// Jobs this request actually moved to `Cancelled`.
    pub cancelled: usize,
    /// Jobs that were already terminal and were left untouched.
    pub already_terminal: usize,
}

/// Coordinates cancellation requests against the state machine.
#[derive(Clone)]
pub struct CancellationCoordinator {
    core: Arc<SchedulerCore>,
}

impl CancellationCoordinator {
    pub(crate) fn new(core: Arc<SchedulerCore>) -> Self {
        Self { core }
    }

    /// Request cancellation of one job.
    ///
    /// Loops on CAS rejection with a fresh read: losing the race to another
    /// transition (a dispatch, a retry bump, a concurrent cancel) only means
    /// the generation moved, and the next read either finds the job terminal
    /// or cancels it at its new generation.
    pub async fn cancel_job(&self, id: JobId, reason: &str) -> Result<CancelOutcome, StoreError> {
        loop {
            let Some(job) = self.core.store.get(id).await? else {
                return Ok(CancelOutcome::NotFound);
            };
            if job.state.is_terminal() {
                tracing::debug!(job_id = %id, state = job.state.as_str(), "Cancel after terminal state is a no-op");
                return Ok(CancelOutcome::AlreadyTerminal(job));
            }

            let detail = TransitionDetail::Cancelled { reason: reason.to_string() };
            match self
                .core
                .apply_transition(id, job.generation, JobState::Cancelled, detail)
                .await?
            {
                Some(updated) => {
                    tracing::info!(job_id = %id, reason, "Job cancelled");
                    return Ok(CancelOutcome::Cancelled(updated));
                }
                // Lost the race; re-read and retry.
                None => continue,
            }
        }
    }

    /// Cancel every still-non-terminal job of a batch.
    pub async fn cancel_batch(
        &self,
        batch_id: BatchId,
        reason: &str,
    ) -> Result<BatchCancelSummary, StoreError> {
        let jobs = self.core.store.list_by_batch(batch_id).await?;
        let summary = self.cancel_each(jobs, reason).await?;
        tracing::info!(
            batch_id = %batch_id,
            cancelled = summary.cancelled,
            already_terminal = summary.already_terminal,
            "Batch cancel complete",
        );
        Ok(summary)
    }

    /// Emergency stop: cancel every non-terminal job across all batches.
    pub async fn cancel_all(&self, reason: &str) -> Result<BatchCancelSummary, StoreError> {
        let jobs = self.core.store.list_active().await?;
        let summary = self.cancel_each(jobs, reason).await?;
        tracing::warn!(
            cancelled = summary.cancelled,
            "Emergency stop: all active jobs cancelled",
        );
        Ok(summary)
    }

    async fn cancel_each(
        &self,
        jobs: Vec<Job>,
        reason: &str,
    ) -> Result<BatchCancelSummary, StoreError> {
        let mut summary = BatchCancelSummary::default();
        for job in jobs {
            match self.cancel_job(job.id, reason).await? {
                CancelOutcome::Cancelled(_) => summary.cancelled += 1,
                CancelOutcome::AlreadyTerminal(_) => summary.already_terminal += 1,
                // Deleted between listing and cancel; nothing to report.
                CancelOutcome::NotFound => {}
            }
        }
        Ok(summary)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
