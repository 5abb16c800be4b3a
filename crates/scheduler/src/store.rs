//! In-memory [`JobStore`] implementation.
//!
//! The default backend for single-process deployments and the workhorse of
//! the test suite. The compare-and-swap holds one write lock across the
//! check and the write, which makes it atomic by construction.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use cytoseg_core::job::{Job, JobState, TransitionDetail};
use cytoseg_core::store::{JobStore, StoreError};
use cytoseg_core::types::{BatchId, JobId};

/// Map-backed job store.
///
/// Insertion order is preserved per batch via an explicit index so
/// `list_by_batch` returns admission order without sorting on timestamps.
pub struct MemoryJobStore {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    jobs: HashMap<JobId, Job>,
    /// Job ids per batch, in admission order.
    batches: HashMap<BatchId, Vec<JobId>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self { inner: RwLock::new(Inner::default()) }
    }
}

impl Default for MemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, job: Job) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if let Some(batch_id) = job.batch_id {
            inner.batches.entry(batch_id).or_default().push(job.id);
        }
        inner.jobs.insert(job.id, job);
        Ok(())
    }

    async fn insert_batch(&self, jobs: Vec<Job>) -> Result<(), StoreError> {
        // One lock acquisition for the whole batch, so readers never observe
        // a partially inserted batch.
        let mut inner = self.inner.write().await;
        for job in jobs {
            if let Some(batch_id) = job.batch_id {
                inner.batches.entry(batch_id).or_default().push(job.id);
            }
            inner.jobs.insert(job.id, job);
        }
        Ok(())
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        Ok(self.inner.read().await.jobs.get(&id).cloned())
    }

    async fn try_transition(
        &self,
        id: JobId,
        expected_generation: u64,
        new_state: JobState,
        detail: TransitionDetail,
    ) -> Result<Option<Job>, StoreError> {
        let mut inner = self.inner.write().await;
        let Some(job) = inner.jobs.get_mut(&id) else {
            return Ok(None);
        };

        if job.generation != expected_generation || !job.state.can_transition_to(new_state) {
            return Ok(None);
        }

        let now = chrono::Utc::now();
        job.state = new_state;
        job.generation += 1;
        match detail {
            TransitionDetail::None => {}
            TransitionDetail::Completed(result) => {
                job.result = Some(result);
                job.completed_at = Some(now);
            }
            TransitionDetail::Failed(error) => {
                job.error = Some(error);
                job.completed_at = Some(now);
            }
            TransitionDetail::Cancelled { .. } => {
                job.cancel_requested = true;
                job.cancel_requested_at.get_or_insert(now);
                job.completed_at = Some(now);
            }
        }
        if new_state == JobState::Processing {
            job.started_at = Some(now);
        }

        Ok(Some(job.clone()))
    }

    async fn list_by_batch(&self, batch_id: BatchId) -> Result<Vec<Job>, StoreError> {
        let inner = self.inner.read().await;
        let jobs = inner
            .batches
            .get(&batch_id)
            .map(|ids| ids.iter().filter_map(|id| inner.jobs.get(id).cloned()).collect())
            .unwrap_or_default();
        Ok(jobs)
    }

    async fn list_active(&self) -> Result<Vec<Job>, StoreError> {
        let inner = self.inner.read().await;
        let mut jobs: Vec<Job> =
            inner.jobs.values().filter(|j| !j.state.is_terminal()).cloned().collect();
        jobs.sort_by_key(|j| j.created_at);
        Ok(jobs)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
