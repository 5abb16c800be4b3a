//! The narrow persistence contract for job records.
//!
//! [`JobStore::try_transition`] is the single compare-and-swap primitive
//! through which ALL job state mutation flows. Implementations must apply it
//! atomically: the in-memory store holds its lock across the check and the
//! write; the Postgres store expresses it as one guarded `UPDATE`.

use async_trait::async_trait;

use crate::job::{Job, JobState, TransitionDetail};
use crate::types::{BatchId, JobId};

/// Errors from a job store implementation.
///
/// The in-memory store is infallible; the Postgres store surfaces driver
/// failures here. A rejected compare-and-swap is NOT an error — it is the
/// `Ok(None)` outcome of [`JobStore::try_transition`].
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Job store backend error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl StoreError {
    /// Wrap a backend driver error.
    pub fn backend(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Backend(Box::new(err))
    }
}

/// Persistence collaborator for job records.
///
/// The scheduler owns the lifecycle; the store owns durability. No method
/// other than `try_transition` writes `state` or `generation`.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a freshly admitted job (generation 0, `Queued`).
    async fn insert(&self, job: Job) -> Result<(), StoreError>;

    /// Persist a whole admitted batch.
    ///
    /// Implementations should make this all-or-nothing (the Postgres store
    /// wraps it in one transaction); admission relies on never leaving a
    /// half-created batch behind.
    async fn insert_batch(&self, jobs: Vec<Job>) -> Result<(), StoreError> {
        for job in jobs {
            self.insert(job).await?;
        }
        Ok(())
    }

    /// Point-in-time snapshot of one job.
    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError>;

    /// Atomically apply a state transition.
    ///
    /// Succeeds only if the job exists, is non-terminal, currently holds
    /// `expected_generation`, and the transition is legal for its current
    /// state. On success the generation is bumped, the detail fields are
    /// applied, and the updated record is returned. Any other case is a
    /// no-op returning `Ok(None)` — including the benign races (late
    /// completion after cancel, duplicate cancel) this contract exists to
    /// resolve.
    async fn try_transition(
        &self,
        id: JobId,
        expected_generation: u64,
        new_state: JobState,
        detail: TransitionDetail,
    ) -> Result<Option<Job>, StoreError>;

    /// All jobs belonging to a batch, in admission order.
    async fn list_by_batch(&self, batch_id: BatchId) -> Result<Vec<Job>, StoreError>;

    /// All jobs currently in a non-terminal state.
    async fn list_active(&self) -> Result<Vec<Job>, StoreError>;
}
