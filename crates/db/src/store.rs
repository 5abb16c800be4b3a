//! [`JobStore`] implementation backed by [`JobRepo`].

use async_trait::async_trait;
use sqlx::PgPool;

use cytoseg_core::job::{Job, JobState, TransitionDetail};
use cytoseg_core::store::{JobStore, StoreError};
use cytoseg_core::types::{BatchId, JobId};

use crate::models::job::JobRow;
use crate::repositories::job_repo::JobRepo;

/// Postgres-backed job store.
///
/// Durability lives in the database; atomicity of the compare-and-swap is
/// the guarded `UPDATE` in [`JobRepo::try_transition`].
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn decode(row: JobRow) -> Result<Job, StoreError> {
    row.into_job().map_err(StoreError::backend)
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn insert(&self, job: Job) -> Result<(), StoreError> {
        JobRepo::insert(&self.pool, &job).await.map_err(StoreError::backend)
    }

    async fn insert_batch(&self, jobs: Vec<Job>) -> Result<(), StoreError> {
        JobRepo::insert_batch(&self.pool, &jobs).await.map_err(StoreError::backend)
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        let row = JobRepo::find_by_id(&self.pool, id).await.map_err(StoreError::backend)?;
        row.map(decode).transpose()
    }

    async fn try_transition(
        &self,
        id: JobId,
        expected_generation: u64,
        new_state: JobState,
        detail: TransitionDetail,
    ) -> Result<Option<Job>, StoreError> {
        let row = JobRepo::try_transition(
            &self.pool,
            id,
            expected_generation as i64,
            new_state,
            &detail,
        )
        .await
        .map_err(StoreError::backend)?;
        row.map(decode).transpose()
    }

    async fn list_by_batch(&self, batch_id: BatchId) -> Result<Vec<Job>, StoreError> {
        let rows =
            JobRepo::list_by_batch(&self.pool, batch_id).await.map_err(StoreError::backend)?;
        rows.into_iter().map(decode).collect()
    }

    async fn list_active(&self) -> Result<Vec<Job>, StoreError> {
        let rows = JobRepo::list_active(&self.pool).await.map_err(StoreError::backend)?;
        rows.into_iter().map(decode).collect()
    }
}
