//! Repository for the `jobs` table.

use sqlx::PgPool;

use cytoseg_core::job::{Job, JobState, TransitionDetail};
use cytoseg_core::types::{BatchId, JobId};

use crate::models::job::JobRow;

/// Column list for jobs queries.
const COLUMNS: &str = "id, batch_id, owner_id, kind, priority, generation, state, \
    created_at, started_at, completed_at, result, error, \
    cancel_requested, cancel_requested_at";

/// Provides persistence operations for job records.
pub struct JobRepo;

impl JobRepo {
    /// Insert a freshly admitted job.
    pub async fn insert(pool: &PgPool, job: &Job) -> Result<(), sqlx::Error> {
        let kind = serde_json::to_value(&job.kind)
            .map_err(|e| sqlx::Error::Encode(Box::new(e)))?;
        sqlx::query(
            "INSERT INTO jobs
                (id, batch_id, owner_id, kind, priority, generation, state, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(job.id)
        .bind(job.batch_id)
        .bind(job.owner_id)
        .bind(kind)
        .bind(job.priority)
        .bind(job.generation as i64)
        .bind(job.state.as_str())
        .bind(job.created_at)
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Insert a whole batch in one transaction, so a failed admission never
    /// leaves a partial batch behind.
    pub async fn insert_batch(pool: &PgPool, jobs: &[Job]) -> Result<(), sqlx::Error> {
        let mut tx = pool.begin().await?;
        for job in jobs {
            let kind = serde_json::to_value(&job.kind)
                .map_err(|e| sqlx::Error::Encode(Box::new(e)))?;
            sqlx::query(
                "INSERT INTO jobs
                    (id, batch_id, owner_id, kind, priority, generation, state, created_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
            )
            .bind(job.id)
            .bind(job.batch_id)
            .bind(job.owner_id)
            .bind(kind)
            .bind(job.priority)
            .bind(job.generation as i64)
            .bind(job.state.as_str())
            .bind(job.created_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await
    }

    /// Find a job by its primary key.
    pub async fn find_by_id(pool: &PgPool, id: JobId) -> Result<Option<JobRow>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM jobs WHERE id = $1");
        sqlx::query_as::<_, JobRow>(&query).bind(id).fetch_optional(pool).await
    }

    /// The compare-and-swap: one guarded `UPDATE`.
    ///
    /// The row is updated only when the generation matches and the current
    /// state legally precedes `new_state`; `RETURNING` yields the accepted
    /// row, and zero rows means the CAS was rejected.
    pub async fn try_transition(
        pool: &PgPool,
        id: JobId,
        expected_generation: i64,
        new_state: JobState,
        detail: &TransitionDetail,
    ) -> Result<Option<JobRow>, sqlx::Error> {
        let (result, error, cancel) = match detail {
            TransitionDetail::None => (None, None, false),
            TransitionDetail::Completed(value) => (Some(value.clone()), None, false),
            TransitionDetail::Failed(job_error) => {
                let encoded = serde_json::to_value(job_error)
                    .map_err(|e| sqlx::Error::Encode(Box::new(e)))?;
                (None, Some(encoded), false)
            }
            TransitionDetail::Cancelled { .. } => (None, None, true),
        };
        let legal_sources: Vec<String> =
            JobState::legal_sources(new_state).iter().map(|s| s.as_str().to_string()).collect();
        let terminal = new_state.is_terminal();

        let query = format!(
            "UPDATE jobs SET
                state = $3,
                generation = generation + 1,
                started_at = CASE WHEN $3 = 'processing' THEN now() ELSE started_at END,
                completed_at = CASE WHEN $4 THEN now() ELSE completed_at END,
                result = COALESCE($5, result),
                error = COALESCE($6, error),
                cancel_requested = cancel_requested OR $7,
                cancel_requested_at = CASE
                    WHEN $7 THEN COALESCE(cancel_requested_at, now())
                    ELSE cancel_requested_at
                END
             WHERE id = $1 AND generation = $2 AND state = ANY($8)
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, JobRow>(&query)
            .bind(id)
            .bind(expected_generation)
            .bind(new_state.as_str())
            .bind(terminal)
            .bind(result)
            .bind(error)
            .bind(cancel)
            .bind(&legal_sources)
            .fetch_optional(pool)
            .await
    }

    /// All jobs of a batch, in admission order.
    pub async fn list_by_batch(
        pool: &PgPool,
        batch_id: BatchId,
    ) -> Result<Vec<JobRow>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM jobs
             WHERE batch_id = $1
             ORDER BY created_at, id"
        );
        sqlx::query_as::<_, JobRow>(&query).bind(batch_id).fetch_all(pool).await
    }

    /// All non-terminal jobs, oldest first.
    pub async fn list_active(pool: &PgPool) -> Result<Vec<JobRow>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM jobs
             WHERE state IN ('queued', 'dispatched', 'processing')
             ORDER BY created_at, id"
        );
        sqlx::query_as::<_, JobRow>(&query).fetch_all(pool).await
    }
}
