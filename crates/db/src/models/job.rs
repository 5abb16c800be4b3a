//! Row model for the `jobs` table.

use cytoseg_core::error::CoreError;
use cytoseg_core::job::{Job, JobError, JobKind, JobState};
use cytoseg_core::types::{BatchId, DbId, JobId, Timestamp};

/// One row of the `jobs` table.
///
/// `kind` and `error` are stored as JSONB and round-trip through serde; the
/// domain [`Job`] is the only shape the rest of the system sees.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct JobRow {
    pub id: JobId,
    pub batch_id: Option<BatchId>,
    pub owner_id: DbId,
    pub kind: serde_json::Value,
    pub priority: i32,
    pub generation: i64,
    pub state: String,
    pub created_at: Timestamp,
    pub started_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
    pub result: Option<serde_json::Value>,
    pub error: Option<serde_json::Value>,
    pub cancel_requested: bool,
    pub cancel_requested_at: Option<Timestamp>,
}

impl JobRow {
    /// Decode the row into the domain record.
    pub fn into_job(self) -> Result<Job, CoreError> {
        let kind: JobKind = serde_json::from_value(self.kind)
            .map_err(|e| CoreError::Internal(format!("Undecodable job kind column: {e}")))?;
        let error: Option<JobError> = self
            .error
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| CoreError::Internal(format!("Undecodable job error column: {e}")))?;

        Ok(Job {
            id: self.id,
            batch_id: self.batch_id,
            owner_id: self.owner_id,
            kind,
            priority: self.priority,
            generation: self.generation as u64,
            state: JobState::parse(&self.state)?,
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            result: self.result,
            error,
            cancel_requested: self.cancel_requested,
            cancel_requested_at: self.cancel_requested_at,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
