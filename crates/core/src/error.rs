use crate::types::JobId;

/// Domain-level errors shared across the workspace.
///
/// Expected scheduling races (stale generation, duplicate cancel) are NOT
/// errors — they are silent, correct outcomes and never appear here.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// Input failed validation at admission time.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A referenced entity does not exist.
    #[error("{entity} {id} not found")]
    NotFound {
        /// Entity kind for the error message (e.g. "Job", "Batch").
        entity: &'static str,
        id: JobId,
    },

    /// The request conflicts with current state.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// An unexpected internal failure.
    #[error("Internal error: {0}")]
    Internal(String),
}
