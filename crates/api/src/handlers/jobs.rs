//! Handlers for single-job inspection and cancellation.

use axum::extract::{Path, State};
use axum::Json;
use serde::Serialize;

use cytoseg_core::job::Job;
use cytoseg_core::types::JobId;
use cytoseg_scheduler::{BatchCancelSummary, CancelOutcome};

use crate::error::{AppError, AppResult};
use crate::response::DataResponse;
use crate::state::AppState;

/// Body of a cancel response: the job's current record plus whether this
/// request did the cancelling.
#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub job: Job,
    /// `"cancelled"` when this request performed the cancel,
    /// `"already_terminal"` when the job had already settled.
    pub status: &'static str,
}

/// GET /api/v1/jobs/{id} -- point-in-time job snapshot.
pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<JobId>,
) -> AppResult<Json<DataResponse<Job>>> {
    let job = state
        .scheduler
        .job(job_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Job {job_id} not found")))?;
    Ok(Json(DataResponse { data: job }))
}

/// GET /api/v1/jobs/active -- all currently non-terminal jobs.
pub async fn list_active(
    State(state): State<AppState>,
) -> AppResult<Json<DataResponse<Vec<Job>>>> {
    let jobs = state.scheduler.active_jobs().await?;
    Ok(Json(DataResponse { data: jobs }))
}

/// POST /api/v1/jobs/{id}/cancel -- idempotent cancel; 200 whether or not
/// the job was still running.
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<JobId>,
) -> AppResult<Json<DataResponse<CancelResponse>>> {
    let outcome = state.scheduler.cancel_job(job_id, "cancel requested").await?;
    let response = match outcome {
        CancelOutcome::Cancelled(job) => CancelResponse { job, status: "cancelled" },
        CancelOutcome::AlreadyTerminal(job) => {
            CancelResponse { job, status: "already_terminal" }
        }
        CancelOutcome::NotFound => {
            return Err(AppError::NotFound(format!("Job {job_id} not found")));
        }
    };
    Ok(Json(DataResponse { data: response }))
}

/// POST /api/v1/jobs/cancel-all -- emergency stop across all batches.
pub async fn cancel_all(
    State(state): State<AppState>,
) -> AppResult<Json<DataResponse<BatchCancelSummary>>> {
    let summary = state.scheduler.cancel_all("emergency stop requested").await?;
    Ok(Json(DataResponse { data: summary }))
}
