//! Handlers for batch submission, inspection, and cancellation.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;

use cytoseg_core::types::BatchId;
use cytoseg_scheduler::{BatchCancelSummary, BatchDescriptor, BatchReceipt, BatchSnapshot};

use crate::error::AppResult;
use crate::extract::OwnerId;
use crate::response::DataResponse;
use crate::state::AppState;

/// POST /api/v1/batches -- submit a batch of jobs.
///
/// Validation is all-or-nothing; an accepted batch returns 201 with the
/// batch id and the job ids in item order.
pub async fn submit_batch(
    State(state): State<AppState>,
    OwnerId(owner_id): OwnerId,
    Json(descriptor): Json<BatchDescriptor>,
) -> AppResult<(StatusCode, Json<DataResponse<BatchReceipt>>)> {
    let receipt = state.scheduler.submit(owner_id, descriptor).await?;
    Ok((StatusCode::CREATED, Json(DataResponse { data: receipt })))
}

/// GET /api/v1/batches/{id} -- batch snapshot with derived counts.
pub async fn get_batch(
    State(state): State<AppState>,
    Path(batch_id): Path<BatchId>,
) -> AppResult<Json<DataResponse<BatchSnapshot>>> {
    let snapshot = state
        .scheduler
        .batch_snapshot(batch_id)
        .await?
        .ok_or_else(|| crate::error::AppError::NotFound(format!("Batch {batch_id} not found")))?;
    Ok(Json(DataResponse { data: snapshot }))
}

/// POST /api/v1/batches/{id}/cancel -- cancel every still-running job of the
/// batch. Idempotent: already-terminal jobs are reported, not errors.
pub async fn cancel_batch(
    State(state): State<AppState>,
    Path(batch_id): Path<BatchId>,
) -> AppResult<Json<DataResponse<BatchCancelSummary>>> {
    let summary = state.scheduler.cancel_batch(batch_id, "batch cancel requested").await?;
    Ok(Json(DataResponse { data: summary }))
}
