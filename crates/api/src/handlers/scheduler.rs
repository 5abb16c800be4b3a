//! Scheduler introspection handlers.

use axum::extract::State;
use axum::Json;

use cytoseg_scheduler::SchedulerStatsSnapshot;

use crate::error::AppResult;
use crate::response::DataResponse;
use crate::state::AppState;

/// GET /api/v1/scheduler/stats -- pool occupancy and lifetime counters.
pub async fn stats(
    State(state): State<AppState>,
) -> AppResult<Json<DataResponse<SchedulerStatsSnapshot>>> {
    Ok(Json(DataResponse { data: state.scheduler.stats() }))
}
