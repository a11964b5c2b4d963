//! Job scheduling, state and results endpoints.

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use testfleet_core::protocol::{ScheduleTestsRequest, ScheduleTestsResponse};
use testfleet_core::{JobId, JobResults, JobState};

use crate::AppState;
use crate::error::ApiError;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", post(schedule_tests))
        .route("/{job_id}", get(get_job).delete(delete_job))
        .route("/{job_id}/results", get(job_results))
}

async fn schedule_tests(
    State(state): State<AppState>,
    Json(req): Json<ScheduleTestsRequest>,
) -> Result<Json<ScheduleTestsResponse>, ApiError> {
    Ok(Json(state.dispatcher.schedule_tests(req).await?))
}

async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<JobId>,
) -> Result<Json<JobState>, ApiError> {
    Ok(Json(state.dispatcher.job_state(&job_id).await?))
}

async fn job_results(
    State(state): State<AppState>,
    Path(job_id): Path<JobId>,
) -> Result<Json<JobResults>, ApiError> {
    Ok(Json(state.dispatcher.job_results(&job_id).await?))
}

async fn delete_job(
    State(state): State<AppState>,
    Path(job_id): Path<JobId>,
) -> Result<Json<JobState>, ApiError> {
    Ok(Json(state.dispatcher.delete_job(&job_id).await?))
}
