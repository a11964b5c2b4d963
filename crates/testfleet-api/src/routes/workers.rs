//! Worker registration, heartbeat and blocking endpoints.

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use testfleet_core::protocol::{AckResponse, RegisterWorkerRequest};
use std::collections::BTreeMap;
use testfleet_core::{AlivenessStatus, WorkerAliveness, WorkerConfiguration, WorkerId};
use tracing::debug;

use crate::AppState;
use crate::error::ApiError;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_workers))
        .route("/by-status", get(workers_by_status))
        .route("/{worker_id}", get(get_worker))
        .route("/{worker_id}/register", post(register_worker))
        .route("/{worker_id}/alive", post(report_alive))
        .route("/{worker_id}/block", post(block_worker))
        .route("/{worker_id}/unblock", post(unblock_worker))
}

async fn list_workers(State(state): State<AppState>) -> Json<Vec<WorkerAliveness>> {
    Json(state.dispatcher.workers().await)
}

async fn workers_by_status(
    State(state): State<AppState>,
) -> Json<BTreeMap<AlivenessStatus, Vec<WorkerId>>> {
    Json(state.dispatcher.workers_by_status().await)
}

async fn get_worker(
    State(state): State<AppState>,
    Path(worker_id): Path<WorkerId>,
) -> Json<WorkerAliveness> {
    Json(state.dispatcher.worker(&worker_id).await)
}

async fn register_worker(
    State(state): State<AppState>,
    Path(worker_id): Path<WorkerId>,
    Json(req): Json<RegisterWorkerRequest>,
) -> Result<Json<WorkerConfiguration>, ApiError> {
    let configuration = state
        .dispatcher
        .register_worker(worker_id, req.configuration)
        .await?;
    Ok(Json(configuration))
}

async fn report_alive(
    State(state): State<AppState>,
    Path(worker_id): Path<WorkerId>,
) -> Result<Json<AckResponse>, ApiError> {
    let status = state.dispatcher.report_alive(&worker_id).await?;
    debug!(worker_id = %worker_id, status = ?status, "Heartbeat");
    Ok(Json(AckResponse::ok()))
}

async fn block_worker(
    State(state): State<AppState>,
    Path(worker_id): Path<WorkerId>,
) -> Result<Json<WorkerAliveness>, ApiError> {
    let worker = state.dispatcher.set_worker_blocked(&worker_id, true).await?;
    Ok(Json(worker))
}

async fn unblock_worker(
    State(state): State<AppState>,
    Path(worker_id): Path<WorkerId>,
) -> Result<Json<WorkerAliveness>, ApiError> {
    let worker = state.dispatcher.set_worker_blocked(&worker_id, false).await?;
    Ok(Json(worker))
}
