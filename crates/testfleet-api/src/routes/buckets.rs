//! Bucket fetch and result submission endpoints.

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use testfleet_core::protocol::{
    FetchBucketRequest, FetchBucketResponse, ProcessingBucketsResponse, SubmitResultRequest,
    SubmitResultResponse,
};

use crate::AppState;
use crate::error::ApiError;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/fetch", post(fetch_bucket))
        .route("/results", post(submit_result))
        .route("/processing", get(processing_buckets))
}

async fn fetch_bucket(
    State(state): State<AppState>,
    Json(req): Json<FetchBucketRequest>,
) -> Result<Json<FetchBucketResponse>, ApiError> {
    Ok(Json(state.dispatcher.fetch_bucket(req).await?))
}

async fn submit_result(
    State(state): State<AppState>,
    Json(req): Json<SubmitResultRequest>,
) -> Result<Json<SubmitResultResponse>, ApiError> {
    Ok(Json(state.dispatcher.submit_result(req).await?))
}

async fn processing_buckets(State(state): State<AppState>) -> Json<ProcessingBucketsResponse> {
    Json(state.dispatcher.currently_processing().await)
}
