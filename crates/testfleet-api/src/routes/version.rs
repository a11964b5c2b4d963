//! Queue protocol version.

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use testfleet_core::protocol::QueueVersionResponse;

use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/version", get(version))
}

async fn version(State(state): State<AppState>) -> Json<QueueVersionResponse> {
    Json(QueueVersionResponse {
        version: state.dispatcher.version().to_string(),
    })
}
