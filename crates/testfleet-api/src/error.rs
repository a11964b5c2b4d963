//! API error handling.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use testfleet_scheduler::QueueError;

/// API error type.
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Unauthorized(String),
    Forbidden(String),
    Conflict(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
        };

        let body = Json(json!({
            "error": message
        }));

        (status, body).into_response()
    }
}

impl From<QueueError> for ApiError {
    fn from(err: QueueError) -> Self {
        let message = err.to_string();
        match err {
            QueueError::UnknownJob(_)
            | QueueError::UnknownBucket(_)
            | QueueError::UnknownWorker(_) => ApiError::NotFound(message),
            QueueError::JobDeleted(_) | QueueError::WorkerLost(_) => ApiError::Conflict(message),
            QueueError::WorkerNotAllowed(_) => ApiError::Forbidden(message),
            QueueError::SignatureMismatch => ApiError::Unauthorized(message),
            QueueError::UnexpectedTest { .. }
            | QueueError::InvalidWorkerConfiguration { .. }
            | QueueError::Split(_) => ApiError::BadRequest(message),
        }
    }
}
