//! API routes.

pub mod buckets;
pub mod health;
pub mod jobs;
pub mod version;
pub mod workers;

use crate::AppState;
use axum::Router;

/// Build the main API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .nest("/api/v1", api_router())
        .merge(health::router())
        .with_state(state)
}

fn api_router() -> Router<AppState> {
    Router::new()
        .merge(version::router())
        .nest("/workers", workers::router())
        .nest("/buckets", buckets::router())
        .nest("/jobs", jobs::router())
}
