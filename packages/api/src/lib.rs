// ABOUTME: Submission API for Runhub: validate, enqueue, look up and cancel command jobs
// ABOUTME: Exposes the SubmissionService and its axum router

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

pub mod error;
pub mod handlers;
pub mod response;
pub mod service;

pub use error::{ApiError, Result};
pub use response::ApiResponse;
pub use service::{SubmissionService, SubmitRequest, SubmitResponse};

/// Job routes, state supplied by the caller
pub fn create_jobs_router() -> Router<SubmissionService> {
    Router::new()
        .route("/api/jobs", post(handlers::submit_job))
        .route("/api/jobs/{id}", get(handlers::get_job))
        .route("/api/jobs/{id}/cancel", post(handlers::cancel_job))
        .route("/api/health", get(handlers::health))
}

/// Job routes bound to a service, with request tracing
pub fn create_router(service: SubmissionService) -> Router {
    create_jobs_router()
        .with_state(service)
        .layer(TraceLayer::new_for_http())
}
