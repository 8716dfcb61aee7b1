// ABOUTME: API error type and its JSON error response
// ABOUTME: Maps validation, lookup and storage failures to status codes and client-visible error codes

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use runhub_core::{ErrorCode, ValidationError};
use runhub_queue::QueueError;
use serde::Serialize;
use thiserror::Error;
use tracing::{error, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Malformed request: {0}")]
    BadRequest(String),

    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Queue error: {0}")]
    Queue(QueueError),
}

impl From<QueueError> for ApiError {
    fn from(error: QueueError) -> Self {
        match error {
            QueueError::Validation(e) => ApiError::Validation(e),
            QueueError::NotFound(id) => ApiError::NotFound(id),
            other => ApiError::Queue(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, ApiError>;

#[derive(Serialize)]
struct ErrorResponse {
    success: bool,
    error: ErrorDetail,
    request_id: String,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: ErrorCode,
    message: String,
}

impl ApiError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ApiError::Validation(e) => e.code(),
            ApiError::BadRequest(_) => ErrorCode::ValidationError,
            ApiError::NotFound(_) => ErrorCode::NotFound,
            ApiError::Queue(_) => ErrorCode::InternalError,
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) | ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Queue(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to show clients; storage details stay in the logs
    fn to_user_message(&self) -> String {
        match self {
            ApiError::Validation(e) => format!("Validation failed: {}", e),
            ApiError::BadRequest(message) => message.clone(),
            ApiError::NotFound(id) => format!("Job {} not found", id),
            ApiError::Queue(_) => "An internal server error occurred".to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let request_id = Uuid::new_v4().to_string();

        match &self {
            ApiError::Queue(err) => error!(
                request_id = %request_id,
                error = %err,
                "Queue error while handling request"
            ),
            ApiError::Validation(err) => warn!(
                request_id = %request_id,
                error = %err,
                "Rejected submission"
            ),
            _ => {}
        }

        let body = ErrorResponse {
            success: false,
            error: ErrorDetail {
                code: self.code(),
                message: self.to_user_message(),
            },
            request_id,
        };
        (self.status(), Json(body)).into_response()
    }
}
