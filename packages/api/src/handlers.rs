// ABOUTME: HTTP handlers for job submission, lookup, cancellation and health
// ABOUTME: Thin wrappers over SubmissionService returning the ApiResponse envelope

use axum::{
    body::Bytes,
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use runhub_core::{CancelAck, Job};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{ApiError, Result};
use crate::response::ApiResponse;
use crate::service::{SubmissionService, SubmitRequest, SubmitResponse};

const DEFAULT_CANCEL_REASON: &str = "cancelled by user";

/// Submit a command for sandboxed execution
///
/// POST /api/jobs
pub async fn submit_job(
    State(service): State<SubmissionService>,
    request: std::result::Result<Json<SubmitRequest>, JsonRejection>,
) -> Result<impl IntoResponse> {
    let Json(request) = request.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let response: SubmitResponse = service.submit(request).await?;
    Ok((StatusCode::ACCEPTED, Json(ApiResponse::success(response))))
}

/// GET /api/jobs/{id}
pub async fn get_job(
    State(service): State<SubmissionService>,
    Path(job_id): Path<String>,
) -> Result<Json<ApiResponse<Job>>> {
    let job = service.get(&job_id).await?;
    Ok(Json(ApiResponse::success(job)))
}

#[derive(Debug, Default, Deserialize)]
pub struct CancelRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

/// Cancel a job. The body is optional.
///
/// POST /api/jobs/{id}/cancel
pub async fn cancel_job(
    State(service): State<SubmissionService>,
    Path(job_id): Path<String>,
    body: Bytes,
) -> Result<Json<ApiResponse<CancelAck>>> {
    let request: CancelRequest = if body.is_empty() {
        CancelRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| ApiError::BadRequest(e.to_string()))?
    };
    let reason = request
        .reason
        .filter(|r| !r.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_CANCEL_REASON.to_string());

    info!(job_id = %job_id, "Cancel requested over HTTP");
    let ack = service.cancel(&job_id, &reason).await?;
    Ok(Json(ApiResponse::success(ack)))
}

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    pub status: &'static str,
    pub queue: String,
    pub queue_depth: u64,
    pub channel_degraded: bool,
}

/// GET /api/health
pub async fn health(
    State(service): State<SubmissionService>,
) -> Result<Json<ApiResponse<HealthStatus>>> {
    let queue = service.queue().config().queue_name.clone();
    let queue_depth = service.queue().queue_depth(&queue).await?;
    let channel_degraded = service.channel().is_degraded();

    Ok(Json(ApiResponse::success(HealthStatus {
        status: if channel_degraded { "degraded" } else { "ok" },
        queue,
        queue_depth,
        channel_degraded,
    })))
}
