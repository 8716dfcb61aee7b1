// ABOUTME: Submission service: validate and enqueue commands, cancel and look up jobs
// ABOUTME: Publishes the terminal cancelled event for jobs cancelled before any worker saw them

use crate::error::{ApiError, Result};
use async_trait::async_trait;
use runhub_channel::EventChannel;
use runhub_core::{
    CancelAck, CancelStatus, ErrorCode, EventKind, EventSequencer, Job, JobCanceller, JobPayload,
    ResourceLimits, Topic, COMMAND_JOB_TYPE,
};
use runhub_queue::{CancelOutcome, JobQueue, NewJob};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Retries a submitter may ask for
const MAX_ATTEMPTS_RANGE: std::ops::RangeInclusive<u32> = 1..=10;

#[derive(Debug, Clone, Deserialize)]
pub struct SubmitRequest {
    pub command: String,
    pub workspace_id: String,
    #[serde(default)]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub limits: Option<ResourceLimits>,
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

impl SubmitRequest {
    pub fn new(command: impl Into<String>, workspace_id: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            workspace_id: workspace_id.into(),
            working_dir: None,
            user_id: None,
            env: HashMap::new(),
            limits: None,
            max_attempts: None,
        }
    }

    fn into_payload(self) -> JobPayload {
        let mut payload = JobPayload::new(self.command, self.workspace_id);
        if let Some(dir) = self.working_dir {
            payload = payload.with_working_dir(dir);
        }
        if let Some(user) = self.user_id {
            payload = payload.with_user(user);
        }
        if let Some(limits) = self.limits {
            payload = payload.with_limits(limits);
        }
        payload.env = self.env;
        payload
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub job_id: String,
    /// Topic to subscribe to for this job's events
    pub topic: Topic,
}

#[derive(Clone)]
pub struct SubmissionService {
    queue: JobQueue,
    channel: Arc<dyn EventChannel>,
}

impl SubmissionService {
    pub fn new(queue: JobQueue, channel: Arc<dyn EventChannel>) -> Self {
        Self { queue, channel }
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    pub fn channel(&self) -> &Arc<dyn EventChannel> {
        &self.channel
    }

    pub async fn submit(&self, request: SubmitRequest) -> Result<SubmitResponse> {
        let max_attempts = request
            .max_attempts
            .unwrap_or(self.queue.config().max_attempts)
            .clamp(*MAX_ATTEMPTS_RANGE.start(), *MAX_ATTEMPTS_RANGE.end());
        let payload = request.into_payload();
        payload.validate()?;

        let job_id = self
            .queue
            .enqueue_job(NewJob {
                queue: self.queue.config().queue_name.clone(),
                job_type: COMMAND_JOB_TYPE.to_string(),
                payload,
                max_attempts,
            })
            .await?;

        info!(job_id = %job_id, "Accepted command submission");
        Ok(SubmitResponse {
            topic: Topic::execution(&job_id),
            job_id,
        })
    }

    pub async fn cancel(&self, job_id: &str, reason: &str) -> Result<CancelAck> {
        let status = match self.queue.cancel(job_id, reason).await? {
            CancelOutcome::Cancelled => {
                // No worker will ever publish for this job
                let job = self.queue.get(job_id).await?;
                let mut sequencer = EventSequencer::for_attempt(
                    Topic::execution(job_id),
                    job.attempts.saturating_add(1),
                );
                let event = sequencer.next(EventKind::Cancelled {
                    reason: reason.to_string(),
                });
                if let Err(e) = self.channel.publish(&event).await {
                    warn!(
                        job_id = %job_id,
                        code = %ErrorCode::ChannelUnavailable,
                        "Failed to publish cancellation: {}",
                        e
                    );
                }
                CancelStatus::Cancelled
            }
            CancelOutcome::Requested => CancelStatus::Requested,
            CancelOutcome::AlreadyTerminal(_) => CancelStatus::AlreadyTerminal,
        };

        Ok(CancelAck {
            job_id: job_id.to_string(),
            status,
        })
    }

    pub async fn get(&self, job_id: &str) -> Result<Job> {
        Ok(self.queue.get(job_id).await?)
    }
}

#[async_trait]
impl JobCanceller for SubmissionService {
    async fn cancel_job(&self, job_id: &str, reason: &str) -> std::result::Result<CancelAck, (ErrorCode, String)> {
        self.cancel(job_id, reason).await.map_err(|e| {
            let code = e.code();
            let message = match e {
                ApiError::Queue(_) => "An internal server error occurred".to_string(),
                other => other.to_string(),
            };
            (code, message)
        })
    }
}
