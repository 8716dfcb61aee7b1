// ABOUTME: Capability for cancelling a job by id
// ABOUTME: Lets the gateway forward client cancels without depending on the queue

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ErrorCode;

/// What a cancel request achieved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelStatus {
    /// Job was still queued and is now cancelled; it never ran
    Cancelled,
    /// Job is leased; the owning worker will stop it
    Requested,
    /// Job had already reached a terminal state
    AlreadyTerminal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelAck {
    pub job_id: String,
    pub status: CancelStatus,
}

#[async_trait]
pub trait JobCanceller: Send + Sync {
    /// Cancel a job, returning an error code when the job cannot be found or cancelled
    async fn cancel_job(&self, job_id: &str, reason: &str) -> Result<CancelAck, (ErrorCode, String)>;
}
