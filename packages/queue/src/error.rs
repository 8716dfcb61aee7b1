// ABOUTME: Error types for job queue operations
// ABOUTME: Distinguishes lost leases from storage failures

use runhub_core::ValidationError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Job not found: {0}")]
    NotFound(String),

    /// The lease token no longer owns the job
    #[error("Lease lost for job {0}")]
    LeaseLost(String),

    #[error("Corrupt job row: {0}")]
    CorruptRow(String),
}

pub type Result<T> = std::result::Result<T, QueueError>;
