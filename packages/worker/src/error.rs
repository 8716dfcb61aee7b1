// ABOUTME: Error types for workers
// ABOUTME: Only infrastructure failures surface here; job failures become queue outcomes

use thiserror::Error;

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Queue error: {0}")]
    Queue(#[from] runhub_queue::QueueError),

    #[error("Sandbox error: {0}")]
    Sandbox(#[from] runhub_sandbox::SandboxError),
}

pub type Result<T> = std::result::Result<T, WorkerError>;
