// ABOUTME: Error types for sandbox execution
// ABOUTME: Separates caller mistakes from runtime failures worth retrying

use thiserror::Error;

/// Main error type for sandbox operations
#[derive(Error, Debug)]
pub enum SandboxError {
    /// Docker/container-related errors
    #[error("Docker error: {0}")]
    Docker(#[from] bollard::errors::Error),

    /// Docker image not found or failed to pull
    #[error("Docker image error: {0}")]
    ImageError(String),

    /// Process or container failed to start
    #[error("Failed to start sandbox: {0}")]
    SpawnFailed(String),

    /// Runtime cannot be used on this host
    #[error("Runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    /// Native execution was requested without the trusted opt-in
    #[error("Native execution is disabled; enable it only for trusted deployments")]
    NativeExecutionDisabled,

    /// Invalid execution request
    #[error("Invalid execution request: {0}")]
    InvalidRequest(String),

    /// Working directory missing or outside the workspace root
    #[error("Workspace error: {0}")]
    WorkspaceError(String),

    /// Sandbox could not be fully removed
    #[error("Sandbox teardown failed: {0}")]
    Teardown(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SandboxError {
    /// Whether a later attempt could succeed with the same request
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            SandboxError::InvalidRequest(_)
                | SandboxError::WorkspaceError(_)
                | SandboxError::NativeExecutionDisabled
        )
    }
}

/// Type alias for Results that return SandboxError
pub type Result<T> = std::result::Result<T, SandboxError>;
