// ABOUTME: Client-visible error codes and submission validation errors
// ABOUTME: Every terminal error event carries one of these codes

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Error codes surfaced to clients in `error` events and API responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Malformed submission, rejected before enqueue
    ValidationError,
    /// Denied by the policy engine; never retried
    PolicyViolation,
    /// Executor failure; retried until attempts run out
    TransientExecutionError,
    /// Abandoned lease recovered by the queue
    LeaseExpired,
    /// Sandbox could not be fully removed
    SandboxTeardownError,
    /// Shared event channel unreachable
    ChannelUnavailable,
    /// Command exceeded its wall-clock limit
    ExecutionTimeout,
    Unauthenticated,
    Forbidden,
    InvalidMessage,
    NotFound,
    InternalError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ValidationError => "VALIDATION_ERROR",
            ErrorCode::PolicyViolation => "POLICY_VIOLATION",
            ErrorCode::TransientExecutionError => "TRANSIENT_EXECUTION_ERROR",
            ErrorCode::LeaseExpired => "LEASE_EXPIRED",
            ErrorCode::SandboxTeardownError => "SANDBOX_TEARDOWN_ERROR",
            ErrorCode::ChannelUnavailable => "CHANNEL_UNAVAILABLE",
            ErrorCode::ExecutionTimeout => "EXECUTION_TIMEOUT",
            ErrorCode::Unauthenticated => "UNAUTHENTICATED",
            ErrorCode::Forbidden => "FORBIDDEN",
            ErrorCode::InvalidMessage => "INVALID_MESSAGE",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "VALIDATION_ERROR" => Some(ErrorCode::ValidationError),
            "POLICY_VIOLATION" => Some(ErrorCode::PolicyViolation),
            "TRANSIENT_EXECUTION_ERROR" => Some(ErrorCode::TransientExecutionError),
            "LEASE_EXPIRED" => Some(ErrorCode::LeaseExpired),
            "SANDBOX_TEARDOWN_ERROR" => Some(ErrorCode::SandboxTeardownError),
            "CHANNEL_UNAVAILABLE" => Some(ErrorCode::ChannelUnavailable),
            "EXECUTION_TIMEOUT" => Some(ErrorCode::ExecutionTimeout),
            "UNAUTHENTICATED" => Some(ErrorCode::Unauthenticated),
            "FORBIDDEN" => Some(ErrorCode::Forbidden),
            "INVALID_MESSAGE" => Some(ErrorCode::InvalidMessage),
            "NOT_FOUND" => Some(ErrorCode::NotFound),
            "INTERNAL_ERROR" => Some(ErrorCode::InternalError),
            _ => None,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reasons a submission is rejected before it reaches the queue
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Command must not be empty")]
    EmptyCommand,

    #[error("Command exceeds {max} bytes")]
    CommandTooLong { max: usize },

    #[error("Command contains a NUL byte")]
    NulByte,

    #[error("Invalid working directory: {0}")]
    InvalidWorkingDir(String),

    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Invalid topic: {0}")]
    InvalidTopic(String),

    #[error("Invalid resource limits: {0}")]
    InvalidLimits(String),
}

impl ValidationError {
    pub fn code(&self) -> ErrorCode {
        ErrorCode::ValidationError
    }
}
