// ABOUTME: Error types for the gateway
// ABOUTME: Each variant maps to the error code sent back to the client

use runhub_channel::ChannelError;
use runhub_core::{ErrorCode, ValidationError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Authentication required to join topics")]
    Unauthenticated,

    #[error("Not allowed to join {0}")]
    Forbidden(String),

    #[error("Unknown connection: {0}")]
    UnknownConnection(u64),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Invalid topic: {0}")]
    Validation(#[from] ValidationError),

    #[error("Event channel error: {0}")]
    Channel(#[from] ChannelError),
}

impl GatewayError {
    pub fn code(&self) -> ErrorCode {
        match self {
            GatewayError::Unauthenticated => ErrorCode::Unauthenticated,
            GatewayError::Forbidden(_) => ErrorCode::Forbidden,
            GatewayError::UnknownConnection(_) => ErrorCode::NotFound,
            GatewayError::InvalidMessage(_) | GatewayError::Validation(_) => {
                ErrorCode::InvalidMessage
            }
            GatewayError::Channel(_) => ErrorCode::ChannelUnavailable,
        }
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
