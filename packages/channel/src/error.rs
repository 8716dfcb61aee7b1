// ABOUTME: Error types for the event channel
// ABOUTME: Wraps ZeroMQ transport and event serialization failures

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("ZeroMQ error: {0}")]
    Zmq(#[from] zeromq::ZmqError),

    #[error("Event serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Channel unavailable: {0}")]
    Unavailable(String),

    #[error("Malformed message: {0}")]
    MalformedMessage(String),
}

pub type Result<T> = std::result::Result<T, ChannelError>;
