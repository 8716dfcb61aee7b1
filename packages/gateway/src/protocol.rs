// ABOUTME: JSON messages exchanged over a gateway websocket
// ABOUTME: Both directions are tagged by a `type` field

use runhub_core::{CancelStatus, ErrorCode, Event, Topic};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe {
        topic: String,
    },
    Unsubscribe {
        topic: String,
    },
    Cancel {
        job_id: String,
        #[serde(default)]
        reason: Option<String>,
    },
    Ping,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Event {
        event: Event,
    },
    Subscribed {
        topic: Topic,
    },
    Unsubscribed {
        topic: Topic,
    },
    CancelAck {
        job_id: String,
        status: CancelStatus,
    },
    Error {
        code: ErrorCode,
        message: String,
    },
    /// Events dropped for this connection because it fell behind
    Lagged {
        dropped: u64,
    },
    Pong,
}

impl ServerMessage {
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            code,
            message: message.into(),
        }
    }
}
