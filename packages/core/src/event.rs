// ABOUTME: Ordered events published on topics
// ABOUTME: Event kinds seen by clients and the per-producer sequence allocator

use crate::error::ErrorCode;
use crate::topic::Topic;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which output stream a chunk came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputStream::Stdout => "stdout",
            OutputStream::Stderr => "stderr",
        }
    }
}

/// Client-visible event kinds, serialized as `{"kind": ..., "payload": {...}}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum EventKind {
    Output {
        stream: OutputStream,
        content: String,
    },
    Progress {
        percent: u8,
    },
    Complete {
        exit_code: i64,
        duration_ms: u64,
    },
    Error {
        code: ErrorCode,
        message: String,
    },
    Cancelled {
        reason: String,
    },
}

impl EventKind {
    /// Terminal kinds end a job's event stream
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventKind::Complete { .. } | EventKind::Error { .. } | EventKind::Cancelled { .. }
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            EventKind::Output { .. } => "output",
            EventKind::Progress { .. } => "progress",
            EventKind::Complete { .. } => "complete",
            EventKind::Error { .. } => "error",
            EventKind::Cancelled { .. } => "cancelled",
        }
    }
}

/// An immutable message on a topic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub topic: Topic,
    pub sequence: u64,
    #[serde(flatten)]
    pub kind: EventKind,
    pub emitted_at: DateTime<Utc>,
}

impl Event {
    pub fn is_terminal(&self) -> bool {
        self.kind.is_terminal()
    }
}

/// Assigns sequence numbers for the single producer of a topic.
///
/// Sequences are `attempt << 32 | counter`. A later attempt of the same job
/// therefore always sorts after every event of an earlier attempt, even though
/// each attempt restarts its counter.
#[derive(Debug, Clone)]
pub struct EventSequencer {
    topic: Topic,
    base: u64,
    counter: u32,
}

impl EventSequencer {
    pub fn for_attempt(topic: Topic, attempt: u32) -> Self {
        Self {
            topic,
            base: u64::from(attempt) << 32,
            counter: 0,
        }
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    /// Sequence of the most recently issued event, if any
    pub fn last_sequence(&self) -> Option<u64> {
        (self.counter > 0).then(|| self.base | u64::from(self.counter))
    }

    pub fn next(&mut self, kind: EventKind) -> Event {
        self.counter = self.counter.saturating_add(1);
        Event {
            topic: self.topic.clone(),
            sequence: self.base | u64::from(self.counter),
            kind,
            emitted_at: Utc::now(),
        }
    }
}
