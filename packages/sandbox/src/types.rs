// ABOUTME: Types shared by sandbox runtimes and their consumers
// ABOUTME: Launch specifications, output chunks and the terminal execution events

use chrono::{DateTime, Utc};
use runhub_core::{OutputStream, ResourceLimits};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Everything a runtime needs to start one isolated command
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub execution_id: String,
    pub command: String,
    /// Canonical host directory; the only path exposed to the command
    pub working_dir: PathBuf,
    pub limits: ResourceLimits,
    pub env: HashMap<String, String>,
    /// Time between the polite stop signal and the forced kill
    pub grace_period: Duration,
    /// Events buffered before the runtime waits on the consumer
    pub output_buffer: usize,
}

/// A chunk of raw process output
#[derive(Debug, Clone, PartialEq)]
pub struct OutputChunk {
    pub stream: OutputStream,
    pub data: Vec<u8>,
    pub timestamp: DateTime<Utc>,
}

impl OutputChunk {
    pub fn new(stream: OutputStream, data: Vec<u8>) -> Self {
        Self {
            stream,
            data,
            timestamp: Utc::now(),
        }
    }

    /// Output decoded as UTF-8, replacing invalid sequences
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

/// Why an execution was stopped before it exited on its own
#[derive(Debug, Clone, PartialEq)]
pub enum CancelReason {
    Requested(String),
    Timeout { seconds: u64 },
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::Requested(reason) => f.write_str(reason),
            CancelReason::Timeout { seconds } => {
                write!(f, "execution timed out after {} seconds", seconds)
            }
        }
    }
}

/// Items yielded by an execution handle.
///
/// Any number of `Output` events is followed by exactly one terminal event.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionEvent {
    Output(OutputChunk),
    /// The command exited on its own
    Exited { exit_code: i64 },
    /// The command was stopped and its sandbox torn down
    Cancelled { reason: CancelReason },
    /// The runtime lost track of the command
    Failed { message: String },
}

impl ExecutionEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionEvent::Output(_))
    }
}

/// Terminal outcome reported by a runtime driver
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Termination {
    Exited(i64),
    Cancelled(CancelReason),
    Failed(String),
}

impl From<Termination> for ExecutionEvent {
    fn from(termination: Termination) -> Self {
        match termination {
            Termination::Exited(exit_code) => ExecutionEvent::Exited { exit_code },
            Termination::Cancelled(reason) => ExecutionEvent::Cancelled { reason },
            Termination::Failed(message) => ExecutionEvent::Failed { message },
        }
    }
}
