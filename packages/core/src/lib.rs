// ABOUTME: Core types shared by every Runhub package
// ABOUTME: Jobs, executions, topics, ordered events, error codes and the policy contract

pub mod cancel;
pub mod error;
pub mod event;
pub mod execution;
pub mod job;
pub mod policy;
pub mod topic;

// Re-export main types
pub use cancel::{CancelAck, CancelStatus, JobCanceller};
pub use error::{ErrorCode, ValidationError};
pub use event::{Event, EventKind, EventSequencer, OutputStream};
pub use execution::{Execution, ExecutionOutcome};
pub use job::{generate_job_id, Job, JobPayload, JobState, ResourceLimits, COMMAND_JOB_TYPE};
pub use policy::{
    PolicyContext, PolicyDecision, PolicyEngine, PolicyVerdict, RiskLevel, RuleBasedPolicy,
};
pub use topic::{Topic, TopicKind};
