// ABOUTME: Runtime record of one attempt at running a job's command
// ABOUTME: Created when a worker starts an attempt and archived when it ends

use crate::policy::RiskLevel;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How an execution attempt ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Running,
    Exited,
    Cancelled,
    TimedOut,
    PolicyDenied,
    Failed,
    LeaseLost,
}

impl ExecutionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionOutcome::Running => "running",
            ExecutionOutcome::Exited => "exited",
            ExecutionOutcome::Cancelled => "cancelled",
            ExecutionOutcome::TimedOut => "timed_out",
            ExecutionOutcome::PolicyDenied => "policy_denied",
            ExecutionOutcome::Failed => "failed",
            ExecutionOutcome::LeaseLost => "lease_lost",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "running" => Some(ExecutionOutcome::Running),
            "exited" => Some(ExecutionOutcome::Exited),
            "cancelled" => Some(ExecutionOutcome::Cancelled),
            "timed_out" => Some(ExecutionOutcome::TimedOut),
            "policy_denied" => Some(ExecutionOutcome::PolicyDenied),
            "failed" => Some(ExecutionOutcome::Failed),
            "lease_lost" => Some(ExecutionOutcome::LeaseLost),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub id: String,
    pub job_id: String,
    pub attempt: u32,
    pub worker_id: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i64>,
    pub output_bytes: u64,
    pub risk_level: RiskLevel,
    pub outcome: ExecutionOutcome,
}

impl Execution {
    pub fn start(job_id: &str, attempt: u32, worker_id: &str, risk_level: RiskLevel) -> Self {
        Self {
            id: format!("exec_{}", uuid::Uuid::new_v4().simple()),
            job_id: job_id.to_string(),
            attempt,
            worker_id: worker_id.to_string(),
            started_at: Utc::now(),
            completed_at: None,
            exit_code: None,
            output_bytes: 0,
            risk_level,
            outcome: ExecutionOutcome::Running,
        }
    }

    pub fn record_output(&mut self, bytes: usize) {
        self.output_bytes = self.output_bytes.saturating_add(bytes as u64);
    }

    pub fn finish(&mut self, outcome: ExecutionOutcome, exit_code: Option<i64>) {
        self.outcome = outcome;
        self.exit_code = exit_code;
        self.completed_at = Some(Utc::now());
    }

    pub fn duration_ms(&self) -> u64 {
        let end = self.completed_at.unwrap_or_else(Utc::now);
        (end - self.started_at).num_milliseconds().max(0) as u64
    }
}
