// ABOUTME: Job model for queued command executions
// ABOUTME: Job states, payload validation and per-job resource limits

use crate::error::ValidationError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Component, Path};

/// Job type for shell command executions
pub const COMMAND_JOB_TYPE: &str = "command";

/// Upper bound for a submitted command line
pub const MAX_COMMAND_BYTES: usize = 16 * 1024;

/// Generate a unique job identifier
pub fn generate_job_id() -> String {
    format!("job_{}", uuid::Uuid::new_v4().simple())
}

/// Lifecycle state of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Leased,
    Running,
    Completed,
    /// Dead-lettered after a terminal failure
    Failed,
    Cancelled,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Leased => "leased",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(JobState::Queued),
            "leased" => Some(JobState::Leased),
            "running" => Some(JobState::Running),
            "completed" => Some(JobState::Completed),
            "failed" => Some(JobState::Failed),
            "cancelled" => Some(JobState::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled
        )
    }

    /// A worker holds the lease in these states
    pub fn is_leased(&self) -> bool {
        matches!(self, JobState::Leased | JobState::Running)
    }
}

/// Resource caps applied to one sandboxed execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub memory_mb: u64,
    pub cpu_cores: f64,
    pub pids_limit: u32,
    pub timeout_seconds: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_mb: 512,
            cpu_cores: 1.0,
            pids_limit: 64,
            timeout_seconds: 600,
        }
    }
}

impl ResourceLimits {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.memory_mb == 0 {
            return Err(ValidationError::InvalidLimits(
                "memory_mb must be positive".to_string(),
            ));
        }
        if !(self.cpu_cores > 0.0 && self.cpu_cores.is_finite()) {
            return Err(ValidationError::InvalidLimits(
                "cpu_cores must be positive".to_string(),
            ));
        }
        if self.pids_limit == 0 {
            return Err(ValidationError::InvalidLimits(
                "pids_limit must be positive".to_string(),
            ));
        }
        if self.timeout_seconds == 0 {
            return Err(ValidationError::InvalidLimits(
                "timeout_seconds must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Clamp every field to the given maximum
    pub fn clamp_to(&self, max: &ResourceLimits) -> ResourceLimits {
        ResourceLimits {
            memory_mb: self.memory_mb.min(max.memory_mb),
            cpu_cores: self.cpu_cores.min(max.cpu_cores),
            pids_limit: self.pids_limit.min(max.pids_limit),
            timeout_seconds: self.timeout_seconds.min(max.timeout_seconds),
        }
    }
}

/// What a command job should run and where
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPayload {
    pub command: String,
    /// Relative to the workspace root
    #[serde(default = "default_working_dir")]
    pub working_dir: String,
    pub workspace_id: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub limits: Option<ResourceLimits>,
}

fn default_working_dir() -> String {
    ".".to_string()
}

impl JobPayload {
    pub fn new(command: impl Into<String>, workspace_id: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            working_dir: default_working_dir(),
            workspace_id: workspace_id.into(),
            user_id: None,
            env: HashMap::new(),
            limits: None,
        }
    }

    pub fn with_working_dir(mut self, working_dir: impl Into<String>) -> Self {
        self.working_dir = working_dir.into();
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = Some(limits);
        self
    }

    /// Reject malformed submissions before they are enqueued
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.command.trim().is_empty() {
            return Err(ValidationError::EmptyCommand);
        }
        if self.command.len() > MAX_COMMAND_BYTES {
            return Err(ValidationError::CommandTooLong {
                max: MAX_COMMAND_BYTES,
            });
        }
        if self.command.contains('\0') {
            return Err(ValidationError::NulByte);
        }
        if self.workspace_id.trim().is_empty() {
            return Err(ValidationError::MissingField("workspace_id"));
        }
        // Used as a directory name under the workspace root
        if self.workspace_id.starts_with('.')
            || !self
                .workspace_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
        {
            return Err(ValidationError::InvalidWorkingDir(format!(
                "workspace id '{}' is not a valid directory name",
                self.workspace_id
            )));
        }

        let dir = Path::new(&self.working_dir);
        if dir.is_absolute() {
            return Err(ValidationError::InvalidWorkingDir(format!(
                "{} must be relative to the workspace",
                self.working_dir
            )));
        }
        if dir
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_)))
        {
            return Err(ValidationError::InvalidWorkingDir(format!(
                "{} escapes the workspace",
                self.working_dir
            )));
        }

        for key in self.env.keys() {
            if key.is_empty() || key.contains('=') || key.contains('\0') {
                return Err(ValidationError::MissingField("env key"));
            }
        }

        if let Some(limits) = &self.limits {
            limits.validate()?;
        }

        Ok(())
    }
}

/// A queued unit of work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub queue: String,
    pub job_type: String,
    pub payload: JobPayload,
    pub state: JobState,
    pub attempts: u32,
    pub max_attempts: u32,
    pub progress: u8,
    pub created_at: DateTime<Utc>,
    pub available_at: DateTime<Utc>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub cancel_reason: Option<String>,
    pub last_error: Option<String>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel_reason.is_some()
    }
}
