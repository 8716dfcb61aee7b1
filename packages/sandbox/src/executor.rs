// ABOUTME: Sandbox executor resolving requests against the workspace root before launch
// ABOUTME: Confines working directories, clamps limits and hands off to the configured runtime

use crate::error::{Result, SandboxError};
use crate::handle::ExecutionHandle;
use crate::runtime::ContainerRuntime;
use crate::types::{CancelReason, LaunchSpec};
use runhub_config::SandboxConfig;
use runhub_core::ResourceLimits;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// A single command to run
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub execution_id: String,
    pub command: String,
    /// Relative to the workspace root
    pub working_dir: PathBuf,
    pub limits: Option<ResourceLimits>,
    pub env: HashMap<String, String>,
}

impl RunRequest {
    pub fn new(
        execution_id: impl Into<String>,
        command: impl Into<String>,
        working_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            execution_id: execution_id.into(),
            command: command.into(),
            working_dir: working_dir.into(),
            limits: None,
            env: HashMap::new(),
        }
    }

    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = Some(limits);
        self
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }
}

/// Runs commands in isolated sandboxes rooted under one workspace directory
pub struct SandboxExecutor {
    runtime: Arc<dyn ContainerRuntime>,
    config: SandboxConfig,
    workspace_root: PathBuf,
}

impl SandboxExecutor {
    /// Create an executor, creating the workspace root if it does not exist
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: SandboxConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.workspace_root).map_err(|e| {
            SandboxError::WorkspaceError(format!(
                "cannot create workspace root {}: {}",
                config.workspace_root.display(),
                e
            ))
        })?;
        let workspace_root = config.workspace_root.canonicalize()?;

        info!(
            "Sandbox executor using {} runtime, workspace root {}",
            runtime.name(),
            workspace_root.display()
        );

        Ok(Self {
            runtime,
            config,
            workspace_root,
        })
    }

    pub fn runtime_name(&self) -> &'static str {
        self.runtime.name()
    }

    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }

    pub async fn is_available(&self) -> bool {
        self.runtime.is_available().await
    }

    /// Run a command with a generated execution id
    pub async fn run(
        &self,
        command: &str,
        working_dir: impl AsRef<Path>,
        limits: Option<ResourceLimits>,
    ) -> Result<ExecutionHandle> {
        let request = RunRequest {
            execution_id: format!("exec_{}", Uuid::new_v4().simple()),
            command: command.to_string(),
            working_dir: working_dir.as_ref().to_path_buf(),
            limits,
            env: HashMap::new(),
        };
        self.launch(request).await
    }

    pub async fn launch(&self, request: RunRequest) -> Result<ExecutionHandle> {
        if request.command.trim().is_empty() {
            return Err(SandboxError::InvalidRequest("command is empty".to_string()));
        }
        if request.command.contains('\0') {
            return Err(SandboxError::InvalidRequest(
                "command contains a NUL byte".to_string(),
            ));
        }

        let working_dir = self.resolve_working_dir(&request.working_dir)?;
        let limits = request
            .limits
            .unwrap_or_else(|| self.config.default_limits.clone())
            .clamp_to(&self.config.max_limits);

        debug!(
            execution_id = %request.execution_id,
            working_dir = %working_dir.display(),
            "Launching sandbox"
        );

        self.runtime
            .launch(LaunchSpec {
                execution_id: request.execution_id,
                command: request.command,
                working_dir,
                limits,
                env: request.env,
                grace_period: self.config.grace_period,
                output_buffer: self.config.output_buffer,
            })
            .await
    }

    /// Request cancellation; the handle still yields the terminal event
    pub fn cancel(&self, handle: &ExecutionHandle, reason: &str) -> bool {
        handle.cancel(CancelReason::Requested(reason.to_string()))
    }

    pub async fn cleanup_orphans(&self) -> Result<Vec<String>> {
        self.runtime.cleanup_orphans().await
    }

    /// Map a relative working directory to an existing directory inside the root
    pub fn resolve_working_dir(&self, relative: &Path) -> Result<PathBuf> {
        for component in relative.components() {
            match component {
                Component::Normal(_) | Component::CurDir => {}
                Component::ParentDir => {
                    return Err(SandboxError::WorkspaceError(format!(
                        "{} escapes the workspace root",
                        relative.display()
                    )))
                }
                Component::RootDir | Component::Prefix(_) => {
                    return Err(SandboxError::WorkspaceError(format!(
                        "{} must be relative to the workspace root",
                        relative.display()
                    )))
                }
            }
        }

        let candidate = self.workspace_root.join(relative);
        if !candidate.is_dir() {
            return Err(SandboxError::WorkspaceError(format!(
                "{} is not a directory",
                relative.display()
            )));
        }

        // Symlinks can still point outside
        let resolved = candidate.canonicalize()?;
        if !resolved.starts_with(&self.workspace_root) {
            return Err(SandboxError::WorkspaceError(format!(
                "{} resolves outside the workspace root",
                relative.display()
            )));
        }
        Ok(resolved)
    }
}
