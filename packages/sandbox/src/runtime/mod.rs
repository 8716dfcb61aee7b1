// ABOUTME: Container runtime capability and its implementations
// ABOUTME: Callers depend on the trait; Docker and native process groups are interchangeable variants

use crate::error::{Result, SandboxError};
use crate::handle::ExecutionHandle;
use crate::types::LaunchSpec;
use async_trait::async_trait;
use runhub_config::{RuntimeKind, SandboxConfig};
use std::sync::Arc;

pub mod docker;
pub mod native;

pub use docker::DockerRuntime;
pub use native::NativeRuntime;

/// Starts isolated commands and tears them down.
///
/// Implementations must emit exactly one terminal event per launch and must
/// remove whatever they created on every exit path.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether the runtime can launch commands on this host right now
    async fn is_available(&self) -> bool;

    async fn launch(&self, spec: LaunchSpec) -> Result<ExecutionHandle>;

    /// Remove sandboxes left behind by a previous process. Returns their ids.
    async fn cleanup_orphans(&self) -> Result<Vec<String>>;
}

/// Build the runtime selected by configuration
pub fn build_runtime(config: &SandboxConfig) -> Result<Arc<dyn ContainerRuntime>> {
    match config.runtime {
        RuntimeKind::Docker => Ok(Arc::new(DockerRuntime::new(config)?)),
        RuntimeKind::Native => {
            if !config.allow_native_execution {
                return Err(SandboxError::NativeExecutionDisabled);
            }
            Ok(Arc::new(NativeRuntime::new()))
        }
    }
}
