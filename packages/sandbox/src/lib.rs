// ABOUTME: Isolated command execution for Runhub workers
// ABOUTME: Runs one shell command per sandbox and streams its output as a bounded event sequence

pub mod error;
pub mod executor;
pub mod handle;
pub mod runtime;
pub mod types;

pub use error::{Result, SandboxError};
pub use executor::{RunRequest, SandboxExecutor};
pub use handle::{CancelHandle, ExecutionHandle};
pub use runtime::{build_runtime, ContainerRuntime, DockerRuntime, NativeRuntime};
pub use types::{CancelReason, ExecutionEvent, LaunchSpec, OutputChunk};
