// ABOUTME: Native subprocess runtime for trusted deployments
// ABOUTME: Runs each command in its own process group with rlimits and a cleared environment

use crate::error::{Result, SandboxError};
use crate::handle::{execution_channel, CancelHandle, ExecutionHandle, OutputSink, TerminalSink};
use crate::runtime::ContainerRuntime;
use crate::types::{CancelReason, LaunchSpec, Termination};
use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::resource::{setrlimit, Resource};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use runhub_core::{OutputStream, ResourceLimits};
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const CHUNK_SIZE: usize = 8 * 1024;
const DEFAULT_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// Runs commands as plain child processes.
///
/// Provides CPU-time and address-space caps and process-group teardown, but no
/// network or filesystem isolation. Only selected with an explicit opt-in.
pub struct NativeRuntime {
    shell: PathBuf,
}

impl Default for NativeRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl NativeRuntime {
    pub fn new() -> Self {
        Self {
            shell: PathBuf::from("/bin/sh"),
        }
    }

    fn build_command(&self, spec: &LaunchSpec) -> Command {
        let mut command = Command::new(&self.shell);
        command
            .arg("-c")
            .arg(&spec.command)
            .current_dir(&spec.working_dir)
            .env_clear()
            .env("PATH", DEFAULT_PATH)
            .env("HOME", &spec.working_dir)
            .env("RUNHUB_EXECUTION_ID", &spec.execution_id)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .process_group(0);

        let limits = spec.limits.clone();
        // SAFETY: the closure only calls setrlimit, which is async-signal-safe
        unsafe {
            command.pre_exec(move || apply_rlimits(&limits));
        }

        command
    }
}

fn apply_rlimits(limits: &ResourceLimits) -> std::io::Result<()> {
    let cpu_seconds = limits.timeout_seconds.saturating_add(1);
    setrlimit(Resource::RLIMIT_CPU, cpu_seconds, cpu_seconds)?;

    let address_space = limits.memory_mb.saturating_mul(1024 * 1024);
    setrlimit(Resource::RLIMIT_AS, address_space, address_space)?;

    setrlimit(Resource::RLIMIT_CORE, 0, 0)?;
    Ok(())
}

#[async_trait]
impl ContainerRuntime for NativeRuntime {
    fn name(&self) -> &'static str {
        "native"
    }

    async fn is_available(&self) -> bool {
        tokio::fs::metadata(&self.shell).await.is_ok()
    }

    async fn launch(&self, spec: LaunchSpec) -> Result<ExecutionHandle> {
        let mut child = self
            .build_command(&spec)
            .spawn()
            .map_err(|e| SandboxError::SpawnFailed(e.to_string()))?;

        let pid = child
            .id()
            .ok_or_else(|| SandboxError::SpawnFailed("process exited before start".to_string()))?;
        let pgid = Pid::from_raw(pid as i32);

        info!(
            execution_id = %spec.execution_id,
            pid = pid,
            "Started native execution"
        );

        let (outputs, terminal, cancel, handle) =
            execution_channel(&spec.execution_id, spec.output_buffer);

        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_reader(stdout, OutputStream::Stdout, outputs.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader(stderr, OutputStream::Stderr, outputs));
        }

        tokio::spawn(drive(DriverContext {
            execution_id: spec.execution_id,
            child,
            pgid,
            readers,
            terminal,
            cancel,
            grace_period: spec.grace_period,
            timeout_seconds: spec.limits.timeout_seconds,
        }));

        Ok(handle)
    }

    async fn cleanup_orphans(&self) -> Result<Vec<String>> {
        // Process groups do not outlive the executor's children; nothing to sweep
        Ok(Vec::new())
    }
}

fn spawn_reader<R>(mut reader: R, stream: OutputStream, sink: OutputSink) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    if !sink.send(stream, buf[..n].to_vec()).await {
                        break;
                    }
                }
                Err(e) => {
                    warn!("Error reading {}: {}", stream.as_str(), e);
                    break;
                }
            }
        }
    })
}

struct DriverContext {
    execution_id: String,
    child: Child,
    pgid: Pid,
    readers: Vec<JoinHandle<()>>,
    terminal: TerminalSink,
    cancel: CancelHandle,
    grace_period: Duration,
    timeout_seconds: u64,
}

async fn drive(ctx: DriverContext) {
    let DriverContext {
        execution_id,
        mut child,
        pgid,
        mut readers,
        terminal,
        cancel,
        grace_period,
        timeout_seconds,
    } = ctx;

    let stop_reason = tokio::select! {
        status = child.wait() => {
            let termination = match status {
                Ok(status) => Termination::Exited(exit_code(status)),
                Err(e) => Termination::Failed(format!("failed to wait for process: {}", e)),
            };
            // Background children may still hold the pipes open
            if tokio::time::timeout(grace_period, join_all(&mut readers)).await.is_err() {
                debug!(execution_id = %execution_id, "Output still open after exit, killing group");
                signal_group(pgid, Signal::SIGKILL);
            }
            abort_all(readers).await;
            signal_group(pgid, Signal::SIGKILL);
            terminal.finish(termination).await;
            return;
        }
        reason = cancel.cancelled() => reason,
        _ = tokio::time::sleep(Duration::from_secs(timeout_seconds)) => {
            CancelReason::Timeout { seconds: timeout_seconds }
        }
        _ = terminal.closed() => CancelReason::Requested("execution handle dropped".to_string()),
    };

    info!(
        execution_id = %execution_id,
        reason = %stop_reason,
        "Stopping native execution"
    );
    terminate_group(&mut child, pgid, grace_period).await;
    abort_all(readers).await;
    terminal.finish(Termination::Cancelled(stop_reason)).await;
}

/// SIGTERM the whole group, wait out the grace period, then SIGKILL and reap
async fn terminate_group(child: &mut Child, pgid: Pid, grace_period: Duration) {
    signal_group(pgid, Signal::SIGTERM);

    match tokio::time::timeout(grace_period, child.wait()).await {
        Ok(_) => debug!("Process group {} exited after SIGTERM", pgid),
        Err(_) => {
            warn!(
                "Process group {} did not exit within {:?}, sending SIGKILL",
                pgid, grace_period
            );
            signal_group(pgid, Signal::SIGKILL);
            if let Err(e) = child.wait().await {
                warn!("Failed to reap process group {}: {}", pgid, e);
            }
        }
    }

    // Stragglers that ignored SIGTERM after the leader exited
    signal_group(pgid, Signal::SIGKILL);
}

fn signal_group(pgid: Pid, signal: Signal) {
    match killpg(pgid, signal) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!("Failed to send {} to process group {}: {}", signal, pgid, e),
    }
}

async fn join_all(readers: &mut [JoinHandle<()>]) {
    for reader in readers.iter_mut() {
        if !reader.is_finished() {
            let _ = reader.await;
        }
    }
}

/// Stop every reader and wait until none can send again
async fn abort_all(readers: Vec<JoinHandle<()>>) {
    for reader in readers {
        reader.abort();
        if !reader.is_finished() {
            let _ = reader.await;
        }
    }
}

fn exit_code(status: std::process::ExitStatus) -> i64 {
    match status.code() {
        Some(code) => i64::from(code),
        None => 128 + i64::from(status.signal().unwrap_or(0)),
    }
}
