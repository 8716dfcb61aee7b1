// ABOUTME: Docker runtime running each command in a throwaway, locked-down container
// ABOUTME: No network, capped CPU/memory/pids, only the working directory mounted, removed on every path

use crate::error::{Result, SandboxError};
use crate::handle::{execution_channel, CancelHandle, ExecutionHandle, OutputSink, TerminalSink};
use crate::runtime::ContainerRuntime;
use crate::types::{CancelReason, LaunchSpec, Termination};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, ListContainersOptions, LogOutput,
    LogsOptions, RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
    WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::Docker;
use futures::StreamExt;
use runhub_config::SandboxConfig;
use runhub_core::OutputStream;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const LABEL_PREFIX: &str = "runhub.sandbox";
const CONTAINER_WORKDIR: &str = "/workspace";

pub struct DockerRuntime {
    client: Docker,
    image: String,
    pull_timeout: Duration,
    /// Containers owned by live executions; never swept as orphans
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl DockerRuntime {
    pub fn new(config: &SandboxConfig) -> Result<Self> {
        let client = Docker::connect_with_defaults()
            .map_err(|e| SandboxError::RuntimeUnavailable(e.to_string()))?;
        Ok(Self::with_client(client, config))
    }

    /// Create with a specific Docker connection
    pub fn with_client(client: Docker, config: &SandboxConfig) -> Self {
        Self {
            client,
            image: config.docker_image.clone(),
            pull_timeout: config.pull_timeout,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    fn container_config(&self, spec: &LaunchSpec) -> Config<String> {
        let mut labels = HashMap::new();
        labels.insert(format!("{}.managed", LABEL_PREFIX), "true".to_string());
        labels.insert(
            format!("{}.execution_id", LABEL_PREFIX),
            spec.execution_id.clone(),
        );

        let mut env: Vec<String> = spec
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        env.push(format!("HOME={}", CONTAINER_WORKDIR));

        let memory_bytes = (spec.limits.memory_mb.saturating_mul(1024 * 1024)) as i64;

        let host_config = HostConfig {
            binds: Some(vec![format!(
                "{}:{}:rw",
                spec.working_dir.display(),
                CONTAINER_WORKDIR
            )]),
            network_mode: Some("none".to_string()),
            memory: Some(memory_bytes),
            memory_swap: Some(memory_bytes),
            nano_cpus: Some((spec.limits.cpu_cores * 1_000_000_000.0) as i64),
            pids_limit: Some(i64::from(spec.limits.pids_limit)),
            cap_drop: Some(vec!["ALL".to_string()]),
            security_opt: Some(vec!["no-new-privileges".to_string()]),
            readonly_rootfs: Some(true),
            tmpfs: Some(HashMap::from([(
                "/tmp".to_string(),
                "rw,noexec,nosuid,size=64m".to_string(),
            )])),
            privileged: Some(false),
            auto_remove: Some(false),
            ..Default::default()
        };

        Config {
            image: Some(self.image.clone()),
            cmd: Some(vec![
                "/bin/sh".to_string(),
                "-c".to_string(),
                spec.command.clone(),
            ]),
            env: Some(env),
            working_dir: Some(CONTAINER_WORKDIR.to_string()),
            labels: Some(labels),
            network_disabled: Some(true),
            tty: Some(false),
            host_config: Some(host_config),
            ..Default::default()
        }
    }

    async fn image_exists(&self, image: &str) -> Result<bool> {
        match self.client.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(SandboxError::ImageError(e.to_string())),
        }
    }

    async fn ensure_image(&self) -> Result<()> {
        if self.image_exists(&self.image).await? {
            return Ok(());
        }

        info!("Pulling image: {} (timeout: {:?})", self.image, self.pull_timeout);
        let options = CreateImageOptions {
            from_image: self.image.clone(),
            ..Default::default()
        };

        let pull = async {
            let mut stream = self.client.create_image(Some(options), None, None);
            while let Some(progress) = stream.next().await {
                progress.map_err(|e| SandboxError::ImageError(e.to_string()))?;
            }
            Ok::<(), SandboxError>(())
        };

        tokio::time::timeout(self.pull_timeout, pull)
            .await
            .map_err(|_| {
                SandboxError::ImageError(format!(
                    "pull of {} timed out after {:?}",
                    self.image, self.pull_timeout
                ))
            })?
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn is_available(&self) -> bool {
        match self.client.ping().await {
            Ok(_) => true,
            Err(e) => {
                warn!("Docker not available: {}", e);
                false
            }
        }
    }

    async fn launch(&self, spec: LaunchSpec) -> Result<ExecutionHandle> {
        self.ensure_image().await?;

        let name = format!("runhub-{}", spec.execution_id);
        let options = CreateContainerOptions {
            name: name.clone(),
            platform: None,
        };
        let container = self
            .client
            .create_container(Some(options), self.container_config(&spec))
            .await?;
        let container_id = container.id;

        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(container_id.clone());

        if let Err(e) = self
            .client
            .start_container(&container_id, None::<StartContainerOptions<String>>)
            .await
        {
            remove_container(&self.client, &container_id).await;
            self.in_flight
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .remove(&container_id);
            return Err(SandboxError::SpawnFailed(e.to_string()));
        }

        info!(
            execution_id = %spec.execution_id,
            container = %container_id,
            "Started container execution"
        );

        let (outputs, terminal, cancel, handle) =
            execution_channel(&spec.execution_id, spec.output_buffer);
        let logs = spawn_log_reader(self.client.clone(), container_id.clone(), outputs);

        tokio::spawn(drive(DriverContext {
            client: self.client.clone(),
            container_id,
            logs,
            terminal,
            cancel,
            grace_period: spec.grace_period,
            timeout_seconds: spec.limits.timeout_seconds,
            in_flight: self.in_flight.clone(),
        }));

        Ok(handle)
    }

    async fn cleanup_orphans(&self) -> Result<Vec<String>> {
        let mut filters = HashMap::new();
        filters.insert(
            "label".to_string(),
            vec![format!("{}.managed=true", LABEL_PREFIX)],
        );
        let options = ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        };

        let containers = self.client.list_containers(Some(options)).await?;
        let in_flight = self
            .in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();

        let mut removed = Vec::new();
        for container in containers {
            let Some(id) = container.id else { continue };
            if in_flight.contains(&id) {
                continue;
            }
            warn!("Removing orphaned sandbox container {}", id);
            if remove_container(&self.client, &id).await {
                removed.push(id);
            }
        }
        Ok(removed)
    }
}

fn spawn_log_reader(client: Docker, container_id: String, sink: OutputSink) -> JoinHandle<()> {
    tokio::spawn(async move {
        let options = LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            ..Default::default()
        };
        let mut logs = client.logs(&container_id, Some(options));

        while let Some(entry) = logs.next().await {
            let (stream, data) = match entry {
                Ok(LogOutput::StdOut { message }) => (OutputStream::Stdout, message.to_vec()),
                Ok(LogOutput::StdErr { message }) => (OutputStream::Stderr, message.to_vec()),
                Ok(LogOutput::Console { message }) => (OutputStream::Stdout, message.to_vec()),
                Ok(_) => continue,
                Err(e) => {
                    warn!("Log stream for container {} failed: {}", container_id, e);
                    break;
                }
            };
            if !sink.send(stream, data).await {
                break;
            }
        }
    })
}

struct DriverContext {
    client: Docker,
    container_id: String,
    logs: JoinHandle<()>,
    terminal: TerminalSink,
    cancel: CancelHandle,
    grace_period: Duration,
    timeout_seconds: u64,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

async fn wait_for_exit(client: &Docker, container_id: &str) -> std::result::Result<i64, String> {
    let options = WaitContainerOptions {
        condition: "not-running",
    };
    let mut wait = client.wait_container(container_id, Some(options));
    match wait.next().await {
        Some(Ok(response)) => Ok(response.status_code),
        // Non-zero exits arrive as an error carrying the code
        Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => Ok(code),
        Some(Err(e)) => Err(e.to_string()),
        None => Err("wait stream ended without a status".to_string()),
    }
}

async fn drive(ctx: DriverContext) {
    let DriverContext {
        client,
        container_id,
        mut logs,
        terminal,
        cancel,
        grace_period,
        timeout_seconds,
        in_flight,
    } = ctx;

    let termination = tokio::select! {
        status = wait_for_exit(&client, &container_id) => {
            // Let the log stream flush what the container wrote before exiting
            if tokio::time::timeout(grace_period, &mut logs).await.is_err() {
                debug!("Log stream for {} still open after exit", container_id);
            }
            match status {
                Ok(code) => Termination::Exited(code),
                Err(message) => Termination::Failed(message),
            }
        }
        reason = cancel.cancelled() => {
            stop_container(&client, &container_id, grace_period).await;
            Termination::Cancelled(reason)
        }
        _ = tokio::time::sleep(Duration::from_secs(timeout_seconds)) => {
            stop_container(&client, &container_id, grace_period).await;
            Termination::Cancelled(CancelReason::Timeout { seconds: timeout_seconds })
        }
        _ = terminal.closed() => {
            stop_container(&client, &container_id, grace_period).await;
            Termination::Cancelled(CancelReason::Requested("execution handle dropped".to_string()))
        }
    };

    logs.abort();
    if !logs.is_finished() {
        let _ = logs.await;
    }

    remove_container(&client, &container_id).await;
    in_flight
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .remove(&container_id);

    terminal.finish(termination).await;
}

/// Stop with the grace period (the daemon SIGKILLs afterwards); kill outright if the daemon stalls
async fn stop_container(client: &Docker, container_id: &str, grace_period: Duration) {
    let grace_secs = grace_period.as_secs().max(1) as i64;
    let stop = client.stop_container(container_id, Some(StopContainerOptions { t: grace_secs }));

    match tokio::time::timeout(grace_period + Duration::from_secs(5), stop).await {
        Ok(Ok(())) => debug!("Stopped container {}", container_id),
        // 304: already stopped
        Ok(Err(bollard::errors::Error::DockerResponseServerError {
            status_code: 304, ..
        })) => {}
        Ok(Err(e)) => {
            warn!("Failed to stop container {}: {}", container_id, e);
            kill_container(client, container_id).await;
        }
        Err(_) => {
            warn!("Stopping container {} timed out, killing", container_id);
            kill_container(client, container_id).await;
        }
    }
}

async fn kill_container(client: &Docker, container_id: &str) {
    let options = KillContainerOptions { signal: "SIGKILL" };
    if let Err(e) = client.kill_container(container_id, Some(options)).await {
        warn!("Failed to kill container {}: {}", container_id, e);
    }
}

/// Force-remove a container. Failures are logged as teardown errors and never
/// change the execution outcome. Returns whether the container is gone.
async fn remove_container(client: &Docker, container_id: &str) -> bool {
    let options = RemoveContainerOptions {
        force: true,
        v: true,
        ..Default::default()
    };
    match client.remove_container(container_id, Some(options)).await {
        Ok(()) => true,
        // 404: already removed
        Err(bollard::errors::Error::DockerResponseServerError {
            status_code: 404, ..
        }) => true,
        Err(e) => {
            let err = SandboxError::Teardown(format!("{}: {}", container_id, e));
            error!("{}", err);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use runhub_core::ResourceLimits;
    use std::path::PathBuf;

    fn spec() -> LaunchSpec {
        LaunchSpec {
            execution_id: "exec_1".to_string(),
            command: "echo hello".to_string(),
            working_dir: PathBuf::from("/srv/workspaces/ws-1"),
            limits: ResourceLimits {
                memory_mb: 256,
                cpu_cores: 0.5,
                pids_limit: 32,
                timeout_seconds: 60,
            },
            env: HashMap::from([("FOO".to_string(), "bar".to_string())]),
            grace_period: Duration::from_secs(2),
            output_buffer: 16,
        }
    }

    #[test]
    fn test_container_config_is_locked_down() {
        // connect_with_defaults does not contact the daemon
        let client = match Docker::connect_with_defaults() {
            Ok(client) => client,
            Err(_) => return,
        };
        let runtime = DockerRuntime::with_client(client, &SandboxConfig::default());
        let config = runtime.container_config(&spec());
        let host = config.host_config.expect("host config");

        assert_eq!(config.network_disabled, Some(true));
        assert_eq!(host.network_mode.as_deref(), Some("none"));
        assert_eq!(host.memory, Some(256 * 1024 * 1024));
        assert_eq!(host.nano_cpus, Some(500_000_000));
        assert_eq!(host.pids_limit, Some(32));
        assert_eq!(host.cap_drop, Some(vec!["ALL".to_string()]));
        assert_eq!(host.readonly_rootfs, Some(true));
        assert_eq!(
            host.binds,
            Some(vec!["/srv/workspaces/ws-1:/workspace:rw".to_string()])
        );
        assert_eq!(
            config.cmd,
            Some(vec![
                "/bin/sh".to_string(),
                "-c".to_string(),
                "echo hello".to_string()
            ])
        );
        assert!(config
            .env
            .unwrap()
            .contains(&"FOO=bar".to_string()));
        assert_eq!(
            config
                .labels
                .unwrap()
                .get("runhub.sandbox.execution_id")
                .map(String::as_str),
            Some("exec_1")
        );
    }

    #[test]
    fn test_pull_timeout_comes_from_config() {
        let client = match Docker::connect_with_defaults() {
            Ok(client) => client,
            Err(_) => return,
        };
        let config = SandboxConfig {
            pull_timeout: Duration::from_secs(45),
            ..Default::default()
        };
        let runtime = DockerRuntime::with_client(client, &config);
        assert_eq!(runtime.pull_timeout, Duration::from_secs(45));
    }
}
