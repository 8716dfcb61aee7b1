// ABOUTME: Typed configuration objects with defaults and environment parsing
// ABOUTME: Each component receives its own config explicitly at construction

use crate::env;
use runhub_core::ResourceLimits;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("Invalid value for {var}: '{value}' ({reason})")]
    InvalidValue {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error("{var} must be between {min} and {max}, got {value}")]
    OutOfRange {
        var: &'static str,
        value: String,
        min: String,
        max: String,
    },

    #[error("Invalid runtime: {0} (expected 'docker' or 'native')")]
    InvalidRuntime(String),

    #[error("Invalid channel mode: {0} (expected 'local' or 'zmq')")]
    InvalidChannelMode(String),

    #[error("Native execution requires {} = true", env::RUNHUB_ALLOW_NATIVE_EXECUTION)]
    NativeExecutionNotAllowed,
}

/// Reads raw variables; tests substitute a map
type Lookup<'a> = &'a dyn Fn(&str) -> Option<String>;

fn parse_var<T>(lookup: Lookup<'_>, var: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(var) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue {
                var,
                value: raw.clone(),
                reason: e.to_string(),
            }),
    }
}

fn parse_ranged<T>(
    lookup: Lookup<'_>,
    var: &'static str,
    default: T,
    min: T,
    max: T,
) -> Result<T, ConfigError>
where
    T: FromStr + PartialOrd + Copy + std::fmt::Display,
    T::Err: std::fmt::Display,
{
    match parse_var::<T>(lookup, var)? {
        None => Ok(default),
        Some(value) if value < min || value > max => Err(ConfigError::OutOfRange {
            var,
            value: value.to_string(),
            min: min.to_string(),
            max: max.to_string(),
        }),
        Some(value) => Ok(value),
    }
}

fn parse_bool(lookup: Lookup<'_>, var: &'static str, default: bool) -> Result<bool, ConfigError> {
    match lookup(var).map(|v| v.trim().to_lowercase()) {
        None => Ok(default),
        Some(v) if v.is_empty() => Ok(default),
        Some(v) => match v.as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidValue {
                var,
                value: v,
                reason: "expected a boolean".to_string(),
            }),
        },
    }
}

fn parse_string(lookup: Lookup<'_>, var: &'static str, default: &str) -> String {
    lookup(var)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn parse_list(lookup: Lookup<'_>, var: &'static str) -> Vec<String> {
    lookup(var)
        .unwrap_or_default()
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueueConfig {
    pub database_url: String,
    pub queue_name: String,
    pub max_attempts: u32,
    pub visibility_timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://runhub.db?mode=rwc".to_string(),
            queue_name: "default".to_string(),
            max_attempts: 3,
            visibility_timeout: Duration::from_secs(30),
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(300),
        }
    }
}

impl QueueConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&|k| std::env::var(k).ok())
    }

    fn from_lookup(lookup: Lookup<'_>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            database_url: parse_string(lookup, env::RUNHUB_DATABASE_URL, &defaults.database_url),
            queue_name: parse_string(lookup, env::RUNHUB_QUEUE_NAME, &defaults.queue_name),
            max_attempts: parse_ranged(lookup, env::RUNHUB_MAX_ATTEMPTS, 3, 1, 100)?,
            visibility_timeout: Duration::from_secs(parse_ranged(
                lookup,
                env::RUNHUB_VISIBILITY_TIMEOUT_SECS,
                30,
                1,
                86_400,
            )?),
            backoff_base: Duration::from_millis(parse_ranged(
                lookup,
                env::RUNHUB_BACKOFF_BASE_MS,
                1_000,
                1,
                3_600_000,
            )?),
            backoff_max: Duration::from_secs(parse_ranged(
                lookup,
                env::RUNHUB_BACKOFF_MAX_SECS,
                300,
                1,
                86_400,
            )?),
        })
    }
}

/// Which sandbox runtime executes commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeKind {
    Docker,
    /// Plain subprocess; only for trusted deployments
    Native,
}

impl FromStr for RuntimeKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "docker" => Ok(RuntimeKind::Docker),
            "native" => Ok(RuntimeKind::Native),
            _ => Err(ConfigError::InvalidRuntime(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SandboxConfig {
    pub runtime: RuntimeKind,
    pub allow_native_execution: bool,
    pub workspace_root: PathBuf,
    pub docker_image: String,
    /// Upper bound on pulling a missing image
    pub pull_timeout: Duration,
    pub grace_period: Duration,
    pub default_limits: ResourceLimits,
    pub max_limits: ResourceLimits,
    /// Buffered events per execution handle before the runtime waits on the consumer
    pub output_buffer: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            runtime: RuntimeKind::Docker,
            allow_native_execution: false,
            workspace_root: PathBuf::from("./workspaces"),
            docker_image: "alpine:3.20".to_string(),
            pull_timeout: Duration::from_secs(600),
            grace_period: Duration::from_secs(2),
            default_limits: ResourceLimits::default(),
            max_limits: ResourceLimits {
                memory_mb: 8192,
                cpu_cores: 4.0,
                pids_limit: 1024,
                timeout_seconds: 3600,
            },
            output_buffer: 256,
        }
    }
}

impl SandboxConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&|k| std::env::var(k).ok())
    }

    fn from_lookup(lookup: Lookup<'_>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let runtime = match lookup(env::RUNHUB_RUNTIME) {
            Some(raw) if !raw.trim().is_empty() => raw.trim().parse::<RuntimeKind>()?,
            _ => defaults.runtime,
        };
        let allow_native_execution = parse_bool(lookup, env::RUNHUB_ALLOW_NATIVE_EXECUTION, false)?;

        if runtime == RuntimeKind::Native && !allow_native_execution {
            return Err(ConfigError::NativeExecutionNotAllowed);
        }

        let default_limits = ResourceLimits {
            memory_mb: parse_ranged(lookup, env::RUNHUB_MEMORY_MB, 512, 16, 65_536)?,
            cpu_cores: parse_ranged(lookup, env::RUNHUB_CPU_CORES, 1.0, 0.1, 64.0)?,
            pids_limit: parse_ranged(lookup, env::RUNHUB_PIDS_LIMIT, 64, 8, 32_768)?,
            timeout_seconds: parse_ranged(lookup, env::RUNHUB_EXEC_TIMEOUT_SECS, 600, 1, 86_400)?,
        };

        Ok(Self {
            runtime,
            allow_native_execution,
            workspace_root: PathBuf::from(parse_string(
                lookup,
                env::RUNHUB_WORKSPACE_ROOT,
                "./workspaces",
            )),
            docker_image: parse_string(lookup, env::RUNHUB_DOCKER_IMAGE, &defaults.docker_image),
            pull_timeout: Duration::from_secs(parse_ranged(
                lookup,
                env::RUNHUB_IMAGE_PULL_TIMEOUT_SECS,
                600,
                10,
                7_200,
            )?),
            grace_period: Duration::from_millis(parse_ranged(
                lookup,
                env::RUNHUB_CANCEL_GRACE_MS,
                2_000,
                100,
                60_000,
            )?),
            max_limits: ResourceLimits {
                memory_mb: defaults.max_limits.memory_mb.max(default_limits.memory_mb),
                cpu_cores: defaults.max_limits.cpu_cores.max(default_limits.cpu_cores),
                pids_limit: defaults.max_limits.pids_limit.max(default_limits.pids_limit),
                timeout_seconds: defaults
                    .max_limits
                    .timeout_seconds
                    .max(default_limits.timeout_seconds),
            },
            default_limits,
            output_buffer: defaults.output_buffer,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    pub pool_size: usize,
    pub queue_name: String,
    pub visibility_timeout: Duration,
    pub poll_interval: Duration,
    pub cancel_poll_interval: Duration,
    pub reaper_interval: Duration,
    pub blocked_commands: Vec<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            pool_size: 4,
            queue_name: "default".to_string(),
            visibility_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(500),
            cancel_poll_interval: Duration::from_millis(250),
            reaper_interval: Duration::from_secs(5),
            blocked_commands: Vec::new(),
        }
    }
}

impl WorkerConfig {
    pub fn from_env(queue: &QueueConfig) -> Result<Self, ConfigError> {
        Self::from_lookup(&|k| std::env::var(k).ok(), queue)
    }

    fn from_lookup(lookup: Lookup<'_>, queue: &QueueConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            pool_size: parse_ranged(lookup, env::RUNHUB_WORKERS, 4, 1, 256)?,
            queue_name: queue.queue_name.clone(),
            visibility_timeout: queue.visibility_timeout,
            poll_interval: Duration::from_millis(parse_ranged(
                lookup,
                env::RUNHUB_POLL_INTERVAL_MS,
                500,
                10,
                60_000,
            )?),
            cancel_poll_interval: Duration::from_millis(parse_ranged(
                lookup,
                env::RUNHUB_CANCEL_POLL_MS,
                250,
                10,
                60_000,
            )?),
            reaper_interval: Duration::from_secs(parse_ranged(
                lookup,
                env::RUNHUB_REAPER_INTERVAL_SECS,
                5,
                1,
                3_600,
            )?),
            blocked_commands: parse_list(lookup, env::RUNHUB_BLOCKED_COMMANDS),
        })
    }

    /// Heartbeats fire three times per visibility window
    pub fn heartbeat_interval(&self) -> Duration {
        (self.visibility_timeout / 3).max(Duration::from_millis(10))
    }
}

/// How events travel between workers and gateways
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelMode {
    /// In-process only; worker and gateway share one process
    Local,
    /// Through a ZeroMQ hub
    Zmq,
}

impl FromStr for ChannelMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "local" => Ok(ChannelMode::Local),
            "zmq" => Ok(ChannelMode::Zmq),
            _ => Err(ConfigError::InvalidChannelMode(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelConfig {
    pub mode: ChannelMode,
    /// Hub PULL endpoint that publishers push to
    pub hub_ingress: String,
    /// Hub PUB endpoint that subscribers connect to
    pub hub_egress: String,
    pub publish_timeout: Duration,
    /// How long a subscribe waits for the hub to start delivering the topic
    pub subscribe_timeout: Duration,
    pub reconnect_interval: Duration,
    pub topic_capacity: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            mode: ChannelMode::Local,
            hub_ingress: "tcp://127.0.0.1:5601".to_string(),
            hub_egress: "tcp://127.0.0.1:5602".to_string(),
            publish_timeout: Duration::from_secs(2),
            subscribe_timeout: Duration::from_secs(2),
            reconnect_interval: Duration::from_secs(1),
            topic_capacity: 1024,
        }
    }
}

impl ChannelConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&|k| std::env::var(k).ok())
    }

    fn from_lookup(lookup: Lookup<'_>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let mode = match lookup(env::RUNHUB_CHANNEL) {
            Some(raw) if !raw.trim().is_empty() => raw.trim().parse::<ChannelMode>()?,
            _ => defaults.mode,
        };
        Ok(Self {
            mode,
            hub_ingress: parse_string(lookup, env::RUNHUB_HUB_INGRESS, &defaults.hub_ingress),
            hub_egress: parse_string(lookup, env::RUNHUB_HUB_EGRESS, &defaults.hub_egress),
            publish_timeout: Duration::from_millis(parse_ranged(
                lookup,
                env::RUNHUB_PUBLISH_TIMEOUT_MS,
                2_000,
                10,
                60_000,
            )?),
            subscribe_timeout: Duration::from_millis(parse_ranged(
                lookup,
                env::RUNHUB_SUBSCRIBE_TIMEOUT_MS,
                2_000,
                10,
                60_000,
            )?),
            reconnect_interval: defaults.reconnect_interval,
            topic_capacity: parse_ranged(lookup, env::RUNHUB_TOPIC_CAPACITY, 1024, 16, 1 << 20)?,
        })
    }
}

/// A static bearer token and the identity it authenticates
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthToken {
    pub token: String,
    pub user_id: String,
    pub workspace_id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GatewayConfig {
    /// Events buffered per connection before the oldest are dropped
    pub connection_backlog: usize,
    pub auth_tokens: Vec<AuthToken>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            connection_backlog: 256,
            auth_tokens: Vec::new(),
        }
    }
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&|k| std::env::var(k).ok())
    }

    fn from_lookup(lookup: Lookup<'_>) -> Result<Self, ConfigError> {
        let mut auth_tokens = Vec::new();
        // Format: token:user_id:workspace_id,token2:user2:workspace2
        for entry in parse_list(lookup, env::RUNHUB_AUTH_TOKENS) {
            let parts: Vec<&str> = entry.split(':').collect();
            match parts.as_slice() {
                [token, user_id, workspace_id]
                    if !token.is_empty() && !user_id.is_empty() && !workspace_id.is_empty() =>
                {
                    auth_tokens.push(AuthToken {
                        token: token.to_string(),
                        user_id: user_id.to_string(),
                        workspace_id: workspace_id.to_string(),
                    });
                }
                _ => {
                    return Err(ConfigError::InvalidValue {
                        var: env::RUNHUB_AUTH_TOKENS,
                        value: "<redacted>".to_string(),
                        reason: "expected token:user_id:workspace_id".to_string(),
                    })
                }
            }
        }

        Ok(Self {
            connection_backlog: parse_ranged(lookup, env::RUNHUB_CONNECTION_BACKLOG, 256, 1, 65_536)?,
            auth_tokens,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 4100,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&|k| std::env::var(k).ok())
    }

    fn from_lookup(lookup: Lookup<'_>) -> Result<Self, ConfigError> {
        Ok(Self {
            host: parse_string(lookup, env::RUNHUB_HOST, "127.0.0.1"),
            port: parse_ranged(lookup, env::RUNHUB_PORT, 4100, 1, u16::MAX)?,
        })
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Every component's configuration, read once at process start
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Settings {
    pub server: ServerConfig,
    pub queue: QueueConfig,
    pub sandbox: SandboxConfig,
    pub worker: WorkerConfig,
    pub channel: ChannelConfig,
    pub gateway: GatewayConfig,
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&|k| std::env::var(k).ok())
    }

    fn from_lookup(lookup: Lookup<'_>) -> Result<Self, ConfigError> {
        let queue = QueueConfig::from_lookup(lookup)?;
        Ok(Self {
            server: ServerConfig::from_lookup(lookup)?,
            sandbox: SandboxConfig::from_lookup(lookup)?,
            worker: WorkerConfig::from_lookup(lookup, &queue)?,
            channel: ChannelConfig::from_lookup(lookup)?,
            gateway: GatewayConfig::from_lookup(lookup)?,
            queue,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let lookup = lookup_from(&[]);
        let settings = Settings::from_lookup(&lookup).unwrap();

        assert_eq!(settings.queue.max_attempts, 3);
        assert_eq!(settings.queue.visibility_timeout, Duration::from_secs(30));
        assert_eq!(settings.sandbox.runtime, RuntimeKind::Docker);
        assert_eq!(settings.sandbox.grace_period, Duration::from_secs(2));
        assert_eq!(settings.sandbox.pull_timeout, Duration::from_secs(600));
        assert_eq!(settings.channel.subscribe_timeout, Duration::from_secs(2));
        assert_eq!(settings.worker.pool_size, 4);
        assert_eq!(settings.worker.heartbeat_interval(), Duration::from_secs(10));
        assert_eq!(settings.channel.mode, ChannelMode::Local);
        assert_eq!(settings.gateway.connection_backlog, 256);
        assert_eq!(settings.server.bind_address(), "127.0.0.1:4100");
    }

    #[test]
    fn test_overrides() {
        let lookup = lookup_from(&[
            (env::RUNHUB_MAX_ATTEMPTS, "5"),
            (env::RUNHUB_VISIBILITY_TIMEOUT_SECS, "60"),
            (env::RUNHUB_WORKERS, "8"),
            (env::RUNHUB_CHANNEL, "zmq"),
            (env::RUNHUB_IMAGE_PULL_TIMEOUT_SECS, "120"),
            (env::RUNHUB_SUBSCRIBE_TIMEOUT_MS, "750"),
            (env::RUNHUB_BLOCKED_COMMANDS, "iptables, nmap ,"),
            (env::RUNHUB_AUTH_TOKENS, "t1:alice:ws1,t2:bob:ws2"),
        ]);
        let settings = Settings::from_lookup(&lookup).unwrap();

        assert_eq!(settings.queue.max_attempts, 5);
        assert_eq!(settings.worker.visibility_timeout, Duration::from_secs(60));
        assert_eq!(settings.worker.pool_size, 8);
        assert_eq!(settings.channel.mode, ChannelMode::Zmq);
        assert_eq!(settings.sandbox.pull_timeout, Duration::from_secs(120));
        assert_eq!(settings.channel.subscribe_timeout, Duration::from_millis(750));
        assert_eq!(settings.worker.blocked_commands, vec!["iptables", "nmap"]);
        assert_eq!(settings.gateway.auth_tokens.len(), 2);
        assert_eq!(settings.gateway.auth_tokens[1].user_id, "bob");
    }

    #[test]
    fn test_out_of_range_rejected() {
        let lookup = lookup_from(&[(env::RUNHUB_WORKERS, "0")]);
        assert!(matches!(
            Settings::from_lookup(&lookup),
            Err(ConfigError::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_malformed_number_rejected() {
        let lookup = lookup_from(&[(env::RUNHUB_MAX_ATTEMPTS, "three")]);
        assert!(matches!(
            Settings::from_lookup(&lookup),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_native_runtime_requires_opt_in() {
        let lookup = lookup_from(&[(env::RUNHUB_RUNTIME, "native")]);
        assert_eq!(
            SandboxConfig::from_lookup(&lookup),
            Err(ConfigError::NativeExecutionNotAllowed)
        );

        let lookup = lookup_from(&[
            (env::RUNHUB_RUNTIME, "native"),
            (env::RUNHUB_ALLOW_NATIVE_EXECUTION, "true"),
        ]);
        let config = SandboxConfig::from_lookup(&lookup).unwrap();
        assert_eq!(config.runtime, RuntimeKind::Native);
    }

    #[test]
    fn test_malformed_auth_tokens() {
        let lookup = lookup_from(&[(env::RUNHUB_AUTH_TOKENS, "just-a-token")]);
        assert!(GatewayConfig::from_lookup(&lookup).is_err());
    }

    #[test]
    #[serial]
    fn test_from_process_env() {
        std::env::set_var(env::RUNHUB_QUEUE_NAME, "builds");
        let config = QueueConfig::from_env().unwrap();
        std::env::remove_var(env::RUNHUB_QUEUE_NAME);

        assert_eq!(config.queue_name, "builds");
    }
}
