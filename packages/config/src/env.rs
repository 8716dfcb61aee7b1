// ABOUTME: Environment variable name constants
// ABOUTME: Centralized definitions of all environment variable names used across Runhub

// Logging
pub const RUST_LOG: &str = "RUST_LOG";
pub const RUNHUB_LOG_FORMAT: &str = "RUNHUB_LOG_FORMAT";

// HTTP Server
pub const RUNHUB_HOST: &str = "RUNHUB_HOST";
pub const RUNHUB_PORT: &str = "RUNHUB_PORT";

// Job Queue
pub const RUNHUB_DATABASE_URL: &str = "RUNHUB_DATABASE_URL";
pub const RUNHUB_QUEUE_NAME: &str = "RUNHUB_QUEUE_NAME";
pub const RUNHUB_MAX_ATTEMPTS: &str = "RUNHUB_MAX_ATTEMPTS";
pub const RUNHUB_VISIBILITY_TIMEOUT_SECS: &str = "RUNHUB_VISIBILITY_TIMEOUT_SECS";
pub const RUNHUB_BACKOFF_BASE_MS: &str = "RUNHUB_BACKOFF_BASE_MS";
pub const RUNHUB_BACKOFF_MAX_SECS: &str = "RUNHUB_BACKOFF_MAX_SECS";

// Sandbox
pub const RUNHUB_RUNTIME: &str = "RUNHUB_RUNTIME";
pub const RUNHUB_ALLOW_NATIVE_EXECUTION: &str = "RUNHUB_ALLOW_NATIVE_EXECUTION";
pub const RUNHUB_WORKSPACE_ROOT: &str = "RUNHUB_WORKSPACE_ROOT";
pub const RUNHUB_DOCKER_IMAGE: &str = "RUNHUB_DOCKER_IMAGE";
pub const RUNHUB_IMAGE_PULL_TIMEOUT_SECS: &str = "RUNHUB_IMAGE_PULL_TIMEOUT_SECS";
pub const RUNHUB_CANCEL_GRACE_MS: &str = "RUNHUB_CANCEL_GRACE_MS";
pub const RUNHUB_MEMORY_MB: &str = "RUNHUB_MEMORY_MB";
pub const RUNHUB_CPU_CORES: &str = "RUNHUB_CPU_CORES";
pub const RUNHUB_PIDS_LIMIT: &str = "RUNHUB_PIDS_LIMIT";
pub const RUNHUB_EXEC_TIMEOUT_SECS: &str = "RUNHUB_EXEC_TIMEOUT_SECS";

// Worker Pool
pub const RUNHUB_WORKERS: &str = "RUNHUB_WORKERS";
pub const RUNHUB_POLL_INTERVAL_MS: &str = "RUNHUB_POLL_INTERVAL_MS";
pub const RUNHUB_CANCEL_POLL_MS: &str = "RUNHUB_CANCEL_POLL_MS";
pub const RUNHUB_REAPER_INTERVAL_SECS: &str = "RUNHUB_REAPER_INTERVAL_SECS";
pub const RUNHUB_BLOCKED_COMMANDS: &str = "RUNHUB_BLOCKED_COMMANDS";

// Event Channel
pub const RUNHUB_CHANNEL: &str = "RUNHUB_CHANNEL";
pub const RUNHUB_HUB_INGRESS: &str = "RUNHUB_HUB_INGRESS";
pub const RUNHUB_HUB_EGRESS: &str = "RUNHUB_HUB_EGRESS";
pub const RUNHUB_PUBLISH_TIMEOUT_MS: &str = "RUNHUB_PUBLISH_TIMEOUT_MS";
pub const RUNHUB_SUBSCRIBE_TIMEOUT_MS: &str = "RUNHUB_SUBSCRIBE_TIMEOUT_MS";
pub const RUNHUB_TOPIC_CAPACITY: &str = "RUNHUB_TOPIC_CAPACITY";

// Gateway
pub const RUNHUB_CONNECTION_BACKLOG: &str = "RUNHUB_CONNECTION_BACKLOG";
pub const RUNHUB_AUTH_TOKENS: &str = "RUNHUB_AUTH_TOKENS";
