// ABOUTME: Process-scoped configuration for every Runhub component
// ABOUTME: Parses and validates environment variables into typed config objects

pub mod env;
mod settings;

pub use settings::{
    AuthToken, ChannelConfig, ChannelMode, ConfigError, GatewayConfig, QueueConfig, RuntimeKind,
    SandboxConfig, ServerConfig, Settings, WorkerConfig,
};
