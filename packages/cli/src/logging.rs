// ABOUTME: Tracing subscriber setup for the runhub binary
// ABOUTME: RUST_LOG overrides the default filter; RUNHUB_LOG_FORMAT=json switches to JSON lines

use runhub_config::env;
use tracing_subscriber::EnvFilter;

pub const DEFAULT_FILTER: &str = "runhub=info,tower_http=info";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Compact,
    Json,
}

impl LogFormat {
    pub fn from_env() -> Self {
        Self::parse(std::env::var(env::RUNHUB_LOG_FORMAT).ok().as_deref())
    }

    fn parse(value: Option<&str>) -> Self {
        match value.map(|v| v.trim().to_ascii_lowercase()) {
            Some(v) if v == "json" => LogFormat::Json,
            _ => LogFormat::Compact,
        }
    }
}

pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = match LogFormat::from_env() {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Compact => builder.compact().try_init(),
    };
    if let Err(e) = result {
        eprintln!("Tracing already initialised: {}", e);
    }
}
