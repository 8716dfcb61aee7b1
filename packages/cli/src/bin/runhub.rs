// ABOUTME: runhub entry point
// ABOUTME: Loads .env and environment settings, applies flag overrides, then runs the selected role

use clap::{Args, Parser, Subcommand};
use runhub_config::{ChannelMode, RuntimeKind, Settings};
use std::path::PathBuf;
use std::process;

#[derive(Parser)]
#[command(name = "runhub")]
#[command(about = "Runhub - sandboxed shell command pipeline")]
#[command(version)]
struct Cli {
    #[command(flatten)]
    overrides: Overrides,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Relay events from workers to gateways
    Hub,
    /// Run a pool of workers leasing jobs from the queue
    Worker,
    /// Serve the submission API and websocket gateway
    Gateway,
    /// Run workers, API and gateway in one process over the in-process bus
    Standalone,
}

/// Flags that take precedence over environment variables
#[derive(Args, Debug, Default)]
struct Overrides {
    /// HTTP bind host
    #[arg(long, global = true)]
    host: Option<String>,

    /// HTTP bind port
    #[arg(long, global = true)]
    port: Option<u16>,

    /// SQLite database URL for the job queue
    #[arg(long, global = true)]
    database_url: Option<String>,

    /// Number of workers
    #[arg(long, global = true)]
    workers: Option<usize>,

    /// Sandbox runtime: docker or native
    #[arg(long, global = true)]
    runtime: Option<RuntimeKind>,

    /// Permit the native runtime (trusted deployments only)
    #[arg(long, global = true)]
    allow_native: bool,

    /// Root directory holding workspaces
    #[arg(long, global = true)]
    workspace_root: Option<PathBuf>,

    /// Event channel: local or zmq
    #[arg(long, global = true)]
    channel: Option<ChannelMode>,

    /// Hub endpoint workers push to
    #[arg(long, global = true)]
    hub_ingress: Option<String>,

    /// Hub endpoint gateways subscribe to
    #[arg(long, global = true)]
    hub_egress: Option<String>,
}

impl Overrides {
    fn apply(self, settings: &mut Settings) {
        if let Some(host) = self.host {
            settings.server.host = host;
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(url) = self.database_url {
            settings.queue.database_url = url;
        }
        if let Some(workers) = self.workers {
            settings.worker.pool_size = workers.max(1);
        }
        if let Some(runtime) = self.runtime {
            settings.sandbox.runtime = runtime;
        }
        if self.allow_native {
            settings.sandbox.allow_native_execution = true;
        }
        if let Some(root) = self.workspace_root {
            settings.sandbox.workspace_root = root;
        }
        if let Some(mode) = self.channel {
            settings.channel.mode = mode;
        }
        if let Some(ingress) = self.hub_ingress {
            settings.channel.hub_ingress = ingress;
        }
        if let Some(egress) = self.hub_egress {
            settings.channel.hub_egress = egress;
        }
    }
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    runhub_cli::init_tracing();

    if let Err(e) = run(cli).await {
        tracing::error!("{:#}", e);
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut settings = Settings::from_env()?;
    cli.overrides.apply(&mut settings);

    match cli.command {
        Commands::Hub => runhub_cli::run_hub(settings).await,
        Commands::Worker => runhub_cli::run_worker(settings).await,
        Commands::Gateway => runhub_cli::run_gateway(settings).await,
        Commands::Standalone => runhub_cli::run_standalone(settings).await,
    }
}
