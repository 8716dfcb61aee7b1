// ABOUTME: Wiring of Runhub components for each process role
// ABOUTME: Hub, worker pool, gateway server and the all-in-one standalone mode

use anyhow::{Context, Result};
use axum::Router;
use runhub_api::SubmissionService;
use runhub_channel::{build_channel, EventChannel, EventHub, LocalEventBus};
use runhub_config::Settings;
use runhub_core::RuleBasedPolicy;
use runhub_gateway::{ConnectionRegistry, Gateway, StaticTokenAuthenticator};
use runhub_queue::JobQueue;
use runhub_sandbox::{build_runtime, SandboxExecutor};
use runhub_worker::{WorkerContext, WorkerPool};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Resolves once Ctrl-C is received
pub async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

/// Submission API and gateway websocket on one router
pub fn build_router(service: SubmissionService, gateway: Arc<Gateway>) -> Router {
    runhub_api::create_jobs_router()
        .with_state(service)
        .merge(runhub_gateway::create_router(gateway))
        .layer(TraceLayer::new_for_http())
        .layer(CatchPanicLayer::new())
}

pub fn build_gateway(
    settings: &Settings,
    channel: Arc<dyn EventChannel>,
    service: SubmissionService,
) -> Arc<Gateway> {
    let authenticator = StaticTokenAuthenticator::new(&settings.gateway.auth_tokens);
    if authenticator.is_empty() {
        warn!("No auth tokens configured; every connection is unauthenticated");
    }
    Arc::new(
        Gateway::new(
            Arc::new(ConnectionRegistry::new(settings.gateway.connection_backlog)),
            channel,
            Arc::new(authenticator),
        )
        .with_canceller(Arc::new(service)),
    )
}

async fn open_queue(settings: &Settings) -> Result<JobQueue> {
    JobQueue::connect(&settings.queue.database_url, settings.queue.clone())
        .await
        .with_context(|| format!("Failed to open job queue at {}", settings.queue.database_url))
}

fn worker_context(
    settings: &Settings,
    queue: JobQueue,
    channel: Arc<dyn EventChannel>,
) -> Result<WorkerContext> {
    let runtime = build_runtime(&settings.sandbox).context("Failed to initialise sandbox runtime")?;
    let executor = SandboxExecutor::new(runtime, settings.sandbox.clone())
        .context("Failed to prepare workspace root")?;
    let policy =
        RuleBasedPolicy::new().with_blocked_prefixes(settings.worker.blocked_commands.clone());

    Ok(WorkerContext {
        queue,
        executor: Arc::new(executor),
        policy: Arc::new(policy),
        channel,
        config: settings.worker.clone(),
    })
}

async fn serve<F>(settings: &Settings, app: Router, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = settings.server.bind_address();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("Listening on http://{}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("HTTP server failed")
}

/// Relay worker events to gateways until Ctrl-C
pub async fn run_hub(settings: Settings) -> Result<()> {
    let hub = EventHub::bind(&settings.channel.hub_ingress, &settings.channel.hub_egress)
        .await
        .context("Failed to bind event hub")?;
    info!(
        "Event hub relaying {} -> {}",
        hub.ingress_endpoint(),
        hub.egress_endpoint()
    );

    let (stop, stopped) = watch::channel(false);
    let relay = tokio::spawn(hub.run(stopped));
    shutdown_signal().await;
    let _ = stop.send(true);

    let relayed = relay.await.context("Event hub task panicked")??;
    info!("Event hub stopped after relaying {} events", relayed);
    Ok(())
}

/// Lease and execute jobs until Ctrl-C, then drain in-flight work
pub async fn run_worker(settings: Settings) -> Result<()> {
    let queue = open_queue(&settings).await?;
    let channel = build_channel(&settings.channel);
    let pool = WorkerPool::start(worker_context(&settings, queue, channel)?).await;

    shutdown_signal().await;
    pool.shutdown().await;
    Ok(())
}

/// Serve the submission API and websocket gateway until Ctrl-C
pub async fn run_gateway(settings: Settings) -> Result<()> {
    let queue = open_queue(&settings).await?;
    let channel = build_channel(&settings.channel);
    let service = SubmissionService::new(queue, channel.clone());
    let gateway = build_gateway(&settings, channel, service.clone());

    serve(&settings, build_router(service, gateway), shutdown_signal()).await
}

/// Everything in one process over the in-process bus
pub async fn run_standalone(settings: Settings) -> Result<()> {
    let queue = open_queue(&settings).await?;
    let channel: Arc<dyn EventChannel> =
        Arc::new(LocalEventBus::new(settings.channel.topic_capacity));

    let pool = WorkerPool::start(worker_context(&settings, queue.clone(), channel.clone())?).await;
    let service = SubmissionService::new(queue, channel.clone());
    let gateway = build_gateway(&settings, channel, service.clone());

    let result = serve(&settings, build_router(service, gateway), shutdown_signal()).await;
    pool.shutdown().await;
    result
}
