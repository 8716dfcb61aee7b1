// ABOUTME: Pool of workers plus the lease reaper sharing one set of collaborators
// ABOUTME: Sweeps orphaned sandboxes on start and drains in-flight jobs on shutdown

use crate::reaper::LeaseReaper;
use crate::worker::{Worker, WorkerContext};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

pub struct WorkerPool {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    size: usize,
}

impl WorkerPool {
    /// Start `ctx.config.pool_size` workers and a reaper
    pub async fn start(ctx: WorkerContext) -> Self {
        match ctx.executor.cleanup_orphans().await {
            Ok(removed) if !removed.is_empty() => {
                warn!("Removed {} orphaned sandboxes: {:?}", removed.len(), removed)
            }
            Ok(_) => {}
            Err(e) => error!("Orphaned sandbox cleanup failed: {}", e),
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let size = ctx.config.pool_size.max(1);
        let mut tasks = Vec::with_capacity(size + 1);

        for index in 0..size {
            let worker = Worker::new(format!("worker-{}-{}", std::process::id(), index), ctx.clone());
            let rx = shutdown_rx.clone();
            tasks.push(tokio::spawn(async move { worker.run(rx).await }));
        }

        let reaper = LeaseReaper::new(
            ctx.queue.clone(),
            ctx.channel.clone(),
            ctx.config.reaper_interval,
        );
        tasks.push(tokio::spawn(async move { reaper.run(shutdown_rx).await }));

        info!(
            "Worker pool started: {} workers on queue {} using {} runtime",
            size,
            ctx.config.queue_name,
            ctx.executor.runtime_name()
        );

        Self {
            shutdown,
            tasks,
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Stop leasing, let in-flight attempts finish, then return
    pub async fn shutdown(self) {
        info!("Shutting down worker pool");
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                error!("Worker task panicked: {}", e);
            }
        }
        info!("Worker pool stopped");
    }
}
