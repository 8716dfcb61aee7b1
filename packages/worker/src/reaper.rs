// ABOUTME: Periodic recovery of leases abandoned by crashed workers
// ABOUTME: Publishes the terminal event for jobs the reclaim dead-lettered or cancelled

use crate::error::Result;
use crate::publisher::JobEventPublisher;
use runhub_channel::EventChannel;
use runhub_core::{ErrorCode, EventKind};
use runhub_queue::{JobQueue, ReclaimOutcome, Reclaimed};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

pub struct LeaseReaper {
    queue: JobQueue,
    channel: Arc<dyn EventChannel>,
    interval: Duration,
}

impl LeaseReaper {
    pub fn new(queue: JobQueue, channel: Arc<dyn EventChannel>, interval: Duration) -> Self {
        Self {
            queue,
            channel,
            interval,
        }
    }

    /// Reclaim until shutdown. Errors are logged and the next tick retries.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!("Started lease reaper (interval: {:?})", self.interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.reap_once().await {
                        error!("Error during lease reclaim: {}", e);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Lease reaper stopped");
    }

    pub async fn reap_once(&self) -> Result<Vec<Reclaimed>> {
        let reclaimed = self.queue.reclaim_expired().await?;

        for item in &reclaimed {
            // The dead worker may have published up to its attempt; sort after it
            let attempt = item.job.attempts.saturating_add(1);
            let mut publisher = JobEventPublisher::for_job(self.channel.clone(), &item.job.id, attempt);

            match item.outcome {
                ReclaimOutcome::DeadLettered => {
                    let message = format!(
                        "worker stopped responding; giving up after {} attempts",
                        item.job.attempts
                    );
                    publisher
                        .error(ErrorCode::TransientExecutionError, message)
                        .await;
                }
                ReclaimOutcome::Cancelled => {
                    let reason = item
                        .job
                        .cancel_reason
                        .clone()
                        .unwrap_or_else(|| "cancelled".to_string());
                    publisher.publish(EventKind::Cancelled { reason }).await;
                }
                ReclaimOutcome::Requeued => {}
            }
        }

        if !reclaimed.is_empty() {
            info!("Reclaimed {} expired leases", reclaimed.len());
        }
        Ok(reclaimed)
    }
}
