// ABOUTME: Worker that leases jobs and runs each attempt through policy, sandbox and channel
// ABOUTME: Maps every attempt to exactly one queue outcome and at most one terminal event

use crate::error::Result;
use crate::publisher::JobEventPublisher;
use futures::StreamExt;
use runhub_channel::EventChannel;
use runhub_config::WorkerConfig;
use runhub_core::{
    ErrorCode, EventKind, Execution, ExecutionOutcome, PolicyContext, PolicyEngine,
};
use runhub_queue::{Failure, JobQueue, Lease, NackOutcome, QueueError};
use runhub_sandbox::{CancelReason, ExecutionEvent, RunRequest, SandboxExecutor};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// How one attempt ended, from this worker's point of view
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    Completed { exit_code: i64 },
    Cancelled,
    PolicyDenied,
    Failed(NackOutcome),
    /// Another writer owns the job now; nothing was published
    LeaseLost,
}

/// Collaborators shared by every worker in a pool
#[derive(Clone)]
pub struct WorkerContext {
    pub queue: JobQueue,
    pub executor: Arc<SandboxExecutor>,
    pub policy: Arc<dyn PolicyEngine>,
    pub channel: Arc<dyn EventChannel>,
    pub config: WorkerConfig,
}

pub struct Worker {
    id: String,
    ctx: WorkerContext,
}

impl Worker {
    pub fn new(id: impl Into<String>, ctx: WorkerContext) -> Self {
        Self { id: id.into(), ctx }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Lease and process jobs until shutdown. A job in progress is finished first.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(worker_id = %self.id, queue = %self.ctx.config.queue_name, "Worker started");

        while !*shutdown.borrow() {
            let leased = self
                .ctx
                .queue
                .lease(&self.ctx.config.queue_name, self.ctx.config.visibility_timeout)
                .await;

            match leased {
                Ok(Some(lease)) => {
                    let job_id = lease.job_id().to_string();
                    match self.process(lease).await {
                        Ok(outcome) => {
                            info!(worker_id = %self.id, job_id = %job_id, outcome = ?outcome, "Attempt finished")
                        }
                        Err(e) => {
                            error!(worker_id = %self.id, job_id = %job_id, "Attempt aborted: {}", e)
                        }
                    }
                }
                Ok(None) => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.ctx.config.poll_interval) => {}
                        _ = shutdown.changed() => {}
                    }
                }
                Err(e) => {
                    error!(worker_id = %self.id, "Failed to lease job: {}", e);
                    tokio::time::sleep(self.ctx.config.poll_interval).await;
                }
            }
        }

        info!(worker_id = %self.id, "Worker stopped");
    }

    /// Run one leased attempt to its outcome
    pub async fn process(&self, lease: Lease) -> Result<AttemptOutcome> {
        let job_id = lease.job_id().to_string();
        let attempt = lease.attempt();
        let payload = lease.job.payload.clone();
        let mut publisher = JobEventPublisher::for_job(self.ctx.channel.clone(), &job_id, attempt);

        info!(worker_id = %self.id, job_id = %job_id, attempt = attempt, "Processing job");

        if !self.progress(&lease, &mut publisher, 10).await? {
            return Ok(AttemptOutcome::LeaseLost);
        }

        let context = PolicyContext {
            job_id: job_id.clone(),
            workspace_id: payload.workspace_id.clone(),
            user_id: payload.user_id.clone(),
            working_dir: payload.working_dir.clone(),
        };
        let decision = self.ctx.policy.check(&payload.command, &context).await;
        let mut execution = Execution::start(&job_id, attempt, &self.id, decision.risk_level);

        if !decision.is_allowed() {
            let reason = decision
                .reason
                .unwrap_or_else(|| "command denied by policy".to_string());
            warn!(
                audit = true,
                job_id = %job_id,
                risk_level = %decision.risk_level,
                "Policy denied command: {}",
                reason
            );
            execution.finish(ExecutionOutcome::PolicyDenied, None);
            self.archive(&execution).await;

            let message = format!("{} (risk level: {})", reason, decision.risk_level);
            let failure = Failure::terminal(ErrorCode::PolicyViolation, message);
            return match self.fail(&lease, &mut publisher, failure).await? {
                AttemptOutcome::Failed(NackOutcome::DeadLettered) => Ok(AttemptOutcome::PolicyDenied),
                other => Ok(other),
            };
        }

        if let Err(e) = self.ctx.queue.mark_running(&lease).await {
            return lease_lost_or(e);
        }
        if !self.progress(&lease, &mut publisher, 30).await? {
            return Ok(AttemptOutcome::LeaseLost);
        }

        let request = RunRequest::new(
            execution.id.clone(),
            payload.command.clone(),
            Path::new(&payload.workspace_id).join(&payload.working_dir),
        )
        .with_env(payload.env.clone());
        let request = match payload.limits.clone() {
            Some(limits) => request.with_limits(limits),
            None => request,
        };

        let mut handle = match self.ctx.executor.launch(request).await {
            Ok(handle) => handle,
            Err(e) => {
                warn!(job_id = %job_id, attempt = attempt, "Sandbox launch failed: {}", e);
                execution.finish(ExecutionOutcome::Failed, None);
                self.archive(&execution).await;

                let failure = if e.is_retryable() {
                    Failure::retryable(ErrorCode::TransientExecutionError, e.to_string())
                } else {
                    Failure::terminal(ErrorCode::ValidationError, e.to_string())
                };
                return self.fail(&lease, &mut publisher, failure).await;
            }
        };

        let canceller = handle.canceller();
        let heartbeat_every = self.ctx.config.heartbeat_interval();
        let cancel_poll_every = self.ctx.config.cancel_poll_interval;
        let mut heartbeat = interval_at(Instant::now() + heartbeat_every, heartbeat_every);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut cancel_poll = interval_at(Instant::now() + cancel_poll_every, cancel_poll_every);
        cancel_poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut lease_lost = false;

        let terminal = loop {
            tokio::select! {
                event = handle.next() => match event {
                    Some(ExecutionEvent::Output(chunk)) => {
                        execution.record_output(chunk.data.len());
                        if !lease_lost {
                            publisher
                                .publish(EventKind::Output {
                                    stream: chunk.stream,
                                    content: chunk.text(),
                                })
                                .await;
                        }
                    }
                    other => break other,
                },
                _ = heartbeat.tick(), if !lease_lost => {
                    match self.ctx.queue.heartbeat(&lease, self.ctx.config.visibility_timeout).await {
                        Ok(status) => {
                            if let Some(reason) = status.cancel_reason {
                                if canceller.cancel(CancelReason::Requested(reason)) {
                                    info!(job_id = %job_id, "Cancellation requested, stopping sandbox");
                                }
                            }
                        }
                        Err(QueueError::LeaseLost(_)) => {
                            warn!(job_id = %job_id, attempt = attempt, "Lease lost, stopping sandbox");
                            lease_lost = true;
                            canceller.cancel(CancelReason::Requested("lease lost".to_string()));
                        }
                        Err(e) => warn!(job_id = %job_id, "Heartbeat failed: {}", e),
                    }
                }
                _ = cancel_poll.tick(), if !lease_lost => {
                    match self.ctx.queue.cancel_reason(&job_id).await {
                        Ok(Some(reason)) => {
                            if canceller.cancel(CancelReason::Requested(reason)) {
                                info!(job_id = %job_id, "Cancellation requested, stopping sandbox");
                            }
                        }
                        Ok(None) => {}
                        Err(e) => debug!(job_id = %job_id, "Cancel poll failed: {}", e),
                    }
                }
            }
        };

        if lease_lost {
            execution.finish(ExecutionOutcome::LeaseLost, None);
            self.archive(&execution).await;
            return Ok(AttemptOutcome::LeaseLost);
        }

        match terminal {
            Some(ExecutionEvent::Exited { exit_code }) => {
                execution.finish(ExecutionOutcome::Exited, Some(exit_code));
                self.archive(&execution).await;
                self.complete(&lease, &mut publisher, exit_code, execution.duration_ms())
                    .await
            }
            Some(ExecutionEvent::Cancelled {
                reason: CancelReason::Requested(reason),
            }) => {
                execution.finish(ExecutionOutcome::Cancelled, None);
                self.archive(&execution).await;
                match self.ctx.queue.finish_cancelled(&lease, &reason).await {
                    Ok(true) => {
                        info!(job_id = %job_id, "Job cancelled: {}", reason);
                        publisher.publish(EventKind::Cancelled { reason }).await;
                        Ok(AttemptOutcome::Cancelled)
                    }
                    Ok(false) => Ok(AttemptOutcome::LeaseLost),
                    Err(e) => lease_lost_or(e),
                }
            }
            Some(ExecutionEvent::Cancelled {
                reason: CancelReason::Timeout { seconds },
            }) => {
                execution.finish(ExecutionOutcome::TimedOut, None);
                self.archive(&execution).await;
                let failure = Failure::terminal(
                    ErrorCode::ExecutionTimeout,
                    format!("command exceeded its {} second time limit", seconds),
                );
                self.fail(&lease, &mut publisher, failure).await
            }
            Some(ExecutionEvent::Failed { message }) => {
                execution.finish(ExecutionOutcome::Failed, None);
                self.archive(&execution).await;
                let failure = Failure::retryable(ErrorCode::TransientExecutionError, message);
                self.fail(&lease, &mut publisher, failure).await
            }
            Some(ExecutionEvent::Output(_)) | None => {
                execution.finish(ExecutionOutcome::Failed, None);
                self.archive(&execution).await;
                let failure = Failure::retryable(
                    ErrorCode::TransientExecutionError,
                    "sandbox stream ended without an exit status",
                );
                self.fail(&lease, &mut publisher, failure).await
            }
        }
    }

    async fn complete(
        &self,
        lease: &Lease,
        publisher: &mut JobEventPublisher,
        exit_code: i64,
        duration_ms: u64,
    ) -> Result<AttemptOutcome> {
        if !self.progress(lease, publisher, 70).await? {
            return Ok(AttemptOutcome::LeaseLost);
        }

        // First writer wins against a concurrent cancel or reclaim
        match self.ctx.queue.ack(lease).await {
            Ok(true) => {
                publisher.progress(100).await;
                publisher
                    .publish(EventKind::Complete {
                        exit_code,
                        duration_ms,
                    })
                    .await;
                Ok(AttemptOutcome::Completed { exit_code })
            }
            Ok(false) => Ok(AttemptOutcome::LeaseLost),
            Err(e) => lease_lost_or(e),
        }
    }

    /// Nack the attempt and publish the terminal error only once nothing will retry it
    async fn fail(
        &self,
        lease: &Lease,
        publisher: &mut JobEventPublisher,
        failure: Failure,
    ) -> Result<AttemptOutcome> {
        let code = failure.code;
        let message = failure.message.clone();

        let outcome = match self.ctx.queue.nack(lease, failure).await {
            Ok(outcome) => outcome,
            Err(e) => return lease_lost_or(e),
        };

        match &outcome {
            NackOutcome::DeadLettered => {
                publisher.error(code, message).await;
            }
            NackOutcome::Requeued { attempts, retry_at } => {
                info!(
                    job_id = %lease.job_id(),
                    attempt = *attempts,
                    retry_at = %retry_at,
                    "Attempt failed with {}, will retry",
                    code
                );
            }
            NackOutcome::Superseded => return Ok(AttemptOutcome::LeaseLost),
        }
        Ok(AttemptOutcome::Failed(outcome))
    }

    /// Record progress and publish it. Returns false when the lease is gone.
    async fn progress(
        &self,
        lease: &Lease,
        publisher: &mut JobEventPublisher,
        percent: u8,
    ) -> Result<bool> {
        match self.ctx.queue.update_progress(lease, percent).await {
            Ok(()) => {
                publisher.progress(percent).await;
                Ok(true)
            }
            Err(QueueError::LeaseLost(_)) => {
                warn!(job_id = %lease.job_id(), "Lease lost before progress {}", percent);
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn archive(&self, execution: &Execution) {
        if let Err(e) = self.ctx.queue.archive_execution(execution).await {
            warn!(
                job_id = %execution.job_id,
                execution_id = %execution.id,
                "Failed to archive execution: {}",
                e
            );
        }
    }
}

fn lease_lost_or(error: QueueError) -> Result<AttemptOutcome> {
    match error {
        QueueError::LeaseLost(_) => Ok(AttemptOutcome::LeaseLost),
        other => Err(other.into()),
    }
}
