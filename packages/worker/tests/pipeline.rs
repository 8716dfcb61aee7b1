// ABOUTME: End-to-end worker tests over the in-memory queue, native sandbox and local bus
// ABOUTME: Covers completion, policy denial, cancellation, timeouts and crash recovery

use futures::StreamExt;
use pretty_assertions::assert_eq;
use runhub_channel::{LocalEventBus, Subscription};
use runhub_config::{QueueConfig, RuntimeKind, SandboxConfig, WorkerConfig};
use runhub_core::{
    ErrorCode, Event, EventKind, ExecutionOutcome, JobPayload, JobState, ResourceLimits,
    RuleBasedPolicy, Topic,
};
use runhub_queue::{CancelOutcome, JobQueue, NackOutcome, ReclaimOutcome};
use runhub_sandbox::{NativeRuntime, SandboxExecutor};
use runhub_worker::{AttemptOutcome, LeaseReaper, Worker, WorkerContext};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::time::timeout;

struct Harness {
    queue: JobQueue,
    bus: Arc<LocalEventBus>,
    ctx: WorkerContext,
    _root: TempDir,
}

impl Harness {
    async fn new(visibility_timeout: Duration) -> Self {
        let root = TempDir::new().unwrap();
        std::fs::create_dir_all(root.path().join("ws-1")).unwrap();

        let queue_config = QueueConfig {
            max_attempts: 3,
            visibility_timeout,
            backoff_base: Duration::from_millis(10),
            ..Default::default()
        };
        let queue = JobQueue::in_memory(queue_config).await.unwrap();

        let sandbox_config = SandboxConfig {
            runtime: RuntimeKind::Native,
            allow_native_execution: true,
            workspace_root: root.path().to_path_buf(),
            grace_period: Duration::from_secs(2),
            ..Default::default()
        };
        let executor =
            Arc::new(SandboxExecutor::new(Arc::new(NativeRuntime::new()), sandbox_config).unwrap());

        let bus = Arc::new(LocalEventBus::default());
        let ctx = WorkerContext {
            queue: queue.clone(),
            executor,
            policy: Arc::new(RuleBasedPolicy::new()),
            channel: bus.clone(),
            config: WorkerConfig {
                pool_size: 1,
                visibility_timeout,
                poll_interval: Duration::from_millis(50),
                cancel_poll_interval: Duration::from_millis(50),
                reaper_interval: Duration::from_millis(100),
                ..Default::default()
            },
        };

        Self {
            queue,
            bus,
            ctx,
            _root: root,
        }
    }

    fn worker(&self) -> Worker {
        Worker::new("worker-test", self.ctx.clone())
    }

    /// Enqueue and subscribe before any event can be published
    async fn submit(&self, command: &str) -> (String, Subscription) {
        self.submit_payload(JobPayload::new(command, "ws-1")).await
    }

    async fn submit_payload(&self, payload: JobPayload) -> (String, Subscription) {
        let job_id = self.queue.enqueue_command(payload).await.unwrap();
        let subscription = self.bus.subscribe_local(&Topic::execution(&job_id));
        (job_id, subscription)
    }

    async fn run_next(&self) -> AttemptOutcome {
        let lease = self
            .queue
            .lease("default", self.ctx.config.visibility_timeout)
            .await
            .unwrap()
            .expect("a job to lease");
        self.worker().process(lease).await.unwrap()
    }
}

/// Everything published so far
async fn drain(subscription: &mut Subscription) -> Vec<Event> {
    let mut events = Vec::new();
    while let Ok(Some(event)) = timeout(Duration::from_millis(200), subscription.next()).await {
        events.push(event);
    }
    events
}

fn progress_of(events: &[Event]) -> Vec<u8> {
    events
        .iter()
        .filter_map(|event| match event.kind {
            EventKind::Progress { percent } => Some(percent),
            _ => None,
        })
        .collect()
}

fn terminals(events: &[Event]) -> Vec<&Event> {
    events.iter().filter(|event| event.is_terminal()).collect()
}

fn assert_ordered(events: &[Event]) {
    for pair in events.windows(2) {
        assert!(pair[0].sequence < pair[1].sequence, "events out of order");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_successful_command_reports_progress_and_completion() {
    let harness = Harness::new(Duration::from_secs(30)).await;
    let (job_id, mut subscription) = harness.submit("echo hello").await;

    assert_eq!(
        harness.run_next().await,
        AttemptOutcome::Completed { exit_code: 0 }
    );

    let events = drain(&mut subscription).await;
    assert_ordered(&events);
    assert_eq!(progress_of(&events), vec![10, 30, 70, 100]);

    let output: String = events
        .iter()
        .filter_map(|event| match &event.kind {
            EventKind::Output { content, .. } => Some(content.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(output, "hello\n");

    let last = events.last().unwrap();
    assert!(matches!(last.kind, EventKind::Complete { exit_code: 0, .. }));
    assert_eq!(terminals(&events).len(), 1);

    let job = harness.queue.get(&job_id).await.unwrap();
    assert_eq!(job.state, JobState::Completed);
    assert_eq!(job.attempts, 1);
    assert_eq!(job.progress, 100);

    let executions = harness.queue.list_executions(&job_id).await.unwrap();
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].outcome, ExecutionOutcome::Exited);
    assert_eq!(executions[0].exit_code, Some(0));
    assert_eq!(executions[0].output_bytes, 6);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_nonzero_exit_still_completes() {
    let harness = Harness::new(Duration::from_secs(30)).await;
    let (job_id, mut subscription) = harness.submit("echo broken >&2; exit 3").await;

    assert_eq!(
        harness.run_next().await,
        AttemptOutcome::Completed { exit_code: 3 }
    );

    let events = drain(&mut subscription).await;
    assert!(matches!(
        events.last().unwrap().kind,
        EventKind::Complete { exit_code: 3, .. }
    ));
    assert_eq!(
        harness.queue.get(&job_id).await.unwrap().state,
        JobState::Completed
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_policy_denial_fails_without_retry() {
    let harness = Harness::new(Duration::from_secs(30)).await;
    let (job_id, mut subscription) = harness.submit("rm -rf /").await;

    assert_eq!(harness.run_next().await, AttemptOutcome::PolicyDenied);

    let events = drain(&mut subscription).await;
    let terminal = terminals(&events);
    assert_eq!(terminal.len(), 1);
    match &terminal[0].kind {
        EventKind::Error { code, message } => {
            assert_eq!(*code, ErrorCode::PolicyViolation);
            assert!(message.contains("critical"), "risk level missing: {}", message);
        }
        other => panic!("expected error event, got {:?}", other),
    }
    assert!(!events
        .iter()
        .any(|event| matches!(event.kind, EventKind::Output { .. })));

    let job = harness.queue.get(&job_id).await.unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.attempts, 1);

    let dead = harness.queue.list_dead_letters("default").await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].error_code, ErrorCode::PolicyViolation);

    let executions = harness.queue.list_executions(&job_id).await.unwrap();
    assert_eq!(executions[0].outcome, ExecutionOutcome::PolicyDenied);

    // Nothing left to lease
    assert!(harness
        .queue
        .lease("default", Duration::from_secs(30))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancelling_queued_job_never_runs_it() {
    let harness = Harness::new(Duration::from_secs(30)).await;
    let (job_id, _subscription) = harness.submit("echo never").await;

    assert_eq!(
        harness.queue.cancel(&job_id, "changed my mind").await.unwrap(),
        CancelOutcome::Cancelled
    );
    assert!(harness
        .queue
        .lease("default", Duration::from_secs(30))
        .await
        .unwrap()
        .is_none());
    assert!(harness.queue.list_executions(&job_id).await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancelling_running_job_emits_single_cancelled() {
    let harness = Harness::new(Duration::from_secs(30)).await;
    let (job_id, mut subscription) = harness.submit("echo started; sleep 3").await;

    let lease = harness
        .queue
        .lease("default", Duration::from_secs(30))
        .await
        .unwrap()
        .unwrap();
    let worker = harness.worker();
    let started = Instant::now();
    let running = tokio::spawn(async move { worker.process(lease).await.unwrap() });

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(
        harness.queue.cancel(&job_id, "user requested").await.unwrap(),
        CancelOutcome::Requested
    );

    assert_eq!(running.await.unwrap(), AttemptOutcome::Cancelled);
    // 500ms before the cancel, then the grace bound
    assert!(started.elapsed() < Duration::from_millis(2900));

    let events = drain(&mut subscription).await;
    assert_ordered(&events);
    let terminal = terminals(&events);
    assert_eq!(terminal.len(), 1);
    assert_eq!(
        terminal[0].kind,
        EventKind::Cancelled {
            reason: "user requested".to_string()
        }
    );
    assert!(events.last().unwrap().is_terminal(), "output after cancelled");

    let job = harness.queue.get(&job_id).await.unwrap();
    assert_eq!(job.state, JobState::Cancelled);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_timeout_is_terminal() {
    let harness = Harness::new(Duration::from_secs(30)).await;
    let payload = JobPayload::new("sleep 5", "ws-1").with_limits(ResourceLimits {
        timeout_seconds: 1,
        ..Default::default()
    });
    let (job_id, mut subscription) = harness.submit_payload(payload).await;

    assert_eq!(
        harness.run_next().await,
        AttemptOutcome::Failed(NackOutcome::DeadLettered)
    );

    let events = drain(&mut subscription).await;
    let terminal = terminals(&events);
    assert_eq!(terminal.len(), 1);
    assert!(matches!(
        terminal[0].kind,
        EventKind::Error {
            code: ErrorCode::ExecutionTimeout,
            ..
        }
    ));
    assert_eq!(
        harness.queue.get(&job_id).await.unwrap().state,
        JobState::Failed
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_missing_working_dir_is_not_retried() {
    let harness = Harness::new(Duration::from_secs(30)).await;
    let payload = JobPayload::new("ls", "ws-1").with_working_dir("does-not-exist");
    let (job_id, mut subscription) = harness.submit_payload(payload).await;

    assert_eq!(
        harness.run_next().await,
        AttemptOutcome::Failed(NackOutcome::DeadLettered)
    );

    let events = drain(&mut subscription).await;
    assert!(matches!(
        events.last().unwrap().kind,
        EventKind::Error {
            code: ErrorCode::ValidationError,
            ..
        }
    ));
    assert_eq!(harness.queue.get(&job_id).await.unwrap().attempts, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_crashed_worker_job_is_released_and_retried() {
    let harness = Harness::new(Duration::from_millis(300)).await;
    let (job_id, mut subscription) = harness.submit("echo recovered").await;

    // First worker leases and dies without heartbeating
    let abandoned = harness
        .queue
        .lease("default", Duration::from_millis(300))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(abandoned.attempt(), 1);

    tokio::time::sleep(Duration::from_millis(400)).await;

    assert_eq!(
        harness.run_next().await,
        AttemptOutcome::Completed { exit_code: 0 }
    );

    let job = harness.queue.get(&job_id).await.unwrap();
    assert_eq!(job.attempts, 2);
    assert_eq!(job.state, JobState::Completed);

    let events = drain(&mut subscription).await;
    assert_eq!(terminals(&events).len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_repeated_crashes_dead_letter_with_single_error() {
    let harness = Harness::new(Duration::from_millis(200)).await;
    let (job_id, mut subscription) = harness.submit("echo unlucky").await;

    for attempt in 1..=3 {
        let lease = harness
            .queue
            .lease("default", Duration::from_millis(200))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(lease.attempt(), attempt);
        tokio::time::sleep(Duration::from_millis(300)).await;
    }

    let reaper = LeaseReaper::new(
        harness.queue.clone(),
        harness.bus.clone(),
        Duration::from_millis(100),
    );
    let reclaimed = reaper.reap_once().await.unwrap();
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].outcome, ReclaimOutcome::DeadLettered);

    let job = harness.queue.get(&job_id).await.unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.attempts, 3);

    let events = drain(&mut subscription).await;
    let terminal = terminals(&events);
    assert_eq!(terminal.len(), 1);
    assert!(matches!(
        terminal[0].kind,
        EventKind::Error {
            code: ErrorCode::TransientExecutionError,
            ..
        }
    ));

    // A second sweep finds nothing
    assert!(reaper.reap_once().await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pool_processes_jobs_until_shutdown() {
    let harness = Harness::new(Duration::from_secs(30)).await;
    let (first, _a) = harness.submit("echo one").await;
    let (second, _b) = harness.submit("echo two").await;

    let pool = runhub_worker::WorkerPool::start(harness.ctx.clone()).await;

    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let a = harness.queue.get(&first).await.unwrap().state;
        let b = harness.queue.get(&second).await.unwrap().state;
        if a == JobState::Completed && b == JobState::Completed {
            break;
        }
        assert!(Instant::now() < deadline, "jobs did not complete");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    pool.shutdown().await;
}
