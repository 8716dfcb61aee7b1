// ABOUTME: Integration tests for the job queue lease protocol
// ABOUTME: Covers leasing, heartbeats, retries, dead-lettering, cancellation and crash recovery

use pretty_assertions::assert_eq;
use runhub_config::QueueConfig;
use runhub_core::{ErrorCode, JobPayload, JobState};
use runhub_queue::{
    CancelOutcome, Failure, JobQueue, NackOutcome, QueueError, ReclaimOutcome,
};
use std::time::Duration;

const QUEUE: &str = "default";

/// Helper function to set up an in-memory queue with custom retry settings
async fn setup_queue(max_attempts: u32, backoff_base: Duration) -> JobQueue {
    let config = QueueConfig {
        max_attempts,
        backoff_base,
        ..Default::default()
    };
    JobQueue::in_memory(config)
        .await
        .expect("Failed to create in-memory queue")
}

async fn enqueue_echo(queue: &JobQueue) -> String {
    queue
        .enqueue_command(JobPayload::new("echo hello", "ws-1"))
        .await
        .expect("Failed to enqueue job")
}

/// Test the happy path: enqueue → lease → running → ack
///
/// This test verifies:
/// 1. A queued job can be leased exactly once
/// 2. Lease increments attempts and sets an expiry
/// 3. Ack completes the job and a second ack is discarded
#[tokio::test]
async fn test_lease_and_ack() {
    let queue = setup_queue(3, Duration::from_secs(1)).await;
    let id = enqueue_echo(&queue).await;

    let lease = queue
        .lease(QUEUE, Duration::from_secs(30))
        .await
        .unwrap()
        .expect("job should be visible");
    assert_eq!(lease.job_id(), id);
    assert_eq!(lease.attempt(), 1);
    assert_eq!(lease.job.state, JobState::Leased);
    assert!(lease.job.lease_expires_at.is_some());

    assert!(queue.lease(QUEUE, Duration::from_secs(30)).await.unwrap().is_none());

    queue.mark_running(&lease).await.unwrap();
    queue.update_progress(&lease, 30).await.unwrap();
    assert_eq!(queue.get(&id).await.unwrap().progress, 30);

    assert!(queue.ack(&lease).await.unwrap());
    assert!(!queue.ack(&lease).await.unwrap());

    let job = queue.get(&id).await.unwrap();
    assert_eq!(job.state, JobState::Completed);
    assert_eq!(job.progress, 100);
    assert!(job.finished_at.is_some());
}

/// Concurrent lease calls hand a single job to exactly one caller
#[tokio::test]
async fn test_concurrent_leases_are_exclusive() {
    let queue = setup_queue(3, Duration::from_secs(1)).await;
    enqueue_echo(&queue).await;

    let mut handles = Vec::new();
    for _ in 0..8 {
        let queue = queue.clone();
        handles.push(tokio::spawn(async move {
            queue.lease(QUEUE, Duration::from_secs(30)).await.unwrap()
        }));
    }

    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap().is_some() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
}

/// Jobs are leased oldest first
#[tokio::test]
async fn test_fifo_order() {
    let queue = setup_queue(3, Duration::from_secs(1)).await;
    let first = enqueue_echo(&queue).await;
    let second = enqueue_echo(&queue).await;

    let a = queue.lease(QUEUE, Duration::from_secs(30)).await.unwrap().unwrap();
    let b = queue.lease(QUEUE, Duration::from_secs(30)).await.unwrap().unwrap();
    assert_eq!(a.job_id(), first);
    assert_eq!(b.job_id(), second);
    assert_eq!(queue.queue_depth(QUEUE).await.unwrap(), 0);
}

/// Test crash recovery through lease expiry
///
/// This test verifies:
/// 1. An expired lease makes the job visible again
/// 2. The re-lease increments attempts by exactly one
/// 3. The stale lease can no longer heartbeat or ack
#[tokio::test]
async fn test_expired_lease_is_released_to_next_worker() {
    let queue = setup_queue(3, Duration::from_secs(1)).await;
    let id = enqueue_echo(&queue).await;

    let crashed = queue
        .lease(QUEUE, Duration::from_millis(50))
        .await
        .unwrap()
        .unwrap();
    queue.mark_running(&crashed).await.unwrap();

    tokio::time::sleep(Duration::from_millis(120)).await;

    let retry = queue
        .lease(QUEUE, Duration::from_secs(30))
        .await
        .unwrap()
        .expect("expired job should be re-leased");
    assert_eq!(retry.job_id(), id);
    assert_eq!(retry.attempt(), 2);

    assert!(matches!(
        queue.heartbeat(&crashed, Duration::from_secs(30)).await,
        Err(QueueError::LeaseLost(_))
    ));
    assert!(!queue.ack(&crashed).await.unwrap());
    assert!(queue.ack(&retry).await.unwrap());
}

/// Heartbeats keep a long-running job leased
#[tokio::test]
async fn test_heartbeat_extends_lease() {
    let queue = setup_queue(3, Duration::from_secs(1)).await;
    enqueue_echo(&queue).await;

    let lease = queue
        .lease(QUEUE, Duration::from_millis(100))
        .await
        .unwrap()
        .unwrap();

    for _ in 0..4 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let status = queue.heartbeat(&lease, Duration::from_millis(100)).await.unwrap();
        assert!(status.cancel_reason.is_none());
    }

    assert!(queue.lease(QUEUE, Duration::from_secs(1)).await.unwrap().is_none());
    assert!(queue.reclaim_expired().await.unwrap().is_empty());
}

/// Retryable failures requeue with backoff before the retry becomes visible
#[tokio::test]
async fn test_retryable_nack_applies_backoff() {
    let queue = setup_queue(3, Duration::from_secs(10)).await;
    let id = enqueue_echo(&queue).await;

    let lease = queue.lease(QUEUE, Duration::from_secs(30)).await.unwrap().unwrap();
    let outcome = queue
        .nack(
            &lease,
            Failure::retryable(ErrorCode::TransientExecutionError, "docker hiccup"),
        )
        .await
        .unwrap();

    match outcome {
        NackOutcome::Requeued { attempts, retry_at } => {
            assert_eq!(attempts, 1);
            assert!(retry_at > chrono::Utc::now() + chrono::Duration::seconds(5));
        }
        other => panic!("expected requeue, got {:?}", other),
    }

    let job = queue.get(&id).await.unwrap();
    assert_eq!(job.state, JobState::Queued);
    assert!(job.last_error.unwrap().contains("docker hiccup"));
    assert!(queue.lease(QUEUE, Duration::from_secs(30)).await.unwrap().is_none());
}

/// Retryable failures are dead-lettered once attempts run out
#[tokio::test]
async fn test_retries_exhausted_dead_letters() {
    let queue = setup_queue(2, Duration::from_millis(1)).await;
    let id = enqueue_echo(&queue).await;

    let first = queue.lease(QUEUE, Duration::from_secs(30)).await.unwrap().unwrap();
    let failure = Failure::retryable(ErrorCode::TransientExecutionError, "spawn failed");
    assert!(matches!(
        queue.nack(&first, failure.clone()).await.unwrap(),
        NackOutcome::Requeued { .. }
    ));

    tokio::time::sleep(Duration::from_millis(20)).await;
    let second = queue.lease(QUEUE, Duration::from_secs(30)).await.unwrap().unwrap();
    assert_eq!(second.attempt(), 2);
    assert_eq!(
        queue.nack(&second, failure).await.unwrap(),
        NackOutcome::DeadLettered
    );

    let job = queue.get(&id).await.unwrap();
    assert_eq!(job.state, JobState::Failed);

    let dead = queue.list_dead_letters(QUEUE).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].job_id, id);
    assert_eq!(dead[0].attempts, 2);
    assert_eq!(dead[0].error_code, ErrorCode::TransientExecutionError);
}

/// A policy denial fails terminally on the first attempt
#[tokio::test]
async fn test_terminal_nack_skips_retries() {
    let queue = setup_queue(3, Duration::from_millis(1)).await;
    let id = enqueue_echo(&queue).await;

    let lease = queue.lease(QUEUE, Duration::from_secs(30)).await.unwrap().unwrap();
    let outcome = queue
        .nack(
            &lease,
            Failure::terminal(ErrorCode::PolicyViolation, "recursive removal (risk: critical)"),
        )
        .await
        .unwrap();
    assert_eq!(outcome, NackOutcome::DeadLettered);

    let job = queue.get(&id).await.unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.attempts, 1);
    assert_eq!(
        queue.list_dead_letters(QUEUE).await.unwrap()[0].error_code,
        ErrorCode::PolicyViolation
    );
}

/// Cancelling a queued job never leases it
#[tokio::test]
async fn test_cancel_queued_job() {
    let queue = setup_queue(3, Duration::from_secs(1)).await;
    let id = enqueue_echo(&queue).await;

    assert_eq!(
        queue.cancel(&id, "user changed their mind").await.unwrap(),
        CancelOutcome::Cancelled
    );
    assert!(queue.lease(QUEUE, Duration::from_secs(30)).await.unwrap().is_none());

    let job = queue.get(&id).await.unwrap();
    assert_eq!(job.state, JobState::Cancelled);
    assert_eq!(job.attempts, 0);
    assert_eq!(job.cancel_reason.as_deref(), Some("user changed their mind"));

    assert_eq!(
        queue.cancel(&id, "again").await.unwrap(),
        CancelOutcome::AlreadyTerminal(JobState::Cancelled)
    );
}

/// Cancelling a leased job raises a flag its worker sees on heartbeat
#[tokio::test]
async fn test_cancel_leased_job_sets_flag() {
    let queue = setup_queue(3, Duration::from_secs(1)).await;
    let id = enqueue_echo(&queue).await;
    let lease = queue.lease(QUEUE, Duration::from_secs(30)).await.unwrap().unwrap();
    queue.mark_running(&lease).await.unwrap();

    assert_eq!(
        queue.cancel(&id, "stop").await.unwrap(),
        CancelOutcome::Requested
    );
    assert_eq!(queue.cancel_reason(&id).await.unwrap().as_deref(), Some("stop"));

    let status = queue.heartbeat(&lease, Duration::from_secs(30)).await.unwrap();
    assert_eq!(status.cancel_reason.as_deref(), Some("stop"));

    assert!(queue.finish_cancelled(&lease, "stop").await.unwrap());
    assert!(!queue.ack(&lease).await.unwrap());
    assert_eq!(queue.get(&id).await.unwrap().state, JobState::Cancelled);
}

/// Cancel of an unknown job is reported as not found
#[tokio::test]
async fn test_cancel_unknown_job() {
    let queue = setup_queue(3, Duration::from_secs(1)).await;
    assert!(matches!(
        queue.cancel("job_nope", "x").await,
        Err(QueueError::NotFound(_))
    ));
}

/// Terminal states never change once written
#[tokio::test]
async fn test_terminal_state_is_immutable() {
    let queue = setup_queue(3, Duration::from_secs(1)).await;
    let id = enqueue_echo(&queue).await;
    let lease = queue.lease(QUEUE, Duration::from_secs(30)).await.unwrap().unwrap();
    assert!(queue.ack(&lease).await.unwrap());

    assert_eq!(
        queue.cancel(&id, "late").await.unwrap(),
        CancelOutcome::AlreadyTerminal(JobState::Completed)
    );
    assert_eq!(
        queue
            .nack(&lease, Failure::terminal(ErrorCode::PolicyViolation, "late"))
            .await
            .unwrap(),
        NackOutcome::Superseded
    );
    assert!(!queue.finish_cancelled(&lease, "late").await.unwrap());
    assert!(matches!(
        queue.update_progress(&lease, 50).await,
        Err(QueueError::LeaseLost(_))
    ));
    assert_eq!(queue.get(&id).await.unwrap().state, JobState::Completed);
}

/// Reclaiming expired leases requeues, dead-letters or cancels as appropriate
#[tokio::test]
async fn test_reclaim_expired_outcomes() {
    let queue = setup_queue(1, Duration::from_millis(1)).await;
    let exhausted = enqueue_echo(&queue).await;
    let cancelled = enqueue_echo(&queue).await;

    let a = queue.lease(QUEUE, Duration::from_millis(30)).await.unwrap().unwrap();
    let b = queue.lease(QUEUE, Duration::from_millis(30)).await.unwrap().unwrap();
    assert_eq!(a.job_id(), exhausted);
    assert_eq!(b.job_id(), cancelled);
    assert_eq!(
        queue.cancel(&cancelled, "user").await.unwrap(),
        CancelOutcome::Requested
    );

    tokio::time::sleep(Duration::from_millis(80)).await;

    // Neither job is eligible for a plain re-lease
    assert!(queue.lease(QUEUE, Duration::from_secs(1)).await.unwrap().is_none());

    let mut reclaimed = queue.reclaim_expired().await.unwrap();
    reclaimed.sort_by(|x, y| x.job.id.cmp(&y.job.id));
    assert_eq!(reclaimed.len(), 2);

    for item in &reclaimed {
        if item.job.id == exhausted {
            assert_eq!(item.outcome, ReclaimOutcome::DeadLettered);
            assert_eq!(item.job.state, JobState::Failed);
        } else {
            assert_eq!(item.outcome, ReclaimOutcome::Cancelled);
            assert_eq!(item.job.state, JobState::Cancelled);
        }
    }

    let dead = queue.list_dead_letters(QUEUE).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].job_id, exhausted);

    assert!(queue.reclaim_expired().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_reclaim_requeues_when_attempts_remain() {
    let queue = setup_queue(3, Duration::from_millis(1)).await;
    let id = enqueue_echo(&queue).await;
    queue.lease(QUEUE, Duration::from_millis(30)).await.unwrap().unwrap();

    tokio::time::sleep(Duration::from_millis(80)).await;
    let reclaimed = queue.reclaim_expired().await.unwrap();
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].outcome, ReclaimOutcome::Requeued);

    let job = queue.get(&id).await.unwrap();
    assert_eq!(job.state, JobState::Queued);
    assert_eq!(job.attempts, 1);
    assert!(job.last_error.unwrap().contains("LEASE_EXPIRED"));
}

/// Test repeated worker crashes until the job is dead-lettered
///
/// This test verifies:
/// 1. Each abandoned lease is re-leased with attempts incremented by one
/// 2. After max_attempts abandoned leases the job is dead-lettered, not retried
#[tokio::test]
async fn test_repeated_crashes_dead_letter_after_max_attempts() {
    let queue = setup_queue(3, Duration::from_millis(1)).await;
    let id = enqueue_echo(&queue).await;

    for expected_attempt in 1..=3 {
        let lease = queue
            .lease(QUEUE, Duration::from_millis(30))
            .await
            .unwrap()
            .expect("job should be visible");
        assert_eq!(lease.attempt(), expected_attempt);
        tokio::time::sleep(Duration::from_millis(80)).await;
    }

    assert!(queue.lease(QUEUE, Duration::from_millis(30)).await.unwrap().is_none());

    let reclaimed = queue.reclaim_expired().await.unwrap();
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].outcome, ReclaimOutcome::DeadLettered);
    assert_eq!(reclaimed[0].job.attempts, 3);
    assert_eq!(queue.get(&id).await.unwrap().state, JobState::Failed);
}

/// Listing filters by state
#[tokio::test]
async fn test_list_jobs_by_state() {
    let queue = setup_queue(3, Duration::from_secs(1)).await;
    let a = enqueue_echo(&queue).await;
    let b = enqueue_echo(&queue).await;
    queue.cancel(&b, "x").await.unwrap();

    let queued = queue.list_jobs(QUEUE, Some(JobState::Queued)).await.unwrap();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].id, a);
    assert_eq!(queue.list_jobs(QUEUE, None).await.unwrap().len(), 2);
}
