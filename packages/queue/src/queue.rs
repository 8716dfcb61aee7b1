// ABOUTME: SQLite-backed job queue implementing the lease protocol
// ABOUTME: Every state transition is a single conditional write so concurrent workers never need a lock

use crate::error::{QueueError, Result};
use crate::retry::RetryPolicy;
use chrono::{DateTime, Utc};
use runhub_config::QueueConfig;
use runhub_core::{
    generate_job_id, ErrorCode, Execution, ExecutionOutcome, Job, JobPayload, JobState, RiskLevel,
    COMMAND_JOB_TYPE,
};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

/// A job submission with explicit queue placement
#[derive(Debug, Clone)]
pub struct NewJob {
    pub queue: String,
    pub job_type: String,
    pub payload: JobPayload,
    pub max_attempts: u32,
}

/// Temporary ownership of a job. Only the holder of `token` may mutate it.
#[derive(Debug, Clone)]
pub struct Lease {
    pub job: Job,
    pub token: String,
}

impl Lease {
    pub fn job_id(&self) -> &str {
        &self.job.id
    }

    /// 1-based attempt number this lease represents
    pub fn attempt(&self) -> u32 {
        self.job.attempts
    }
}

/// Result of a successful heartbeat
#[derive(Debug, Clone, PartialEq)]
pub struct LeaseStatus {
    pub lease_expires_at: DateTime<Utc>,
    pub cancel_reason: Option<String>,
}

/// Why an attempt failed
#[derive(Debug, Clone, PartialEq)]
pub struct Failure {
    pub retryable: bool,
    pub code: ErrorCode,
    pub message: String,
}

impl Failure {
    pub fn retryable(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            retryable: true,
            code,
            message: message.into(),
        }
    }

    pub fn terminal(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            retryable: false,
            code,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum NackOutcome {
    /// Back in the queue, visible again at `retry_at`
    Requeued {
        attempts: u32,
        retry_at: DateTime<Utc>,
    },
    /// Terminal failure recorded in the dead-letter table
    DeadLettered,
    /// The lease no longer owned the job; nothing was written
    Superseded,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CancelOutcome {
    /// The job was still queued and will never run
    Cancelled,
    /// The job is leased; its worker will observe the flag
    Requested,
    AlreadyTerminal(JobState),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReclaimOutcome {
    Requeued,
    DeadLettered,
    Cancelled,
}

/// A job recovered from an abandoned lease
#[derive(Debug, Clone)]
pub struct Reclaimed {
    pub job: Job,
    pub outcome: ReclaimOutcome,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetter {
    pub job_id: String,
    pub queue: String,
    pub attempts: u32,
    pub error_code: ErrorCode,
    pub message: String,
    pub dead_lettered_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct JobQueue {
    pool: SqlitePool,
    config: QueueConfig,
    retry: RetryPolicy,
}

const LEASED_STATES: &str = "('leased', 'running')";

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn ms_to_datetime(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .ok_or_else(|| QueueError::CorruptRow(format!("timestamp out of range: {}", ms)))
}

fn duration_ms(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

impl JobQueue {
    pub fn new(pool: SqlitePool, config: QueueConfig) -> Self {
        let retry = RetryPolicy::from_config(&config);
        Self {
            pool,
            config,
            retry,
        }
    }

    /// Open (creating if needed) a database file and run migrations
    pub async fn connect(url: &str, config: QueueConfig) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;

        let queue = Self::new(pool, config);
        queue.migrate().await?;
        info!("Job queue ready at {}", url);
        Ok(queue)
    }

    /// A private in-memory queue; a single pinned connection keeps the schema alive
    pub async fn in_memory(config: QueueConfig) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        let queue = Self::new(pool, config);
        queue.migrate().await?;
        Ok(queue)
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Enqueue a job on the default queue
    pub async fn enqueue(&self, job_type: &str, payload: JobPayload) -> Result<String> {
        self.enqueue_job(NewJob {
            queue: self.config.queue_name.clone(),
            job_type: job_type.to_string(),
            payload,
            max_attempts: self.config.max_attempts,
        })
        .await
    }

    /// Enqueue a command job on the default queue
    pub async fn enqueue_command(&self, payload: JobPayload) -> Result<String> {
        self.enqueue(COMMAND_JOB_TYPE, payload).await
    }

    pub async fn enqueue_job(&self, job: NewJob) -> Result<String> {
        job.payload.validate()?;

        let id = generate_job_id();
        let now = now_ms();
        let payload = serde_json::to_string(&job.payload)?;

        sqlx::query(
            r#"
            INSERT INTO jobs (
                id, queue, job_type, payload, state, attempts, max_attempts,
                progress, created_at, available_at, updated_at
            )
            VALUES (?, ?, ?, ?, 'queued', 0, ?, 0, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&job.queue)
        .bind(&job.job_type)
        .bind(&payload)
        .bind(i64::from(job.max_attempts.max(1)))
        .bind(now)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        info!("Enqueued job {} on queue {}", id, job.queue);
        Ok(id)
    }

    /// Atomically lease the oldest visible job.
    ///
    /// Visible means queued and past its backoff, or holding an expired lease
    /// that still has attempts left and no pending cancel. Exhausted or
    /// cancelled expired leases are left to `reclaim_expired`.
    pub async fn lease(&self, queue: &str, visibility_timeout: Duration) -> Result<Option<Lease>> {
        let now = now_ms();
        let token = uuid::Uuid::new_v4().to_string();
        let expires_at = now.saturating_add(duration_ms(visibility_timeout));

        let row = sqlx::query(&format!(
            r#"
            UPDATE jobs
            SET state = 'leased',
                attempts = attempts + 1,
                progress = 0,
                lease_token = ?1,
                lease_expires_at = ?2,
                updated_at = ?3
            WHERE id = (
                SELECT id FROM jobs
                WHERE queue = ?4
                  AND (
                    (state = 'queued' AND available_at <= ?3)
                    OR (
                        state IN {leased}
                        AND lease_expires_at <= ?3
                        AND attempts < max_attempts
                        AND cancel_reason IS NULL
                    )
                  )
                ORDER BY available_at ASC, created_at ASC, rowid ASC
                LIMIT 1
            )
            RETURNING *
            "#,
            leased = LEASED_STATES
        ))
        .bind(&token)
        .bind(expires_at)
        .bind(now)
        .bind(queue)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let job = row_to_job(&row)?;
                if job.attempts > 1 {
                    warn!(
                        job_id = %job.id,
                        attempt = job.attempts,
                        "Re-leasing job after a failed or abandoned attempt"
                    );
                } else {
                    debug!(job_id = %job.id, "Leased job");
                }
                Ok(Some(Lease { job, token }))
            }
            None => Ok(None),
        }
    }

    /// Move a leased job to running
    pub async fn mark_running(&self, lease: &Lease) -> Result<()> {
        let result = sqlx::query(&format!(
            "UPDATE jobs SET state = 'running', updated_at = ? \
             WHERE id = ? AND lease_token = ? AND state IN {}",
            LEASED_STATES
        ))
        .bind(now_ms())
        .bind(lease.job_id())
        .bind(&lease.token)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(QueueError::LeaseLost(lease.job_id().to_string()));
        }
        Ok(())
    }

    /// Extend the lease and report any pending cancellation
    pub async fn heartbeat(&self, lease: &Lease, visibility_timeout: Duration) -> Result<LeaseStatus> {
        let now = now_ms();
        let expires_at = now.saturating_add(duration_ms(visibility_timeout));

        let row = sqlx::query(&format!(
            "UPDATE jobs SET lease_expires_at = ?, updated_at = ? \
             WHERE id = ? AND lease_token = ? AND state IN {} \
             RETURNING lease_expires_at, cancel_reason",
            LEASED_STATES
        ))
        .bind(expires_at)
        .bind(now)
        .bind(lease.job_id())
        .bind(&lease.token)
        .fetch_optional(&self.pool)
        .await?;

        let row = row.ok_or_else(|| QueueError::LeaseLost(lease.job_id().to_string()))?;
        Ok(LeaseStatus {
            lease_expires_at: ms_to_datetime(row.get("lease_expires_at"))?,
            cancel_reason: row.get("cancel_reason"),
        })
    }

    pub async fn update_progress(&self, lease: &Lease, percent: u8) -> Result<()> {
        let result = sqlx::query(&format!(
            "UPDATE jobs SET progress = ?, updated_at = ? \
             WHERE id = ? AND lease_token = ? AND state IN {}",
            LEASED_STATES
        ))
        .bind(i64::from(percent.min(100)))
        .bind(now_ms())
        .bind(lease.job_id())
        .bind(&lease.token)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(QueueError::LeaseLost(lease.job_id().to_string()));
        }
        Ok(())
    }

    /// Cancellation reason, if one has been requested
    pub async fn cancel_reason(&self, job_id: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT cancel_reason FROM jobs WHERE id = ?")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(row.get("cancel_reason")),
            None => Err(QueueError::NotFound(job_id.to_string())),
        }
    }

    /// Mark completed. Returns false when another writer already decided the outcome.
    pub async fn ack(&self, lease: &Lease) -> Result<bool> {
        let now = now_ms();
        let result = sqlx::query(&format!(
            "UPDATE jobs SET state = 'completed', progress = 100, lease_token = NULL, \
             lease_expires_at = NULL, finished_at = ?, updated_at = ? \
             WHERE id = ? AND lease_token = ? AND state IN {}",
            LEASED_STATES
        ))
        .bind(now)
        .bind(now)
        .bind(lease.job_id())
        .bind(&lease.token)
        .execute(&self.pool)
        .await?;

        let won = result.rows_affected() == 1;
        if won {
            info!(job_id = %lease.job_id(), attempt = lease.attempt(), "Job completed");
        } else {
            warn!(job_id = %lease.job_id(), "Ack discarded, lease no longer owns the job");
        }
        Ok(won)
    }

    /// Mark cancelled after the worker stopped the sandbox
    pub async fn finish_cancelled(&self, lease: &Lease, reason: &str) -> Result<bool> {
        let now = now_ms();
        let result = sqlx::query(&format!(
            "UPDATE jobs SET state = 'cancelled', cancel_reason = COALESCE(cancel_reason, ?), \
             lease_token = NULL, lease_expires_at = NULL, finished_at = ?, updated_at = ? \
             WHERE id = ? AND lease_token = ? AND state IN {}",
            LEASED_STATES
        ))
        .bind(reason)
        .bind(now)
        .bind(now)
        .bind(lease.job_id())
        .bind(&lease.token)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Report a failed attempt.
    ///
    /// Retryable failures with attempts left are requeued after backoff;
    /// everything else is dead-lettered.
    pub async fn nack(&self, lease: &Lease, failure: Failure) -> Result<NackOutcome> {
        let now = now_ms();
        let attempts = lease.attempt();

        if failure.retryable && attempts < lease.job.max_attempts {
            let delay = self.retry.delay_for(attempts);
            let retry_at = now.saturating_add(duration_ms(delay));

            let result = sqlx::query(&format!(
                "UPDATE jobs SET state = 'queued', lease_token = NULL, lease_expires_at = NULL, \
                 available_at = ?, last_error = ?, updated_at = ? \
                 WHERE id = ? AND lease_token = ? AND state IN {}",
                LEASED_STATES
            ))
            .bind(retry_at)
            .bind(format!("{}: {}", failure.code, failure.message))
            .bind(now)
            .bind(lease.job_id())
            .bind(&lease.token)
            .execute(&self.pool)
            .await?;

            if result.rows_affected() == 0 {
                return Ok(NackOutcome::Superseded);
            }

            info!(
                job_id = %lease.job_id(),
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                "Requeued job after {}",
                failure.code
            );
            return Ok(NackOutcome::Requeued {
                attempts,
                retry_at: ms_to_datetime(retry_at)?,
            });
        }

        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(&format!(
            "UPDATE jobs SET state = 'failed', lease_token = NULL, lease_expires_at = NULL, \
             last_error = ?, finished_at = ?, updated_at = ? \
             WHERE id = ? AND lease_token = ? AND state IN {}",
            LEASED_STATES
        ))
        .bind(format!("{}: {}", failure.code, failure.message))
        .bind(now)
        .bind(now)
        .bind(lease.job_id())
        .bind(&lease.token)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(NackOutcome::Superseded);
        }

        insert_dead_letter(&mut tx, &lease.job, attempts, failure.code, &failure.message, now)
            .await?;
        tx.commit().await?;

        warn!(
            job_id = %lease.job_id(),
            attempt = attempts,
            code = %failure.code,
            "Job dead-lettered: {}",
            failure.message
        );
        Ok(NackOutcome::DeadLettered)
    }

    /// Cancel a job. Queued jobs are cancelled outright; leased jobs get a flag
    /// their worker observes.
    pub async fn cancel(&self, job_id: &str, reason: &str) -> Result<CancelOutcome> {
        // A job can move between queued and leased while we look at it
        for _ in 0..3 {
            let now = now_ms();
            let result = sqlx::query(
                "UPDATE jobs SET state = 'cancelled', cancel_reason = ?, finished_at = ?, \
                 updated_at = ? WHERE id = ? AND state = 'queued'",
            )
            .bind(reason)
            .bind(now)
            .bind(now)
            .bind(job_id)
            .execute(&self.pool)
            .await?;

            if result.rows_affected() == 1 {
                info!(job_id = %job_id, "Cancelled queued job before execution");
                return Ok(CancelOutcome::Cancelled);
            }

            let result = sqlx::query(&format!(
                "UPDATE jobs SET cancel_reason = COALESCE(cancel_reason, ?), updated_at = ? \
                 WHERE id = ? AND state IN {}",
                LEASED_STATES
            ))
            .bind(reason)
            .bind(now)
            .bind(job_id)
            .execute(&self.pool)
            .await?;

            if result.rows_affected() == 1 {
                info!(job_id = %job_id, "Cancellation requested for leased job");
                return Ok(CancelOutcome::Requested);
            }

            let job = self.get(job_id).await?;
            if job.state.is_terminal() {
                return Ok(CancelOutcome::AlreadyTerminal(job.state));
            }
        }

        Err(QueueError::LeaseLost(job_id.to_string()))
    }

    /// Recover jobs whose lease expired without a heartbeat.
    ///
    /// Jobs with attempts left are requeued, exhausted jobs are dead-lettered and
    /// jobs with a pending cancel are cancelled. Callers publish the terminal
    /// event for the latter two.
    pub async fn reclaim_expired(&self) -> Result<Vec<Reclaimed>> {
        let now = now_ms();
        let rows = sqlx::query(&format!(
            "SELECT * FROM jobs WHERE state IN {} AND lease_expires_at <= ? \
             ORDER BY lease_expires_at ASC",
            LEASED_STATES
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        let mut reclaimed = Vec::new();
        for row in rows {
            let token: Option<String> = row.get("lease_token");
            let job = row_to_job(&row)?;
            let Some(token) = token else { continue };

            let outcome = if job.cancel_reason.is_some() {
                let result = sqlx::query(&format!(
                    "UPDATE jobs SET state = 'cancelled', lease_token = NULL, \
                     lease_expires_at = NULL, finished_at = ?, updated_at = ? \
                     WHERE id = ? AND lease_token = ? AND lease_expires_at <= ? AND state IN {}",
                    LEASED_STATES
                ))
                .bind(now)
                .bind(now)
                .bind(&job.id)
                .bind(&token)
                .bind(now)
                .execute(&self.pool)
                .await?;
                (result.rows_affected() == 1).then_some(ReclaimOutcome::Cancelled)
            } else if job.attempts >= job.max_attempts {
                let message = format!("lease expired after {} attempts", job.attempts);
                let mut tx = self.pool.begin().await?;
                let result = sqlx::query(&format!(
                    "UPDATE jobs SET state = 'failed', lease_token = NULL, \
                     lease_expires_at = NULL, last_error = ?, finished_at = ?, updated_at = ? \
                     WHERE id = ? AND lease_token = ? AND lease_expires_at <= ? AND state IN {}",
                    LEASED_STATES
                ))
                .bind(format!("{}: {}", ErrorCode::LeaseExpired, message))
                .bind(now)
                .bind(now)
                .bind(&job.id)
                .bind(&token)
                .bind(now)
                .execute(&mut *tx)
                .await?;

                if result.rows_affected() == 1 {
                    insert_dead_letter(
                        &mut tx,
                        &job,
                        job.attempts,
                        ErrorCode::TransientExecutionError,
                        &message,
                        now,
                    )
                    .await?;
                    tx.commit().await?;
                    Some(ReclaimOutcome::DeadLettered)
                } else {
                    tx.rollback().await?;
                    None
                }
            } else {
                let result = sqlx::query(&format!(
                    "UPDATE jobs SET state = 'queued', lease_token = NULL, \
                     lease_expires_at = NULL, available_at = ?, last_error = ?, updated_at = ? \
                     WHERE id = ? AND lease_token = ? AND lease_expires_at <= ? AND state IN {}",
                    LEASED_STATES
                ))
                .bind(now)
                .bind(format!("{}: attempt {} abandoned", ErrorCode::LeaseExpired, job.attempts))
                .bind(now)
                .bind(&job.id)
                .bind(&token)
                .bind(now)
                .execute(&self.pool)
                .await?;
                (result.rows_affected() == 1).then_some(ReclaimOutcome::Requeued)
            };

            if let Some(outcome) = outcome {
                warn!(
                    job_id = %job.id,
                    attempt = job.attempts,
                    outcome = ?outcome,
                    "Reclaimed expired lease"
                );
                let job = self.get(&job.id).await?;
                reclaimed.push(Reclaimed { job, outcome });
            }
        }

        Ok(reclaimed)
    }

    pub async fn get(&self, job_id: &str) -> Result<Job> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| QueueError::NotFound(job_id.to_string()))?;

        row_to_job(&row)
    }

    pub async fn list_jobs(&self, queue: &str, state: Option<JobState>) -> Result<Vec<Job>> {
        let rows = match state {
            Some(state) => {
                sqlx::query("SELECT * FROM jobs WHERE queue = ? AND state = ? ORDER BY created_at ASC, rowid ASC")
                    .bind(queue)
                    .bind(state.as_str())
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query("SELECT * FROM jobs WHERE queue = ? ORDER BY created_at ASC, rowid ASC")
                    .bind(queue)
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        rows.iter().map(row_to_job).collect()
    }

    /// Number of queued jobs waiting for a worker
    pub async fn queue_depth(&self, queue: &str) -> Result<u64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE queue = ? AND state = 'queued'")
                .bind(queue)
                .fetch_one(&self.pool)
                .await?;
        Ok(count.max(0) as u64)
    }

    pub async fn list_dead_letters(&self, queue: &str) -> Result<Vec<DeadLetter>> {
        let rows = sqlx::query(
            "SELECT * FROM dead_letters WHERE queue = ? ORDER BY dead_lettered_at ASC",
        )
        .bind(queue)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let code: String = row.get("error_code");
                Ok(DeadLetter {
                    job_id: row.get("job_id"),
                    queue: row.get("queue"),
                    attempts: row.get::<i64, _>("attempts").max(0) as u32,
                    error_code: ErrorCode::from_str(&code)
                        .ok_or_else(|| QueueError::CorruptRow(format!("error code {}", code)))?,
                    message: row.get("message"),
                    dead_lettered_at: ms_to_datetime(row.get("dead_lettered_at"))?,
                })
            })
            .collect()
    }

    /// Store a finished execution attempt
    pub async fn archive_execution(&self, execution: &Execution) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO executions (
                id, job_id, attempt, worker_id, started_at, completed_at,
                exit_code, output_bytes, risk_level, outcome
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&execution.id)
        .bind(&execution.job_id)
        .bind(i64::from(execution.attempt))
        .bind(&execution.worker_id)
        .bind(execution.started_at.timestamp_millis())
        .bind(execution.completed_at.map(|t| t.timestamp_millis()))
        .bind(execution.exit_code)
        .bind(i64::try_from(execution.output_bytes).unwrap_or(i64::MAX))
        .bind(execution.risk_level.as_str())
        .bind(execution.outcome.as_str())
        .execute(&self.pool)
        .await?;

        debug!(
            execution_id = %execution.id,
            job_id = %execution.job_id,
            outcome = execution.outcome.as_str(),
            "Archived execution"
        );
        Ok(())
    }

    pub async fn list_executions(&self, job_id: &str) -> Result<Vec<Execution>> {
        let rows = sqlx::query("SELECT * FROM executions WHERE job_id = ? ORDER BY attempt ASC")
            .bind(job_id)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(row_to_execution).collect()
    }
}

async fn insert_dead_letter(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    job: &Job,
    attempts: u32,
    code: ErrorCode,
    message: &str,
    now: i64,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT OR REPLACE INTO dead_letters (job_id, queue, attempts, error_code, message, dead_lettered_at)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&job.id)
    .bind(&job.queue)
    .bind(i64::from(attempts))
    .bind(code.as_str())
    .bind(message)
    .bind(now)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

fn row_to_job(row: &SqliteRow) -> Result<Job> {
    let state: String = row.get("state");
    let payload: String = row.get("payload");
    let lease_expires_at: Option<i64> = row.get("lease_expires_at");
    let finished_at: Option<i64> = row.get("finished_at");

    Ok(Job {
        id: row.get("id"),
        queue: row.get("queue"),
        job_type: row.get("job_type"),
        payload: serde_json::from_str(&payload)?,
        state: JobState::from_str(&state)
            .ok_or_else(|| QueueError::CorruptRow(format!("unknown state {}", state)))?,
        attempts: row.get::<i64, _>("attempts").max(0) as u32,
        max_attempts: row.get::<i64, _>("max_attempts").max(1) as u32,
        progress: row.get::<i64, _>("progress").clamp(0, 100) as u8,
        created_at: ms_to_datetime(row.get("created_at"))?,
        available_at: ms_to_datetime(row.get("available_at"))?,
        lease_expires_at: lease_expires_at.map(ms_to_datetime).transpose()?,
        cancel_reason: row.get("cancel_reason"),
        last_error: row.get("last_error"),
        finished_at: finished_at.map(ms_to_datetime).transpose()?,
    })
}

fn row_to_execution(row: &SqliteRow) -> Result<Execution> {
    let risk: String = row.get("risk_level");
    let outcome: String = row.get("outcome");
    let completed_at: Option<i64> = row.get("completed_at");

    Ok(Execution {
        id: row.get("id"),
        job_id: row.get("job_id"),
        attempt: row.get::<i64, _>("attempt").max(0) as u32,
        worker_id: row.get("worker_id"),
        started_at: ms_to_datetime(row.get("started_at"))?,
        completed_at: completed_at.map(ms_to_datetime).transpose()?,
        exit_code: row.get("exit_code"),
        output_bytes: row.get::<i64, _>("output_bytes").max(0) as u64,
        risk_level: RiskLevel::from_str(&risk)
            .ok_or_else(|| QueueError::CorruptRow(format!("unknown risk level {}", risk)))?,
        outcome: ExecutionOutcome::from_str(&outcome)
            .ok_or_else(|| QueueError::CorruptRow(format!("unknown outcome {}", outcome)))?,
    })
}
