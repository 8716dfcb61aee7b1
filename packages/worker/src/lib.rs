// ABOUTME: Runhub workers: lease a job, check policy, run it in a sandbox, publish its events
// ABOUTME: Also hosts the lease reaper that recovers jobs from crashed workers

pub mod error;
pub mod pool;
pub mod publisher;
pub mod reaper;
pub mod worker;

pub use error::{Result, WorkerError};
pub use pool::WorkerPool;
pub use publisher::JobEventPublisher;
pub use reaper::LeaseReaper;
pub use worker::{AttemptOutcome, Worker, WorkerContext};
