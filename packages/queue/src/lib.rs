// ABOUTME: Durable job queue with atomic leases, heartbeats and dead-lettering
// ABOUTME: Lease expiry is the only crash-recovery path for abandoned jobs

pub mod error;
pub mod queue;
pub mod retry;

pub use error::{QueueError, Result};
pub use queue::{
    CancelOutcome, DeadLetter, Failure, JobQueue, Lease, LeaseStatus, NackOutcome, NewJob,
    ReclaimOutcome, Reclaimed,
};
pub use retry::RetryPolicy;
