//! Database-backed priority job queue with retry, backoff and dead-letter handling.
//!
//! ## Design
//!
//! - Jobs are tenant-scoped; another tenant's job behaves as a missing one
//! - Claims are atomic: a pending job is handed to at most one worker
//! - Failed jobs are rescheduled with exponential backoff until their retry
//!   budget runs out, then dead-lettered (`failed`) until an operator requeues
//!   or purges them
//!
//! ## Components
//!
//! - `Job` / `NewJob`: the queued unit of work
//! - `RetryPolicy`: pure backoff and retry-or-dead-letter decision
//! - `JobStore`: persistence seam (`InMemoryJobStore`, `PostgresJobStore`)
//! - `JobQueue`: tenant-scoped facade used by callers and workers
//! - `TaskExecutor`: polling worker pool dispatching to `TaskHandler`s

pub mod executor;
pub mod postgres;
pub mod queue;
pub mod retry;
pub mod store;
pub mod types;

pub use executor::{
    ExecutorHandle, ExecutorStats, JobDisposition, TaskExecutor, TaskHandler, TaskOutcome,
};
pub use postgres::PostgresJobStore;
pub use queue::JobQueue;
pub use retry::{BackoffStrategy, RetryDecision, RetryPolicy};
pub use store::{InMemoryJobStore, JobStore, QueueError};
pub use types::{ClaimOrder, DEFAULT_PRIORITY, FailOutcome, Job, JobId, NewJob, QueueStats};
