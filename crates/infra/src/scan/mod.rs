//! Partitioned fan-out / fan-in scan orchestration.
//!
//! ## Flow
//!
//! - `ScanService::start_scan` creates the parent `ScanJob`, fans it out into
//!   partitions (all rows in one write) and enqueues one `scan_partition`
//!   queue job per partition
//! - A `TaskExecutor` worker claims a partition job; `PartitionTaskHandler`
//!   runs it through `ScanOrchestrator::run_partition`
//! - Each partition that reaches a terminal state calls
//!   `PartitionCoordinator::check_and_aggregate`; exactly one call rolls the
//!   partitions up into the parent and runs the completion hooks
//!
//! ## Mutex scopes
//!
//! Queue claims lock the claimed job row only. Aggregation takes a per-job
//! mutex (`pg_try_advisory_xact_lock` on Postgres) that is unrelated to any
//! row, so aggregating one job never blocks claims or other jobs.

pub mod collaborators;
pub mod coordinator;
pub mod error;
pub mod orchestrator;
pub mod postgres;
pub mod service;
pub mod store;
#[cfg(test)]
mod testing;
pub mod types;

pub use collaborators::{
    BroadcastNotifier, CompletionHook, DetectionPipeline, FileDescriptor, FileFindings, HookError,
    InMemoryInventory, InventoryProvider, NoopNotifier, NotifyError, PipelineError, Progress,
    ProgressNotifier, ProgressUpdate, ProviderError,
};
pub use coordinator::{PartitionCoordinator, SCAN_PARTITION_TASK, summarize};
pub use error::ScanError;
pub use orchestrator::{PartitionTaskHandler, ScanOrchestrator};
pub use postgres::PostgresScanStore;
pub use service::{ScanService, ScanStatusView};
pub use store::{AggregationGuard, InMemoryScanStore, ScanStore, ScanStoreError, StartOutcome};
pub use types::{
    AggregationOutcome, PartitionProgress, PartitionReport, PartitionSpec, PartitionStats,
    PartitionTask, RiskTier, ScanJob, ScanPartition, ScanSummary,
};
