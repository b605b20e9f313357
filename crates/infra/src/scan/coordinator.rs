//! Fan-out of a scan job into partitions and exactly-once fan-in.
//!
//! ## Aggregation
//!
//! Every partition that reaches a terminal state calls
//! [`PartitionCoordinator::check_and_aggregate`]. The call:
//!
//! 1. Tries the job's aggregation mutex without blocking. Busy means another
//!    worker is aggregating; the caller returns `LockBusy` at once.
//! 2. Under the mutex, re-reads the parent and its partitions. Any partition
//!    that is not terminal defers the aggregation to a later terminal event.
//!    After releasing a deferral the caller re-counts: a partition that
//!    finished while the mutex was held got `LockBusy`, so if none remain
//!    running the deferring caller tries again itself.
//! 3. Rolls the partition counters into the parent and writes its final state.
//!    The write is conditional on the parent not being aggregated yet, so a
//!    re-trigger after a successful aggregation observes `AlreadyAggregated`.
//! 4. Only the caller whose write landed runs the completion hooks, each in
//!    its own task under its own timeout.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use scanflow_core::{PartitionId, ScanJobId, TenantId, WorkStatus};

use super::collaborators::{
    CompletionHook, HookError, NoopNotifier, Progress, ProgressNotifier, ProgressUpdate,
};
use super::error::ScanError;
use super::store::ScanStore;
use super::types::{AggregationOutcome, PartitionTask, ScanJob, ScanPartition, ScanSummary};
use crate::jobs::{JobId, JobQueue, JobStore, NewJob, QueueError};

/// Queue task type of a partition work item.
pub const SCAN_PARTITION_TASK: &str = "scan_partition";

const DEFAULT_HOOK_TIMEOUT: Duration = Duration::from_secs(30);

pub struct PartitionCoordinator<S> {
    store: S,
    hooks: Vec<Arc<dyn CompletionHook>>,
    notifier: Arc<dyn ProgressNotifier>,
    hook_timeout: Duration,
}

impl<S> PartitionCoordinator<S>
where
    S: ScanStore,
{
    pub fn new(store: S) -> Self {
        Self {
            store,
            hooks: Vec::new(),
            notifier: Arc::new(NoopNotifier),
            hook_timeout: DEFAULT_HOOK_TIMEOUT,
        }
    }

    /// Hooks run in registration order.
    pub fn with_hook(mut self, hook: Arc<dyn CompletionHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn ProgressNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_hook_timeout(mut self, timeout: Duration) -> Self {
        self.hook_timeout = timeout;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn notifier(&self) -> &Arc<dyn ProgressNotifier> {
        &self.notifier
    }

    /// Create all `n_partitions` partition rows of a job in one atomic write.
    ///
    /// `spec_fn(index, total)` describes the slice each partition covers.
    pub async fn fan_out<F>(
        &self,
        tenant_id: TenantId,
        job_id: ScanJobId,
        n_partitions: u32,
        mut spec_fn: F,
    ) -> Result<Vec<PartitionId>, ScanError>
    where
        F: FnMut(u32, u32) -> serde_json::Value,
    {
        if n_partitions == 0 {
            return Err(ScanError::NoPartitions);
        }

        let partitions: Vec<ScanPartition> = (0..n_partitions)
            .map(|index| {
                ScanPartition::new(
                    tenant_id,
                    job_id,
                    index,
                    n_partitions,
                    spec_fn(index, n_partitions),
                )
            })
            .collect();
        let ids = partitions.iter().map(|p| p.id).collect();

        self.store
            .insert_partitions(tenant_id, job_id, partitions)
            .await?;
        info!(job_id = %job_id, partitions = n_partitions, "scan job fanned out");
        Ok(ids)
    }

    /// Enqueue one `scan_partition` work item per partition.
    pub async fn dispatch<Q>(
        &self,
        queue: &JobQueue<Q>,
        job_id: ScanJobId,
        partitions: &[PartitionId],
    ) -> Result<Vec<JobId>, ScanError>
    where
        Q: JobStore,
    {
        let mut queued = Vec::with_capacity(partitions.len());
        for &partition_id in partitions {
            let payload = serde_json::to_value(PartitionTask {
                partition_id,
                job_id,
            })
            .map_err(|e| QueueError::Serialization(e.to_string()))?;
            queued.push(queue.submit(NewJob::new(SCAN_PARTITION_TASK, payload)).await?);
        }
        Ok(queued)
    }

    /// Aggregate the job if every partition is terminal. Safe to call any
    /// number of times from any number of workers.
    pub async fn check_and_aggregate(
        &self,
        tenant_id: TenantId,
        job_id: ScanJobId,
    ) -> Result<AggregationOutcome, ScanError> {
        loop {
            let outcome = self.try_aggregate(tenant_id, job_id).await?;
            let AggregationOutcome::Deferred { .. } = outcome else {
                return Ok(outcome);
            };

            // The last partition may have finished while we held the mutex; its
            // own call then saw `LockBusy`, so the re-check falls to us.
            let partitions = self.store.list_partitions(tenant_id, job_id).await?;
            if partitions.is_empty() || partitions.iter().any(|p| !p.status.is_terminal()) {
                return Ok(outcome);
            }
            debug!(job_id = %job_id, "last partition finished during deferral; retrying");
        }
    }

    async fn try_aggregate(
        &self,
        tenant_id: TenantId,
        job_id: ScanJobId,
    ) -> Result<AggregationOutcome, ScanError> {
        let Some(mut guard) = self.store.try_begin_aggregation(tenant_id, job_id).await? else {
            debug!(job_id = %job_id, "another worker is aggregating");
            return Ok(AggregationOutcome::LockBusy);
        };

        let Some((job, partitions)) = guard.load().await? else {
            guard.release().await?;
            return Err(ScanError::JobNotFound(job_id));
        };

        if job.is_aggregated() {
            guard.release().await?;
            return Ok(AggregationOutcome::AlreadyAggregated);
        }

        // Not fanned out yet: nothing can be terminal.
        let remaining = if partitions.is_empty() {
            job.partitions_total as usize
        } else {
            partitions.iter().filter(|p| !p.status.is_terminal()).count()
        };
        if remaining > 0 || partitions.is_empty() {
            guard.release().await?;
            debug!(job_id = %job_id, remaining, "partitions still running; aggregation deferred");
            return Ok(AggregationOutcome::Deferred { remaining });
        }

        let Some(summary) = guard.commit(&summarize(&job, &partitions, Utc::now())).await? else {
            return Ok(AggregationOutcome::AlreadyAggregated);
        };

        info!(
            job_id = %job_id,
            status = %summary.status,
            files_scanned = summary.files_scanned,
            files_with_pii = summary.files_with_pii,
            partitions_completed = summary.partitions_completed,
            partitions_failed = summary.partitions_failed,
            partitions_total = summary.partitions_total,
            "scan job aggregated"
        );

        if summary.status != WorkStatus::Cancelled {
            self.run_hooks(tenant_id, job_id).await;
        }

        let update = ProgressUpdate {
            tenant_id,
            job_id,
            status: summary.status,
            progress: Progress::Summary(summary.clone()),
        };
        if let Err(err) = self.notifier.notify(update).await {
            debug!(job_id = %job_id, error = %err, "completion notification dropped");
        }

        Ok(AggregationOutcome::Aggregated(summary))
    }

    /// Run every hook once. A failing, panicking or slow hook is logged and
    /// skipped; it never affects the job or the remaining hooks.
    async fn run_hooks(&self, tenant_id: TenantId, job_id: ScanJobId) {
        for hook in &self.hooks {
            let name = hook.name().to_string();
            let task = {
                let hook = Arc::clone(hook);
                let timeout = self.hook_timeout;
                tokio::spawn(async move {
                    tokio::time::timeout(timeout, hook.run(job_id, tenant_id))
                        .await
                        .unwrap_or(Err(HookError::TimedOut(timeout)))
                })
            };

            match task.await {
                Ok(Ok(())) => debug!(job_id = %job_id, hook = %name, "completion hook done"),
                Ok(Err(err)) => {
                    warn!(job_id = %job_id, hook = %name, error = %err, "completion hook failed")
                }
                Err(join) => {
                    warn!(job_id = %job_id, hook = %name, error = %join, "completion hook panicked")
                }
            }
        }
    }
}

/// Roll terminal partitions up into the parent's final state.
///
/// Counters include completed and cancelled partitions (cancelled ones keep
/// the work done before they stopped); failed partitions only count as
/// failures. A cancelled parent stays cancelled. The parent fails only when
/// every partition failed.
pub fn summarize(job: &ScanJob, partitions: &[ScanPartition], now: DateTime<Utc>) -> ScanSummary {
    let mut summary = ScanSummary {
        job_id: job.id,
        status: WorkStatus::Completed,
        files_scanned: 0,
        files_with_pii: 0,
        total_entities: 0,
        partitions_total: partitions.len() as u32,
        partitions_completed: 0,
        partitions_failed: 0,
        error: None,
        completed_at: now,
    };

    for p in partitions {
        match p.status {
            WorkStatus::Failed => {
                summary.partitions_failed += 1;
                continue;
            }
            WorkStatus::Completed => summary.partitions_completed += 1,
            WorkStatus::Cancelled => {}
            WorkStatus::Pending | WorkStatus::Running => continue,
        }
        summary.files_scanned += p.progress.files_scanned;
        summary.files_with_pii += p.progress.files_with_pii;
        summary.total_entities += p.progress.total_entities;
    }

    let failed = summary.partitions_failed;
    if job.status == WorkStatus::Cancelled {
        summary.status = WorkStatus::Cancelled;
    } else if failed > 0 && failed == summary.partitions_total {
        summary.status = WorkStatus::Failed;
        summary.error = Some(format!("All {failed} partitions failed"));
    } else if failed > 0 {
        summary.error = Some(format!("{failed}/{} partitions failed", summary.partitions_total));
    }
    summary
}
