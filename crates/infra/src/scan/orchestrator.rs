//! Per-partition worker loop.
//!
//! ```text
//! get partition ── parent cancelled? ──► finish(cancelled) ──► aggregate
//!      │
//! start_partition ── already terminal ──► aggregate (self-heal)
//!      │ started / resumed
//!      ▼
//! page inventory after cursor ─► per file: skip | pipeline (timeout) | error
//!      │ every `checkpoint_every` files: persist, notify, re-read parent
//!      ▼
//! finish(completed | cancelled | failed) ──► aggregate
//! ```
//!
//! A partition-fatal error on an attempt that still has queue retries left
//! keeps the partition `running` with its progress persisted, so the retried
//! queue job resumes it. On the last attempt the partition is finished as
//! `failed` and aggregation is triggered.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, error, info, warn};

use scanflow_core::{PartitionId, ScanJobId, TenantId, WorkStatus};

use super::collaborators::{
    DetectionPipeline, FileDescriptor, InventoryProvider, Progress, ProgressUpdate, ProviderError,
};
use super::coordinator::PartitionCoordinator;
use super::error::ScanError;
use super::store::{ScanStore, StartOutcome};
use super::types::{PartitionProgress, PartitionReport, PartitionSpec, PartitionTask, ScanPartition};
use crate::config::PartitionConfig;
use crate::jobs::{Job, RetryDecision, RetryPolicy, TaskHandler, TaskOutcome};

/// How the file loop ended.
enum LoopEnd {
    Exhausted,
    Cancelled,
}

/// What an attempt knew when it stopped.
#[derive(Default)]
struct Attempt {
    job_id: Option<ScanJobId>,
    progress: PartitionProgress,
    started: bool,
}

pub struct ScanOrchestrator<S> {
    coordinator: Arc<PartitionCoordinator<S>>,
    inventory: Arc<dyn InventoryProvider>,
    pipeline: Arc<dyn DetectionPipeline>,
    config: PartitionConfig,
}

impl<S> ScanOrchestrator<S>
where
    S: ScanStore,
{
    pub fn new(
        coordinator: Arc<PartitionCoordinator<S>>,
        inventory: Arc<dyn InventoryProvider>,
        pipeline: Arc<dyn DetectionPipeline>,
        config: PartitionConfig,
    ) -> Self {
        Self {
            coordinator,
            inventory,
            pipeline,
            config,
        }
    }

    pub fn coordinator(&self) -> &Arc<PartitionCoordinator<S>> {
        &self.coordinator
    }

    /// Run one partition to a terminal state (or, on a retryable failure with
    /// `final_attempt == false`, up to its last checkpoint).
    ///
    /// On the final attempt any error, including a store error before the
    /// partition started, finishes the partition as `failed` and triggers
    /// aggregation before it is returned.
    pub async fn run_partition(
        &self,
        tenant_id: TenantId,
        partition_id: PartitionId,
        final_attempt: bool,
    ) -> Result<PartitionReport, ScanError> {
        let mut attempt = Attempt::default();
        let err = match self.attempt(tenant_id, partition_id, &mut attempt).await {
            Ok(report) => return Ok(report),
            Err(err) => err,
        };

        if final_attempt {
            self.fail_partition(tenant_id, partition_id, &attempt, &err).await;
        } else {
            warn!(job_id = ?attempt.job_id, partition_id = %partition_id, error = %err, "partition attempt failed; will resume");
            if attempt.started {
                let store = self.coordinator.store();
                if let Err(save_err) = store.record_progress(tenant_id, partition_id, &attempt.progress).await {
                    warn!(partition_id = %partition_id, error = %save_err, "could not save progress");
                }
            }
        }
        Err(err)
    }

    async fn attempt(
        &self,
        tenant_id: TenantId,
        partition_id: PartitionId,
        attempt: &mut Attempt,
    ) -> Result<PartitionReport, ScanError> {
        let store = self.coordinator.store();
        let partition = store
            .get_partition(tenant_id, partition_id)
            .await?
            .ok_or(ScanError::PartitionNotFound(partition_id))?;
        let job_id = partition.job_id;
        attempt.job_id = Some(job_id);
        attempt.progress = partition.progress.clone();

        let parent = store
            .job_status(tenant_id, job_id)
            .await?
            .ok_or(ScanError::JobNotFound(job_id))?;

        if parent == WorkStatus::Cancelled && !partition.status.is_terminal() {
            store
                .finish_partition(
                    tenant_id,
                    partition_id,
                    WorkStatus::Cancelled,
                    &partition.progress,
                    None,
                    Utc::now(),
                )
                .await?;
            info!(job_id = %job_id, partition_id = %partition_id, "parent cancelled; partition skipped");
            self.aggregate(tenant_id, job_id).await;
            return Ok(report(partition_id, WorkStatus::Cancelled, partition.progress));
        }

        let partition = match store.start_partition(tenant_id, partition_id, Utc::now()).await? {
            StartOutcome::Started(p) => {
                info!(
                    job_id = %job_id,
                    partition = p.partition_index,
                    total = p.total_partitions,
                    "partition started"
                );
                p
            }
            StartOutcome::Resumed(p) => {
                info!(
                    job_id = %job_id,
                    partition = p.partition_index,
                    after = ?p.progress.last_processed_path,
                    files_seen = p.progress.files_seen(),
                    "resuming partition"
                );
                p
            }
            StartOutcome::Finished(p) => {
                debug!(job_id = %job_id, partition = p.partition_index, status = %p.status, "partition already finished");
                self.aggregate(tenant_id, job_id).await;
                return Ok(report(partition_id, p.status, p.progress));
            }
        };
        attempt.started = true;
        attempt.progress = partition.progress.clone();

        let status = match self.scan_files(&partition, &mut attempt.progress).await? {
            LoopEnd::Exhausted => WorkStatus::Completed,
            LoopEnd::Cancelled => WorkStatus::Cancelled,
        };
        let progress = &attempt.progress;
        let written = store
            .finish_partition(tenant_id, partition_id, status, progress, None, Utc::now())
            .await?;
        if !written {
            debug!(partition_id = %partition_id, "partition finished concurrently");
        }
        info!(
            job_id = %job_id,
            partition = partition.partition_index + 1,
            total = partition.total_partitions,
            status = %status,
            files_scanned = progress.files_scanned,
            files_with_pii = progress.files_with_pii,
            files_skipped = progress.files_skipped,
            files_errored = progress.files_errored,
            "partition finished"
        );
        self.aggregate(tenant_id, job_id).await;
        Ok(report(partition_id, status, progress.clone()))
    }

    /// Best effort: the error being reported matters more than these writes.
    async fn fail_partition(
        &self,
        tenant_id: TenantId,
        partition_id: PartitionId,
        attempt: &Attempt,
        err: &ScanError,
    ) {
        let message = err.to_string();
        error!(job_id = ?attempt.job_id, partition_id = %partition_id, error = %message, "partition failed");
        if matches!(err, ScanError::PartitionNotFound(_)) {
            return;
        }

        let store = self.coordinator.store();
        if let Err(finish_err) = store
            .finish_partition(
                tenant_id,
                partition_id,
                WorkStatus::Failed,
                &attempt.progress,
                Some(&message),
                Utc::now(),
            )
            .await
        {
            error!(partition_id = %partition_id, error = %finish_err, "could not mark partition failed");
        }

        let job_id = match attempt.job_id {
            Some(job_id) => Some(job_id),
            None => store
                .get_partition(tenant_id, partition_id)
                .await
                .ok()
                .flatten()
                .map(|p| p.job_id),
        };
        match job_id {
            Some(job_id) => self.aggregate(tenant_id, job_id).await,
            None => warn!(partition_id = %partition_id, "owning job unknown; aggregation not triggered"),
        }
    }

    async fn scan_files(
        &self,
        partition: &ScanPartition,
        progress: &mut PartitionProgress,
    ) -> Result<LoopEnd, ScanError> {
        let spec = PartitionSpec::from_value(&partition.partition_spec)
            .map_err(|e| ProviderError::InvalidSpec(e.to_string()))?;
        let page_size = self.config.page_size.max(1);
        let checkpoint_every = self.config.checkpoint_every.max(1);
        let mut since_checkpoint = 0usize;

        loop {
            let cursor = progress.last_processed_path.clone();
            let batch = self
                .inventory
                .next_batch(&spec, cursor.as_deref(), page_size)
                .await?;
            let Some(last) = batch.last() else {
                return Ok(LoopEnd::Exhausted);
            };
            if cursor.as_deref().is_some_and(|c| last.path.as_str() <= c) {
                return Err(ProviderError::Unavailable(format!(
                    "inventory did not advance past {}",
                    last.path
                ))
                .into());
            }

            for file in &batch {
                self.process_file(partition, file, progress).await;
                progress.last_processed_path = Some(file.path.clone());

                since_checkpoint += 1;
                if since_checkpoint >= checkpoint_every {
                    since_checkpoint = 0;
                    if self.checkpoint(partition, progress).await? {
                        info!(
                            job_id = %partition.job_id,
                            partition = partition.partition_index,
                            files_seen = progress.files_seen(),
                            "parent cancelled; stopping partition"
                        );
                        return Ok(LoopEnd::Cancelled);
                    }
                }
            }
        }
    }

    /// Per-file errors are counted, never propagated.
    async fn process_file(
        &self,
        partition: &ScanPartition,
        file: &FileDescriptor,
        progress: &mut PartitionProgress,
    ) {
        if file.size > self.config.max_file_size_bytes {
            progress.files_skipped += 1;
            debug!(path = %file.path, size = file.size, "file too large; skipped");
            return;
        }

        match tokio::time::timeout(self.config.file_timeout, self.pipeline.process(file)).await {
            Ok(Ok(findings)) => progress.record_scanned(findings.total_entities, findings.risk_tier),
            Ok(Err(err)) => {
                progress.files_errored += 1;
                warn!(job_id = %partition.job_id, path = %file.path, error = %err, "file processing failed");
            }
            Err(_) => {
                progress.files_errored += 1;
                warn!(
                    job_id = %partition.job_id,
                    path = %file.path,
                    timeout = ?self.config.file_timeout,
                    "file processing timed out"
                );
            }
        }
    }

    /// Persist progress, push a progress update and re-read the parent.
    /// Returns `true` when the parent was cancelled.
    async fn checkpoint(
        &self,
        partition: &ScanPartition,
        progress: &PartitionProgress,
    ) -> Result<bool, ScanError> {
        let store = self.coordinator.store();
        store
            .record_progress(partition.tenant_id, partition.id, progress)
            .await?;

        let update = ProgressUpdate {
            tenant_id: partition.tenant_id,
            job_id: partition.job_id,
            status: WorkStatus::Running,
            progress: Progress::Partition {
                partition_id: partition.id,
                partition_index: partition.partition_index,
                total_partitions: partition.total_partitions,
                counters: progress.clone(),
            },
        };
        if let Err(err) = self.coordinator.notifier().notify(update).await {
            debug!(partition_id = %partition.id, error = %err, "progress notification dropped");
        }

        let parent = store
            .job_status(partition.tenant_id, partition.job_id)
            .await?
            .ok_or(ScanError::JobNotFound(partition.job_id))?;
        Ok(parent == WorkStatus::Cancelled)
    }

    /// Aggregation trouble never fails the partition; the next terminal
    /// partition retries it.
    async fn aggregate(&self, tenant_id: TenantId, job_id: ScanJobId) {
        match self.coordinator.check_and_aggregate(tenant_id, job_id).await {
            Ok(outcome) => debug!(job_id = %job_id, ?outcome, "aggregation check"),
            Err(err) => warn!(job_id = %job_id, error = %err, "aggregation check failed"),
        }
    }
}

fn report(partition_id: PartitionId, status: WorkStatus, progress: PartitionProgress) -> PartitionReport {
    PartitionReport {
        partition_id,
        status,
        progress,
    }
}

/// Runs `scan_partition` queue jobs.
pub struct PartitionTaskHandler<S> {
    orchestrator: Arc<ScanOrchestrator<S>>,
    policy: RetryPolicy,
}

impl<S> PartitionTaskHandler<S> {
    /// `policy` must be the queue's, so the handler knows which attempt is
    /// the last one.
    pub fn new(orchestrator: Arc<ScanOrchestrator<S>>, policy: RetryPolicy) -> Self {
        Self {
            orchestrator,
            policy,
        }
    }
}

#[async_trait]
impl<S> TaskHandler for PartitionTaskHandler<S>
where
    S: ScanStore + 'static,
{
    async fn handle(&self, job: &Job) -> TaskOutcome {
        let task: PartitionTask = match serde_json::from_value(job.payload.clone()) {
            Ok(task) => task,
            Err(err) => return TaskOutcome::Fatal(format!("invalid scan_partition payload: {err}")),
        };
        let final_attempt = matches!(
            self.policy.decide(job.retry_count, job.max_retries, true),
            RetryDecision::DeadLetter { .. }
        );

        match self
            .orchestrator
            .run_partition(job.tenant_id, task.partition_id, final_attempt)
            .await
        {
            Ok(report) => TaskOutcome::Success(serde_json::to_value(&report).ok()),
            Err(err) if err.is_permanent() => TaskOutcome::Fatal(err.to_string()),
            Err(err) => TaskOutcome::Retry(err.to_string()),
        }
    }
}
