//! Scan job / partition storage and the per-job aggregation mutex.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use scanflow_core::{PartitionId, ScanJobId, TenantId, WorkStatus};

use super::types::{PartitionProgress, ScanJob, ScanPartition, ScanSummary};

/// Scan store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScanStoreError {
    #[error("scan job not found: {0}")]
    JobNotFound(ScanJobId),
    #[error("scan partition not found: {0}")]
    PartitionNotFound(PartitionId),
    #[error("partition {partition_id} cannot move from {from} to {to}")]
    InvalidTransition {
        partition_id: PartitionId,
        from: WorkStatus,
        to: WorkStatus,
    },
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Result of [`ScanStore::start_partition`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    /// pending -> running.
    Started(ScanPartition),
    /// Already running (reclaimed after a worker crash); resume from its progress.
    Resumed(ScanPartition),
    /// Already terminal; nothing to run.
    Finished(ScanPartition),
}

/// Persistence seam for scan jobs and partitions.
///
/// Tenant-scoped like the job store: rows of other tenants behave as missing.
#[async_trait]
pub trait ScanStore: Send + Sync {
    async fn create_job(&self, job: ScanJob) -> Result<ScanJobId, ScanStoreError>;

    async fn get_job(
        &self,
        tenant_id: TenantId,
        job_id: ScanJobId,
    ) -> Result<Option<ScanJob>, ScanStoreError>;

    /// Cheap status read used at cancellation checkpoints.
    async fn job_status(
        &self,
        tenant_id: TenantId,
        job_id: ScanJobId,
    ) -> Result<Option<WorkStatus>, ScanStoreError>;

    /// pending|running -> cancelled. False when missing or already terminal.
    async fn cancel_job(&self, tenant_id: TenantId, job_id: ScanJobId)
    -> Result<bool, ScanStoreError>;

    /// Insert every partition of a job in one atomic step and fix the job's
    /// partition count. Fails with `Conflict` if the job already has partitions.
    async fn insert_partitions(
        &self,
        tenant_id: TenantId,
        job_id: ScanJobId,
        partitions: Vec<ScanPartition>,
    ) -> Result<(), ScanStoreError>;

    async fn get_partition(
        &self,
        tenant_id: TenantId,
        partition_id: PartitionId,
    ) -> Result<Option<ScanPartition>, ScanStoreError>;

    /// Partitions of a job ordered by index.
    async fn list_partitions(
        &self,
        tenant_id: TenantId,
        job_id: ScanJobId,
    ) -> Result<Vec<ScanPartition>, ScanStoreError>;

    /// Move a partition to running (and its pending parent with it).
    async fn start_partition(
        &self,
        tenant_id: TenantId,
        partition_id: PartitionId,
        now: DateTime<Utc>,
    ) -> Result<StartOutcome, ScanStoreError>;

    /// Checkpoint a running partition's counters and cursor.
    async fn record_progress(
        &self,
        tenant_id: TenantId,
        partition_id: PartitionId,
        progress: &PartitionProgress,
    ) -> Result<(), ScanStoreError>;

    /// Move a partition to a terminal status. False if it already was terminal.
    async fn finish_partition(
        &self,
        tenant_id: TenantId,
        partition_id: PartitionId,
        status: WorkStatus,
        progress: &PartitionProgress,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool, ScanStoreError>;

    /// Try to take the job's aggregation mutex without blocking.
    /// `None` means another worker holds it.
    async fn try_begin_aggregation(
        &self,
        tenant_id: TenantId,
        job_id: ScanJobId,
    ) -> Result<Option<Box<dyn AggregationGuard>>, ScanStoreError>;
}

/// Held aggregation mutex for one scan job.
///
/// Non-reentrant: a second `try_begin_aggregation` for the same job fails
/// until this guard is committed, released or dropped.
#[async_trait]
pub trait AggregationGuard: Send {
    /// Read the parent and all its partitions under the mutex.
    async fn load(&mut self) -> Result<Option<(ScanJob, Vec<ScanPartition>)>, ScanStoreError>;

    /// Write the parent's final state if it has not been aggregated yet, then
    /// release. Returns the state this call wrote, or `None` when the parent
    /// was already aggregated. A parent that is cancelled at commit time stays
    /// cancelled whatever `summary` says.
    async fn commit(
        self: Box<Self>,
        summary: &ScanSummary,
    ) -> Result<Option<ScanSummary>, ScanStoreError>;

    /// Release without writing.
    async fn release(self: Box<Self>) -> Result<(), ScanStoreError>;
}

#[derive(Debug, Default)]
struct Tables {
    jobs: HashMap<ScanJobId, ScanJob>,
    partitions: HashMap<PartitionId, ScanPartition>,
}

impl Tables {
    fn job_mut(&mut self, tenant_id: TenantId, job_id: ScanJobId) -> Option<&mut ScanJob> {
        self.jobs.get_mut(&job_id).filter(|j| j.tenant_id == tenant_id)
    }

    fn partitions_of(&self, tenant_id: TenantId, job_id: ScanJobId) -> Vec<ScanPartition> {
        let mut partitions: Vec<ScanPartition> = self
            .partitions
            .values()
            .filter(|p| p.job_id == job_id && p.tenant_id == tenant_id)
            .cloned()
            .collect();
        partitions.sort_by_key(|p| p.partition_index);
        partitions
    }
}

#[derive(Debug, Default)]
struct Shared {
    tables: RwLock<Tables>,
    /// Jobs whose aggregation mutex is held
    held: Mutex<HashSet<ScanJobId>>,
}

impl Shared {
    fn read(&self) -> RwLockReadGuard<'_, Tables> {
        self.tables.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Tables> {
        self.tables.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn held(&self) -> std::sync::MutexGuard<'_, HashSet<ScanJobId>> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// In-memory scan store for tests/dev.
#[derive(Debug, Clone, Default)]
pub struct InMemoryScanStore {
    shared: Arc<Shared>,
}

impl InMemoryScanStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl ScanStore for InMemoryScanStore {
    async fn create_job(&self, job: ScanJob) -> Result<ScanJobId, ScanStoreError> {
        let mut tables = self.shared.write();
        if tables.jobs.contains_key(&job.id) {
            return Err(ScanStoreError::Conflict(format!("scan job {} exists", job.id)));
        }
        let id = job.id;
        tables.jobs.insert(id, job);
        Ok(id)
    }

    async fn get_job(
        &self,
        tenant_id: TenantId,
        job_id: ScanJobId,
    ) -> Result<Option<ScanJob>, ScanStoreError> {
        let tables = self.shared.read();
        Ok(tables
            .jobs
            .get(&job_id)
            .filter(|j| j.tenant_id == tenant_id)
            .cloned())
    }

    async fn job_status(
        &self,
        tenant_id: TenantId,
        job_id: ScanJobId,
    ) -> Result<Option<WorkStatus>, ScanStoreError> {
        let tables = self.shared.read();
        Ok(tables
            .jobs
            .get(&job_id)
            .filter(|j| j.tenant_id == tenant_id)
            .map(|j| j.status))
    }

    async fn cancel_job(
        &self,
        tenant_id: TenantId,
        job_id: ScanJobId,
    ) -> Result<bool, ScanStoreError> {
        let mut tables = self.shared.write();
        match tables.job_mut(tenant_id, job_id) {
            Some(job) if !job.status.is_terminal() => {
                job.status = WorkStatus::Cancelled;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn insert_partitions(
        &self,
        tenant_id: TenantId,
        job_id: ScanJobId,
        partitions: Vec<ScanPartition>,
    ) -> Result<(), ScanStoreError> {
        let mut tables = self.shared.write();
        if tables.job_mut(tenant_id, job_id).is_none() {
            return Err(ScanStoreError::JobNotFound(job_id));
        }
        if tables.partitions.values().any(|p| p.job_id == job_id) {
            return Err(ScanStoreError::Conflict(format!(
                "scan job {job_id} already fanned out"
            )));
        }

        let total = partitions.len() as u32;
        for partition in partitions {
            tables.partitions.insert(partition.id, partition);
        }
        if let Some(job) = tables.job_mut(tenant_id, job_id) {
            job.partitions_total = total;
        }
        Ok(())
    }

    async fn get_partition(
        &self,
        tenant_id: TenantId,
        partition_id: PartitionId,
    ) -> Result<Option<ScanPartition>, ScanStoreError> {
        let tables = self.shared.read();
        Ok(tables
            .partitions
            .get(&partition_id)
            .filter(|p| p.tenant_id == tenant_id)
            .cloned())
    }

    async fn list_partitions(
        &self,
        tenant_id: TenantId,
        job_id: ScanJobId,
    ) -> Result<Vec<ScanPartition>, ScanStoreError> {
        Ok(self.shared.read().partitions_of(tenant_id, job_id))
    }

    async fn start_partition(
        &self,
        tenant_id: TenantId,
        partition_id: PartitionId,
        now: DateTime<Utc>,
    ) -> Result<StartOutcome, ScanStoreError> {
        let mut tables = self.shared.write();
        let partition = tables
            .partitions
            .get_mut(&partition_id)
            .filter(|p| p.tenant_id == tenant_id)
            .ok_or(ScanStoreError::PartitionNotFound(partition_id))?;

        let outcome = match partition.status {
            WorkStatus::Pending => {
                partition.status = WorkStatus::Running;
                partition.started_at = Some(now);
                StartOutcome::Started(partition.clone())
            }
            WorkStatus::Running => StartOutcome::Resumed(partition.clone()),
            _ => return Ok(StartOutcome::Finished(partition.clone())),
        };

        let job_id = partition.job_id;
        if let Some(job) = tables.job_mut(tenant_id, job_id) {
            if job.status == WorkStatus::Pending {
                job.status = WorkStatus::Running;
                job.started_at = Some(now);
            }
        }
        Ok(outcome)
    }

    async fn record_progress(
        &self,
        tenant_id: TenantId,
        partition_id: PartitionId,
        progress: &PartitionProgress,
    ) -> Result<(), ScanStoreError> {
        let mut tables = self.shared.write();
        let partition = tables
            .partitions
            .get_mut(&partition_id)
            .filter(|p| p.tenant_id == tenant_id)
            .ok_or(ScanStoreError::PartitionNotFound(partition_id))?;

        if partition.status != WorkStatus::Running {
            return Err(ScanStoreError::InvalidTransition {
                partition_id,
                from: partition.status,
                to: WorkStatus::Running,
            });
        }
        partition.progress = progress.clone();
        Ok(())
    }

    async fn finish_partition(
        &self,
        tenant_id: TenantId,
        partition_id: PartitionId,
        status: WorkStatus,
        progress: &PartitionProgress,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool, ScanStoreError> {
        let mut tables = self.shared.write();
        let partition = tables
            .partitions
            .get_mut(&partition_id)
            .filter(|p| p.tenant_id == tenant_id)
            .ok_or(ScanStoreError::PartitionNotFound(partition_id))?;

        if partition.status.is_terminal() {
            return Ok(false);
        }
        if !partition.status.can_advance_to(status) {
            return Err(ScanStoreError::InvalidTransition {
                partition_id,
                from: partition.status,
                to: status,
            });
        }

        partition.status = status;
        partition.progress = progress.clone();
        partition.error = error.map(str::to_string);
        partition.completed_at = Some(now);
        Ok(true)
    }

    async fn try_begin_aggregation(
        &self,
        tenant_id: TenantId,
        job_id: ScanJobId,
    ) -> Result<Option<Box<dyn AggregationGuard>>, ScanStoreError> {
        if !self.shared.held().insert(job_id) {
            return Ok(None);
        }
        Ok(Some(Box::new(InMemoryAggregationGuard {
            shared: self.shared.clone(),
            tenant_id,
            job_id,
        })))
    }
}

struct InMemoryAggregationGuard {
    shared: Arc<Shared>,
    tenant_id: TenantId,
    job_id: ScanJobId,
}

#[async_trait]
impl AggregationGuard for InMemoryAggregationGuard {
    async fn load(&mut self) -> Result<Option<(ScanJob, Vec<ScanPartition>)>, ScanStoreError> {
        let tables = self.shared.read();
        let Some(job) = tables
            .jobs
            .get(&self.job_id)
            .filter(|j| j.tenant_id == self.tenant_id)
            .cloned()
        else {
            return Ok(None);
        };
        let partitions = tables.partitions_of(self.tenant_id, self.job_id);
        Ok(Some((job, partitions)))
    }

    async fn commit(
        self: Box<Self>,
        summary: &ScanSummary,
    ) -> Result<Option<ScanSummary>, ScanStoreError> {
        let mut tables = self.shared.write();
        let Some(job) = tables.job_mut(self.tenant_id, self.job_id) else {
            return Ok(None);
        };
        if job.is_aggregated() {
            return Ok(None);
        }

        // `cancel_job` does not wait for the mutex, so it may have landed after `load`.
        let mut written = summary.clone();
        if job.status == WorkStatus::Cancelled {
            written.status = WorkStatus::Cancelled;
            written.error = None;
        }

        job.status = written.status;
        job.files_scanned = written.files_scanned;
        job.files_with_pii = written.files_with_pii;
        job.total_entities = written.total_entities;
        job.partitions_completed = written.partitions_completed;
        job.partitions_failed = written.partitions_failed;
        job.error = written.error.clone();
        job.completed_at = Some(written.completed_at);
        Ok(Some(written))
    }

    async fn release(self: Box<Self>) -> Result<(), ScanStoreError> {
        Ok(())
    }
}

impl Drop for InMemoryAggregationGuard {
    fn drop(&mut self) {
        self.shared.held().remove(&self.job_id);
    }
}

// Allow Arc<dyn ScanStore> / Arc<S> to be passed where a store is expected.
#[async_trait]
impl<S> ScanStore for Arc<S>
where
    S: ScanStore + ?Sized,
{
    async fn create_job(&self, job: ScanJob) -> Result<ScanJobId, ScanStoreError> {
        (**self).create_job(job).await
    }

    async fn get_job(
        &self,
        tenant_id: TenantId,
        job_id: ScanJobId,
    ) -> Result<Option<ScanJob>, ScanStoreError> {
        (**self).get_job(tenant_id, job_id).await
    }

    async fn job_status(
        &self,
        tenant_id: TenantId,
        job_id: ScanJobId,
    ) -> Result<Option<WorkStatus>, ScanStoreError> {
        (**self).job_status(tenant_id, job_id).await
    }

    async fn cancel_job(
        &self,
        tenant_id: TenantId,
        job_id: ScanJobId,
    ) -> Result<bool, ScanStoreError> {
        (**self).cancel_job(tenant_id, job_id).await
    }

    async fn insert_partitions(
        &self,
        tenant_id: TenantId,
        job_id: ScanJobId,
        partitions: Vec<ScanPartition>,
    ) -> Result<(), ScanStoreError> {
        (**self)
            .insert_partitions(tenant_id, job_id, partitions)
            .await
    }

    async fn get_partition(
        &self,
        tenant_id: TenantId,
        partition_id: PartitionId,
    ) -> Result<Option<ScanPartition>, ScanStoreError> {
        (**self).get_partition(tenant_id, partition_id).await
    }

    async fn list_partitions(
        &self,
        tenant_id: TenantId,
        job_id: ScanJobId,
    ) -> Result<Vec<ScanPartition>, ScanStoreError> {
        (**self).list_partitions(tenant_id, job_id).await
    }

    async fn start_partition(
        &self,
        tenant_id: TenantId,
        partition_id: PartitionId,
        now: DateTime<Utc>,
    ) -> Result<StartOutcome, ScanStoreError> {
        (**self).start_partition(tenant_id, partition_id, now).await
    }

    async fn record_progress(
        &self,
        tenant_id: TenantId,
        partition_id: PartitionId,
        progress: &PartitionProgress,
    ) -> Result<(), ScanStoreError> {
        (**self)
            .record_progress(tenant_id, partition_id, progress)
            .await
    }

    async fn finish_partition(
        &self,
        tenant_id: TenantId,
        partition_id: PartitionId,
        status: WorkStatus,
        progress: &PartitionProgress,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool, ScanStoreError> {
        (**self)
            .finish_partition(tenant_id, partition_id, status, progress, error, now)
            .await
    }

    async fn try_begin_aggregation(
        &self,
        tenant_id: TenantId,
        job_id: ScanJobId,
    ) -> Result<Option<Box<dyn AggregationGuard>>, ScanStoreError> {
        (**self).try_begin_aggregation(tenant_id, job_id).await
    }
}
