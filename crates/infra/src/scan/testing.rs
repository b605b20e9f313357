//! Store wrapper for interleaving tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;

use scanflow_core::{PartitionId, ScanJobId, TenantId, WorkStatus};

use super::store::{AggregationGuard, InMemoryScanStore, ScanStore, ScanStoreError, StartOutcome};
use super::types::{PartitionProgress, ScanJob, ScanPartition, ScanSummary};

/// In-memory store that can fail `start_partition` and park the next
/// aggregation right after its `load`.
#[derive(Default)]
pub(crate) struct ScriptedStore {
    pub inner: InMemoryScanStore,
    pub fail_start: AtomicBool,
    pause_next_load: AtomicBool,
    gate: Arc<Gate>,
}

#[derive(Default)]
struct Gate {
    loaded: Notify,
    resume: Notify,
}

impl ScriptedStore {
    pub fn arc() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The next aggregation parks after `load` until [`Self::resume`].
    pub fn pause_next_load(&self) {
        self.pause_next_load.store(true, Ordering::SeqCst);
    }

    /// Wait until the parked aggregation has loaded.
    pub async fn loaded(&self) {
        self.gate.loaded.notified().await;
    }

    pub fn resume(&self) {
        self.gate.resume.notify_one();
    }
}

#[async_trait]
impl ScanStore for ScriptedStore {
    async fn create_job(&self, job: ScanJob) -> Result<ScanJobId, ScanStoreError> {
        self.inner.create_job(job).await
    }

    async fn get_job(
        &self,
        tenant_id: TenantId,
        job_id: ScanJobId,
    ) -> Result<Option<ScanJob>, ScanStoreError> {
        self.inner.get_job(tenant_id, job_id).await
    }

    async fn job_status(
        &self,
        tenant_id: TenantId,
        job_id: ScanJobId,
    ) -> Result<Option<WorkStatus>, ScanStoreError> {
        self.inner.job_status(tenant_id, job_id).await
    }

    async fn cancel_job(
        &self,
        tenant_id: TenantId,
        job_id: ScanJobId,
    ) -> Result<bool, ScanStoreError> {
        self.inner.cancel_job(tenant_id, job_id).await
    }

    async fn insert_partitions(
        &self,
        tenant_id: TenantId,
        job_id: ScanJobId,
        partitions: Vec<ScanPartition>,
    ) -> Result<(), ScanStoreError> {
        self.inner.insert_partitions(tenant_id, job_id, partitions).await
    }

    async fn get_partition(
        &self,
        tenant_id: TenantId,
        partition_id: PartitionId,
    ) -> Result<Option<ScanPartition>, ScanStoreError> {
        self.inner.get_partition(tenant_id, partition_id).await
    }

    async fn list_partitions(
        &self,
        tenant_id: TenantId,
        job_id: ScanJobId,
    ) -> Result<Vec<ScanPartition>, ScanStoreError> {
        self.inner.list_partitions(tenant_id, job_id).await
    }

    async fn start_partition(
        &self,
        tenant_id: TenantId,
        partition_id: PartitionId,
        now: DateTime<Utc>,
    ) -> Result<StartOutcome, ScanStoreError> {
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(ScanStoreError::Storage("connection reset".into()));
        }
        self.inner.start_partition(tenant_id, partition_id, now).await
    }

    async fn record_progress(
        &self,
        tenant_id: TenantId,
        partition_id: PartitionId,
        progress: &PartitionProgress,
    ) -> Result<(), ScanStoreError> {
        self.inner.record_progress(tenant_id, partition_id, progress).await
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
        self.inner
            .finish_partition(tenant_id, partition_id, status, progress, error, now)
            .await
    }

    async fn try_begin_aggregation(
        &self,
        tenant_id: TenantId,
        job_id: ScanJobId,
    ) -> Result<Option<Box<dyn AggregationGuard>>, ScanStoreError> {
        let Some(inner) = self.inner.try_begin_aggregation(tenant_id, job_id).await? else {
            return Ok(None);
        };
        let pause = self.pause_next_load.swap(false, Ordering::SeqCst);
        Ok(Some(Box::new(ScriptedGuard {
            inner,
            gate: pause.then(|| self.gate.clone()),
        })))
    }
}

struct ScriptedGuard {
    inner: Box<dyn AggregationGuard>,
    gate: Option<Arc<Gate>>,
}

#[async_trait]
impl AggregationGuard for ScriptedGuard {
    async fn load(&mut self) -> Result<Option<(ScanJob, Vec<ScanPartition>)>, ScanStoreError> {
        let loaded = self.inner.load().await?;
        if let Some(gate) = self.gate.take() {
            gate.loaded.notify_one();
            gate.resume.notified().await;
        }
        Ok(loaded)
    }

    async fn commit(
        self: Box<Self>,
        summary: &ScanSummary,
    ) -> Result<Option<ScanSummary>, ScanStoreError> {
        self.inner.commit(summary).await
    }

    async fn release(self: Box<Self>) -> Result<(), ScanStoreError> {
        self.inner.release().await
    }
}
