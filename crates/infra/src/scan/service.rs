use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use scanflow_core::{ScanJobId, TargetId, TenantId};

use super::coordinator::PartitionCoordinator;
use super::error::ScanError;
use super::store::ScanStore;
use super::types::{ScanJob, ScanPartition};
use crate::jobs::{JobQueue, JobStore};

/// Parent job plus its partitions, ordered by index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScanStatusView {
    pub job: ScanJob,
    pub partitions: Vec<ScanPartition>,
}

/// Tenant-scoped entry point for starting, inspecting and cancelling scans.
pub struct ScanService<S, Q> {
    coordinator: Arc<PartitionCoordinator<S>>,
    queue: JobQueue<Q>,
}

impl<S, Q> ScanService<S, Q>
where
    S: ScanStore,
    Q: JobStore,
{
    pub fn new(coordinator: Arc<PartitionCoordinator<S>>, queue: JobQueue<Q>) -> Self {
        Self { coordinator, queue }
    }

    pub fn tenant_id(&self) -> TenantId {
        self.queue.tenant_id()
    }

    /// Dead-letter inspection, requeue and purge go through the queue.
    pub fn queue(&self) -> &JobQueue<Q> {
        &self.queue
    }

    /// Create the scan job, fan it out into one partition per spec and
    /// enqueue the partition work items.
    pub async fn start_scan(
        &self,
        target_id: TargetId,
        specs: Vec<serde_json::Value>,
    ) -> Result<ScanJobId, ScanError> {
        if specs.is_empty() {
            return Err(ScanError::NoPartitions);
        }
        let tenant_id = self.tenant_id();
        let store = self.coordinator.store();

        let job_id = store.create_job(ScanJob::new(tenant_id, target_id)).await?;
        let partitions = self
            .coordinator
            .fan_out(tenant_id, job_id, specs.len() as u32, |index, _| {
                specs[index as usize].clone()
            })
            .await?;
        self.coordinator
            .dispatch(&self.queue, job_id, &partitions)
            .await?;

        info!(
            tenant_id = %tenant_id,
            job_id = %job_id,
            target_id = %target_id,
            partitions = partitions.len(),
            "scan started"
        );
        Ok(job_id)
    }

    pub async fn scan_status(&self, job_id: ScanJobId) -> Result<Option<ScanStatusView>, ScanError> {
        let tenant_id = self.tenant_id();
        let store = self.coordinator.store();

        let Some(job) = store.get_job(tenant_id, job_id).await? else {
            return Ok(None);
        };
        let partitions = store.list_partitions(tenant_id, job_id).await?;
        Ok(Some(ScanStatusView { job, partitions }))
    }

    /// Cooperative: running partitions stop at their next checkpoint, queued
    /// ones finish as cancelled when claimed. Returns `false` for finished or
    /// unknown scans.
    pub async fn cancel_scan(&self, job_id: ScanJobId) -> Result<bool, ScanError> {
        let cancelled = self
            .coordinator
            .store()
            .cancel_job(self.tenant_id(), job_id)
            .await?;
        if cancelled {
            info!(tenant_id = %self.tenant_id(), job_id = %job_id, "scan cancelled");
        }
        Ok(cancelled)
    }
}
