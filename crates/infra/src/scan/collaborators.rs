//! Narrow interfaces to the systems a partition worker consumes.
//!
//! Content extraction, detection, storage adapters and delivery channels live
//! outside the scheduler. The worker loop only sees these traits.

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use scanflow_core::{PartitionId, ScanJobId, TenantId, WorkStatus};

use super::types::{PartitionProgress, PartitionSpec, RiskTier, ScanSummary};

/// One candidate file yielded by an inventory provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDescriptor {
    /// Keyspace path; also the pagination cursor.
    pub path: String,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
}

impl FileDescriptor {
    pub fn new(path: impl Into<String>, size: u64) -> Self {
        Self {
            path: path.into(),
            size,
            modified: None,
        }
    }
}

/// Detection result for one file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileFindings {
    pub total_entities: u64,
    pub risk_tier: Option<RiskTier>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    #[error("inventory unavailable: {0}")]
    Unavailable(String),
    #[error("invalid partition spec: {0}")]
    InvalidSpec(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PipelineError {
    #[error("content extraction failed: {0}")]
    Extraction(String),
    #[error("detection failed: {0}")]
    Detection(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NotifyError {
    #[error("notification channel closed")]
    Closed,
    #[error("notification failed: {0}")]
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HookError {
    #[error("hook failed: {0}")]
    Failed(String),
    #[error("hook timed out after {0:?}")]
    TimedOut(Duration),
}

/// Yields the files of one partition in ascending path order.
///
/// Keyset-paginated on `after` (exclusive) so a restarted partition continues
/// from its last processed path without coordinating with its siblings.
#[async_trait]
pub trait InventoryProvider: Send + Sync {
    async fn next_batch(
        &self,
        spec: &PartitionSpec,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<FileDescriptor>, ProviderError>;
}

/// Content extraction + entity detection for one file.
#[async_trait]
pub trait DetectionPipeline: Send + Sync {
    async fn process(&self, file: &FileDescriptor) -> Result<FileFindings, PipelineError>;
}

/// What a progress message describes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Progress {
    Partition {
        partition_id: PartitionId,
        partition_index: u32,
        total_partitions: u32,
        counters: PartitionProgress,
    },
    Summary(ScanSummary),
}

/// Best-effort `{job_id, status, progress}` push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressUpdate {
    pub tenant_id: TenantId,
    pub job_id: ScanJobId,
    pub status: WorkStatus,
    pub progress: Progress,
}

#[async_trait]
pub trait ProgressNotifier: Send + Sync {
    async fn notify(&self, update: ProgressUpdate) -> Result<(), NotifyError>;
}

/// One-time side effect run after a scan job is aggregated.
#[async_trait]
pub trait CompletionHook: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self, job_id: ScanJobId, tenant_id: TenantId) -> Result<(), HookError>;
}

/// Drops every update.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotifier;

#[async_trait]
impl ProgressNotifier for NoopNotifier {
    async fn notify(&self, _update: ProgressUpdate) -> Result<(), NotifyError> {
        Ok(())
    }
}

/// Lossy fan-out to in-process subscribers (e.g. a websocket/SSE layer).
///
/// Updates sent while nobody is subscribed are dropped.
#[derive(Debug, Clone)]
pub struct BroadcastNotifier {
    tx: broadcast::Sender<ProgressUpdate>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressUpdate> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl ProgressNotifier for BroadcastNotifier {
    async fn notify(&self, update: ProgressUpdate) -> Result<(), NotifyError> {
        if self.tx.receiver_count() == 0 {
            return Ok(());
        }
        self.tx.send(update).map(|_| ()).map_err(|_| NotifyError::Closed)
    }
}

/// Sorted in-memory file listing for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryInventory {
    files: RwLock<BTreeMap<String, FileDescriptor>>,
}

impl InMemoryInventory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_files(files: impl IntoIterator<Item = FileDescriptor>) -> Self {
        let inventory = Self::new();
        for file in files {
            inventory.add(file);
        }
        inventory
    }

    pub fn add(&self, file: FileDescriptor) {
        self.files
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(file.path.clone(), file);
    }

    pub fn len(&self) -> usize {
        self.files.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl InventoryProvider for InMemoryInventory {
    async fn next_batch(
        &self,
        spec: &PartitionSpec,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<FileDescriptor>, ProviderError> {
        let files = self.files.read().unwrap_or_else(PoisonError::into_inner);
        Ok(files
            .values()
            .filter(|f| after.is_none_or(|a| f.path.as_str() > a))
            .filter(|f| spec.contains(&f.path))
            .take(limit)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inventory() -> InMemoryInventory {
        InMemoryInventory::with_files(
            ["data/d", "data/a", "data/c", "data/b", "other/x"]
                .into_iter()
                .map(|p| FileDescriptor::new(p, 10)),
        )
    }

    #[tokio::test]
    async fn pages_in_path_order_after_cursor() {
        let inv = inventory();
        let spec = PartitionSpec::whole("data/");

        let first = inv.next_batch(&spec, None, 2).await.unwrap();
        let paths: Vec<_> = first.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, ["data/a", "data/b"]);

        let second = inv.next_batch(&spec, Some("data/b"), 10).await.unwrap();
        let paths: Vec<_> = second.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, ["data/c", "data/d"]);

        assert!(inv.next_batch(&spec, Some("data/d"), 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn respects_key_range() {
        let inv = inventory();
        let ranges = PartitionSpec::key_ranges("data/", &["data/c"]);

        let low = inv.next_batch(&ranges[0], None, 10).await.unwrap();
        let high = inv.next_batch(&ranges[1], None, 10).await.unwrap();
        assert_eq!(low.len(), 2);
        assert_eq!(high.len(), 2);
        assert_eq!(high[0].path, "data/c");
    }

    #[tokio::test]
    async fn broadcast_without_subscribers_is_ok() {
        let notifier = BroadcastNotifier::new(8);
        let update = ProgressUpdate {
            tenant_id: TenantId::new(),
            job_id: ScanJobId::new(),
            status: WorkStatus::Running,
            progress: Progress::Partition {
                partition_id: PartitionId::new(),
                partition_index: 0,
                total_partitions: 1,
                counters: PartitionProgress::default(),
            },
        };
        notifier.notify(update.clone()).await.unwrap();

        let mut rx = notifier.subscribe();
        notifier.notify(update.clone()).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), update);
    }
}
