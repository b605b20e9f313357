use thiserror::Error;

use scanflow_core::{PartitionId, ScanJobId};

use super::collaborators::{PipelineError, ProviderError};
use super::store::ScanStoreError;
use crate::jobs::QueueError;

/// Scan coordination / partition execution error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScanError {
    #[error("scan partition not found: {0}")]
    PartitionNotFound(PartitionId),

    #[error("scan job not found: {0}")]
    JobNotFound(ScanJobId),

    #[error("a scan needs at least one partition")]
    NoPartitions,

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    Store(ScanStoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

impl ScanError {
    /// Retrying the owning queue job cannot help.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            ScanError::PartitionNotFound(_) | ScanError::JobNotFound(_) | ScanError::NoPartitions
        )
    }
}

impl From<ScanStoreError> for ScanError {
    fn from(err: ScanStoreError) -> Self {
        match err {
            ScanStoreError::JobNotFound(id) => ScanError::JobNotFound(id),
            ScanStoreError::PartitionNotFound(id) => ScanError::PartitionNotFound(id),
            other => ScanError::Store(other),
        }
    }
}
