//! Work-item lifecycle shared by queue jobs, scan jobs and scan partitions.
//!
//! ```text
//!            dequeue            complete
//! pending ───────────► running ──────────► completed
//!    │   ◄───────────     │
//!    │   fail (retry)     │ fail (exhausted)
//!    │                    ▼
//!    │   requeue_failed  failed
//!    │ ◄──────────────────┘
//!    │ cancel             │ cancel
//!    └──────► cancelled ◄─┘
//! ```

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Status of a unit of work.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkStatus {
    /// Waiting to be claimed.
    Pending,
    /// Claimed by exactly one worker.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished unsuccessfully (dead-lettered for queue jobs).
    Failed,
    /// Stopped by an operator or by a cancelled parent.
    Cancelled,
}

impl WorkStatus {
    pub const ALL: [WorkStatus; 5] = [
        WorkStatus::Pending,
        WorkStatus::Running,
        WorkStatus::Completed,
        WorkStatus::Failed,
        WorkStatus::Cancelled,
    ];

    /// Wire/storage name.
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkStatus::Pending => "pending",
            WorkStatus::Running => "running",
            WorkStatus::Completed => "completed",
            WorkStatus::Failed => "failed",
            WorkStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkStatus::Completed | WorkStatus::Failed | WorkStatus::Cancelled
        )
    }

    /// Legal transitions for queue jobs.
    ///
    /// Includes the two backward edges: `running -> pending` (retry with backoff,
    /// or operator reclaim) and `failed -> pending` (dead-letter requeue).
    pub fn can_transition_to(&self, next: WorkStatus) -> bool {
        use WorkStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Running, Pending)
                | (Failed, Pending)
        )
    }

    /// Legal transitions for scan partitions: forward only. A partition whose
    /// last attempt died before it started goes straight to `Failed`.
    pub fn can_advance_to(&self, next: WorkStatus) -> bool {
        use WorkStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Pending, Failed)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }
}

impl core::fmt::Display for WorkStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(WorkStatus::Pending),
            "running" => Ok(WorkStatus::Running),
            "completed" => Ok(WorkStatus::Completed),
            "failed" => Ok(WorkStatus::Failed),
            "cancelled" => Ok(WorkStatus::Cancelled),
            other => Err(DomainError::UnknownStatus(other.to_string())),
        }
    }
}
