//! Core job types.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use scanflow_core::{TenantId, WorkStatus};

use super::retry::RetryDecision;

/// Priority used when the caller does not pick one (0-100, higher is more urgent).
pub const DEFAULT_PRIORITY: i32 = 50;

/// Unique job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Tie-break among pending jobs of equal priority at claim time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimOrder {
    /// Earliest `created_at` first.
    #[default]
    CreatedFirst,
    /// Earliest `scheduled_for` first (unscheduled jobs use `created_at`).
    ScheduledFirst,
}

/// A queued unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub tenant_id: TenantId,
    /// Selects the handler
    pub task_type: String,
    /// Opaque to the queue; interpreted only by the handler
    pub payload: serde_json::Value,
    pub priority: i32,
    pub status: WorkStatus,
    /// Set while (and only while) running
    pub worker_id: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    /// Not claimable before this instant
    pub scheduled_for: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Last failure message
    pub error: Option<String>,
    pub result: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl Job {
    /// Check if the job can be claimed at `now`.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.status == WorkStatus::Pending && self.scheduled_for.is_none_or(|at| at <= now)
    }

    /// The instant used to break priority ties.
    pub fn order_key(&self, order: ClaimOrder) -> DateTime<Utc> {
        match order {
            ClaimOrder::CreatedFirst => self.created_at,
            ClaimOrder::ScheduledFirst => self.scheduled_for.unwrap_or(self.created_at),
        }
    }

    /// pending -> running.
    pub fn mark_claimed(&mut self, worker_id: &str, now: DateTime<Utc>) {
        self.status = WorkStatus::Running;
        self.worker_id = Some(worker_id.to_string());
        self.started_at = Some(now);
    }

    /// running -> completed.
    pub fn mark_completed(&mut self, result: Option<serde_json::Value>, now: DateTime<Utc>) {
        self.status = WorkStatus::Completed;
        self.worker_id = None;
        self.result = result;
        self.completed_at = Some(now);
    }

    /// running -> pending (retry) or running -> failed (dead-letter).
    pub fn apply_failure(
        &mut self,
        error: &str,
        decision: RetryDecision,
        now: DateTime<Utc>,
    ) -> FailOutcome {
        self.worker_id = None;
        self.error = Some(error.to_string());

        match decision {
            RetryDecision::Retry { retry_count, delay } => {
                let retry_at = now + chrono::Duration::from_std(delay).unwrap_or_default();
                self.status = WorkStatus::Pending;
                self.retry_count = retry_count;
                self.started_at = None;
                self.scheduled_for = Some(retry_at);
                FailOutcome::Retrying {
                    retry_count,
                    scheduled_for: retry_at,
                }
            }
            RetryDecision::DeadLetter { retry_count } => {
                self.status = WorkStatus::Failed;
                self.retry_count = retry_count;
                self.completed_at = Some(now);
                FailOutcome::DeadLettered { retry_count }
            }
        }
    }

    /// pending|running -> cancelled.
    pub fn mark_cancelled(&mut self, now: DateTime<Utc>) {
        self.status = WorkStatus::Cancelled;
        self.worker_id = None;
        self.completed_at = Some(now);
    }

    /// failed -> pending, immediately eligible.
    pub fn mark_requeued(&mut self, reset_retries: bool) {
        self.status = WorkStatus::Pending;
        self.worker_id = None;
        self.started_at = None;
        self.completed_at = None;
        self.scheduled_for = None;
        self.error = None;
        if reset_retries {
            self.retry_count = 0;
        }
    }

    /// running -> pending after a worker vanished; the retry budget is untouched.
    pub fn mark_reclaimed(&mut self) {
        self.status = WorkStatus::Pending;
        self.worker_id = None;
        self.started_at = None;
    }
}

/// A job to be enqueued.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub task_type: String,
    pub payload: serde_json::Value,
    pub priority: i32,
    pub scheduled_for: Option<DateTime<Utc>>,
    /// Falls back to the queue's retry policy when unset
    pub max_retries: Option<u32>,
}

impl NewJob {
    pub fn new(task_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            task_type: task_type.into(),
            payload,
            priority: DEFAULT_PRIORITY,
            scheduled_for: None,
            max_retries: None,
        }
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Schedule the job for later execution.
    pub fn scheduled_for(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_for = Some(at);
        self
    }

    /// Schedule the job with a delay from now.
    pub fn delayed(mut self, delay: Duration) -> Self {
        self.scheduled_for =
            Some(Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default());
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Materialize the pending job row.
    pub fn into_job(self, tenant_id: TenantId, default_max_retries: u32, now: DateTime<Utc>) -> Job {
        Job {
            id: JobId::new(),
            tenant_id,
            task_type: self.task_type,
            payload: self.payload,
            priority: self.priority,
            status: WorkStatus::Pending,
            worker_id: None,
            retry_count: 0,
            max_retries: self.max_retries.unwrap_or(default_max_retries),
            scheduled_for: self.scheduled_for,
            started_at: None,
            completed_at: None,
            error: None,
            result: None,
            created_at: now,
        }
    }
}

/// Result of [`fail`](super::JobQueue::fail).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum FailOutcome {
    /// Back to pending; claimable again at `scheduled_for`.
    Retrying {
        retry_count: u32,
        scheduled_for: DateTime<Utc>,
    },
    /// Terminal `failed` (dead-letter).
    DeadLettered { retry_count: u32 },
}

/// Per-tenant queue statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    /// Dead-letter size per task type
    pub failed_by_type: BTreeMap<String, u64>,
}

impl QueueStats {
    pub fn record(&mut self, status: WorkStatus, count: u64) {
        match status {
            WorkStatus::Pending => self.pending += count,
            WorkStatus::Running => self.running += count,
            WorkStatus::Completed => self.completed += count,
            WorkStatus::Failed => self.failed += count,
            WorkStatus::Cancelled => self.cancelled += count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::retry::RetryPolicy;

    fn pending_job() -> Job {
        NewJob::new("scan_partition", serde_json::json!({"k": "v"})).into_job(
            TenantId::new(),
            3,
            Utc::now(),
        )
    }

    #[test]
    fn new_job_defaults() {
        let job = pending_job();
        assert_eq!(job.status, WorkStatus::Pending);
        assert_eq!(job.priority, DEFAULT_PRIORITY);
        assert_eq!(job.max_retries, 3);
        assert_eq!(job.retry_count, 0);
        assert!(job.worker_id.is_none());
    }

    #[test]
    fn scheduled_job_is_not_eligible_early() {
        let now = Utc::now();
        let mut job = pending_job();
        job.scheduled_for = Some(now + chrono::Duration::seconds(5));

        assert!(!job.is_eligible(now));
        assert!(job.is_eligible(now + chrono::Duration::seconds(5)));
    }

    #[test]
    fn job_lifecycle() {
        let now = Utc::now();
        let mut job = pending_job();

        job.mark_claimed("w-1", now);
        assert_eq!(job.status, WorkStatus::Running);
        assert_eq!(job.worker_id.as_deref(), Some("w-1"));

        job.mark_completed(Some(serde_json::json!({"ok": true})), now);
        assert_eq!(job.status, WorkStatus::Completed);
        assert!(job.worker_id.is_none());
        assert_eq!(job.completed_at, Some(now));
    }

    #[test]
    fn failure_reschedules_then_dead_letters() {
        let now = Utc::now();
        let policy = RetryPolicy::default();
        let mut job = pending_job();

        job.mark_claimed("w-1", now);
        let decision = policy.decide(job.retry_count, job.max_retries, true);
        let outcome = job.apply_failure("boom", decision, now);
        assert_eq!(
            outcome,
            FailOutcome::Retrying {
                retry_count: 1,
                scheduled_for: now + chrono::Duration::seconds(2)
            }
        );
        assert_eq!(job.status, WorkStatus::Pending);
        assert!(job.worker_id.is_none());
        assert!(job.started_at.is_none());
        assert_eq!(job.error.as_deref(), Some("boom"));

        job.mark_claimed("w-2", now);
        let decision = policy.decide(job.retry_count, job.max_retries, false);
        let outcome = job.apply_failure("fatal", decision, now);
        assert_eq!(outcome, FailOutcome::DeadLettered { retry_count: 1 });
        assert_eq!(job.status, WorkStatus::Failed);
        assert_eq!(job.completed_at, Some(now));
    }

    #[test]
    fn requeue_resets_everything_but_identity() {
        let now = Utc::now();
        let mut job = pending_job();
        job.mark_claimed("w-1", now);
        job.apply_failure("x", RetryDecision::DeadLetter { retry_count: 3 }, now);

        let mut kept = job.clone();
        kept.mark_requeued(false);
        assert_eq!(kept.retry_count, 3);

        job.mark_requeued(true);
        assert_eq!(job.status, WorkStatus::Pending);
        assert_eq!(job.retry_count, 0);
        assert!(job.error.is_none());
        assert!(job.completed_at.is_none());
        assert!(job.is_eligible(now));
    }

    #[test]
    fn scheduled_first_falls_back_to_created_at() {
        let mut job = pending_job();
        assert_eq!(job.order_key(ClaimOrder::ScheduledFirst), job.created_at);

        let at = job.created_at + chrono::Duration::seconds(30);
        job.scheduled_for = Some(at);
        assert_eq!(job.order_key(ClaimOrder::ScheduledFirst), at);
        assert_eq!(job.order_key(ClaimOrder::CreatedFirst), job.created_at);
    }
}
