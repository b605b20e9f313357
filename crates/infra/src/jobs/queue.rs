//! Tenant-scoped job queue facade.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use scanflow_core::TenantId;

use super::retry::RetryPolicy;
use super::store::{JobStore, QueueError};
use super::types::{ClaimOrder, FailOutcome, Job, JobId, NewJob, QueueStats};

/// Priority work queue bound to one tenant.
///
/// Owns the retry policy and reads the clock; the store does the atomic work.
/// Every call is scoped to [`tenant_id`](Self::tenant_id): jobs of other
/// tenants are invisible and behave as missing.
#[derive(Debug, Clone)]
pub struct JobQueue<S> {
    store: S,
    tenant_id: TenantId,
    policy: RetryPolicy,
    claim_order: ClaimOrder,
}

impl<S: JobStore> JobQueue<S> {
    pub fn new(store: S, tenant_id: TenantId, policy: RetryPolicy) -> Self {
        Self {
            store,
            tenant_id,
            policy,
            claim_order: ClaimOrder::default(),
        }
    }

    pub fn with_claim_order(mut self, claim_order: ClaimOrder) -> Self {
        self.claim_order = claim_order;
        self
    }

    /// Same store and policy, different tenant.
    pub fn for_tenant(&self, tenant_id: TenantId) -> Self
    where
        S: Clone,
    {
        Self {
            store: self.store.clone(),
            tenant_id,
            policy: self.policy.clone(),
            claim_order: self.claim_order,
        }
    }

    pub fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Enqueue a job. Duplicate payloads are not detected.
    pub async fn enqueue(
        &self,
        task_type: &str,
        payload: serde_json::Value,
        priority: i32,
        scheduled_for: Option<DateTime<Utc>>,
    ) -> Result<JobId, QueueError> {
        let mut job = NewJob::new(task_type, payload).priority(priority);
        job.scheduled_for = scheduled_for;
        self.submit(job).await
    }

    /// Enqueue a fully specified job.
    pub async fn submit(&self, job: NewJob) -> Result<JobId, QueueError> {
        let job = job.into_job(self.tenant_id, self.policy.default_max_retries, Utc::now());
        let (task_type, priority) = (job.task_type.clone(), job.priority);
        let id = self.store.insert(job).await?;
        debug!(job_id = %id, task_type = %task_type, priority, "enqueued job");
        Ok(id)
    }

    /// Claim the next eligible job for `worker_id`. Non-blocking: returns
    /// `None` when nothing is eligible.
    pub async fn dequeue(&self, worker_id: &str) -> Result<Option<Job>, QueueError> {
        self.store
            .claim(self.tenant_id, worker_id, self.claim_order, Utc::now())
            .await
    }

    /// Mark a running job completed.
    pub async fn complete(
        &self,
        job_id: JobId,
        result: Option<serde_json::Value>,
    ) -> Result<(), QueueError> {
        self.store
            .complete(self.tenant_id, job_id, result, Utc::now())
            .await
    }

    /// Fail a running job: reschedule with backoff while retries remain,
    /// otherwise dead-letter it.
    pub async fn fail(
        &self,
        job_id: JobId,
        error: &str,
        retry: bool,
    ) -> Result<FailOutcome, QueueError> {
        let outcome = self
            .store
            .fail(self.tenant_id, job_id, error, retry, &self.policy, Utc::now())
            .await?;

        match outcome {
            FailOutcome::Retrying {
                retry_count,
                scheduled_for,
            } => debug!(job_id = %job_id, retry_count, %scheduled_for, error, "job scheduled for retry"),
            FailOutcome::DeadLettered { retry_count } => {
                warn!(job_id = %job_id, retry_count, error, "job dead-lettered")
            }
        }
        Ok(outcome)
    }

    /// Cancel a pending or running job. False if missing or already terminal.
    pub async fn cancel(&self, job_id: JobId) -> Result<bool, QueueError> {
        self.store.cancel(self.tenant_id, job_id, Utc::now()).await
    }

    /// Put a dead-lettered job back to pending.
    pub async fn requeue_failed(
        &self,
        job_id: JobId,
        reset_retries: bool,
    ) -> Result<bool, QueueError> {
        let requeued = self
            .store
            .requeue_failed(self.tenant_id, job_id, reset_retries)
            .await?;
        if requeued {
            info!(job_id = %job_id, reset_retries, "requeued dead-lettered job");
        }
        Ok(requeued)
    }

    pub async fn requeue_all_failed(
        &self,
        task_type: Option<&str>,
        reset_retries: bool,
    ) -> Result<u64, QueueError> {
        let count = self
            .store
            .requeue_all_failed(self.tenant_id, task_type, reset_retries)
            .await?;
        info!(count, task_type, "requeued dead-lettered jobs");
        Ok(count)
    }

    pub async fn get(&self, job_id: JobId) -> Result<Option<Job>, QueueError> {
        self.store.get(self.tenant_id, job_id).await
    }

    /// Dead-letter page, most recently failed first.
    pub async fn get_failed_jobs(
        &self,
        task_type: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Job>, QueueError> {
        self.store
            .failed_jobs(self.tenant_id, task_type, limit, offset)
            .await
    }

    pub async fn get_failed_count(&self, task_type: Option<&str>) -> Result<u64, QueueError> {
        self.store.failed_count(self.tenant_id, task_type).await
    }

    pub async fn get_queue_stats(&self) -> Result<QueueStats, QueueError> {
        self.store.stats(self.tenant_id).await
    }

    /// Delete dead-lettered jobs that failed more than `older_than` ago.
    pub async fn purge_failed(
        &self,
        task_type: Option<&str>,
        older_than: Duration,
    ) -> Result<u64, QueueError> {
        let cutoff = Utc::now() - chrono::Duration::from_std(older_than).unwrap_or_default();
        let purged = self
            .store
            .purge_failed(self.tenant_id, task_type, cutoff)
            .await?;
        info!(purged, task_type, "purged dead-lettered jobs");
        Ok(purged)
    }

    /// Return running jobs whose worker has held them longer than
    /// `older_than` to pending.
    pub async fn reclaim_stuck(&self, older_than: Duration) -> Result<Vec<JobId>, QueueError> {
        let cutoff = Utc::now() - chrono::Duration::from_std(older_than).unwrap_or_default();
        let reclaimed = self.store.reclaim_stuck(self.tenant_id, cutoff).await?;
        if !reclaimed.is_empty() {
            warn!(count = reclaimed.len(), "reclaimed stuck jobs");
        }
        Ok(reclaimed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::store::InMemoryJobStore;
    use crate::jobs::types::DEFAULT_PRIORITY;
    use scanflow_core::WorkStatus;
    use serde_json::json;
    use std::sync::Arc;

    fn queue() -> JobQueue<Arc<InMemoryJobStore>> {
        JobQueue::new(InMemoryJobStore::arc(), TenantId::new(), RetryPolicy::default())
    }

    fn close_to(actual: DateTime<Utc>, expected: DateTime<Utc>) -> bool {
        (actual - expected).num_milliseconds().abs() < 1_000
    }

    #[tokio::test]
    async fn backoff_then_dead_letter() {
        let queue = queue();
        let id = queue
            .enqueue("scan_partition", json!({}), DEFAULT_PRIORITY, None)
            .await
            .unwrap();

        queue.dequeue("w").await.unwrap().unwrap();
        let before = Utc::now();
        let outcome = queue.fail(id, "first", true).await.unwrap();
        let FailOutcome::Retrying {
            retry_count,
            scheduled_for,
        } = outcome
        else {
            panic!("expected retry, got {outcome:?}");
        };
        assert_eq!(retry_count, 1);
        assert!(close_to(scheduled_for, before + chrono::Duration::seconds(2)));

        // Not eligible until the backoff elapses.
        assert!(queue.dequeue("w").await.unwrap().is_none());

        // Pretend the delay passed.
        let claimed = queue
            .store()
            .claim(queue.tenant_id(), "w", ClaimOrder::CreatedFirst, scheduled_for)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.id, id);

        let before = Utc::now();
        let outcome = queue.fail(id, "second", true).await.unwrap();
        let FailOutcome::Retrying {
            retry_count,
            scheduled_for,
        } = outcome
        else {
            panic!("expected retry, got {outcome:?}");
        };
        assert_eq!(retry_count, 2);
        assert!(close_to(scheduled_for, before + chrono::Duration::seconds(4)));

        queue
            .store()
            .claim(queue.tenant_id(), "w", ClaimOrder::CreatedFirst, scheduled_for)
            .await
            .unwrap()
            .unwrap();
        let outcome = queue.fail(id, "third", true).await.unwrap();
        assert_eq!(outcome, FailOutcome::DeadLettered { retry_count: 3 });

        let job = queue.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, WorkStatus::Failed);
        assert_eq!(job.retry_count, 3);
        assert_eq!(job.error.as_deref(), Some("third"));
        assert!(job.completed_at.is_some());
    }

    #[tokio::test]
    async fn fail_on_dead_letter_is_rejected() {
        let queue = queue();
        let id = queue
            .enqueue("export", json!({}), DEFAULT_PRIORITY, None)
            .await
            .unwrap();
        queue.dequeue("w").await.unwrap();
        queue.fail(id, "fatal", false).await.unwrap();
        let before = queue.get(id).await.unwrap().unwrap();

        let err = queue.fail(id, "again", true).await.unwrap_err();
        assert!(matches!(err, QueueError::InvalidTransition { .. }));
        assert_eq!(queue.get(id).await.unwrap().unwrap(), before);
    }

    #[tokio::test]
    async fn cancel_completed_is_noop() {
        let queue = queue();
        let id = queue
            .enqueue("export", json!({}), DEFAULT_PRIORITY, None)
            .await
            .unwrap();
        queue.dequeue("w").await.unwrap();
        queue.complete(id, Some(json!({"rows": 3}))).await.unwrap();
        let before = queue.get(id).await.unwrap().unwrap();

        assert!(!queue.cancel(id).await.unwrap());
        assert_eq!(queue.get(id).await.unwrap().unwrap(), before);
    }

    #[tokio::test]
    async fn requeue_failed_without_reset_keeps_count() {
        let queue = queue();
        let id = queue
            .enqueue("export", json!({}), DEFAULT_PRIORITY, None)
            .await
            .unwrap();
        queue.dequeue("w").await.unwrap();
        let FailOutcome::Retrying { scheduled_for, .. } =
            queue.fail(id, "flaky", true).await.unwrap()
        else {
            panic!("expected retry");
        };
        queue
            .store()
            .claim(queue.tenant_id(), "w", ClaimOrder::CreatedFirst, scheduled_for)
            .await
            .unwrap()
            .unwrap();
        queue.fail(id, "boom", false).await.unwrap();

        assert!(queue.requeue_failed(id, false).await.unwrap());
        assert!(!queue.requeue_failed(id, false).await.unwrap());

        let job = queue.dequeue("w").await.unwrap().unwrap();
        assert_eq!(job.id, id);
        assert_eq!(job.retry_count, 1);
        assert!(job.error.is_none());
    }

    #[tokio::test]
    async fn scheduled_first_order_breaks_ties() {
        let store = InMemoryJobStore::arc();
        let queue = JobQueue::new(store, TenantId::new(), RetryPolicy::default())
            .with_claim_order(ClaimOrder::ScheduledFirst);
        let past = Utc::now() - chrono::Duration::minutes(5);

        queue
            .enqueue("a", json!({}), DEFAULT_PRIORITY, None)
            .await
            .unwrap();
        let early = queue
            .enqueue("a", json!({}), DEFAULT_PRIORITY, Some(past))
            .await
            .unwrap();

        assert_eq!(queue.dequeue("w").await.unwrap().unwrap().id, early);
    }

    #[tokio::test]
    async fn for_tenant_shares_store_but_not_jobs() {
        let queue = queue();
        let other = queue.for_tenant(TenantId::new());
        let id = queue
            .enqueue("a", json!({}), DEFAULT_PRIORITY, None)
            .await
            .unwrap();

        assert!(other.get(id).await.unwrap().is_none());
        assert!(other.dequeue("w").await.unwrap().is_none());
        assert!(!other.requeue_failed(id, true).await.unwrap());
        assert_eq!(queue.get_queue_stats().await.unwrap().pending, 1);
    }
}
