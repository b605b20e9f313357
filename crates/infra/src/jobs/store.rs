//! Job storage implementations.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use scanflow_core::{TenantId, WorkStatus};

use super::retry::RetryPolicy;
use super::types::{ClaimOrder, FailOutcome, Job, JobId, QueueStats};

/// Persistence seam for the job queue.
///
/// Every method is tenant-scoped: a job that belongs to another tenant is
/// reported exactly like a missing one. Each mutating method is a single
/// atomic unit against the backing store.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new pending job.
    async fn insert(&self, job: Job) -> Result<JobId, QueueError>;

    /// Get a job by ID.
    async fn get(&self, tenant_id: TenantId, job_id: JobId) -> Result<Option<Job>, QueueError>;

    /// Atomically claim the best eligible pending job (pending -> running).
    /// Returns None if nothing is eligible at `now`.
    async fn claim(
        &self,
        tenant_id: TenantId,
        worker_id: &str,
        order: ClaimOrder,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, QueueError>;

    /// running -> completed.
    async fn complete(
        &self,
        tenant_id: TenantId,
        job_id: JobId,
        result: Option<serde_json::Value>,
        now: DateTime<Utc>,
    ) -> Result<(), QueueError>;

    /// running -> pending (retry) or failed (dead-letter), decided by `policy`
    /// inside the same atomic section as the write.
    async fn fail(
        &self,
        tenant_id: TenantId,
        job_id: JobId,
        error: &str,
        retry: bool,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<FailOutcome, QueueError>;

    /// pending|running -> cancelled. False when missing or already terminal.
    async fn cancel(
        &self,
        tenant_id: TenantId,
        job_id: JobId,
        now: DateTime<Utc>,
    ) -> Result<bool, QueueError>;

    /// failed -> pending. False when missing or not failed.
    async fn requeue_failed(
        &self,
        tenant_id: TenantId,
        job_id: JobId,
        reset_retries: bool,
    ) -> Result<bool, QueueError>;

    /// Requeue every dead-lettered job, optionally filtered by task type.
    async fn requeue_all_failed(
        &self,
        tenant_id: TenantId,
        task_type: Option<&str>,
        reset_retries: bool,
    ) -> Result<u64, QueueError>;

    /// Dead-letter page, most recently failed first.
    async fn failed_jobs(
        &self,
        tenant_id: TenantId,
        task_type: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Job>, QueueError>;

    async fn failed_count(
        &self,
        tenant_id: TenantId,
        task_type: Option<&str>,
    ) -> Result<u64, QueueError>;

    async fn stats(&self, tenant_id: TenantId) -> Result<QueueStats, QueueError>;

    /// Delete dead-lettered jobs that failed before `completed_before`.
    async fn purge_failed(
        &self,
        tenant_id: TenantId,
        task_type: Option<&str>,
        completed_before: DateTime<Utc>,
    ) -> Result<u64, QueueError>;

    /// Move running jobs started before `started_before` back to pending.
    async fn reclaim_stuck(
        &self,
        tenant_id: TenantId,
        started_before: DateTime<Utc>,
    ) -> Result<Vec<JobId>, QueueError>;
}

/// Job queue error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job {job_id} cannot move from {from} to {to}")]
    InvalidTransition {
        job_id: JobId,
        from: WorkStatus,
        to: WorkStatus,
    },
    #[error("storage error: {0}")]
    Storage(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

#[derive(Debug)]
struct Entry {
    /// Insertion order; final tie-break at claim time
    seq: u64,
    job: Job,
}

#[derive(Debug, Default)]
struct Table {
    next_seq: u64,
    jobs: HashMap<JobId, Entry>,
}

impl Table {
    fn scoped_mut(&mut self, tenant_id: TenantId, job_id: JobId) -> Option<&mut Job> {
        self.jobs
            .get_mut(&job_id)
            .map(|e| &mut e.job)
            .filter(|j| j.tenant_id == tenant_id)
    }

    fn dead_letters<'a>(
        &'a self,
        tenant_id: TenantId,
        task_type: Option<&'a str>,
    ) -> impl Iterator<Item = &'a Job> + 'a {
        self.jobs.values().map(|e| &e.job).filter(move |j| {
            j.tenant_id == tenant_id
                && j.status == WorkStatus::Failed
                && task_type.is_none_or(|t| j.task_type == t)
        })
    }
}

/// In-memory job store for tests/dev.
///
/// One lock around the whole table serialises claims, which gives the same
/// at-most-one-claim guarantee the database gets from row locks.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    table: RwLock<Table>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn read(&self) -> RwLockReadGuard<'_, Table> {
        self.table.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Table> {
        self.table.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, job: Job) -> Result<JobId, QueueError> {
        let mut table = self.write();
        let id = job.id;
        let seq = table.next_seq;
        table.next_seq += 1;
        table.jobs.insert(id, Entry { seq, job });
        Ok(id)
    }

    async fn get(&self, tenant_id: TenantId, job_id: JobId) -> Result<Option<Job>, QueueError> {
        let table = self.read();
        Ok(table
            .jobs
            .get(&job_id)
            .filter(|e| e.job.tenant_id == tenant_id)
            .map(|e| e.job.clone()))
    }

    async fn claim(
        &self,
        tenant_id: TenantId,
        worker_id: &str,
        order: ClaimOrder,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, QueueError> {
        let mut table = self.write();

        let best = table
            .jobs
            .values()
            .filter(|e| e.job.tenant_id == tenant_id && e.job.is_eligible(now))
            .min_by(|a, b| {
                b.job
                    .priority
                    .cmp(&a.job.priority)
                    .then_with(|| a.job.order_key(order).cmp(&b.job.order_key(order)))
                    .then_with(|| a.seq.cmp(&b.seq))
            })
            .map(|e| e.job.id);

        let Some(job_id) = best else {
            return Ok(None);
        };

        Ok(table.jobs.get_mut(&job_id).map(|e| {
            e.job.mark_claimed(worker_id, now);
            e.job.clone()
        }))
    }

    async fn complete(
        &self,
        tenant_id: TenantId,
        job_id: JobId,
        result: Option<serde_json::Value>,
        now: DateTime<Utc>,
    ) -> Result<(), QueueError> {
        let mut table = self.write();
        let job = table
            .scoped_mut(tenant_id, job_id)
            .ok_or(QueueError::NotFound(job_id))?;

        if job.status != WorkStatus::Running {
            return Err(QueueError::InvalidTransition {
                job_id,
                from: job.status,
                to: WorkStatus::Completed,
            });
        }

        job.mark_completed(result, now);
        Ok(())
    }

    async fn fail(
        &self,
        tenant_id: TenantId,
        job_id: JobId,
        error: &str,
        retry: bool,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<FailOutcome, QueueError> {
        let mut table = self.write();
        let job = table
            .scoped_mut(tenant_id, job_id)
            .ok_or(QueueError::NotFound(job_id))?;

        if job.status != WorkStatus::Running {
            return Err(QueueError::InvalidTransition {
                job_id,
                from: job.status,
                to: WorkStatus::Failed,
            });
        }

        let decision = policy.decide(job.retry_count, job.max_retries, retry);
        Ok(job.apply_failure(error, decision, now))
    }

    async fn cancel(
        &self,
        tenant_id: TenantId,
        job_id: JobId,
        now: DateTime<Utc>,
    ) -> Result<bool, QueueError> {
        let mut table = self.write();
        match table.scoped_mut(tenant_id, job_id) {
            Some(job) if job.status.can_transition_to(WorkStatus::Cancelled) => {
                job.mark_cancelled(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn requeue_failed(
        &self,
        tenant_id: TenantId,
        job_id: JobId,
        reset_retries: bool,
    ) -> Result<bool, QueueError> {
        let mut table = self.write();
        match table.scoped_mut(tenant_id, job_id) {
            Some(job) if job.status == WorkStatus::Failed => {
                job.mark_requeued(reset_retries);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn requeue_all_failed(
        &self,
        tenant_id: TenantId,
        task_type: Option<&str>,
        reset_retries: bool,
    ) -> Result<u64, QueueError> {
        let mut table = self.write();
        let mut count = 0;
        for job in table.jobs.values_mut().map(|e| &mut e.job) {
            if job.tenant_id == tenant_id
                && job.status == WorkStatus::Failed
                && task_type.is_none_or(|t| job.task_type == t)
            {
                job.mark_requeued(reset_retries);
                count += 1;
            }
        }
        Ok(count)
    }

    async fn failed_jobs(
        &self,
        tenant_id: TenantId,
        task_type: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Job>, QueueError> {
        let table = self.read();
        let mut failed: Vec<Job> = table.dead_letters(tenant_id, task_type).cloned().collect();
        failed.sort_by(|a, b| b.completed_at.cmp(&a.completed_at).then(b.id.cmp(&a.id)));
        Ok(failed.into_iter().skip(offset).take(limit).collect())
    }

    async fn failed_count(
        &self,
        tenant_id: TenantId,
        task_type: Option<&str>,
    ) -> Result<u64, QueueError> {
        let table = self.read();
        Ok(table.dead_letters(tenant_id, task_type).count() as u64)
    }

    async fn stats(&self, tenant_id: TenantId) -> Result<QueueStats, QueueError> {
        let table = self.read();
        let mut stats = QueueStats::default();
        for job in table
            .jobs
            .values()
            .map(|e| &e.job)
            .filter(|j| j.tenant_id == tenant_id)
        {
            stats.record(job.status, 1);
            if job.status == WorkStatus::Failed {
                *stats.failed_by_type.entry(job.task_type.clone()).or_default() += 1;
            }
        }
        Ok(stats)
    }

    async fn purge_failed(
        &self,
        tenant_id: TenantId,
        task_type: Option<&str>,
        completed_before: DateTime<Utc>,
    ) -> Result<u64, QueueError> {
        let mut table = self.write();
        let before = table.jobs.len();
        table.jobs.retain(|_, e| {
            let j = &e.job;
            !(j.tenant_id == tenant_id
                && j.status == WorkStatus::Failed
                && task_type.is_none_or(|t| j.task_type == t)
                && j.completed_at.is_some_and(|at| at < completed_before))
        });
        Ok((before - table.jobs.len()) as u64)
    }

    async fn reclaim_stuck(
        &self,
        tenant_id: TenantId,
        started_before: DateTime<Utc>,
    ) -> Result<Vec<JobId>, QueueError> {
        let mut table = self.write();
        let mut reclaimed = Vec::new();
        for job in table.jobs.values_mut().map(|e| &mut e.job) {
            if job.tenant_id == tenant_id
                && job.status == WorkStatus::Running
                && job.started_at.is_some_and(|at| at < started_before)
            {
                job.mark_reclaimed();
                reclaimed.push(job.id);
            }
        }
        reclaimed.sort();
        Ok(reclaimed)
    }
}

// Allow Arc<dyn JobStore> / Arc<S> to be passed where a store is expected.
#[async_trait]
impl<S> JobStore for Arc<S>
where
    S: JobStore + ?Sized,
{
    async fn insert(&self, job: Job) -> Result<JobId, QueueError> {
        (**self).insert(job).await
    }

    async fn get(&self, tenant_id: TenantId, job_id: JobId) -> Result<Option<Job>, QueueError> {
        (**self).get(tenant_id, job_id).await
    }

    async fn claim(
        &self,
        tenant_id: TenantId,
        worker_id: &str,
        order: ClaimOrder,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, QueueError> {
        (**self).claim(tenant_id, worker_id, order, now).await
    }

    async fn complete(
        &self,
        tenant_id: TenantId,
        job_id: JobId,
        result: Option<serde_json::Value>,
        now: DateTime<Utc>,
    ) -> Result<(), QueueError> {
        (**self).complete(tenant_id, job_id, result, now).await
    }

    async fn fail(
        &self,
        tenant_id: TenantId,
        job_id: JobId,
        error: &str,
        retry: bool,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<FailOutcome, QueueError> {
        (**self)
            .fail(tenant_id, job_id, error, retry, policy, now)
            .await
    }

    async fn cancel(
        &self,
        tenant_id: TenantId,
        job_id: JobId,
        now: DateTime<Utc>,
    ) -> Result<bool, QueueError> {
        (**self).cancel(tenant_id, job_id, now).await
    }

    async fn requeue_failed(
        &self,
        tenant_id: TenantId,
        job_id: JobId,
        reset_retries: bool,
    ) -> Result<bool, QueueError> {
        (**self)
            .requeue_failed(tenant_id, job_id, reset_retries)
            .await
    }

    async fn requeue_all_failed(
        &self,
        tenant_id: TenantId,
        task_type: Option<&str>,
        reset_retries: bool,
    ) -> Result<u64, QueueError> {
        (**self)
            .requeue_all_failed(tenant_id, task_type, reset_retries)
            .await
    }

    async fn failed_jobs(
        &self,
        tenant_id: TenantId,
        task_type: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Job>, QueueError> {
        (**self)
            .failed_jobs(tenant_id, task_type, limit, offset)
            .await
    }

    async fn failed_count(
        &self,
        tenant_id: TenantId,
        task_type: Option<&str>,
    ) -> Result<u64, QueueError> {
        (**self).failed_count(tenant_id, task_type).await
    }

    async fn stats(&self, tenant_id: TenantId) -> Result<QueueStats, QueueError> {
        (**self).stats(tenant_id).await
    }

    async fn purge_failed(
        &self,
        tenant_id: TenantId,
        task_type: Option<&str>,
        completed_before: DateTime<Utc>,
    ) -> Result<u64, QueueError> {
        (**self)
            .purge_failed(tenant_id, task_type, completed_before)
            .await
    }

    async fn reclaim_stuck(
        &self,
        tenant_id: TenantId,
        started_before: DateTime<Utc>,
    ) -> Result<Vec<JobId>, QueueError> {
        (**self).reclaim_stuck(tenant_id, started_before).await
    }
}
