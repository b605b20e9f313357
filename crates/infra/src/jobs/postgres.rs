//! Postgres-backed job store.
//!
//! ## Claim exclusivity
//!
//! `claim` is a single statement:
//!
//! ```sql
//! UPDATE job_queue SET status = 'running', ...
//! WHERE id = (SELECT id ... FOR UPDATE SKIP LOCKED LIMIT 1)
//! RETURNING ...
//! ```
//!
//! Concurrent claimers skip rows another transaction has locked, so each
//! pending row is handed to at most one worker and nobody blocks.
//!
//! ## State changes
//!
//! `complete`, `fail`, `cancel` and `requeue_failed` lock the row with
//! `SELECT ... FOR UPDATE`, apply the transition to the loaded [`Job`], and
//! write the lifecycle columns back in the same transaction.
//!
//! ## Error Mapping
//!
//! | SQLx Error | QueueError |
//! |------------|------------|
//! | any database/pool error | `Storage` (message names the operation) |
//! | undecodable status/counter column | `Serialization` |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use tracing::{debug, instrument};

use scanflow_core::{TenantId, WorkStatus};

use super::retry::RetryPolicy;
use super::store::{JobStore, QueueError};
use super::types::{ClaimOrder, FailOutcome, Job, JobId, QueueStats};
use crate::db::{SqlFailure, map_sqlx_error};

macro_rules! job_columns {
    () => {
        r#"id, tenant_id, task_type, payload, priority, status, worker_id,
           retry_count, max_retries, scheduled_for, started_at, completed_at,
           error, result, created_at"#
    };
}

macro_rules! claim_sql {
    ($order_by:literal) => {
        concat!(
            r#"
            UPDATE job_queue
            SET status = 'running', worker_id = $2, started_at = $3
            WHERE status = 'pending' AND id = (
                SELECT id FROM job_queue
                WHERE tenant_id = $1
                  AND status = 'pending'
                  AND (scheduled_for IS NULL OR scheduled_for <= $3)
                ORDER BY "#,
            $order_by,
            r#"
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING "#,
            job_columns!()
        )
    };
}

const CLAIM_CREATED_FIRST: &str = claim_sql!("priority DESC, created_at ASC, id ASC");
const CLAIM_SCHEDULED_FIRST: &str =
    claim_sql!("priority DESC, COALESCE(scheduled_for, created_at) ASC, created_at ASC, id ASC");

impl From<SqlFailure> for QueueError {
    fn from(failure: SqlFailure) -> Self {
        QueueError::Storage(failure.to_string())
    }
}

fn storage(operation: &'static str) -> impl FnOnce(sqlx::Error) -> QueueError {
    move |err| map_sqlx_error(operation, err).into()
}

/// Raw `job_queue` row.
struct JobRow {
    id: uuid::Uuid,
    tenant_id: uuid::Uuid,
    task_type: String,
    payload: serde_json::Value,
    priority: i32,
    status: String,
    worker_id: Option<String>,
    retry_count: i32,
    max_retries: i32,
    scheduled_for: Option<DateTime<Utc>>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    error: Option<String>,
    result: Option<serde_json::Value>,
    created_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for JobRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            tenant_id: row.try_get("tenant_id")?,
            task_type: row.try_get("task_type")?,
            payload: row.try_get("payload")?,
            priority: row.try_get("priority")?,
            status: row.try_get("status")?,
            worker_id: row.try_get("worker_id")?,
            retry_count: row.try_get("retry_count")?,
            max_retries: row.try_get("max_retries")?,
            scheduled_for: row.try_get("scheduled_for")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            error: row.try_get("error")?,
            result: row.try_get("result")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl TryFrom<JobRow> for Job {
    type Error = QueueError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse::<WorkStatus>()
            .map_err(|e| QueueError::Serialization(e.to_string()))?;
        let count = |name: &str, v: i32| {
            u32::try_from(v).map_err(|_| QueueError::Serialization(format!("negative {name}: {v}")))
        };

        Ok(Job {
            id: JobId::from_uuid(row.id),
            tenant_id: TenantId::from_uuid(row.tenant_id),
            task_type: row.task_type,
            payload: row.payload,
            priority: row.priority,
            status,
            worker_id: row.worker_id,
            retry_count: count("retry_count", row.retry_count)?,
            max_retries: count("max_retries", row.max_retries)?,
            scheduled_for: row.scheduled_for,
            started_at: row.started_at,
            completed_at: row.completed_at,
            error: row.error,
            result: row.result,
            created_at: row.created_at,
        })
    }
}

fn decode(row: &PgRow) -> Result<Job, QueueError> {
    let raw = JobRow::from_row(row).map_err(storage("decode_job"))?;
    Job::try_from(raw)
}

/// Postgres-backed job queue store.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Lock a tenant's job row for the rest of the transaction.
    async fn lock_row(
        tx: &mut Transaction<'_, Postgres>,
        tenant_id: TenantId,
        job_id: JobId,
        operation: &'static str,
    ) -> Result<Option<Job>, QueueError> {
        let row = sqlx::query(concat!(
            "SELECT ",
            job_columns!(),
            " FROM job_queue WHERE id = $1 AND tenant_id = $2 FOR UPDATE"
        ))
        .bind(job_id.as_uuid())
        .bind(tenant_id.as_uuid())
        .fetch_optional(&mut **tx)
        .await
        .map_err(storage(operation))?;

        row.as_ref().map(decode).transpose()
    }

    /// Write every lifecycle column of `job` back to its row.
    async fn write_state(
        tx: &mut Transaction<'_, Postgres>,
        job: &Job,
        operation: &'static str,
    ) -> Result<(), QueueError> {
        sqlx::query(
            r#"
            UPDATE job_queue
            SET status = $2,
                worker_id = $3,
                retry_count = $4,
                scheduled_for = $5,
                started_at = $6,
                completed_at = $7,
                error = $8,
                result = $9
            WHERE id = $1
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(job.status.as_str())
        .bind(job.worker_id.as_deref())
        .bind(job.retry_count as i32)
        .bind(job.scheduled_for)
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(job.error.as_deref())
        .bind(job.result.as_ref())
        .execute(&mut **tx)
        .await
        .map_err(storage(operation))?;
        Ok(())
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, job), fields(tenant_id = %job.tenant_id, task_type = %job.task_type), err)]
    async fn insert(&self, job: Job) -> Result<JobId, QueueError> {
        sqlx::query(
            r#"
            INSERT INTO job_queue (
                id, tenant_id, task_type, payload, priority, status, worker_id,
                retry_count, max_retries, scheduled_for, started_at, completed_at,
                error, result, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, NULL, $7, $8, $9, NULL, NULL, NULL, NULL, $10)
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(job.tenant_id.as_uuid())
        .bind(&job.task_type)
        .bind(&job.payload)
        .bind(job.priority)
        .bind(job.status.as_str())
        .bind(job.retry_count as i32)
        .bind(job.max_retries as i32)
        .bind(job.scheduled_for)
        .bind(job.created_at)
        .execute(&*self.pool)
        .await
        .map_err(storage("insert"))?;

        Ok(job.id)
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, job_id = %job_id), err)]
    async fn get(&self, tenant_id: TenantId, job_id: JobId) -> Result<Option<Job>, QueueError> {
        let row = sqlx::query(concat!(
            "SELECT ",
            job_columns!(),
            " FROM job_queue WHERE id = $1 AND tenant_id = $2"
        ))
        .bind(job_id.as_uuid())
        .bind(tenant_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(storage("get"))?;

        row.as_ref().map(decode).transpose()
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, worker_id = %worker_id), err)]
    async fn claim(
        &self,
        tenant_id: TenantId,
        worker_id: &str,
        order: ClaimOrder,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, QueueError> {
        let sql = match order {
            ClaimOrder::CreatedFirst => CLAIM_CREATED_FIRST,
            ClaimOrder::ScheduledFirst => CLAIM_SCHEDULED_FIRST,
        };

        let row = sqlx::query(sql)
            .bind(tenant_id.as_uuid())
            .bind(worker_id)
            .bind(now)
            .fetch_optional(&*self.pool)
            .await
            .map_err(storage("claim"))?;

        let job = row.as_ref().map(decode).transpose()?;
        if let Some(job) = &job {
            debug!(job_id = %job.id, task_type = %job.task_type, "claimed job");
        }
        Ok(job)
    }

    #[instrument(skip(self, result), fields(tenant_id = %tenant_id, job_id = %job_id), err)]
    async fn complete(
        &self,
        tenant_id: TenantId,
        job_id: JobId,
        result: Option<serde_json::Value>,
        now: DateTime<Utc>,
    ) -> Result<(), QueueError> {
        let mut tx = self.pool.begin().await.map_err(storage("complete"))?;

        let mut job = Self::lock_row(&mut tx, tenant_id, job_id, "complete")
            .await?
            .ok_or(QueueError::NotFound(job_id))?;
        if job.status != WorkStatus::Running {
            return Err(QueueError::InvalidTransition {
                job_id,
                from: job.status,
                to: WorkStatus::Completed,
            });
        }

        job.mark_completed(result, now);
        Self::write_state(&mut tx, &job, "complete").await?;
        tx.commit().await.map_err(storage("complete"))?;
        Ok(())
    }

    #[instrument(skip(self, policy), fields(tenant_id = %tenant_id, job_id = %job_id), err)]
    async fn fail(
        &self,
        tenant_id: TenantId,
        job_id: JobId,
        error: &str,
        retry: bool,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<FailOutcome, QueueError> {
        let mut tx = self.pool.begin().await.map_err(storage("fail"))?;

        let mut job = Self::lock_row(&mut tx, tenant_id, job_id, "fail")
            .await?
            .ok_or(QueueError::NotFound(job_id))?;
        if job.status != WorkStatus::Running {
            return Err(QueueError::InvalidTransition {
                job_id,
                from: job.status,
                to: WorkStatus::Failed,
            });
        }

        let decision = policy.decide(job.retry_count, job.max_retries, retry);
        let outcome = job.apply_failure(error, decision, now);
        Self::write_state(&mut tx, &job, "fail").await?;
        tx.commit().await.map_err(storage("fail"))?;
        Ok(outcome)
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, job_id = %job_id), err)]
    async fn cancel(
        &self,
        tenant_id: TenantId,
        job_id: JobId,
        now: DateTime<Utc>,
    ) -> Result<bool, QueueError> {
        let mut tx = self.pool.begin().await.map_err(storage("cancel"))?;

        let Some(mut job) = Self::lock_row(&mut tx, tenant_id, job_id, "cancel").await? else {
            return Ok(false);
        };
        if !job.status.can_transition_to(WorkStatus::Cancelled) {
            return Ok(false);
        }

        job.mark_cancelled(now);
        Self::write_state(&mut tx, &job, "cancel").await?;
        tx.commit().await.map_err(storage("cancel"))?;
        Ok(true)
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, job_id = %job_id), err)]
    async fn requeue_failed(
        &self,
        tenant_id: TenantId,
        job_id: JobId,
        reset_retries: bool,
    ) -> Result<bool, QueueError> {
        let mut tx = self.pool.begin().await.map_err(storage("requeue_failed"))?;

        let Some(mut job) = Self::lock_row(&mut tx, tenant_id, job_id, "requeue_failed").await?
        else {
            return Ok(false);
        };
        if job.status != WorkStatus::Failed {
            return Ok(false);
        }

        job.mark_requeued(reset_retries);
        Self::write_state(&mut tx, &job, "requeue_failed").await?;
        tx.commit().await.map_err(storage("requeue_failed"))?;
        Ok(true)
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id), err)]
    async fn requeue_all_failed(
        &self,
        tenant_id: TenantId,
        task_type: Option<&str>,
        reset_retries: bool,
    ) -> Result<u64, QueueError> {
        let done = sqlx::query(
            r#"
            UPDATE job_queue
            SET status = 'pending',
                worker_id = NULL,
                started_at = NULL,
                completed_at = NULL,
                scheduled_for = NULL,
                error = NULL,
                retry_count = CASE WHEN $3 THEN 0 ELSE retry_count END
            WHERE tenant_id = $1
              AND status = 'failed'
              AND ($2::text IS NULL OR task_type = $2)
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(task_type)
        .bind(reset_retries)
        .execute(&*self.pool)
        .await
        .map_err(storage("requeue_all_failed"))?;

        Ok(done.rows_affected())
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id), err)]
    async fn failed_jobs(
        &self,
        tenant_id: TenantId,
        task_type: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Job>, QueueError> {
        let rows = sqlx::query(concat!(
            "SELECT ",
            job_columns!(),
            r#"
            FROM job_queue
            WHERE tenant_id = $1
              AND status = 'failed'
              AND ($2::text IS NULL OR task_type = $2)
            ORDER BY completed_at DESC NULLS LAST, id DESC
            LIMIT $3 OFFSET $4
            "#
        ))
        .bind(tenant_id.as_uuid())
        .bind(task_type)
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(storage("failed_jobs"))?;

        rows.iter().map(decode).collect()
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id), err)]
    async fn failed_count(
        &self,
        tenant_id: TenantId,
        task_type: Option<&str>,
    ) -> Result<u64, QueueError> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM job_queue
            WHERE tenant_id = $1
              AND status = 'failed'
              AND ($2::text IS NULL OR task_type = $2)
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(task_type)
        .fetch_one(&*self.pool)
        .await
        .map_err(storage("failed_count"))?;

        Ok(count as u64)
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id), err)]
    async fn stats(&self, tenant_id: TenantId) -> Result<QueueStats, QueueError> {
        let rows = sqlx::query(
            r#"
            SELECT status, task_type, COUNT(*) AS n
            FROM job_queue
            WHERE tenant_id = $1
            GROUP BY status, task_type
            "#,
        )
        .bind(tenant_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(storage("stats"))?;

        let mut stats = QueueStats::default();
        for row in rows {
            let status: String = row.try_get("status").map_err(storage("stats"))?;
            let task_type: String = row.try_get("task_type").map_err(storage("stats"))?;
            let n: i64 = row.try_get("n").map_err(storage("stats"))?;

            let status = status
                .parse::<WorkStatus>()
                .map_err(|e| QueueError::Serialization(e.to_string()))?;
            stats.record(status, n as u64);
            if status == WorkStatus::Failed {
                *stats.failed_by_type.entry(task_type).or_default() += n as u64;
            }
        }
        Ok(stats)
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id), err)]
    async fn purge_failed(
        &self,
        tenant_id: TenantId,
        task_type: Option<&str>,
        completed_before: DateTime<Utc>,
    ) -> Result<u64, QueueError> {
        let done = sqlx::query(
            r#"
            DELETE FROM job_queue
            WHERE tenant_id = $1
              AND status = 'failed'
              AND ($2::text IS NULL OR task_type = $2)
              AND completed_at < $3
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(task_type)
        .bind(completed_before)
        .execute(&*self.pool)
        .await
        .map_err(storage("purge_failed"))?;

        Ok(done.rows_affected())
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id), err)]
    async fn reclaim_stuck(
        &self,
        tenant_id: TenantId,
        started_before: DateTime<Utc>,
    ) -> Result<Vec<JobId>, QueueError> {
        let mut ids: Vec<uuid::Uuid> = sqlx::query_scalar(
            r#"
            UPDATE job_queue
            SET status = 'pending', worker_id = NULL, started_at = NULL
            WHERE tenant_id = $1
              AND status = 'running'
              AND started_at < $2
            RETURNING id
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(started_before)
        .fetch_all(&*self.pool)
        .await
        .map_err(storage("reclaim_stuck"))?;

        ids.sort();
        Ok(ids.into_iter().map(JobId::from_uuid).collect())
    }
}
