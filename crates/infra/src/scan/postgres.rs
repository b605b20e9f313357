//! Postgres-backed scan store.
//!
//! ## Aggregation mutex
//!
//! [`PostgresScanStore::try_begin_aggregation`] opens a transaction and calls
//! `pg_try_advisory_xact_lock(key)` where `key` is a stable 64-bit hash of the
//! scan job id. The lock is scoped to that transaction: commit or rollback
//! (including an implicit rollback when the guard is dropped or the worker
//! dies) releases it. It is independent of any row lock, so it never blocks
//! queue claims or partition writes.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use tracing::{debug, instrument};

use scanflow_core::{PartitionId, ScanJobId, TargetId, TenantId, WorkStatus};

use super::store::{AggregationGuard, ScanStore, ScanStoreError, StartOutcome};
use super::types::{PartitionProgress, PartitionStats, ScanJob, ScanPartition, ScanSummary};
use crate::db::{SqlFailure, advisory_key, map_sqlx_error};

macro_rules! job_columns {
    () => {
        r#"id, tenant_id, target_id, status, files_scanned, files_with_pii,
           total_entities, partitions_total, partitions_completed, partitions_failed,
           started_at, completed_at, error, created_at"#
    };
}

macro_rules! partition_columns {
    () => {
        r#"id, tenant_id, job_id, partition_index, total_partitions, partition_spec,
           status, files_scanned, files_with_pii, total_entities, files_skipped,
           files_errored, stats, started_at, completed_at, last_processed_path, error"#
    };
}

impl From<SqlFailure> for ScanStoreError {
    fn from(failure: SqlFailure) -> Self {
        match failure {
            SqlFailure::UniqueViolation(msg) => ScanStoreError::Conflict(msg),
            other => ScanStoreError::Storage(other.to_string()),
        }
    }
}

fn storage(operation: &'static str) -> impl FnOnce(sqlx::Error) -> ScanStoreError {
    move |err| map_sqlx_error(operation, err).into()
}

fn parse_status(raw: &str) -> Result<WorkStatus, ScanStoreError> {
    raw.parse()
        .map_err(|e: scanflow_core::DomainError| ScanStoreError::Serialization(e.to_string()))
}

fn counter(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn small(value: i32) -> u32 {
    u32::try_from(value).unwrap_or(0)
}

/// Raw `scan_jobs` row.
struct ScanJobRow {
    id: uuid::Uuid,
    tenant_id: uuid::Uuid,
    target_id: uuid::Uuid,
    status: String,
    files_scanned: i64,
    files_with_pii: i64,
    total_entities: i64,
    partitions_total: i32,
    partitions_completed: i32,
    partitions_failed: i32,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    error: Option<String>,
    created_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for ScanJobRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            tenant_id: row.try_get("tenant_id")?,
            target_id: row.try_get("target_id")?,
            status: row.try_get("status")?,
            files_scanned: row.try_get("files_scanned")?,
            files_with_pii: row.try_get("files_with_pii")?,
            total_entities: row.try_get("total_entities")?,
            partitions_total: row.try_get("partitions_total")?,
            partitions_completed: row.try_get("partitions_completed")?,
            partitions_failed: row.try_get("partitions_failed")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            error: row.try_get("error")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl TryFrom<ScanJobRow> for ScanJob {
    type Error = ScanStoreError;

    fn try_from(row: ScanJobRow) -> Result<Self, Self::Error> {
        Ok(ScanJob {
            id: ScanJobId::from_uuid(row.id),
            tenant_id: TenantId::from_uuid(row.tenant_id),
            target_id: TargetId::from_uuid(row.target_id),
            status: parse_status(&row.status)?,
            files_scanned: counter(row.files_scanned),
            files_with_pii: counter(row.files_with_pii),
            total_entities: counter(row.total_entities),
            partitions_total: small(row.partitions_total),
            partitions_completed: small(row.partitions_completed),
            partitions_failed: small(row.partitions_failed),
            started_at: row.started_at,
            completed_at: row.completed_at,
            error: row.error,
            created_at: row.created_at,
        })
    }
}

/// Raw `scan_partitions` row.
struct PartitionRow {
    id: uuid::Uuid,
    tenant_id: uuid::Uuid,
    job_id: uuid::Uuid,
    partition_index: i32,
    total_partitions: i32,
    partition_spec: serde_json::Value,
    status: String,
    files_scanned: i64,
    files_with_pii: i64,
    total_entities: i64,
    files_skipped: i64,
    files_errored: i64,
    stats: serde_json::Value,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    last_processed_path: Option<String>,
    error: Option<String>,
}

impl<'r> FromRow<'r, PgRow> for PartitionRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            tenant_id: row.try_get("tenant_id")?,
            job_id: row.try_get("job_id")?,
            partition_index: row.try_get("partition_index")?,
            total_partitions: row.try_get("total_partitions")?,
            partition_spec: row.try_get("partition_spec")?,
            status: row.try_get("status")?,
            files_scanned: row.try_get("files_scanned")?,
            files_with_pii: row.try_get("files_with_pii")?,
            total_entities: row.try_get("total_entities")?,
            files_skipped: row.try_get("files_skipped")?,
            files_errored: row.try_get("files_errored")?,
            stats: row.try_get("stats")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            last_processed_path: row.try_get("last_processed_path")?,
            error: row.try_get("error")?,
        })
    }
}

impl TryFrom<PartitionRow> for ScanPartition {
    type Error = ScanStoreError;

    fn try_from(row: PartitionRow) -> Result<Self, Self::Error> {
        let stats: PartitionStats = serde_json::from_value(row.stats)
            .map_err(|e| ScanStoreError::Serialization(format!("partition stats: {e}")))?;

        Ok(ScanPartition {
            id: PartitionId::from_uuid(row.id),
            tenant_id: TenantId::from_uuid(row.tenant_id),
            job_id: ScanJobId::from_uuid(row.job_id),
            partition_index: small(row.partition_index),
            total_partitions: small(row.total_partitions),
            partition_spec: row.partition_spec,
            status: parse_status(&row.status)?,
            progress: PartitionProgress {
                files_scanned: counter(row.files_scanned),
                files_with_pii: counter(row.files_with_pii),
                total_entities: counter(row.total_entities),
                files_skipped: counter(row.files_skipped),
                files_errored: counter(row.files_errored),
                last_processed_path: row.last_processed_path,
                stats,
            },
            started_at: row.started_at,
            completed_at: row.completed_at,
            error: row.error,
        })
    }
}

fn decode_job(row: &PgRow) -> Result<ScanJob, ScanStoreError> {
    ScanJob::try_from(ScanJobRow::from_row(row).map_err(storage("decode_scan_job"))?)
}

fn decode_partition(row: &PgRow) -> Result<ScanPartition, ScanStoreError> {
    ScanPartition::try_from(PartitionRow::from_row(row).map_err(storage("decode_partition"))?)
}

fn stats_value(progress: &PartitionProgress) -> Result<serde_json::Value, ScanStoreError> {
    serde_json::to_value(&progress.stats)
        .map_err(|e| ScanStoreError::Serialization(format!("partition stats: {e}")))
}

/// Postgres-backed scan job / partition store.
#[derive(Debug, Clone)]
pub struct PostgresScanStore {
    pool: Arc<PgPool>,
}

impl PostgresScanStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    async fn load_partition(
        tx: &mut Transaction<'_, Postgres>,
        tenant_id: TenantId,
        partition_id: PartitionId,
        operation: &'static str,
    ) -> Result<ScanPartition, ScanStoreError> {
        let row = sqlx::query(concat!(
            "SELECT ",
            partition_columns!(),
            " FROM scan_partitions WHERE id = $1 AND tenant_id = $2 FOR UPDATE"
        ))
        .bind(partition_id.as_uuid())
        .bind(tenant_id.as_uuid())
        .fetch_optional(&mut **tx)
        .await
        .map_err(storage(operation))?
        .ok_or(ScanStoreError::PartitionNotFound(partition_id))?;

        decode_partition(&row)
    }
}

#[async_trait]
impl ScanStore for PostgresScanStore {
    #[instrument(skip(self, job), fields(tenant_id = %job.tenant_id, job_id = %job.id), err)]
    async fn create_job(&self, job: ScanJob) -> Result<ScanJobId, ScanStoreError> {
        sqlx::query(
            r#"
            INSERT INTO scan_jobs (id, tenant_id, target_id, status, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(job.tenant_id.as_uuid())
        .bind(job.target_id.as_uuid())
        .bind(job.status.as_str())
        .bind(job.created_at)
        .execute(&*self.pool)
        .await
        .map_err(storage("create_job"))?;

        Ok(job.id)
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, job_id = %job_id), err)]
    async fn get_job(
        &self,
        tenant_id: TenantId,
        job_id: ScanJobId,
    ) -> Result<Option<ScanJob>, ScanStoreError> {
        let row = sqlx::query(concat!(
            "SELECT ",
            job_columns!(),
            " FROM scan_jobs WHERE id = $1 AND tenant_id = $2"
        ))
        .bind(job_id.as_uuid())
        .bind(tenant_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(storage("get_job"))?;

        row.as_ref().map(decode_job).transpose()
    }

    async fn job_status(
        &self,
        tenant_id: TenantId,
        job_id: ScanJobId,
    ) -> Result<Option<WorkStatus>, ScanStoreError> {
        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM scan_jobs WHERE id = $1 AND tenant_id = $2")
                .bind(job_id.as_uuid())
                .bind(tenant_id.as_uuid())
                .fetch_optional(&*self.pool)
                .await
                .map_err(storage("job_status"))?;

        status.as_deref().map(parse_status).transpose()
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, job_id = %job_id), err)]
    async fn cancel_job(
        &self,
        tenant_id: TenantId,
        job_id: ScanJobId,
    ) -> Result<bool, ScanStoreError> {
        let done = sqlx::query(
            r#"
            UPDATE scan_jobs SET status = 'cancelled'
            WHERE id = $1 AND tenant_id = $2 AND status IN ('pending', 'running')
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(tenant_id.as_uuid())
        .execute(&*self.pool)
        .await
        .map_err(storage("cancel_job"))?;

        Ok(done.rows_affected() == 1)
    }

    #[instrument(
        skip(self, partitions),
        fields(tenant_id = %tenant_id, job_id = %job_id, partitions = partitions.len()),
        err
    )]
    async fn insert_partitions(
        &self,
        tenant_id: TenantId,
        job_id: ScanJobId,
        partitions: Vec<ScanPartition>,
    ) -> Result<(), ScanStoreError> {
        let mut tx = self.pool.begin().await.map_err(storage("insert_partitions"))?;

        let existing: Option<i32> = sqlx::query_scalar(
            "SELECT partitions_total FROM scan_jobs WHERE id = $1 AND tenant_id = $2 FOR UPDATE",
        )
        .bind(job_id.as_uuid())
        .bind(tenant_id.as_uuid())
        .fetch_optional(&mut *tx)
        .await
        .map_err(storage("insert_partitions"))?;

        match existing {
            None => return Err(ScanStoreError::JobNotFound(job_id)),
            Some(n) if n > 0 => {
                return Err(ScanStoreError::Conflict(format!(
                    "scan job {job_id} already fanned out"
                )));
            }
            Some(_) => {}
        }

        for p in &partitions {
            sqlx::query(
                r#"
                INSERT INTO scan_partitions (
                    id, tenant_id, job_id, partition_index, total_partitions,
                    partition_spec, status
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(p.id.as_uuid())
            .bind(tenant_id.as_uuid())
            .bind(job_id.as_uuid())
            .bind(p.partition_index as i32)
            .bind(p.total_partitions as i32)
            .bind(&p.partition_spec)
            .bind(p.status.as_str())
            .execute(&mut *tx)
            .await
            .map_err(storage("insert_partitions"))?;
        }

        sqlx::query("UPDATE scan_jobs SET partitions_total = $2 WHERE id = $1")
            .bind(job_id.as_uuid())
            .bind(partitions.len() as i32)
            .execute(&mut *tx)
            .await
            .map_err(storage("insert_partitions"))?;

        tx.commit().await.map_err(storage("insert_partitions"))?;
        Ok(())
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, partition_id = %partition_id), err)]
    async fn get_partition(
        &self,
        tenant_id: TenantId,
        partition_id: PartitionId,
    ) -> Result<Option<ScanPartition>, ScanStoreError> {
        let row = sqlx::query(concat!(
            "SELECT ",
            partition_columns!(),
            " FROM scan_partitions WHERE id = $1 AND tenant_id = $2"
        ))
        .bind(partition_id.as_uuid())
        .bind(tenant_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(storage("get_partition"))?;

        row.as_ref().map(decode_partition).transpose()
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, job_id = %job_id), err)]
    async fn list_partitions(
        &self,
        tenant_id: TenantId,
        job_id: ScanJobId,
    ) -> Result<Vec<ScanPartition>, ScanStoreError> {
        let rows = sqlx::query(concat!(
            "SELECT ",
            partition_columns!(),
            " FROM scan_partitions WHERE job_id = $1 AND tenant_id = $2 ORDER BY partition_index"
        ))
        .bind(job_id.as_uuid())
        .bind(tenant_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(storage("list_partitions"))?;

        rows.iter().map(decode_partition).collect()
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, partition_id = %partition_id), err)]
    async fn start_partition(
        &self,
        tenant_id: TenantId,
        partition_id: PartitionId,
        now: DateTime<Utc>,
    ) -> Result<StartOutcome, ScanStoreError> {
        let mut tx = self.pool.begin().await.map_err(storage("start_partition"))?;
        let mut partition =
            Self::load_partition(&mut tx, tenant_id, partition_id, "start_partition").await?;

        match partition.status {
            WorkStatus::Pending => {}
            WorkStatus::Running => return Ok(StartOutcome::Resumed(partition)),
            _ => return Ok(StartOutcome::Finished(partition)),
        }

        sqlx::query(
            "UPDATE scan_partitions SET status = 'running', started_at = $2 WHERE id = $1",
        )
        .bind(partition_id.as_uuid())
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(storage("start_partition"))?;

        sqlx::query(
            r#"
            UPDATE scan_jobs SET status = 'running', started_at = $3
            WHERE id = $1 AND tenant_id = $2 AND status = 'pending'
            "#,
        )
        .bind(partition.job_id.as_uuid())
        .bind(tenant_id.as_uuid())
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(storage("start_partition"))?;

        tx.commit().await.map_err(storage("start_partition"))?;

        partition.status = WorkStatus::Running;
        partition.started_at = Some(now);
        Ok(StartOutcome::Started(partition))
    }

    #[instrument(skip(self, progress), fields(tenant_id = %tenant_id, partition_id = %partition_id), err)]
    async fn record_progress(
        &self,
        tenant_id: TenantId,
        partition_id: PartitionId,
        progress: &PartitionProgress,
    ) -> Result<(), ScanStoreError> {
        let done = sqlx::query(
            r#"
            UPDATE scan_partitions
            SET files_scanned = $3,
                files_with_pii = $4,
                total_entities = $5,
                files_skipped = $6,
                files_errored = $7,
                last_processed_path = $8,
                stats = $9
            WHERE id = $1 AND tenant_id = $2 AND status = 'running'
            "#,
        )
        .bind(partition_id.as_uuid())
        .bind(tenant_id.as_uuid())
        .bind(progress.files_scanned as i64)
        .bind(progress.files_with_pii as i64)
        .bind(progress.total_entities as i64)
        .bind(progress.files_skipped as i64)
        .bind(progress.files_errored as i64)
        .bind(progress.last_processed_path.as_deref())
        .bind(stats_value(progress)?)
        .execute(&*self.pool)
        .await
        .map_err(storage("record_progress"))?;

        if done.rows_affected() == 1 {
            return Ok(());
        }
        match self.get_partition(tenant_id, partition_id).await? {
            None => Err(ScanStoreError::PartitionNotFound(partition_id)),
            Some(p) => Err(ScanStoreError::InvalidTransition {
                partition_id,
                from: p.status,
                to: WorkStatus::Running,
            }),
        }
    }

    #[instrument(
        skip(self, progress),
        fields(tenant_id = %tenant_id, partition_id = %partition_id, status = %status),
        err
    )]
    async fn finish_partition(
        &self,
        tenant_id: TenantId,
        partition_id: PartitionId,
        status: WorkStatus,
        progress: &PartitionProgress,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool, ScanStoreError> {
        let mut tx = self.pool.begin().await.map_err(storage("finish_partition"))?;
        let partition =
            Self::load_partition(&mut tx, tenant_id, partition_id, "finish_partition").await?;

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

        sqlx::query(
            r#"
            UPDATE scan_partitions
            SET status = $2,
                files_scanned = $3,
                files_with_pii = $4,
                total_entities = $5,
                files_skipped = $6,
                files_errored = $7,
                last_processed_path = $8,
                stats = $9,
                error = $10,
                completed_at = $11
            WHERE id = $1
            "#,
        )
        .bind(partition_id.as_uuid())
        .bind(status.as_str())
        .bind(progress.files_scanned as i64)
        .bind(progress.files_with_pii as i64)
        .bind(progress.total_entities as i64)
        .bind(progress.files_skipped as i64)
        .bind(progress.files_errored as i64)
        .bind(progress.last_processed_path.as_deref())
        .bind(stats_value(progress)?)
        .bind(error)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(storage("finish_partition"))?;

        tx.commit().await.map_err(storage("finish_partition"))?;
        Ok(true)
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, job_id = %job_id), err)]
    async fn try_begin_aggregation(
        &self,
        tenant_id: TenantId,
        job_id: ScanJobId,
    ) -> Result<Option<Box<dyn AggregationGuard>>, ScanStoreError> {
        let mut tx = self.pool.begin().await.map_err(storage("try_begin_aggregation"))?;

        let locked: bool = sqlx::query_scalar("SELECT pg_try_advisory_xact_lock($1)")
            .bind(advisory_key(job_id.as_uuid()))
            .fetch_one(&mut *tx)
            .await
            .map_err(storage("try_begin_aggregation"))?;

        if !locked {
            tx.rollback().await.map_err(storage("try_begin_aggregation"))?;
            debug!(job_id = %job_id, "aggregation lock busy");
            return Ok(None);
        }

        Ok(Some(Box::new(PgAggregationGuard {
            tx,
            tenant_id,
            job_id,
        })))
    }
}

/// Transaction holding the job's advisory lock.
struct PgAggregationGuard {
    tx: Transaction<'static, Postgres>,
    tenant_id: TenantId,
    job_id: ScanJobId,
}

#[async_trait]
impl AggregationGuard for PgAggregationGuard {
    async fn load(&mut self) -> Result<Option<(ScanJob, Vec<ScanPartition>)>, ScanStoreError> {
        let row = sqlx::query(concat!(
            "SELECT ",
            job_columns!(),
            " FROM scan_jobs WHERE id = $1 AND tenant_id = $2 FOR UPDATE"
        ))
        .bind(self.job_id.as_uuid())
        .bind(self.tenant_id.as_uuid())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(storage("aggregation_load"))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let job = decode_job(&row)?;

        let rows = sqlx::query(concat!(
            "SELECT ",
            partition_columns!(),
            " FROM scan_partitions WHERE job_id = $1 AND tenant_id = $2 ORDER BY partition_index"
        ))
        .bind(self.job_id.as_uuid())
        .bind(self.tenant_id.as_uuid())
        .fetch_all(&mut *self.tx)
        .await
        .map_err(storage("aggregation_load"))?;

        let partitions = rows
            .iter()
            .map(decode_partition)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Some((job, partitions)))
    }

    /// The parent row has been locked since `load`, so `cancel_job` waits for
    /// this commit and then finds the parent terminal.
    async fn commit(
        self: Box<Self>,
        summary: &ScanSummary,
    ) -> Result<Option<ScanSummary>, ScanStoreError> {
        let mut this = *self;
        let done = sqlx::query(
            r#"
            UPDATE scan_jobs
            SET status = $3,
                files_scanned = $4,
                files_with_pii = $5,
                total_entities = $6,
                partitions_completed = $7,
                partitions_failed = $8,
                error = $9,
                completed_at = $10
            WHERE id = $1 AND tenant_id = $2 AND completed_at IS NULL
            "#,
        )
        .bind(this.job_id.as_uuid())
        .bind(this.tenant_id.as_uuid())
        .bind(summary.status.as_str())
        .bind(summary.files_scanned as i64)
        .bind(summary.files_with_pii as i64)
        .bind(summary.total_entities as i64)
        .bind(summary.partitions_completed as i32)
        .bind(summary.partitions_failed as i32)
        .bind(summary.error.as_deref())
        .bind(summary.completed_at)
        .execute(&mut *this.tx)
        .await
        .map_err(storage("aggregation_commit"))?;

        let written = done.rows_affected() == 1;
        this.tx.commit().await.map_err(storage("aggregation_commit"))?;
        Ok(written.then(|| summary.clone()))
    }

    async fn release(self: Box<Self>) -> Result<(), ScanStoreError> {
        let this = *self;
        this.tx.rollback().await.map_err(storage("aggregation_release"))
    }
}
