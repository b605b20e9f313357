//! PostgreSQL connection and error helpers shared by the sqlx-backed stores.

use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use uuid::Uuid;

/// Namespace mixed into every advisory key so scan aggregation locks do not
/// collide with advisory locks taken by other applications on the same database.
const AGGREGATION_LOCK_NAMESPACE: i64 = 0x5343_414e_4147_4752;

/// Open a connection pool.
///
/// The pool is the only process-level resource; callers own it and pass it into
/// each store constructor.
pub async fn connect(database_url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await
}

/// Stable 64-bit advisory lock key for a scan job.
///
/// Identical across processes and restarts (no per-process hash seed).
pub fn advisory_key(id: &Uuid) -> i64 {
    let (hi, lo) = id.as_u64_pair();
    ((hi ^ lo) as i64) ^ AGGREGATION_LOCK_NAMESPACE
}

/// Classification of a sqlx failure, before the owning layer wraps it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlFailure {
    /// `23505`
    UniqueViolation(String),
    /// `23503` / `23514`
    ConstraintViolation(String),
    /// Pool closed or timed out
    Unavailable(String),
    Other(String),
}

impl SqlFailure {
    pub fn message(&self) -> &str {
        match self {
            SqlFailure::UniqueViolation(m)
            | SqlFailure::ConstraintViolation(m)
            | SqlFailure::Unavailable(m)
            | SqlFailure::Other(m) => m,
        }
    }
}

impl std::fmt::Display for SqlFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.message())
    }
}

/// Map a sqlx error raised by `operation` into a [`SqlFailure`].
pub fn map_sqlx_error(operation: &str, err: sqlx::Error) -> SqlFailure {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => SqlFailure::UniqueViolation(msg),
                Some("23503") | Some("23514") => SqlFailure::ConstraintViolation(msg),
                _ => SqlFailure::Other(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            SqlFailure::Unavailable(format!("connection pool closed in {}", operation))
        }
        sqlx::Error::PoolTimedOut => {
            SqlFailure::Unavailable(format!("connection pool timed out in {}", operation))
        }
        sqlx::Error::RowNotFound => {
            // fetch_optional/fetch_all are used throughout; this should not happen
            SqlFailure::Other(format!("unexpected row not found in {}", operation))
        }
        _ => SqlFailure::Other(format!("sqlx error in {}: {}", operation, err)),
    }
}
