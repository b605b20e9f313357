//! Database schema bootstrap.

use anyhow::Context;
use sqlx::PgPool;

const SCAN_SCHEDULER: &str = include_str!("../migrations/0001_scan_scheduler.sql");

/// Create the queue and scan tables if they do not exist yet.
pub async fn apply(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::raw_sql(SCAN_SCHEDULER)
        .execute(pool)
        .await
        .context("failed to apply scan scheduler schema")?;
    Ok(())
}
