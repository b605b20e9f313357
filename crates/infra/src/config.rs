//! Scheduler configuration, loaded from environment variables at startup.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use scanflow_observability::LogConfig;

use crate::jobs::{ClaimOrder, RetryPolicy};

/// Runtime configuration for a scheduler process.
///
/// Every field has a default so the scheduler works without any environment
/// variables set (apart from a reachable database).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub database: DatabaseConfig,
    pub queue: QueueConfig,
    pub retry: RetryPolicy,
    pub partition: PartitionConfig,
    pub executor: ExecutorConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// PostgreSQL connection string.
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgres://localhost/scanflow".to_string(),
            max_connections: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Tie-break among equal priorities.
    pub claim_order: ClaimOrder,
    /// Running jobs older than this are eligible for operator reclaim.
    pub stuck_after: Duration,
    /// Dead-letter retention used by TTL purges.
    pub dead_letter_ttl: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            claim_order: ClaimOrder::CreatedFirst,
            stuck_after: Duration::from_secs(3600),
            dead_letter_ttl: Duration::from_secs(30 * 24 * 3600),
        }
    }
}

/// Per-partition worker loop settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PartitionConfig {
    /// Files between progress commits / cancellation checks.
    pub checkpoint_every: usize,
    /// Inventory page size.
    pub page_size: usize,
    /// Budget for one pipeline call.
    pub file_timeout: Duration,
    /// Larger files are skipped.
    pub max_file_size_bytes: u64,
    /// Budget for each post-completion hook.
    pub hook_timeout: Duration,
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            checkpoint_every: 10,
            page_size: 100,
            file_timeout: Duration::from_secs(60),
            max_file_size_bytes: 100 * 1024 * 1024,
            hook_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Worker ids are `"{name}-{i}"`.
    pub name: String,
    pub concurrency: usize,
    /// Sleep between empty polls.
    pub poll_interval: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            name: "scanflow-worker".to_string(),
            concurrency: 4,
            poll_interval: Duration::from_millis(1000),
        }
    }
}

impl SchedulerConfig {
    /// Build [`SchedulerConfig`] from `SCANFLOW_*` environment variables,
    /// falling back to defaults for absent or unparsable values.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        let env = Env(&lookup);

        Self {
            database: DatabaseConfig {
                url: env.or("SCANFLOW_DATABASE_URL", &d.database.url),
                max_connections: env.parse("SCANFLOW_DB_MAX_CONNECTIONS", d.database.max_connections),
            },
            queue: QueueConfig {
                claim_order: match env.get("SCANFLOW_CLAIM_ORDER").as_deref() {
                    Some("scheduled_first") => ClaimOrder::ScheduledFirst,
                    Some("created_first") => ClaimOrder::CreatedFirst,
                    _ => d.queue.claim_order,
                },
                stuck_after: env.secs("SCANFLOW_STUCK_AFTER_SECS", d.queue.stuck_after),
                dead_letter_ttl: env.secs("SCANFLOW_DEAD_LETTER_TTL_SECS", d.queue.dead_letter_ttl),
            },
            retry: RetryPolicy {
                base_delay: env.secs("SCANFLOW_RETRY_BASE_SECS", d.retry.base_delay),
                max_delay: env.secs("SCANFLOW_RETRY_MAX_SECS", d.retry.max_delay),
                default_max_retries: env.parse("SCANFLOW_MAX_RETRIES", d.retry.default_max_retries),
                ..d.retry
            },
            partition: PartitionConfig {
                checkpoint_every: env
                    .parse("SCANFLOW_CHECKPOINT_EVERY", d.partition.checkpoint_every)
                    .max(1),
                page_size: env.parse("SCANFLOW_PAGE_SIZE", d.partition.page_size).max(1),
                file_timeout: env.secs("SCANFLOW_FILE_TIMEOUT_SECS", d.partition.file_timeout),
                max_file_size_bytes: env
                    .get("SCANFLOW_MAX_FILE_SIZE_MB")
                    .and_then(|v| v.parse::<u64>().ok())
                    .map(|mb| mb.saturating_mul(1024 * 1024))
                    .unwrap_or(d.partition.max_file_size_bytes),
                hook_timeout: env.secs("SCANFLOW_HOOK_TIMEOUT_SECS", d.partition.hook_timeout),
            },
            executor: ExecutorConfig {
                name: env.or("SCANFLOW_WORKER_NAME", &d.executor.name),
                concurrency: env.parse("SCANFLOW_WORKERS", d.executor.concurrency).max(1),
                poll_interval: env
                    .get("SCANFLOW_POLL_INTERVAL_MS")
                    .and_then(|v| v.parse::<u64>().ok())
                    .map(Duration::from_millis)
                    .unwrap_or(d.executor.poll_interval),
            },
            log: LogConfig {
                level: env.or("SCANFLOW_LOG", &d.log.level),
                json: env
                    .get("SCANFLOW_LOG_JSON")
                    .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                    .unwrap_or(d.log.json),
            },
        }
    }
}

// ── private helpers ──────────────────────────────────────────────────────────

struct Env<'a, F>(&'a F);

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key).filter(|v| !v.trim().is_empty())
    }

    fn or(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_owned())
    }

    fn parse<T: std::str::FromStr>(&self, key: &str, default: T) -> T {
        self.get(key)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }

    fn secs(&self, key: &str, default: Duration) -> Duration {
        self.get(key)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(default)
    }
}
