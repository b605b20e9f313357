//! Scan job, partition and aggregation types.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use scanflow_core::{PartitionId, ScanJobId, TargetId, TenantId, WorkStatus};

/// Parent aggregate: one per user-initiated scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanJob {
    pub id: ScanJobId,
    pub tenant_id: TenantId,
    pub target_id: TargetId,
    pub status: WorkStatus,
    pub files_scanned: u64,
    pub files_with_pii: u64,
    pub total_entities: u64,
    /// Fixed at fan-out
    pub partitions_total: u32,
    pub partitions_completed: u32,
    pub partitions_failed: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ScanJob {
    pub fn new(tenant_id: TenantId, target_id: TargetId) -> Self {
        Self {
            id: ScanJobId::new(),
            tenant_id,
            target_id,
            status: WorkStatus::Pending,
            files_scanned: 0,
            files_with_pii: 0,
            total_entities: 0,
            partitions_total: 0,
            partitions_completed: 0,
            partitions_failed: 0,
            started_at: None,
            completed_at: None,
            error: None,
            created_at: Utc::now(),
        }
    }

    /// Aggregation already wrote the final state. `completed_at` is stamped
    /// only by aggregation, including for cancelled scans.
    pub fn is_aggregated(&self) -> bool {
        self.completed_at.is_some()
    }
}

/// Child unit of a scan job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanPartition {
    pub id: PartitionId,
    pub tenant_id: TenantId,
    pub job_id: ScanJobId,
    pub partition_index: u32,
    pub total_partitions: u32,
    /// Opaque to the coordinator; see [`PartitionSpec`] for the key-range form.
    pub partition_spec: serde_json::Value,
    pub status: WorkStatus,
    pub progress: PartitionProgress,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl ScanPartition {
    pub fn new(
        tenant_id: TenantId,
        job_id: ScanJobId,
        partition_index: u32,
        total_partitions: u32,
        partition_spec: serde_json::Value,
    ) -> Self {
        Self {
            id: PartitionId::new(),
            tenant_id,
            job_id,
            partition_index,
            total_partitions,
            partition_spec,
            status: WorkStatus::Pending,
            progress: PartitionProgress::default(),
            started_at: None,
            completed_at: None,
            error: None,
        }
    }
}

/// Risk bucket reported by the detection pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskTier {
    Minimal,
    Low,
    Medium,
    High,
    Critical,
}

/// Extra per-partition counters, persisted as the `stats` blob.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PartitionStats {
    pub by_risk_tier: BTreeMap<RiskTier, u64>,
}

/// Running counters of one partition, written at every checkpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PartitionProgress {
    pub files_scanned: u64,
    pub files_with_pii: u64,
    pub total_entities: u64,
    pub files_skipped: u64,
    pub files_errored: u64,
    /// Resumption cursor: last path handled (scanned, skipped or errored).
    pub last_processed_path: Option<String>,
    pub stats: PartitionStats,
}

impl PartitionProgress {
    /// Count one scanned file.
    pub fn record_scanned(&mut self, total_entities: u64, risk_tier: Option<RiskTier>) {
        self.files_scanned += 1;
        self.total_entities += total_entities;
        if total_entities > 0 {
            self.files_with_pii += 1;
        }
        if let Some(tier) = risk_tier {
            *self.stats.by_risk_tier.entry(tier).or_default() += 1;
        }
    }

    /// Files looked at, whatever their outcome.
    pub fn files_seen(&self) -> u64 {
        self.files_scanned + self.files_skipped + self.files_errored
    }
}

/// Key range a partition covers: keys under `prefix` in `[start_at, end_before)`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionSpec {
    #[serde(default)]
    pub prefix: String,
    /// Inclusive lower bound; unbounded when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_at: Option<String>,
    /// Exclusive upper bound; unbounded when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_before: Option<String>,
}

impl PartitionSpec {
    /// The whole keyspace under `prefix`.
    pub fn whole(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            start_at: None,
            end_before: None,
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        key.starts_with(&self.prefix)
            && self.start_at.as_deref().is_none_or(|s| key >= s)
            && self.end_before.as_deref().is_none_or(|e| key < e)
    }

    /// Contiguous, non-overlapping ranges split at `boundaries`.
    ///
    /// `n` distinct boundaries give `n + 1` ranges covering the whole prefix.
    pub fn key_ranges<S: AsRef<str>>(prefix: &str, boundaries: &[S]) -> Vec<PartitionSpec> {
        let mut points: Vec<&str> = boundaries.iter().map(AsRef::as_ref).collect();
        points.sort_unstable();
        points.dedup();

        let mut lower: Option<&str> = None;
        let mut ranges = Vec::with_capacity(points.len() + 1);
        for point in points {
            ranges.push(PartitionSpec {
                prefix: prefix.to_string(),
                start_at: lower.map(str::to_string),
                end_before: Some(point.to_string()),
            });
            lower = Some(point);
        }
        ranges.push(PartitionSpec {
            prefix: prefix.to_string(),
            start_at: lower.map(str::to_string),
            end_before: None,
        });
        ranges
    }

    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    pub fn from_value(value: &serde_json::Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value.clone())
    }
}

/// Queue payload of a `scan_partition` job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionTask {
    pub partition_id: PartitionId,
    pub job_id: ScanJobId,
}

/// Final state written to the parent by a successful aggregation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanSummary {
    pub job_id: ScanJobId,
    pub status: WorkStatus,
    pub files_scanned: u64,
    pub files_with_pii: u64,
    pub total_entities: u64,
    pub partitions_total: u32,
    pub partitions_completed: u32,
    pub partitions_failed: u32,
    pub error: Option<String>,
    pub completed_at: DateTime<Utc>,
}

/// Result of one `check_and_aggregate` attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AggregationOutcome {
    /// Another worker holds the job's aggregation mutex.
    LockBusy,
    /// Some partitions are not terminal yet.
    Deferred { remaining: usize },
    /// The parent already reached its final state.
    AlreadyAggregated,
    /// This call aggregated the job.
    Aggregated(ScanSummary),
}

/// How a partition's worker loop ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionReport {
    pub partition_id: PartitionId,
    pub status: WorkStatus,
    pub progress: PartitionProgress,
}
