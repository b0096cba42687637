//! Sync jobs and per-table sync status.

use crate::table::SourceTableRef;
use crate::value::{Predicate, Value};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Unique identifier of a sync job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    /// Generates a fresh random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wraps an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// How rows are moved into the destination.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum SyncStrategy {
    /// Replace every destination row.
    Full,
    /// Append rows whose watermark column is past the last watermark.
    Incremental {
        /// Monotonic column, typically an update timestamp.
        watermark_column: String,
    },
}

impl SyncStrategy {
    /// Convenience constructor for [`SyncStrategy::Incremental`].
    pub fn incremental(watermark_column: impl Into<String>) -> Self {
        SyncStrategy::Incremental {
            watermark_column: watermark_column.into(),
        }
    }

    /// Returns the watermark column for incremental syncs.
    pub fn watermark_column(&self) -> Option<&str> {
        match self {
            SyncStrategy::Full => None,
            SyncStrategy::Incremental { watermark_column } => Some(watermark_column),
        }
    }

    /// Short name used in logs and listings.
    pub fn name(&self) -> &'static str {
        match self {
            SyncStrategy::Full => "full",
            SyncStrategy::Incremental { .. } => "incremental",
        }
    }
}

/// Lifecycle status of a sync job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Created, not yet claimed by a worker.
    Pending,
    /// Claimed and executing.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
}

impl JobStatus {
    /// Storage string.
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    /// Returns true for `Completed` and `Failed`.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Returns true for `Pending` and `Running`.
    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }

    /// Returns true if `self → next` is a legal transition.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Running)
                | (JobStatus::Running, JobStatus::Completed)
                | (JobStatus::Running, JobStatus::Failed)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown status string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown job status: {0}")]
pub struct ParseStatusError(pub String);

impl FromStr for JobStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(ParseStatusError(other.to_string())),
        }
    }
}

/// Progress counters of a job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStats {
    /// Rows loaded into the destination by the current pass.
    pub rows_processed: u64,
    /// Rows exported by the current pass; unknown until export finishes.
    pub total_rows: Option<u64>,
    /// Size of the staged file in bytes.
    pub bytes: u64,
}

impl JobStats {
    /// Applies a partial update; absent fields keep their value.
    pub fn merge(&mut self, update: &StatsUpdate) {
        if let Some(rows) = update.rows_processed {
            self.rows_processed = rows;
        }
        if let Some(total) = update.total_rows {
            self.total_rows = Some(total);
        }
        if let Some(bytes) = update.bytes {
            self.bytes = bytes;
        }
    }

    /// Returns false if `rows_processed` exceeds a known `total_rows`.
    pub fn is_consistent(&self) -> bool {
        self.total_rows
            .map_or(true, |total| self.rows_processed <= total)
    }
}

/// A partial stats update. Also serves as a liveness heartbeat.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsUpdate {
    /// New `rows_processed`, if changed.
    pub rows_processed: Option<u64>,
    /// New `total_rows`, if known.
    pub total_rows: Option<u64>,
    /// New `bytes`, if changed.
    pub bytes: Option<u64>,
}

impl StatsUpdate {
    /// An update that changes nothing but refreshes the heartbeat.
    pub fn heartbeat() -> Self {
        Self::default()
    }

    /// Sets `rows_processed`.
    pub fn rows_processed(mut self, rows: u64) -> Self {
        self.rows_processed = Some(rows);
        self
    }

    /// Sets `total_rows`.
    pub fn total_rows(mut self, rows: u64) -> Self {
        self.total_rows = Some(rows);
        self
    }

    /// Sets `bytes`.
    pub fn bytes(mut self, bytes: u64) -> Self {
        self.bytes = Some(bytes);
        self
    }
}

/// A request to sync one table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRequest {
    /// Table to sync.
    pub table_ref: SourceTableRef,
    /// Sync strategy.
    pub strategy: SyncStrategy,
    /// Optional explicit row filter, AND-ed with any watermark filter.
    pub filter: Option<Predicate>,
}

impl SyncRequest {
    /// A full sync of `table_ref`.
    pub fn full(table_ref: SourceTableRef) -> Self {
        Self {
            table_ref,
            strategy: SyncStrategy::Full,
            filter: None,
        }
    }

    /// An incremental sync of `table_ref` on `watermark_column`.
    pub fn incremental(table_ref: SourceTableRef, watermark_column: impl Into<String>) -> Self {
        Self {
            table_ref,
            strategy: SyncStrategy::incremental(watermark_column),
            filter: None,
        }
    }

    /// Restricts the export to rows matching `filter`.
    pub fn with_filter(mut self, filter: Predicate) -> Self {
        self.filter = Some(filter);
        self
    }
}

/// The unit of work tracked by the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncJob {
    /// Unique job ID.
    pub job_id: JobId,
    /// Table being synced.
    pub table_ref: SourceTableRef,
    /// Sync strategy.
    pub strategy: SyncStrategy,
    /// Explicit row filter, if any.
    pub filter: Option<Predicate>,
    /// Current status.
    pub status: JobStatus,
    /// When the job was created; reset when a worker claims it.
    pub started_at: DateTime<Utc>,
    /// Last stats update while running.
    pub heartbeat_at: Option<DateTime<Utc>>,
    /// Set if and only if the status is terminal.
    pub completed_at: Option<DateTime<Utc>>,
    /// Failure message, verbatim.
    pub error_message: Option<String>,
    /// Progress counters.
    pub stats: JobStats,
    /// Highest watermark exported by this job (incremental only).
    pub watermark: Option<Value>,
}

impl SyncJob {
    /// Time of the last sign of life: the latest heartbeat, else the start.
    pub fn last_activity(&self) -> DateTime<Utc> {
        self.heartbeat_at.unwrap_or(self.started_at)
    }
}

/// Denormalized last-known sync state of one table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSyncStatus {
    /// The table.
    pub table_ref: SourceTableRef,
    /// Most recent job to reach a terminal state.
    pub last_job_id: JobId,
    /// That job's terminal status.
    pub last_status: JobStatus,
    /// When the table last synced successfully.
    pub last_synced_at: Option<DateTime<Utc>>,
    /// Error of the last job, if it failed.
    pub last_error: Option<String>,
    /// Source row count at the last successful sync.
    pub row_count: u64,
    /// Source size in bytes at the last successful sync.
    pub size_bytes: u64,
    /// Highest watermark synced so far. Never regresses.
    pub last_watermark_value: Option<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legal_transitions() {
        use JobStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Failed));

        assert!(!Pending.can_transition_to(Completed));
        assert!(!Pending.can_transition_to(Failed));
        assert!(!Running.can_transition_to(Pending));
        assert!(!Completed.can_transition_to(Running));
        assert!(!Failed.can_transition_to(Running));
        assert!(!Completed.can_transition_to(Failed));
    }

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("paused".parse::<JobStatus>().is_err());
    }

    #[test]
    fn stats_merge_keeps_absent_fields() {
        let mut stats = JobStats {
            rows_processed: 5,
            total_rows: Some(10),
            bytes: 100,
        };
        stats.merge(&StatsUpdate::default().rows_processed(8));
        assert_eq!(stats.rows_processed, 8);
        assert_eq!(stats.total_rows, Some(10));
        assert_eq!(stats.bytes, 100);

        stats.merge(&StatsUpdate::heartbeat());
        assert_eq!(stats.rows_processed, 8);
    }

    #[test]
    fn stats_consistency() {
        let mut stats = JobStats::default();
        stats.rows_processed = 3;
        assert!(stats.is_consistent());
        stats.total_rows = Some(2);
        assert!(!stats.is_consistent());
    }

    #[test]
    fn strategy_serializes_with_mode_tag() {
        let json = serde_json::to_string(&SyncStrategy::incremental("updated_at")).unwrap();
        assert_eq!(json, r#"{"mode":"incremental","watermark_column":"updated_at"}"#);
        let back: SyncStrategy = serde_json::from_str(&json).unwrap();
        assert_eq!(back.watermark_column(), Some("updated_at"));
    }

    #[test]
    fn job_id_parses() {
        let id = JobId::new();
        assert_eq!(id.to_string().parse::<JobId>().unwrap(), id);
    }
}
