//! Job ledger trait definition.

use crate::error::LedgerResult;
use chrono::{DateTime, Utc};
use tablesync_types::{
    JobId, JobStatus, RegisteredTable, SourceTableRef, StatsUpdate, SyncJob, SyncRequest,
    TableStats, TableSyncStatus, Value,
};

/// Extra fields recorded with a status transition.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransitionFields {
    /// Failure message, stored verbatim (`Failed` only).
    pub error_message: Option<String>,
    /// Final stats merged into the job.
    pub stats: Option<StatsUpdate>,
    /// Highest watermark exported by the job (`Completed` only).
    pub watermark: Option<Value>,
    /// Source table statistics for the table status row (`Completed` only).
    pub table_stats: Option<TableStats>,
}

impl TransitionFields {
    /// No extra fields.
    pub fn none() -> Self {
        Self::default()
    }

    /// Fields for a failed job.
    pub fn failed(error_message: impl Into<String>) -> Self {
        Self {
            error_message: Some(error_message.into()),
            ..Self::default()
        }
    }

    /// Fields for a completed job.
    pub fn completed(table_stats: TableStats) -> Self {
        Self {
            table_stats: Some(table_stats),
            ..Self::default()
        }
    }

    /// Sets the final stats.
    pub fn with_stats(mut self, stats: StatsUpdate) -> Self {
        self.stats = Some(stats);
        self
    }

    /// Sets the exported watermark.
    pub fn with_watermark(mut self, watermark: Option<Value>) -> Self {
        self.watermark = watermark;
        self
    }
}

/// Durable store for sync jobs and per-table sync status.
///
/// Every operation is atomic with respect to every other operation on the
/// same table.
///
/// # Invariants
///
/// - `create` refuses a table that already has a `Pending` or `Running` job
/// - `transition` accepts only `Pending→Running`, `Running→Completed`, `Running→Failed`
/// - `completed_at` is set exactly when the status becomes terminal
/// - The table status row is written in the same commit as the terminal transition
/// - `last_watermark_value` only advances; failures never touch it
///
/// # Implementors
///
/// - [`super::SqliteLedger`] - file-backed or in-memory SQLite
pub trait JobLedger: Send + Sync {
    /// Records a new `Pending` job for the request's table.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::JobAlreadyRunning`](crate::LedgerError::JobAlreadyRunning)
    /// if another job for the table is pending or running.
    fn create(&self, request: &SyncRequest) -> LedgerResult<JobId>;

    /// Moves a job to `to`, recording `fields`, and returns the updated job.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::IllegalTransition`](crate::LedgerError::IllegalTransition)
    /// for any transition outside the legal set, and
    /// [`LedgerError::JobNotFound`](crate::LedgerError::JobNotFound) for unknown IDs.
    fn transition(&self, job_id: JobId, to: JobStatus, fields: TransitionFields)
        -> LedgerResult<SyncJob>;

    /// Returns the latest committed record of a job.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::JobNotFound`](crate::LedgerError::JobNotFound) for unknown IDs.
    fn get(&self, job_id: JobId) -> LedgerResult<SyncJob>;

    /// Returns the last known sync state of a table, if it ever finished a job.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure.
    fn get_table_status(&self, table: &SourceTableRef) -> LedgerResult<Option<TableSyncStatus>>;

    /// Merges a partial stats update into a running job and refreshes its heartbeat.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::NotRunning`](crate::LedgerError::NotRunning) unless the
    /// job is running.
    fn update_stats(&self, job_id: JobId, update: &StatsUpdate) -> LedgerResult<()>;

    /// Lists jobs, newest first, optionally filtered by status.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure.
    fn list_jobs(&self, status: Option<JobStatus>, limit: usize) -> LedgerResult<Vec<SyncJob>>;

    /// Returns running jobs whose last activity is older than `inactive_since`.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure.
    fn stale_jobs(&self, inactive_since: DateTime<Utc>) -> LedgerResult<Vec<SyncJob>>;

    /// Deletes jobs in terminal `status` that completed before `completed_before`.
    ///
    /// Returns the number of deleted jobs. Table status rows are never deleted.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::InvalidArgument`](crate::LedgerError::InvalidArgument)
    /// for a non-terminal status.
    fn purge_terminal(&self, status: JobStatus, completed_before: DateTime<Utc>)
        -> LedgerResult<u64>;

    /// Adds a table to the allow-list, or reactivates it.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure.
    fn register_table(&self, table: &SourceTableRef) -> LedgerResult<RegisteredTable>;

    /// Removes a table from the allow-list. Returns false if it was not registered.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure.
    fn deactivate_table(&self, table: &SourceTableRef) -> LedgerResult<bool>;

    /// Returns true if the table is registered and active.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure.
    fn is_table_allowed(&self, table: &SourceTableRef) -> LedgerResult<bool>;

    /// Lists every registered table, active or not.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure.
    fn list_tables(&self) -> LedgerResult<Vec<RegisteredTable>>;
}
