//! Error types for ledger operations.

use tablesync_types::{JobId, JobStatus, SourceTableRef};
use thiserror::Error;

/// Result type for ledger operations.
pub type LedgerResult<T> = Result<T, LedgerError>;

/// Errors that can occur during ledger operations.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// Underlying SQLite failure.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// File-system failure (e.g. creating the ledger directory).
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A stored JSON column could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// Another job is already pending or running for the table.
    #[error("a sync job is already active for {table} ({job_id})")]
    JobAlreadyRunning {
        /// The contested table.
        table: SourceTableRef,
        /// The active job, when known.
        job_id: String,
    },

    /// The requested status change is not in the legal transition set.
    #[error("illegal transition for job {job_id}: {from} -> {to}")]
    IllegalTransition {
        /// Job ID.
        job_id: JobId,
        /// Current status.
        from: JobStatus,
        /// Requested status.
        to: JobStatus,
    },

    /// No job with this ID exists.
    #[error("job not found: {0}")]
    JobNotFound(JobId),

    /// Stats can only be updated while the job is running.
    #[error("job {job_id} is not running (status {status})")]
    NotRunning {
        /// Job ID.
        job_id: JobId,
        /// Current status.
        status: JobStatus,
    },

    /// A stats update would make `rows_processed` exceed `total_rows`.
    #[error("inconsistent stats for job {0}: rows_processed exceeds total_rows")]
    InconsistentStats(JobId),

    /// A caller passed an argument the ledger cannot act on.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A stored record could not be interpreted.
    #[error("corrupt ledger record: {0}")]
    Corrupt(String),
}

impl LedgerError {
    /// Returns true if the store was busy or locked by another writer.
    pub fn is_contention(&self) -> bool {
        match self {
            LedgerError::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}
