//! Error types for the sync engine.

use tablesync_ledger::LedgerError;
use tablesync_types::SourceTableRef;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Whether retrying an operation can help.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Expected to succeed on retry.
    Transient,
    /// Retrying cannot fix it; the job fails immediately.
    Fatal,
}

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// The source warehouse could not be reached.
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),

    /// A call to either data system timed out.
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// A data system or the ledger was locked by another writer.
    #[error("lock contention: {0}")]
    LockContention(String),

    /// Post-load row count did not match the export.
    #[error("verification failed: expected {expected} rows in destination, found {actual}")]
    VerificationFailed {
        /// Rows the destination should hold.
        expected: u64,
        /// Rows it actually holds.
        actual: u64,
    },

    /// Credentials were rejected.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The table does not exist in the source.
    #[error("table not found: {0}")]
    TableNotFound(SourceTableRef),

    /// An existing destination column cannot hold the new source type.
    #[error(
        "schema conflict on {table} column {column}: destination has {existing}, source now maps to {incoming}"
    )]
    SchemaConflict {
        /// Table being reconciled.
        table: SourceTableRef,
        /// Column name.
        column: String,
        /// Declared destination type.
        existing: String,
        /// Newly mapped type.
        incoming: String,
    },

    /// Another job is already pending or running for the table.
    #[error("a sync job is already active for {table} ({job_id})")]
    JobAlreadyRunning {
        /// The contested table.
        table: SourceTableRef,
        /// The active job, when known.
        job_id: String,
    },

    /// The ledger refused a status change.
    #[error("{0}")]
    IllegalTransition(String),

    /// The destination store failed.
    #[error("destination error: {0}")]
    Destination(String),

    /// The staged file could not be written or read.
    #[error("staging error: {0}")]
    Staging(String),

    /// File-system or thread failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Any other ledger failure.
    #[error("ledger error: {0}")]
    Ledger(LedgerError),

    /// The table is not in the active allow-list.
    #[error("table {0} is not registered for sync")]
    TableNotAllowed(SourceTableRef),

    /// The request can never be executed as given.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Synthetic failure recorded by the stale job reaper.
    #[error("stale job timed out: {0}")]
    Stale(String),
}

impl SyncError {
    /// Classifies the error for the retry supervisor.
    pub fn class(&self) -> ErrorClass {
        match self {
            SyncError::SourceUnavailable(_)
            | SyncError::Timeout(_)
            | SyncError::LockContention(_)
            | SyncError::VerificationFailed { .. } => ErrorClass::Transient,
            _ => ErrorClass::Fatal,
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}

impl From<LedgerError> for SyncError {
    fn from(err: LedgerError) -> Self {
        if err.is_contention() {
            return SyncError::LockContention(err.to_string());
        }
        match err {
            LedgerError::JobAlreadyRunning { table, job_id } => {
                SyncError::JobAlreadyRunning { table, job_id }
            }
            err @ LedgerError::IllegalTransition { .. } => {
                SyncError::IllegalTransition(err.to_string())
            }
            other => SyncError::Ledger(other),
        }
    }
}

impl From<arrow::error::ArrowError> for SyncError {
    fn from(err: arrow::error::ArrowError) -> Self {
        SyncError::Staging(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tablesync_types::{JobId, JobStatus};

    #[test]
    fn transient_errors() {
        assert!(SyncError::SourceUnavailable("reset".into()).is_retryable());
        assert!(SyncError::Timeout("export".into()).is_retryable());
        assert!(SyncError::LockContention("busy".into()).is_retryable());
        assert!(SyncError::VerificationFailed {
            expected: 10,
            actual: 9
        }
        .is_retryable());
    }

    #[test]
    fn fatal_errors() {
        let table = SourceTableRef::new("sales", "orders");
        assert_eq!(
            SyncError::AuthenticationFailed("bad password".into()).class(),
            ErrorClass::Fatal
        );
        assert!(!SyncError::TableNotFound(table.clone()).is_retryable());
        assert!(!SyncError::SchemaConflict {
            table: table.clone(),
            column: "amount".into(),
            existing: "DOUBLE".into(),
            incoming: "VARCHAR".into(),
        }
        .is_retryable());
        assert!(!SyncError::IllegalTransition("x".into()).is_retryable());
        assert!(!SyncError::Stale("no heartbeat".into()).is_retryable());
        assert!(!SyncError::TableNotAllowed(table).is_retryable());
    }

    #[test]
    fn ledger_errors_map_to_engine_variants() {
        let table = SourceTableRef::new("sales", "orders");
        let err: SyncError = LedgerError::JobAlreadyRunning {
            table: table.clone(),
            job_id: "abc".into(),
        }
        .into();
        assert!(matches!(err, SyncError::JobAlreadyRunning { .. }));

        let err: SyncError = LedgerError::IllegalTransition {
            job_id: JobId::new(),
            from: JobStatus::Failed,
            to: JobStatus::Completed,
        }
        .into();
        assert!(matches!(err, SyncError::IllegalTransition(_)));
        assert!(err.to_string().contains("failed -> completed"));

        let busy = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        );
        let err: SyncError = LedgerError::Sqlite(busy).into();
        assert!(err.is_retryable());

        let err: SyncError = LedgerError::JobNotFound(JobId::new()).into();
        assert!(matches!(err, SyncError::Ledger(_)));
    }

    #[test]
    fn error_display() {
        let err = SyncError::VerificationFailed {
            expected: 10_000,
            actual: 9_999,
        };
        assert!(err.to_string().contains("10000"));
        assert!(err.to_string().contains("9999"));
    }
}
