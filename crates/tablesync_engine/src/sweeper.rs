//! Retention sweeper.
//!
//! Deletes terminal job records and orphaned staging directories once they
//! outlive their retention window. Table status rows are never touched.

use crate::config::RetentionConfig;
use crate::error::SyncResult;
use crate::reaper::cutoff;
use crate::staging::StagingArea;
use chrono::{DateTime, Utc};
use std::fs;
use std::sync::Arc;
use tablesync_ledger::{JobLedger, LedgerError};
use tablesync_types::JobStatus;
use tracing::{debug, info, warn};

/// Counts of what one full sweep removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Completed job records deleted.
    pub completed_jobs: u64,
    /// Failed job records deleted.
    pub failed_jobs: u64,
    /// Staging directories deleted.
    pub staged_dirs: u64,
}

/// Applies the retention windows.
pub struct RetentionSweeper {
    ledger: Arc<dyn JobLedger>,
    staging: StagingArea,
    config: RetentionConfig,
}

impl RetentionSweeper {
    /// Creates a sweeper.
    pub fn new(ledger: Arc<dyn JobLedger>, staging: StagingArea, config: RetentionConfig) -> Self {
        Self {
            ledger,
            staging,
            config,
        }
    }

    /// The sweeper's configuration.
    pub fn config(&self) -> &RetentionConfig {
        &self.config
    }

    /// Deletes completed jobs finished before `now - completed_jobs`.
    pub fn sweep_completed(&self, now: DateTime<Utc>) -> SyncResult<u64> {
        self.purge(JobStatus::Completed, cutoff(now, self.config.completed_jobs))
    }

    /// Deletes failed jobs finished before `now - failed_jobs`.
    pub fn sweep_failed(&self, now: DateTime<Utc>) -> SyncResult<u64> {
        self.purge(JobStatus::Failed, cutoff(now, self.config.failed_jobs))
    }

    fn purge(&self, status: JobStatus, before: DateTime<Utc>) -> SyncResult<u64> {
        let deleted = self.ledger.purge_terminal(status, before)?;
        if deleted > 0 {
            info!(%status, deleted, "purged job records");
        }
        Ok(deleted)
    }

    /// Deletes staging directories older than `now - staged_files`.
    ///
    /// A directory whose job is still running is kept regardless of age.
    pub fn sweep_staging(&self, now: DateTime<Utc>) -> SyncResult<u64> {
        let before = cutoff(now, self.config.staged_files);
        let mut removed = 0;

        for entry in self.staging.entries()? {
            if entry.modified >= before {
                continue;
            }
            if let Some(job_id) = entry.job_id {
                match self.ledger.get(job_id) {
                    Ok(job) if job.status == JobStatus::Running => {
                        debug!(job_id = %job_id, "keeping staging directory of running job");
                        continue;
                    }
                    Ok(_) | Err(LedgerError::JobNotFound(_)) => {}
                    Err(e) => return Err(e.into()),
                }
            }
            match fs::remove_dir_all(&entry.path) {
                Ok(()) => {
                    debug!(path = %entry.path.display(), "removed orphaned staging directory");
                    removed += 1;
                }
                Err(e) => {
                    warn!(path = %entry.path.display(), error = %e, "failed to remove staging directory");
                }
            }
        }
        if removed > 0 {
            info!(removed, "swept staging area");
        }
        Ok(removed)
    }

    /// Runs all three sweeps.
    pub fn sweep_all(&self, now: DateTime<Utc>) -> SyncResult<SweepReport> {
        Ok(SweepReport {
            completed_jobs: self.sweep_completed(now)?,
            failed_jobs: self.sweep_failed(now)?,
            staged_dirs: self.sweep_staging(now)?,
        })
    }
}
