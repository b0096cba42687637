//! Stale job reaper.
//!
//! A worker that dies mid-job leaves its job `Running` forever. The reaper
//! is the only recovery path: any running job whose last sign of life (its
//! latest stats heartbeat, else its claim time) is older than the liveness
//! threshold is force-failed.

use crate::config::ReaperConfig;
use crate::error::{SyncError, SyncResult};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tablesync_ledger::{JobLedger, TransitionFields};
use tablesync_types::{JobId, JobStatus};
use tracing::{debug, warn};

/// `now - window`, saturating at the earliest representable instant.
pub(crate) fn cutoff(now: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(window)
        .ok()
        .and_then(|window| now.checked_sub_signed(window))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Force-fails running jobs that stopped making progress.
pub struct StaleJobReaper {
    ledger: Arc<dyn JobLedger>,
    config: ReaperConfig,
}

impl StaleJobReaper {
    /// Creates a reaper.
    pub fn new(ledger: Arc<dyn JobLedger>, config: ReaperConfig) -> Self {
        Self { ledger, config }
    }

    /// The reaper's configuration.
    pub fn config(&self) -> &ReaperConfig {
        &self.config
    }

    /// Runs one sweep as of `now`. Returns the jobs it failed.
    pub fn reap_once(&self, now: DateTime<Utc>) -> SyncResult<Vec<JobId>> {
        let threshold = self.config.liveness_threshold;
        let stale = self.ledger.stale_jobs(cutoff(now, threshold))?;

        let mut reaped = Vec::with_capacity(stale.len());
        for job in stale {
            let idle = (now - job.last_activity()).num_seconds();
            let message = SyncError::Stale(format!(
                "no progress for {idle}s (threshold {}s)",
                threshold.as_secs()
            ))
            .to_string();

            match self.ledger.transition(
                job.job_id,
                JobStatus::Failed,
                TransitionFields::failed(message),
            ) {
                Ok(_) => {
                    warn!(job_id = %job.job_id, table = %job.table_ref, idle_secs = idle, "reaped stale job");
                    reaped.push(job.job_id);
                }
                Err(e) => match SyncError::from(e) {
                    // Finished between the scan and the transition.
                    SyncError::IllegalTransition(_) => {
                        debug!(job_id = %job.job_id, "stale candidate already settled");
                    }
                    other => return Err(other),
                },
            }
        }
        Ok(reaped)
    }
}
