//! One-shot reaper and sweeper passes.

use super::{emit, open_ledger, CommandResult, Format};
use chrono::Utc;
use std::path::Path;
use std::time::Duration;
use tablesync_engine::{
    ReaperConfig, RetentionConfig, RetentionSweeper, StaleJobReaper, StagingArea,
};

/// Fails running jobs idle for longer than `threshold_secs`.
pub fn reap(ledger: &Path, threshold_secs: u64, format: Format) -> CommandResult {
    let config =
        ReaperConfig::default().with_liveness_threshold(Duration::from_secs(threshold_secs));
    let reaper = StaleJobReaper::new(open_ledger(ledger)?, config);
    let reaped = reaper.reap_once(Utc::now())?;
    emit(format, &reaped, |reaped| {
        println!("Reaped {} stale job(s)", reaped.len());
        for job_id in reaped {
            println!("  {job_id}");
        }
    })
}

/// Applies the default retention windows once.
pub fn sweep(ledger: &Path, staging: &Path, format: Format) -> CommandResult {
    let sweeper = RetentionSweeper::new(
        open_ledger(ledger)?,
        StagingArea::new(staging),
        RetentionConfig::default(),
    );
    let report = sweeper.sweep_all(Utc::now())?;
    emit(
        format,
        &serde_json::json!({
            "completed_jobs": report.completed_jobs,
            "failed_jobs": report.failed_jobs,
            "staged_dirs": report.staged_dirs,
        }),
        |_| {
            println!("Deleted {} completed job(s)", report.completed_jobs);
            println!("Deleted {} failed job(s)", report.failed_jobs);
            println!("Removed {} staging director(ies)", report.staged_dirs);
        },
    )
}
