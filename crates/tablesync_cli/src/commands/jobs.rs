//! Job and table status commands.

use super::{emit, open_ledger, table_ref, CommandResult, Format};
use std::path::Path;
use tablesync_ledger::JobLedger;
use tablesync_types::{JobId, JobStatus, SyncJob, TableSyncStatus, Value};

/// Shows one job.
pub fn show(ledger: &Path, id: &str, format: Format) -> CommandResult {
    let job_id: JobId = id.parse()?;
    let job = open_ledger(ledger)?.get(job_id)?;
    emit(format, &job, print_job)
}

/// Lists jobs, newest first.
pub fn list(ledger: &Path, status: Option<&str>, limit: usize, format: Format) -> CommandResult {
    let status = status.map(str::parse::<JobStatus>).transpose()?;
    let jobs = open_ledger(ledger)?.list_jobs(status, limit)?;
    emit(format, &jobs, |jobs| {
        if jobs.is_empty() {
            println!("No jobs");
        }
        for job in jobs {
            println!("{}", job_line(job));
        }
    })
}

/// Shows a table's last known sync state.
pub fn table_status(ledger: &Path, schema: &str, table: &str, format: Format) -> CommandResult {
    let table = table_ref(schema, table);
    let status = open_ledger(ledger)?.get_table_status(&table)?;
    match status {
        Some(status) => emit(format, &status, print_table_status),
        None => Err(format!("table {table} has never been synced").into()),
    }
}

/// One-line summary of a job.
pub(crate) fn job_line(job: &SyncJob) -> String {
    format!(
        "{}  {:<9}  {:<11}  {}  {} rows",
        job.job_id,
        job.status,
        job.strategy.name(),
        job.table_ref,
        job.stats.rows_processed
    )
}

/// Prints a job record in text form.
pub(crate) fn print_job(job: &SyncJob) {
    println!("Job {}", job.job_id);
    println!("  Table:      {}", job.table_ref);
    println!("  Strategy:   {}", job.strategy.name());
    if let Some(column) = job.strategy.watermark_column() {
        println!("  Watermark:  {column} > {}", display_value(job.watermark.as_ref()));
    }
    if let Some(filter) = &job.filter {
        println!("  Filter:     {}", filter.to_sql());
    }
    println!("  Status:     {}", job.status);
    println!("  Started:    {}", job.started_at.to_rfc3339());
    if let Some(heartbeat) = job.heartbeat_at {
        println!("  Heartbeat:  {}", heartbeat.to_rfc3339());
    }
    if let Some(completed) = job.completed_at {
        println!("  Completed:  {}", completed.to_rfc3339());
    }
    match job.stats.total_rows {
        Some(total) => println!("  Rows:       {} / {total}", job.stats.rows_processed),
        None => println!("  Rows:       {}", job.stats.rows_processed),
    }
    println!("  Bytes:      {}", job.stats.bytes);
    if let Some(message) = &job.error_message {
        println!("  Error:      {message}");
    }
}

fn print_table_status(status: &TableSyncStatus) {
    println!("Table {}", status.table_ref);
    println!("  Last job:     {} ({})", status.last_job_id, status.last_status);
    match status.last_synced_at {
        Some(at) => println!("  Last synced:  {}", at.to_rfc3339()),
        None => println!("  Last synced:  never"),
    }
    if let Some(error) = &status.last_error {
        println!("  Last error:   {error}");
    }
    println!("  Rows:         {}", status.row_count);
    println!("  Size:         {} bytes", status.size_bytes);
    println!(
        "  Watermark:    {}",
        display_value(status.last_watermark_value.as_ref())
    );
}

fn display_value(value: Option<&Value>) -> String {
    value.map_or_else(|| "-".to_string(), Value::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tablesync_ledger::SqliteLedger;
    use tablesync_types::{SourceTableRef, SyncRequest};
    use tempfile::TempDir;

    #[test]
    fn job_line_shows_status_and_table() {
        let ledger = SqliteLedger::in_memory().unwrap();
        let job_id = ledger
            .create(&SyncRequest::incremental(
                SourceTableRef::new("sales", "orders"),
                "UPDATED_AT",
            ))
            .unwrap();
        let job = ledger.get(job_id).unwrap();

        let line = job_line(&job);
        assert!(line.starts_with(&job_id.to_string()));
        assert!(line.contains("pending"));
        assert!(line.contains("sales.orders"));
        assert!(line.ends_with("0 rows"));
    }

    #[test]
    fn unknown_status_filter_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ledger.db");
        assert!(list(&path, Some("paused"), 10, Format::Json).is_err());
        assert!(list(&path, Some("failed"), 10, Format::Json).is_ok());
    }

    #[test]
    fn missing_table_status_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ledger.db");
        assert!(table_status(&path, "sales", "orders", Format::Text).is_err());
    }

    #[test]
    fn malformed_job_id_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ledger.db");
        assert!(show(&path, "not-a-uuid", Format::Text).is_err());
    }
}
