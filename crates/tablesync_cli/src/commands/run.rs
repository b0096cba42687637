//! Run and sync command implementations.

use super::jobs::print_job;
use super::{build_service, emit, table_ref, CommandResult, DataArgs, Format};
use std::path::Path;
use tablesync_types::SyncRequest;
use tracing::info;

/// Runs the service until Ctrl-C.
pub fn run(
    ledger: &Path,
    data: &DataArgs,
    workers: usize,
    require_registration: bool,
) -> CommandResult {
    let config = data
        .config()
        .with_workers(workers)
        .with_required_registration(require_registration);
    let service = build_service(ledger, data, config)?;

    let recovered = service.start()?;
    info!(
        ledger = %ledger.display(),
        source = %data.source.display(),
        destination = %data.destination.display(),
        recovered,
        "waiting for Ctrl-C"
    );

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(tokio::signal::ctrl_c())?;

    info!("shutting down");
    service.shutdown();
    Ok(())
}

/// Runs one job on the calling thread and prints its final record.
pub fn sync_once(
    ledger: &Path,
    data: &DataArgs,
    schema: &str,
    table: &str,
    incremental: Option<&str>,
    format: Format,
) -> CommandResult {
    let service = build_service(ledger, data, data.config())?;
    let table = table_ref(schema, table);
    let request = match incremental {
        Some(column) => SyncRequest::incremental(table, column),
        None => SyncRequest::full(table),
    };

    let job = service.sync_now(request)?;
    emit(format, &job, print_job)?;
    if let Some(message) = &job.error_message {
        return Err(format!("job {} failed: {message}", job.job_id).into());
    }
    Ok(())
}
