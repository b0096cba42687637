//! The sync service: the engine's entry point for callers.

use crate::config::EngineConfig;
use crate::destination::DestinationStore;
use crate::error::{SyncError, SyncResult};
use crate::periodic::PeriodicTask;
use crate::reaper::StaleJobReaper;
use crate::retry::{RetryClass, RetrySupervisor};
use crate::source::SourceWarehouse;
use crate::staging::StagingArea;
use crate::sweeper::{RetentionSweeper, SweepReport};
use crate::worker::{SyncWorker, WorkerPool};
use chrono::Utc;
use parking_lot::Mutex;
use std::sync::Arc;
use tablesync_ledger::JobLedger;
use tablesync_types::{
    JobId, JobStatus, RegisteredTable, SourceTableRef, SyncJob, SyncRequest, SyncStrategy,
    TableSyncStatus,
};
use tracing::{info, warn};

struct Runtime {
    pool: WorkerPool,
    tasks: Vec<PeriodicTask>,
}

/// Submits sync jobs, runs them on a worker pool and keeps the ledger tidy.
///
/// Created stopped: [`SyncService::submit`] records jobs but nothing executes
/// them until [`SyncService::start`].
///
/// # Example
///
/// ```rust,ignore
/// let service = SyncService::new(config, ledger, source, destination);
/// service.start()?;
/// let job_id = service.submit(SyncRequest::full(SourceTableRef::new("sales", "orders")))?;
/// // ... poll service.status(job_id)
/// service.shutdown();
/// ```
pub struct SyncService {
    config: EngineConfig,
    ledger: Arc<dyn JobLedger>,
    source: Arc<dyn SourceWarehouse>,
    worker: Arc<SyncWorker>,
    reaper: Arc<StaleJobReaper>,
    sweeper: Arc<RetentionSweeper>,
    retry: RetrySupervisor,
    runtime: Mutex<Option<Runtime>>,
}

impl SyncService {
    /// Creates a stopped service.
    pub fn new(
        config: EngineConfig,
        ledger: Arc<dyn JobLedger>,
        source: Arc<dyn SourceWarehouse>,
        destination: Arc<dyn DestinationStore>,
    ) -> Self {
        let worker = Arc::new(SyncWorker::new(
            &config,
            Arc::clone(&ledger),
            Arc::clone(&source),
            destination,
        ));
        let reaper = Arc::new(StaleJobReaper::new(
            Arc::clone(&ledger),
            config.reaper.clone(),
        ));
        let sweeper = Arc::new(RetentionSweeper::new(
            Arc::clone(&ledger),
            StagingArea::new(&config.staging_dir),
            config.retention.clone(),
        ));
        let retry = RetrySupervisor::new(
            config.sync_retry.clone(),
            config.lightweight_retry.clone(),
        );
        Self {
            config,
            ledger,
            source,
            worker,
            reaper,
            sweeper,
            retry,
            runtime: Mutex::new(None),
        }
    }

    /// The service configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Returns true between [`SyncService::start`] and [`SyncService::shutdown`].
    pub fn is_running(&self) -> bool {
        self.runtime.lock().is_some()
    }

    /// Starts the workers and the periodic reaper and sweepers, then
    /// re-dispatches jobs left `Pending` by a previous run.
    ///
    /// Returns the number of re-dispatched jobs.
    pub fn start(&self) -> SyncResult<usize> {
        let mut runtime = self.runtime.lock();
        if runtime.is_some() {
            return Err(SyncError::InvalidRequest("service already started".into()));
        }

        let pool = WorkerPool::spawn(Arc::clone(&self.worker), self.config.workers)?;
        let tasks = self.spawn_tasks()?;

        let mut pending = self.ledger.list_jobs(Some(JobStatus::Pending), usize::MAX)?;
        // Oldest first.
        pending.reverse();
        for job in &pending {
            pool.dispatch(job.job_id)?;
        }

        info!(
            workers = self.config.workers,
            recovered = pending.len(),
            "sync service started"
        );
        *runtime = Some(Runtime { pool, tasks });
        Ok(pending.len())
    }

    fn spawn_tasks(&self) -> SyncResult<Vec<PeriodicTask>> {
        let retention = &self.config.retention;
        let mut tasks = Vec::with_capacity(4);

        let reaper = Arc::clone(&self.reaper);
        tasks.push(PeriodicTask::spawn(
            "reaper",
            self.config.reaper.interval,
            move || reaper.reap_once(Utc::now()).map(drop),
        )?);

        let sweeper = Arc::clone(&self.sweeper);
        tasks.push(PeriodicTask::spawn(
            "sweep-completed",
            retention.completed_interval,
            move || sweeper.sweep_completed(Utc::now()).map(drop),
        )?);

        let sweeper = Arc::clone(&self.sweeper);
        tasks.push(PeriodicTask::spawn(
            "sweep-failed",
            retention.failed_interval,
            move || sweeper.sweep_failed(Utc::now()).map(drop),
        )?);

        let sweeper = Arc::clone(&self.sweeper);
        tasks.push(PeriodicTask::spawn(
            "sweep-staging",
            retention.staging_interval,
            move || sweeper.sweep_staging(Utc::now()).map(drop),
        )?);

        Ok(tasks)
    }

    /// Stops the periodic tasks, drains queued jobs and joins the workers.
    pub fn shutdown(&self) {
        let Some(mut runtime) = self.runtime.lock().take() else {
            return;
        };
        for task in &mut runtime.tasks {
            task.stop();
        }
        runtime.pool.shutdown();
        info!("sync service stopped");
    }

    fn validate(&self, request: &SyncRequest) -> SyncResult<()> {
        let table = &request.table_ref;
        if table.schema_name.trim().is_empty() || table.table_name.trim().is_empty() {
            return Err(SyncError::InvalidRequest(
                "schema and table name must not be empty".into(),
            ));
        }
        if let SyncStrategy::Incremental { watermark_column } = &request.strategy {
            if watermark_column.trim().is_empty() {
                return Err(SyncError::InvalidRequest(
                    "incremental sync needs a watermark column".into(),
                ));
            }
        }
        if self.config.require_registered_tables && !self.ledger.is_table_allowed(table)? {
            return Err(SyncError::TableNotAllowed(table.clone()));
        }
        Ok(())
    }

    /// Records a new job and, if the service is running, queues it.
    ///
    /// # Errors
    ///
    /// - [`SyncError::JobAlreadyRunning`] if the table has an active job
    /// - [`SyncError::TableNotAllowed`] if registration is required and missing
    /// - [`SyncError::InvalidRequest`] for malformed requests
    pub fn submit(&self, request: SyncRequest) -> SyncResult<JobId> {
        self.validate(&request)?;
        let job_id = self.ledger.create(&request)?;
        info!(
            job_id = %job_id,
            table = %request.table_ref,
            strategy = request.strategy.name(),
            "job submitted"
        );

        if let Some(runtime) = self.runtime.lock().as_ref() {
            if let Err(e) = runtime.pool.dispatch(job_id) {
                // Stays pending; the next start picks it up.
                warn!(job_id = %job_id, error = %e, "could not dispatch job");
            }
        }
        Ok(job_id)
    }

    /// Records a job and runs it on the calling thread. Returns the final record.
    pub fn sync_now(&self, request: SyncRequest) -> SyncResult<SyncJob> {
        self.validate(&request)?;
        let job_id = self.ledger.create(&request)?;
        self.worker.execute(job_id)?;
        self.status(job_id)
    }

    /// The latest committed record of a job.
    pub fn status(&self, job_id: JobId) -> SyncResult<SyncJob> {
        Ok(self.ledger.get(job_id)?)
    }

    /// The last known sync state of a table, if it was ever synced.
    pub fn table_status(&self, table: &SourceTableRef) -> SyncResult<Option<TableSyncStatus>> {
        Ok(self.ledger.get_table_status(table)?)
    }

    /// Jobs, newest first, optionally filtered by status.
    pub fn list_jobs(&self, status: Option<JobStatus>, limit: usize) -> SyncResult<Vec<SyncJob>> {
        Ok(self.ledger.list_jobs(status, limit)?)
    }

    /// Adds a table to the allow-list after checking it exists in the source.
    pub fn register_table(&self, table: &SourceTableRef) -> SyncResult<RegisteredTable> {
        let columns = self
            .retry
            .run(RetryClass::Lightweight, "describe_table", |_| {
                self.source.describe_table(table)
            })?;
        if columns.is_empty() {
            return Err(SyncError::TableNotFound(table.clone()));
        }
        let registered = self.ledger.register_table(table)?;
        info!(table = %table, "table registered");
        Ok(registered)
    }

    /// Removes a table from the allow-list. Returns false if it wasn't listed.
    pub fn deactivate_table(&self, table: &SourceTableRef) -> SyncResult<bool> {
        let changed = self.ledger.deactivate_table(table)?;
        if changed {
            info!(table = %table, "table deactivated");
        }
        Ok(changed)
    }

    /// All registered tables, active or not.
    pub fn list_tables(&self) -> SyncResult<Vec<RegisteredTable>> {
        Ok(self.ledger.list_tables()?)
    }

    /// Runs one reaper sweep now.
    pub fn reap_now(&self) -> SyncResult<Vec<JobId>> {
        self.reaper.reap_once(Utc::now())
    }

    /// Runs all retention sweeps now.
    pub fn sweep_now(&self) -> SyncResult<SweepReport> {
        self.sweeper.sweep_all(Utc::now())
    }
}

impl Drop for SyncService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use crate::destination::SqliteStore;
    use crate::source::MemoryWarehouse;
    use std::time::{Duration, Instant};
    use tablesync_ledger::SqliteLedger;
    use tablesync_types::{SourceColumn, Value};
    use tempfile::TempDir;

    fn orders() -> SourceTableRef {
        SourceTableRef::new("sales", "orders")
    }

    fn service(dir: &TempDir, config: impl FnOnce(EngineConfig) -> EngineConfig) -> SyncService {
        let source = Arc::new(MemoryWarehouse::new());
        source.create_table(orders(), vec![SourceColumn::new("ID", "NUMBER")]);
        source
            .insert_rows(&orders(), (0..3).map(|i| vec![Value::Number(f64::from(i))]))
            .unwrap();
        let quick = RetryConfig::new(1)
            .with_initial_delay(Duration::ZERO)
            .with_jitter(false);
        let base = EngineConfig::new(dir.path().join("staging"))
            .with_workers(2)
            .with_sync_retry(quick.clone())
            .with_lightweight_retry(quick);
        SyncService::new(
            config(base),
            Arc::new(SqliteLedger::in_memory().unwrap()),
            source,
            Arc::new(SqliteStore::in_memory().unwrap()),
        )
    }

    fn wait_terminal(service: &SyncService, job_id: JobId) -> SyncJob {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let job = service.status(job_id).unwrap();
            if job.status.is_terminal() || Instant::now() > deadline {
                return job;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn submitted_job_runs_once_started() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir, |c| c);

        let job_id = service.submit(SyncRequest::full(orders())).unwrap();
        assert_eq!(service.status(job_id).unwrap().status, JobStatus::Pending);

        // Recovered from the ledger on start.
        assert_eq!(service.start().unwrap(), 1);
        assert_eq!(wait_terminal(&service, job_id).status, JobStatus::Completed);

        let second = service.submit(SyncRequest::full(orders())).unwrap();
        assert_eq!(wait_terminal(&service, second).status, JobStatus::Completed);
        assert_eq!(service.table_status(&orders()).unwrap().unwrap().row_count, 3);

        service.shutdown();
        assert!(!service.is_running());
    }

    #[test]
    fn second_submit_for_active_table_is_rejected() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir, |c| c);
        service.submit(SyncRequest::full(orders())).unwrap();
        let err = service.submit(SyncRequest::full(orders())).unwrap_err();
        assert!(matches!(err, SyncError::JobAlreadyRunning { .. }));
    }

    #[test]
    fn registration_gates_submission() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir, |c| c.with_required_registration(true));

        let err = service.submit(SyncRequest::full(orders())).unwrap_err();
        assert!(matches!(err, SyncError::TableNotAllowed(_)));

        let missing = SourceTableRef::new("sales", "nope");
        assert!(matches!(
            service.register_table(&missing).unwrap_err(),
            SyncError::TableNotFound(_)
        ));

        service.register_table(&orders()).unwrap();
        let job = service.sync_now(SyncRequest::full(orders())).unwrap();
        assert_eq!(job.status, JobStatus::Completed);

        assert!(service.deactivate_table(&orders()).unwrap());
        assert!(matches!(
            service.submit(SyncRequest::full(orders())).unwrap_err(),
            SyncError::TableNotAllowed(_)
        ));
        assert_eq!(service.list_tables().unwrap().len(), 1);
    }

    #[test]
    fn malformed_requests_are_rejected() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir, |c| c);
        for request in [
            SyncRequest::full(SourceTableRef::new("", "orders")),
            SyncRequest::incremental(orders(), " "),
        ] {
            assert!(matches!(
                service.submit(request).unwrap_err(),
                SyncError::InvalidRequest(_)
            ));
        }
        assert!(service.list_jobs(None, 10).unwrap().is_empty());
    }

    #[test]
    fn start_twice_is_an_error() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir, |c| c);
        service.start().unwrap();
        assert!(service.start().is_err());
        service.shutdown();
        // Restartable after shutdown.
        service.start().unwrap();
    }

    #[test]
    fn maintenance_passes_run_on_demand() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir, |c| c);
        service.sync_now(SyncRequest::full(orders())).unwrap();

        assert!(service.reap_now().unwrap().is_empty());
        assert_eq!(service.sweep_now().unwrap(), SweepReport::default());
        assert_eq!(service.list_jobs(Some(JobStatus::Completed), 10).unwrap().len(), 1);
    }
}
