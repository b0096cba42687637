//! Job execution: the per-job pipeline and the worker pool running it.

use crate::config::EngineConfig;
use crate::destination::DestinationStore;
use crate::error::{SyncError, SyncResult};
use crate::retry::{RetryClass, RetrySupervisor};
use crate::schema::SchemaReconciler;
use crate::source::SourceWarehouse;
use crate::staging::StagingArea;
use crate::transport::{BatchTransporter, TransportOutcome, TransportPlan};
use parking_lot::Mutex;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tablesync_ledger::{JobLedger, TransitionFields};
use tablesync_types::{JobId, JobStatus, StatsUpdate, SyncJob, SyncStrategy, TableStats};
use tracing::{debug, error, info, warn};

/// Runs one job's full pipeline, writing every transition to the ledger.
pub struct SyncWorker {
    ledger: Arc<dyn JobLedger>,
    source: Arc<dyn SourceWarehouse>,
    reconciler: SchemaReconciler,
    transporter: BatchTransporter,
    retry: RetrySupervisor,
}

impl SyncWorker {
    /// Creates a worker over the given collaborators.
    pub fn new(
        config: &EngineConfig,
        ledger: Arc<dyn JobLedger>,
        source: Arc<dyn SourceWarehouse>,
        destination: Arc<dyn DestinationStore>,
    ) -> Self {
        Self {
            reconciler: SchemaReconciler::new(Arc::clone(&source), Arc::clone(&destination)),
            transporter: BatchTransporter::new(
                Arc::clone(&source),
                destination,
                Arc::clone(&ledger),
                StagingArea::new(&config.staging_dir),
                config.chunk_size,
            ),
            retry: RetrySupervisor::new(
                config.sync_retry.clone(),
                config.lightweight_retry.clone(),
            ),
            ledger,
            source,
        }
    }

    /// Claims a pending job and runs it to a terminal state.
    ///
    /// Pipeline failures are recorded on the job and are not returned;
    /// the result is the job's final status. An error means the job could
    /// not be claimed or the ledger itself failed.
    pub fn execute(&self, job_id: JobId) -> SyncResult<JobStatus> {
        self.ledger
            .transition(job_id, JobStatus::Running, TransitionFields::none())?;
        let job = self.ledger.get(job_id)?;
        info!(job_id = %job_id, table = %job.table_ref, strategy = job.strategy.name(), "job started");

        match self.pipeline(&job) {
            Ok((outcome, table_stats)) => self.complete(&job, outcome, table_stats),
            Err(e) => self.fail(&job, &e),
        }
    }

    fn pipeline(&self, job: &SyncJob) -> SyncResult<(TransportOutcome, Option<TableStats>)> {
        let table = &job.table_ref;

        let columns = self.retry.run(RetryClass::Sync, "fetch_source_schema", |_| {
            self.reconciler.fetch_source_schema(table)
        })?;
        let change = self
            .retry
            .run(RetryClass::Sync, "ensure_destination_schema", |_| {
                self.reconciler.ensure_destination_schema(table, &columns)
            })?;
        debug!(job_id = %job.job_id, ?change, "destination schema ready");

        let last_watermark = match job.strategy {
            SyncStrategy::Full => None,
            SyncStrategy::Incremental { .. } => self
                .retry
                .run(RetryClass::Lightweight, "get_table_status", |_| {
                    Ok(self.ledger.get_table_status(table)?)
                })?
                .and_then(|status| status.last_watermark_value),
        };

        let plan = TransportPlan {
            table_ref: table.clone(),
            columns,
            strategy: job.strategy.clone(),
            filter: job.filter.clone(),
            last_watermark,
        };
        let outcome = self.retry.run(RetryClass::Sync, "transport", |attempt| {
            self.transporter.run(job.job_id, attempt, &plan)
        })?;

        let table_stats = match self
            .retry
            .run(RetryClass::Lightweight, "table_stats", |_| {
                self.source.table_stats(table)
            }) {
            Ok(stats) => Some(stats),
            Err(e) => {
                // The data is loaded; keep the previous counts rather than fail the job.
                warn!(job_id = %job.job_id, table = %table, error = %e, "table stats unavailable");
                None
            }
        };
        Ok((outcome, table_stats))
    }

    fn complete(
        &self,
        job: &SyncJob,
        outcome: TransportOutcome,
        table_stats: Option<TableStats>,
    ) -> SyncResult<JobStatus> {
        let fields = TransitionFields {
            table_stats,
            ..TransitionFields::none()
        }
        .with_stats(
            StatsUpdate::default()
                .rows_processed(outcome.exported_rows)
                .total_rows(outcome.exported_rows)
                .bytes(outcome.bytes),
        )
        .with_watermark(outcome.watermark);

        match self.settle(job.job_id, JobStatus::Completed, fields) {
            Ok(status) => {
                if status == JobStatus::Completed {
                    info!(
                        job_id = %job.job_id,
                        table = %job.table_ref,
                        rows = outcome.exported_rows,
                        "job completed"
                    );
                }
                Ok(status)
            }
            // The load is verified but unrecorded; failing keeps the watermark where it was.
            Err(e) => self.fail(job, &e),
        }
    }

    fn fail(&self, job: &SyncJob, cause: &SyncError) -> SyncResult<JobStatus> {
        error!(job_id = %job.job_id, table = %job.table_ref, error = %cause, "job failed");
        self.settle(
            job.job_id,
            JobStatus::Failed,
            TransitionFields::failed(cause.to_string()),
        )
    }

    /// Writes a terminal transition, retrying lock contention.
    fn settle(
        &self,
        job_id: JobId,
        to: JobStatus,
        fields: TransitionFields,
    ) -> SyncResult<JobStatus> {
        let result = self.retry.run(RetryClass::Lightweight, "settle_job", |_| {
            Ok(self.ledger.transition(job_id, to, fields.clone())?)
        });
        match result {
            Ok(job) => Ok(job.status),
            Err(e) => self.settled_elsewhere(job_id, e),
        }
    }

    /// The reaper may have failed the job while it ran; its record stands.
    fn settled_elsewhere(&self, job_id: JobId, err: SyncError) -> SyncResult<JobStatus> {
        match err {
            SyncError::IllegalTransition(_) => {
                let status = self.ledger.get(job_id)?.status;
                warn!(job_id = %job_id, %status, "job was settled by another party");
                Ok(status)
            }
            other => Err(other),
        }
    }
}

/// A fixed pool of threads executing dispatched jobs.
///
/// Each job runs entirely on the thread that picked it up.
pub struct WorkerPool {
    sender: Mutex<Option<Sender<JobId>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Starts `size` threads sharing `worker`.
    pub fn spawn(worker: Arc<SyncWorker>, size: usize) -> SyncResult<Self> {
        let (sender, receiver) = mpsc::channel::<JobId>();
        let receiver = Arc::new(Mutex::new(receiver));

        let mut handles = Vec::with_capacity(size.max(1));
        for index in 0..size.max(1) {
            let worker = Arc::clone(&worker);
            let receiver = Arc::clone(&receiver);
            let handle = thread::Builder::new()
                .name(format!("tablesync-worker-{index}"))
                .spawn(move || worker_loop(&worker, &receiver))?;
            handles.push(handle);
        }

        Ok(Self {
            sender: Mutex::new(Some(sender)),
            handles: Mutex::new(handles),
        })
    }

    /// Queues a job for execution.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::InvalidRequest`] after [`WorkerPool::shutdown`].
    pub fn dispatch(&self, job_id: JobId) -> SyncResult<()> {
        let sender = self.sender.lock();
        let sender = sender
            .as_ref()
            .ok_or_else(|| SyncError::InvalidRequest("worker pool is shut down".into()))?;
        sender
            .send(job_id)
            .map_err(|_| SyncError::InvalidRequest("worker pool is shut down".into()))
    }

    /// Stops accepting jobs, lets queued jobs finish and joins the threads.
    pub fn shutdown(&self) {
        self.sender.lock().take();
        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            if handle.join().is_err() {
                error!("worker thread panicked");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(worker: &SyncWorker, receiver: &Mutex<Receiver<JobId>>) {
    loop {
        let next = receiver.lock().recv();
        let Ok(job_id) = next else {
            break;
        };
        match worker.execute(job_id) {
            Ok(status) => debug!(job_id = %job_id, %status, "job finished"),
            Err(e) => error!(job_id = %job_id, error = %e, "job could not be executed"),
        }
    }
}
