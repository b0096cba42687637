//! SQLite-backed implementation of [`JobLedger`].
//!
//! A single `Mutex<Connection>` serializes access within the process.
//! `BEGIN IMMEDIATE` transactions and a partial unique index on active jobs
//! serialize writers across processes sharing the same file.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, TransactionBehavior};
use tablesync_types::{
    JobId, JobStats, JobStatus, RegisteredTable, SourceTableRef, StatsUpdate, SyncJob,
    SyncRequest, TableStats, TableSyncStatus, Value,
};
use tracing::debug;

use crate::error::{LedgerError, LedgerResult};
use crate::ledger::{JobLedger, TransitionFields};

/// Idempotent DDL for ledger tables.
const CREATE_TABLES: &str = r"
CREATE TABLE IF NOT EXISTS sync_jobs (
    job_id TEXT PRIMARY KEY,
    schema_name TEXT NOT NULL,
    table_name TEXT NOT NULL,
    strategy TEXT NOT NULL,
    filter TEXT,
    status TEXT NOT NULL,
    started_at TEXT NOT NULL,
    heartbeat_at TEXT,
    completed_at TEXT,
    error_message TEXT,
    rows_processed INTEGER NOT NULL DEFAULT 0,
    total_rows INTEGER,
    bytes INTEGER NOT NULL DEFAULT 0,
    watermark TEXT
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_sync_jobs_one_active
    ON sync_jobs (schema_name, table_name) WHERE status IN ('pending', 'running');

CREATE INDEX IF NOT EXISTS idx_sync_jobs_status ON sync_jobs (status, completed_at);

CREATE TABLE IF NOT EXISTS table_sync_status (
    schema_name TEXT NOT NULL,
    table_name TEXT NOT NULL,
    last_job_id TEXT NOT NULL,
    last_status TEXT NOT NULL,
    last_synced_at TEXT,
    last_error TEXT,
    row_count INTEGER NOT NULL DEFAULT 0,
    size_bytes INTEGER NOT NULL DEFAULT 0,
    last_watermark_value TEXT,
    PRIMARY KEY (schema_name, table_name)
);

CREATE TABLE IF NOT EXISTS registered_tables (
    schema_name TEXT NOT NULL,
    table_name TEXT NOT NULL,
    active INTEGER NOT NULL DEFAULT 1,
    registered_at TEXT NOT NULL,
    PRIMARY KEY (schema_name, table_name)
);
";

const JOB_COLUMNS: &str = "job_id, schema_name, table_name, strategy, filter, status, \
     started_at, heartbeat_at, completed_at, error_message, rows_processed, total_rows, \
     bytes, watermark";

/// Fixed-width RFC 3339 so that textual order matches time order.
fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> LedgerResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| LedgerError::Corrupt(format!("timestamp {raw:?}: {e}")))
}

fn parse_opt_ts(raw: Option<String>) -> LedgerResult<Option<DateTime<Utc>>> {
    raw.as_deref().map(parse_ts).transpose()
}

fn parse_job_id(raw: &str) -> LedgerResult<JobId> {
    raw.parse()
        .map_err(|e| LedgerError::Corrupt(format!("job id {raw:?}: {e}")))
}

fn parse_status(raw: &str) -> LedgerResult<JobStatus> {
    raw.parse()
        .map_err(|e| LedgerError::Corrupt(format!("{e}")))
}

fn to_sql_int(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn from_sql_int(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

/// Raw `sync_jobs` row, decoded outside the rusqlite row closure.
struct JobRow {
    job_id: String,
    schema_name: String,
    table_name: String,
    strategy: String,
    filter: Option<String>,
    status: String,
    started_at: String,
    heartbeat_at: Option<String>,
    completed_at: Option<String>,
    error_message: Option<String>,
    rows_processed: i64,
    total_rows: Option<i64>,
    bytes: i64,
    watermark: Option<String>,
}

impl JobRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            job_id: row.get(0)?,
            schema_name: row.get(1)?,
            table_name: row.get(2)?,
            strategy: row.get(3)?,
            filter: row.get(4)?,
            status: row.get(5)?,
            started_at: row.get(6)?,
            heartbeat_at: row.get(7)?,
            completed_at: row.get(8)?,
            error_message: row.get(9)?,
            rows_processed: row.get(10)?,
            total_rows: row.get(11)?,
            bytes: row.get(12)?,
            watermark: row.get(13)?,
        })
    }

    fn decode(self) -> LedgerResult<SyncJob> {
        Ok(SyncJob {
            job_id: parse_job_id(&self.job_id)?,
            table_ref: SourceTableRef::new(self.schema_name, self.table_name),
            strategy: serde_json::from_str(&self.strategy)?,
            filter: self
                .filter
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            status: parse_status(&self.status)?,
            started_at: parse_ts(&self.started_at)?,
            heartbeat_at: parse_opt_ts(self.heartbeat_at)?,
            completed_at: parse_opt_ts(self.completed_at)?,
            error_message: self.error_message,
            stats: JobStats {
                rows_processed: from_sql_int(self.rows_processed),
                total_rows: self.total_rows.map(from_sql_int),
                bytes: from_sql_int(self.bytes),
            },
            watermark: self
                .watermark
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
        })
    }
}

/// SQLite-backed job ledger.
///
/// Create with [`SqliteLedger::open`] for file-backed persistence
/// or [`SqliteLedger::in_memory`] for tests.
pub struct SqliteLedger {
    conn: Mutex<Connection>,
}

impl SqliteLedger {
    /// Opens or creates a ledger database at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Io`] if the directory can't be created,
    /// or [`LedgerError::Sqlite`] if the database can't be opened.
    pub fn open(path: &Path) -> LedgerResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
        Self::init(conn)
    }

    /// Creates an in-memory ledger (for testing).
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Sqlite`] if the schema can't be created.
    pub fn in_memory() -> LedgerResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> LedgerResult<Self> {
        conn.execute_batch(CREATE_TABLES)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn load_job(conn: &Connection, job_id: JobId) -> LedgerResult<SyncJob> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM sync_jobs WHERE job_id = ?1");
        conn.query_row(&sql, params![job_id.to_string()], JobRow::from_row)
            .optional()?
            .ok_or(LedgerError::JobNotFound(job_id))?
            .decode()
    }

    fn query_jobs<P: rusqlite::Params>(
        conn: &Connection,
        sql: &str,
        params: P,
    ) -> LedgerResult<Vec<SyncJob>> {
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params, JobRow::from_row)?;
        let jobs = rows
            .map(|row| row.map_err(LedgerError::from).and_then(JobRow::decode))
            .collect::<LedgerResult<Vec<_>>>()?;
        Ok(jobs)
    }

    fn active_job(conn: &Connection, table: &SourceTableRef) -> LedgerResult<Option<String>> {
        Ok(conn
            .query_row(
                "SELECT job_id FROM sync_jobs \
                 WHERE schema_name = ?1 AND table_name = ?2 AND status IN ('pending', 'running') \
                 LIMIT 1",
                params![table.schema_name, table.table_name],
                |row| row.get(0),
            )
            .optional()?)
    }

    fn load_table_status(
        conn: &Connection,
        table: &SourceTableRef,
    ) -> LedgerResult<Option<TableSyncStatus>> {
        let row = conn
            .query_row(
                "SELECT last_job_id, last_status, last_synced_at, last_error, row_count, \
                 size_bytes, last_watermark_value \
                 FROM table_sync_status WHERE schema_name = ?1 AND table_name = ?2",
                params![table.schema_name, table.table_name],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, i64>(5)?,
                        row.get::<_, Option<String>>(6)?,
                    ))
                },
            )
            .optional()?;

        let Some((job_id, status, synced_at, last_error, row_count, size_bytes, watermark)) = row
        else {
            return Ok(None);
        };

        Ok(Some(TableSyncStatus {
            table_ref: table.clone(),
            last_job_id: parse_job_id(&job_id)?,
            last_status: parse_status(&status)?,
            last_synced_at: parse_opt_ts(synced_at)?,
            last_error,
            row_count: from_sql_int(row_count),
            size_bytes: from_sql_int(size_bytes),
            last_watermark_value: watermark
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
        }))
    }

    /// Upserts the table status row for a completed job.
    fn record_completion(
        conn: &Connection,
        job: &SyncJob,
        watermark: Option<&Value>,
        table_stats: Option<TableStats>,
        now: &str,
    ) -> LedgerResult<()> {
        let prior = Self::load_table_status(conn, &job.table_ref)?
            .and_then(|status| status.last_watermark_value);
        let next = match (prior, watermark) {
            (Some(old), Some(new)) if new.is_after(&old) => Some(new.clone()),
            (Some(old), _) => Some(old),
            (None, new) => new.cloned(),
        };
        let next = next.as_ref().map(serde_json::to_string).transpose()?;

        conn.execute(
            "INSERT INTO table_sync_status \
             (schema_name, table_name, last_job_id, last_status, last_synced_at, last_error, \
              row_count, size_bytes, last_watermark_value) \
             VALUES (?1, ?2, ?3, ?4, ?5, NULL, COALESCE(?6, 0), COALESCE(?7, 0), ?8) \
             ON CONFLICT(schema_name, table_name) DO UPDATE SET \
             last_job_id = ?3, last_status = ?4, last_synced_at = ?5, last_error = NULL, \
             row_count = COALESCE(?6, row_count), size_bytes = COALESCE(?7, size_bytes), \
             last_watermark_value = ?8",
            params![
                job.table_ref.schema_name,
                job.table_ref.table_name,
                job.job_id.to_string(),
                JobStatus::Completed.as_str(),
                now,
                table_stats.map(|s| to_sql_int(s.row_count)),
                table_stats.map(|s| to_sql_int(s.size_bytes)),
                next,
            ],
        )?;
        Ok(())
    }

    /// Upserts the table status row for a failed job.
    ///
    /// Sync time, counts and watermark keep their last successful values.
    fn record_failure(conn: &Connection, job: &SyncJob, message: &str) -> LedgerResult<()> {
        conn.execute(
            "INSERT INTO table_sync_status \
             (schema_name, table_name, last_job_id, last_status, last_error) \
             VALUES (?1, ?2, ?3, ?4, ?5) \
             ON CONFLICT(schema_name, table_name) DO UPDATE SET \
             last_job_id = ?3, last_status = ?4, last_error = ?5",
            params![
                job.table_ref.schema_name,
                job.table_ref.table_name,
                job.job_id.to_string(),
                JobStatus::Failed.as_str(),
                message,
            ],
        )?;
        Ok(())
    }

    fn load_registered(
        conn: &Connection,
        table: &SourceTableRef,
    ) -> LedgerResult<Option<RegisteredTable>> {
        let row = conn
            .query_row(
                "SELECT active, registered_at FROM registered_tables \
                 WHERE schema_name = ?1 AND table_name = ?2",
                params![table.schema_name, table.table_name],
                |row| Ok((row.get::<_, bool>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()?;
        row.map(|(active, registered_at)| {
            parse_ts(&registered_at).map(|registered_at| RegisteredTable {
                table_ref: table.clone(),
                active,
                registered_at,
            })
        })
        .transpose()
    }
}

impl JobLedger for SqliteLedger {
    fn create(&self, request: &SyncRequest) -> LedgerResult<JobId> {
        let table = &request.table_ref;
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        if let Some(active) = Self::active_job(&tx, table)? {
            return Err(LedgerError::JobAlreadyRunning {
                table: table.clone(),
                job_id: active,
            });
        }

        let job_id = JobId::new();
        let strategy = serde_json::to_string(&request.strategy)?;
        let filter = request
            .filter
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let inserted = tx.execute(
            "INSERT INTO sync_jobs \
             (job_id, schema_name, table_name, strategy, filter, status, started_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                job_id.to_string(),
                table.schema_name,
                table.table_name,
                strategy,
                filter,
                JobStatus::Pending.as_str(),
                format_ts(Utc::now()),
            ],
        );
        match inserted {
            Ok(_) => {}
            // The partial unique index caught a writer from another process.
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == ErrorCode::ConstraintViolation =>
            {
                return Err(LedgerError::JobAlreadyRunning {
                    table: table.clone(),
                    job_id: "unknown".into(),
                });
            }
            Err(e) => return Err(e.into()),
        }
        tx.commit()?;

        debug!(%job_id, table = %table, strategy = request.strategy.name(), "sync job created");
        Ok(job_id)
    }

    fn transition(
        &self,
        job_id: JobId,
        to: JobStatus,
        fields: TransitionFields,
    ) -> LedgerResult<SyncJob> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut job = Self::load_job(&tx, job_id)?;

        if !job.status.can_transition_to(to) {
            return Err(LedgerError::IllegalTransition {
                job_id,
                from: job.status,
                to,
            });
        }

        let now = format_ts(Utc::now());
        if to == JobStatus::Running {
            tx.execute(
                "UPDATE sync_jobs SET status = ?1, started_at = ?2, heartbeat_at = NULL \
                 WHERE job_id = ?3",
                params![to.as_str(), now, job_id.to_string()],
            )?;
        } else {
            if let Some(update) = &fields.stats {
                job.stats.merge(update);
            }
            if !job.stats.is_consistent() {
                return Err(LedgerError::InconsistentStats(job_id));
            }

            let watermark = match to {
                JobStatus::Completed => fields.watermark.as_ref(),
                _ => None,
            };
            let error_message = match to {
                JobStatus::Failed => Some(
                    fields
                        .error_message
                        .clone()
                        .unwrap_or_else(|| "unspecified failure".to_string()),
                ),
                _ => None,
            };

            tx.execute(
                "UPDATE sync_jobs SET status = ?1, completed_at = ?2, error_message = ?3, \
                 rows_processed = ?4, total_rows = ?5, bytes = ?6, watermark = ?7 \
                 WHERE job_id = ?8",
                params![
                    to.as_str(),
                    now,
                    error_message,
                    to_sql_int(job.stats.rows_processed),
                    job.stats.total_rows.map(to_sql_int),
                    to_sql_int(job.stats.bytes),
                    watermark.map(serde_json::to_string).transpose()?,
                    job_id.to_string(),
                ],
            )?;

            match &error_message {
                Some(message) => Self::record_failure(&tx, &job, message)?,
                None => Self::record_completion(&tx, &job, watermark, fields.table_stats, &now)?,
            }
        }

        tx.commit()?;
        debug!(%job_id, from = %job.status, %to, "sync job transitioned");
        Self::load_job(&conn, job_id)
    }

    fn get(&self, job_id: JobId) -> LedgerResult<SyncJob> {
        let conn = self.conn.lock();
        Self::load_job(&conn, job_id)
    }

    fn get_table_status(&self, table: &SourceTableRef) -> LedgerResult<Option<TableSyncStatus>> {
        let conn = self.conn.lock();
        Self::load_table_status(&conn, table)
    }

    fn update_stats(&self, job_id: JobId, update: &StatsUpdate) -> LedgerResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut job = Self::load_job(&tx, job_id)?;

        if job.status != JobStatus::Running {
            return Err(LedgerError::NotRunning {
                job_id,
                status: job.status,
            });
        }
        job.stats.merge(update);
        if !job.stats.is_consistent() {
            return Err(LedgerError::InconsistentStats(job_id));
        }

        tx.execute(
            "UPDATE sync_jobs SET rows_processed = ?1, total_rows = ?2, bytes = ?3, \
             heartbeat_at = ?4 WHERE job_id = ?5",
            params![
                to_sql_int(job.stats.rows_processed),
                job.stats.total_rows.map(to_sql_int),
                to_sql_int(job.stats.bytes),
                format_ts(Utc::now()),
                job_id.to_string(),
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn list_jobs(&self, status: Option<JobStatus>, limit: usize) -> LedgerResult<Vec<SyncJob>> {
        let conn = self.conn.lock();
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        match status {
            Some(status) => Self::query_jobs(
                &conn,
                &format!(
                    "SELECT {JOB_COLUMNS} FROM sync_jobs WHERE status = ?1 \
                     ORDER BY started_at DESC LIMIT ?2"
                ),
                params![status.as_str(), limit],
            ),
            None => Self::query_jobs(
                &conn,
                &format!("SELECT {JOB_COLUMNS} FROM sync_jobs ORDER BY started_at DESC LIMIT ?1"),
                params![limit],
            ),
        }
    }

    fn stale_jobs(&self, inactive_since: DateTime<Utc>) -> LedgerResult<Vec<SyncJob>> {
        let conn = self.conn.lock();
        Self::query_jobs(
            &conn,
            &format!(
                "SELECT {JOB_COLUMNS} FROM sync_jobs \
                 WHERE status = 'running' AND COALESCE(heartbeat_at, started_at) < ?1 \
                 ORDER BY started_at"
            ),
            params![format_ts(inactive_since)],
        )
    }

    fn purge_terminal(
        &self,
        status: JobStatus,
        completed_before: DateTime<Utc>,
    ) -> LedgerResult<u64> {
        if !status.is_terminal() {
            return Err(LedgerError::InvalidArgument(format!(
                "cannot purge {status} jobs"
            )));
        }
        let conn = self.conn.lock();
        let deleted = conn.execute(
            "DELETE FROM sync_jobs WHERE status = ?1 AND completed_at IS NOT NULL \
             AND completed_at < ?2",
            params![status.as_str(), format_ts(completed_before)],
        )?;
        Ok(deleted as u64)
    }

    fn register_table(&self, table: &SourceTableRef) -> LedgerResult<RegisteredTable> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO registered_tables (schema_name, table_name, active, registered_at) \
             VALUES (?1, ?2, 1, ?3) \
             ON CONFLICT(schema_name, table_name) DO UPDATE SET active = 1",
            params![table.schema_name, table.table_name, format_ts(Utc::now())],
        )?;
        Self::load_registered(&conn, table)?
            .ok_or_else(|| LedgerError::Corrupt(format!("registration of {table} vanished")))
    }

    fn deactivate_table(&self, table: &SourceTableRef) -> LedgerResult<bool> {
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE registered_tables SET active = 0 WHERE schema_name = ?1 AND table_name = ?2",
            params![table.schema_name, table.table_name],
        )?;
        Ok(updated > 0)
    }

    fn is_table_allowed(&self, table: &SourceTableRef) -> LedgerResult<bool> {
        let conn = self.conn.lock();
        Ok(Self::load_registered(&conn, table)?.is_some_and(|t| t.active))
    }

    fn list_tables(&self) -> LedgerResult<Vec<RegisteredTable>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT schema_name, table_name, active, registered_at FROM registered_tables \
             ORDER BY schema_name, table_name",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, bool>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;
        let tables = rows
            .map(|row| -> LedgerResult<RegisteredTable> {
                let (schema_name, table_name, active, registered_at) = row?;
                Ok(RegisteredTable {
                    table_ref: SourceTableRef::new(schema_name, table_name),
                    active,
                    registered_at: parse_ts(&registered_at)?,
                })
            })
            .collect::<LedgerResult<Vec<_>>>()?;
        Ok(tables)
    }
}
