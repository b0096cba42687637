//! Destination store abstraction and its SQLite implementation.

use crate::error::{SyncError, SyncResult};
use crate::staging::{plain_text, StagedReader};
use parking_lot::Mutex;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, ErrorCode};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tablesync_types::{ColumnDescriptor, SourceTableRef, Value};
use tracing::debug;

/// A column as currently declared in the destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExistingColumn {
    /// Column name.
    pub name: String,
    /// Declared type, verbatim.
    pub declared_type: String,
    /// Whether the column accepts NULL.
    pub nullable: bool,
}

/// The local analytical store rows are loaded into.
///
/// Each source table maps to one destination table named `schema.table`.
pub trait DestinationStore: Send + Sync {
    /// Returns the table's columns in order, or `None` if it doesn't exist.
    fn existing_columns(&self, table: &SourceTableRef) -> SyncResult<Option<Vec<ExistingColumn>>>;

    /// Creates the table with the given columns.
    fn create_table(&self, table: &SourceTableRef, columns: &[ColumnDescriptor]) -> SyncResult<()>;

    /// Appends a nullable column.
    fn add_column(&self, table: &SourceTableRef, column: &ColumnDescriptor) -> SyncResult<()>;

    /// Deletes every row. Returns the number deleted.
    fn delete_all(&self, table: &SourceTableRef) -> SyncResult<u64>;

    /// Appends every row of a staged file. Returns the number loaded.
    fn bulk_load(&self, table: &SourceTableRef, staged: &Path) -> SyncResult<u64>;

    /// Current row count.
    fn row_count(&self, table: &SourceTableRef) -> SyncResult<u64>;
}

impl<D: DestinationStore + ?Sized> DestinationStore for Arc<D> {
    fn existing_columns(&self, table: &SourceTableRef) -> SyncResult<Option<Vec<ExistingColumn>>> {
        (**self).existing_columns(table)
    }

    fn create_table(&self, table: &SourceTableRef, columns: &[ColumnDescriptor]) -> SyncResult<()> {
        (**self).create_table(table, columns)
    }

    fn add_column(&self, table: &SourceTableRef, column: &ColumnDescriptor) -> SyncResult<()> {
        (**self).add_column(table, column)
    }

    fn delete_all(&self, table: &SourceTableRef) -> SyncResult<u64> {
        (**self).delete_all(table)
    }

    fn bulk_load(&self, table: &SourceTableRef, staged: &Path) -> SyncResult<u64> {
        (**self).bulk_load(table, staged)
    }

    fn row_count(&self, table: &SourceTableRef) -> SyncResult<u64> {
        (**self).row_count(table)
    }
}

/// Maps a SQLite failure onto the engine taxonomy.
pub(crate) fn store_error(err: rusqlite::Error) -> SyncError {
    match &err {
        rusqlite::Error::SqliteFailure(e, _)
            if matches!(e.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) =>
        {
            SyncError::LockContention(err.to_string())
        }
        _ => SyncError::Destination(err.to_string()),
    }
}

/// Quotes an identifier for SQLite.
pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn destination_name(table: &SourceTableRef) -> String {
    quote_ident(&table.qualified_name())
}

fn column_ddl(column: &ColumnDescriptor, allow_not_null: bool) -> String {
    let mut ddl = format!(
        "{} {}",
        quote_ident(&column.name),
        column.destination_type.sql_name()
    );
    if allow_not_null && !column.nullable {
        ddl.push_str(" NOT NULL");
    }
    ddl
}

fn to_sql_value(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Number(n) => SqlValue::Real(*n),
        Value::Boolean(b) => SqlValue::Integer(i64::from(*b)),
        other => SqlValue::Text(plain_text(other)),
    }
}

/// SQLite-backed destination store.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Opens or creates a destination database at `path`.
    pub fn open(path: &Path) -> SyncResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path).map_err(store_error)?;
        conn.busy_timeout(Duration::from_secs(5))
            .map_err(store_error)?;
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))
            .map_err(store_error)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Creates an in-memory destination (for testing).
    pub fn in_memory() -> SyncResult<Self> {
        let conn = Connection::open_in_memory().map_err(store_error)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Reads every row of a table in insertion order.
    pub fn select_all(&self, table: &SourceTableRef) -> SyncResult<Vec<Vec<SqlValue>>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT * FROM {} ORDER BY rowid",
                destination_name(table)
            ))
            .map_err(store_error)?;
        let width = stmt.column_count();
        let rows = stmt
            .query_map([], |row| {
                (0..width)
                    .map(|i| row.get::<_, SqlValue>(i))
                    .collect::<rusqlite::Result<Vec<_>>>()
            })
            .map_err(store_error)?;
        let rows = rows
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(store_error)?;
        Ok(rows)
    }
}

impl DestinationStore for SqliteStore {
    fn existing_columns(&self, table: &SourceTableRef) -> SyncResult<Option<Vec<ExistingColumn>>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT name, type, \"notnull\" FROM pragma_table_info(?1) ORDER BY cid")
            .map_err(store_error)?;
        let columns = stmt
            .query_map(params![table.qualified_name()], |row| {
                Ok(ExistingColumn {
                    name: row.get(0)?,
                    declared_type: row.get(1)?,
                    nullable: !row.get::<_, bool>(2)?,
                })
            })
            .map_err(store_error)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(store_error)?;
        Ok(if columns.is_empty() {
            None
        } else {
            Some(columns)
        })
    }

    fn create_table(&self, table: &SourceTableRef, columns: &[ColumnDescriptor]) -> SyncResult<()> {
        if columns.is_empty() {
            return Err(SyncError::InvalidRequest(format!(
                "cannot create {table} without columns"
            )));
        }
        let ddl = columns
            .iter()
            .map(|c| column_ddl(c, true))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} ({ddl})",
            destination_name(table)
        );
        self.conn.lock().execute(&sql, []).map_err(store_error)?;
        debug!(table = %table, columns = columns.len(), "destination table created");
        Ok(())
    }

    fn add_column(&self, table: &SourceTableRef, column: &ColumnDescriptor) -> SyncResult<()> {
        let sql = format!(
            "ALTER TABLE {} ADD COLUMN {}",
            destination_name(table),
            column_ddl(column, false)
        );
        self.conn.lock().execute(&sql, []).map_err(store_error)?;
        debug!(table = %table, column = %column.name, "destination column added");
        Ok(())
    }

    fn delete_all(&self, table: &SourceTableRef) -> SyncResult<u64> {
        let sql = format!("DELETE FROM {}", destination_name(table));
        let deleted = self.conn.lock().execute(&sql, []).map_err(store_error)?;
        Ok(deleted as u64)
    }

    fn bulk_load(&self, table: &SourceTableRef, staged: &Path) -> SyncResult<u64> {
        let reader = StagedReader::open(staged)?;
        let columns = reader
            .columns()
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>();
        let placeholders = vec!["?"; columns.len()].join(", ");
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({placeholders})",
            destination_name(table),
            columns.join(", ")
        );

        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(store_error)?;
        let mut loaded = 0u64;
        {
            let mut stmt = tx.prepare(&sql).map_err(store_error)?;
            for batch in reader {
                for row in batch? {
                    stmt.execute(params_from_iter(row.iter().map(to_sql_value)))
                        .map_err(store_error)?;
                    loaded += 1;
                }
            }
        }
        tx.commit().map_err(store_error)?;
        Ok(loaded)
    }

    fn row_count(&self, table: &SourceTableRef) -> SyncResult<u64> {
        let sql = format!("SELECT COUNT(*) FROM {}", destination_name(table));
        let count: i64 = self
            .conn
            .lock()
            .query_row(&sql, [], |row| row.get(0))
            .map_err(store_error)?;
        Ok(u64::try_from(count).unwrap_or(0))
    }
}
