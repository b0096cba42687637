//! A source warehouse backed by a SQLite database file.
//!
//! Schemas are SQLite database names (`main`, or any attached database), so
//! `SourceTableRef::new("main", "orders")` reads `main.orders`. Declared
//! column types are reported as-is and go through the normal type mapping.
//! Values are decoded according to the declared type; date and timestamp
//! columns are expected as ISO 8601 text.

use crate::destination::quote_ident;
use crate::error::{SyncError, SyncResult};
use crate::source::{ExportCursor, ExportRequest, SourceWarehouse};
use crate::type_map::parse_source_type;
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use parking_lot::Mutex;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, ErrorCode, OpenFlags};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tablesync_types::{
    Predicate, Row, SourceColumn, SourceTableRef, SourceType, TableStats, Value,
};

const NAIVE_FORMATS: [&str; 3] = ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M"];

fn source_error(err: rusqlite::Error) -> SyncError {
    match &err {
        rusqlite::Error::SqliteFailure(e, _) => match e.code {
            ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => {
                SyncError::LockContention(err.to_string())
            }
            ErrorCode::PermissionDenied | ErrorCode::AuthorizationForStatementDenied => {
                SyncError::AuthenticationFailed(err.to_string())
            }
            _ => SyncError::SourceUnavailable(err.to_string()),
        },
        _ => SyncError::SourceUnavailable(err.to_string()),
    }
}

fn describe_error(err: rusqlite::Error, table: &SourceTableRef) -> SyncError {
    match &err {
        rusqlite::Error::SqliteFailure(_, Some(msg)) if msg.contains("unknown database") => {
            SyncError::TableNotFound(table.clone())
        }
        _ => source_error(err),
    }
}

fn table_name(table: &SourceTableRef) -> String {
    format!(
        "{}.{}",
        quote_ident(&table.schema_name),
        quote_ident(&table.table_name)
    )
}

/// Numbers inside the parentheses of a declared type, e.g. `[12, 2]` for `NUMBER(12,2)`.
fn type_params(declared: &str) -> Vec<u32> {
    declared
        .split_once('(')
        .and_then(|(_, rest)| rest.split_once(')'))
        .map(|(inner, _)| {
            inner
                .split(',')
                .filter_map(|p| p.trim().parse().ok())
                .collect()
        })
        .unwrap_or_default()
}

fn describe_column(name: String, declared: String, not_null: bool) -> SourceColumn {
    let params = type_params(&declared);
    let source_type = parse_source_type(&declared);
    let mut column = SourceColumn::new(name, declared);
    if not_null {
        column = column.not_null();
    }
    match (source_type, params.as_slice()) {
        (SourceType::Varchar | SourceType::Char, [len, ..]) => column.with_max_length(*len),
        (SourceType::Number, [precision, scale]) => column.with_precision(*precision, *scale),
        (SourceType::Number, [precision]) => column.with_precision(*precision, 0),
        _ => column,
    }
}

fn text_of(raw: ValueRef<'_>) -> Option<String> {
    match raw {
        ValueRef::Text(bytes) | ValueRef::Blob(bytes) => {
            Some(String::from_utf8_lossy(bytes).into_owned())
        }
        _ => None,
    }
}

fn parse_naive(s: &str) -> Option<NaiveDateTime> {
    NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
}

/// Decodes a stored value according to its column's source type.
///
/// Anything that doesn't parse is passed through as text and left for the
/// staging step to accept or reject.
fn decode(raw: ValueRef<'_>, ty: &SourceType) -> Value {
    let fallback = |raw: ValueRef<'_>| match raw {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Number(i as f64),
        ValueRef::Real(f) => Value::Number(f),
        other => Value::Text(text_of(other).unwrap_or_default()),
    };
    if matches!(raw, ValueRef::Null) {
        return Value::Null;
    }

    match ty {
        SourceType::Number | SourceType::Float => match text_of(raw) {
            Some(text) => text
                .trim()
                .parse()
                .map(Value::Number)
                .unwrap_or(Value::Text(text)),
            None => fallback(raw),
        },
        SourceType::Boolean => match raw {
            ValueRef::Integer(i) => Value::Boolean(i != 0),
            ValueRef::Real(f) => Value::Boolean(f != 0.0),
            other => match text_of(other).as_deref().map(str::trim) {
                Some(t) if t.eq_ignore_ascii_case("true") || t == "1" => Value::Boolean(true),
                Some(t) if t.eq_ignore_ascii_case("false") || t == "0" => Value::Boolean(false),
                _ => fallback(other),
            },
        },
        SourceType::Date => match text_of(raw) {
            Some(text) => NaiveDate::parse_from_str(text.trim(), "%Y-%m-%d")
                .map(Value::Date)
                .unwrap_or(Value::Text(text)),
            None => fallback(raw),
        },
        SourceType::TimestampNtz => match text_of(raw) {
            Some(text) => parse_naive(text.trim())
                .map(Value::Timestamp)
                .unwrap_or(Value::Text(text)),
            None => fallback(raw),
        },
        SourceType::TimestampTz | SourceType::TimestampLtz => match text_of(raw) {
            Some(text) => {
                let trimmed = text.trim();
                DateTime::parse_from_rfc3339(trimmed)
                    .map(Value::TimestampTz)
                    .ok()
                    .or_else(|| parse_naive(trimmed).map(Value::Timestamp))
                    .unwrap_or(Value::Text(text))
            }
            None => fallback(raw),
        },
        SourceType::Varchar | SourceType::Char | SourceType::Text | SourceType::Other(_) => {
            fallback(raw)
        }
    }
}

/// SQLite-backed source warehouse.
pub struct SqliteWarehouse {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteWarehouse {
    /// Opens an existing database read-only.
    pub fn open(path: &Path) -> SyncResult<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(source_error)?;
        conn.busy_timeout(Duration::from_secs(5))
            .map_err(source_error)?;
        Ok(Self::from_connection(conn))
    }

    /// Wraps an open connection (for testing with in-memory databases).
    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    /// Runs `sql` against the underlying connection.
    pub fn execute_batch(&self, sql: &str) -> SyncResult<()> {
        self.conn.lock().execute_batch(sql).map_err(source_error)
    }
}

impl SourceWarehouse for SqliteWarehouse {
    fn describe_table(&self, table: &SourceTableRef) -> SyncResult<Vec<SourceColumn>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT name, type, \"notnull\" FROM pragma_table_info(?1, ?2) ORDER BY cid")
            .map_err(source_error)?;
        let rows = stmt
            .query_map([&table.table_name, &table.schema_name], |row| {
                Ok(describe_column(
                    row.get(0)?,
                    row.get(1)?,
                    row.get::<_, i64>(2)? != 0,
                ))
            })
            .map_err(|e| describe_error(e, table))?;
        let columns = rows
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| describe_error(e, table))?;
        if columns.is_empty() {
            return Err(SyncError::TableNotFound(table.clone()));
        }
        Ok(columns)
    }

    fn open_export(&self, request: &ExportRequest) -> SyncResult<Box<dyn ExportCursor>> {
        let described = self.describe_table(&request.table_ref)?;
        let names: Vec<String> = described.iter().map(|c| c.name.clone()).collect();
        let projection = request
            .columns
            .iter()
            .map(|name| {
                names
                    .iter()
                    .position(|c| c.eq_ignore_ascii_case(name))
                    .ok_or_else(|| {
                        SyncError::InvalidRequest(format!(
                            "unknown column {name} in {}",
                            request.table_ref
                        ))
                    })
            })
            .collect::<SyncResult<Vec<_>>>()?;

        // Every column is read so the filter can see columns outside the projection.
        let all_columns = names
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT {all_columns} FROM {} ORDER BY rowid LIMIT ?1 OFFSET ?2",
            table_name(&request.table_ref)
        );
        self.conn.lock().prepare(&sql).map_err(|e| {
            SyncError::InvalidRequest(format!("cannot export {}: {e}", request.table_ref))
        })?;

        Ok(Box::new(SqliteCursor {
            conn: Arc::clone(&self.conn),
            sql,
            types: described
                .iter()
                .map(|c| parse_source_type(&c.data_type))
                .collect(),
            names,
            projection,
            filter: request.filter.clone(),
            chunk_size: request.chunk_size.max(1),
            offset: 0,
            done: false,
        }))
    }

    fn table_stats(&self, table: &SourceTableRef) -> SyncResult<TableStats> {
        let columns = self.describe_table(table)?;
        let size_expr = columns
            .iter()
            .map(|c| format!("COALESCE(LENGTH(CAST({} AS BLOB)), 0)", quote_ident(&c.name)))
            .collect::<Vec<_>>()
            .join(" + ");
        let sql = format!(
            "SELECT COUNT(*), COALESCE(SUM({size_expr}), 0) FROM {}",
            table_name(table)
        );
        let (rows, size): (i64, i64) = self
            .conn
            .lock()
            .query_row(&sql, [], |row| Ok((row.get(0)?, row.get(1)?)))
            .map_err(source_error)?;
        Ok(TableStats {
            row_count: u64::try_from(rows).unwrap_or(0),
            size_bytes: u64::try_from(size).unwrap_or(0),
        })
    }
}

/// Pages through the table with LIMIT/OFFSET; no statement outlives a chunk.
///
/// Rows are decoded before the filter runs, so comparisons follow
/// [`Value::compare`] rather than SQLite's text ordering of stored values.
struct SqliteCursor {
    conn: Arc<Mutex<Connection>>,
    sql: String,
    types: Vec<SourceType>,
    names: Vec<String>,
    projection: Vec<usize>,
    filter: Option<Predicate>,
    chunk_size: usize,
    offset: i64,
    done: bool,
}

impl SqliteCursor {
    fn read_page(&mut self, limit: usize) -> SyncResult<Vec<Row>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&self.sql).map_err(source_error)?;
        let types = &self.types;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt
            .query_map([limit, self.offset], |row| {
                (0..types.len())
                    .map(|i| Ok(decode(row.get_ref(i)?, &types[i])))
                    .collect::<rusqlite::Result<Row>>()
            })
            .map_err(source_error)?;
        let page = rows
            .collect::<rusqlite::Result<Vec<Row>>>()
            .map_err(source_error)?;

        if (page.len() as i64) < limit {
            self.done = true;
        }
        self.offset += page.len() as i64;
        Ok(page)
    }
}

impl ExportCursor for SqliteCursor {
    fn next_chunk(&mut self) -> SyncResult<Option<Vec<Row>>> {
        let mut chunk: Vec<Row> = Vec::new();
        while !self.done && chunk.len() < self.chunk_size {
            let page = self.read_page(self.chunk_size - chunk.len())?;
            chunk.extend(
                page.into_iter()
                    .filter(|row| {
                        self.filter
                            .as_ref()
                            .map_or(true, |filter| filter.matches(&self.names, row))
                    })
                    .map(|row| {
                        self.projection
                            .iter()
                            .map(|&idx| row[idx].clone())
                            .collect::<Row>()
                    }),
            );
        }
        Ok(if chunk.is_empty() { None } else { Some(chunk) })
    }

    fn release(&mut self) -> SyncResult<()> {
        self.done = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn orders() -> SourceTableRef {
        SourceTableRef::new("main", "orders")
    }

    fn warehouse() -> SqliteWarehouse {
        let warehouse = SqliteWarehouse::from_connection(Connection::open_in_memory().unwrap());
        warehouse
            .execute_batch(
                "CREATE TABLE orders (
                    id NUMBER(38,0) NOT NULL,
                    status VARCHAR(16),
                    paid BOOLEAN,
                    order_date DATE,
                    updated_at TIMESTAMP_NTZ,
                    seen_at TIMESTAMP_TZ,
                    shape GEOGRAPHY
                 );
                 INSERT INTO orders VALUES
                    (1, 'open', 1, '2024-01-01', '2024-01-01 10:00:00', '2024-01-01T10:00:00+02:00', 'POINT(1 2)'),
                    (2, 'paid', 0, '2024-01-02', '2024-01-02 10:00:00', NULL, NULL),
                    (3, NULL, NULL, NULL, '2024-01-03 10:00:00', NULL, NULL);",
            )
            .unwrap();
        warehouse
    }

    fn request(columns: &[&str], filter: Option<Predicate>, chunk_size: usize) -> ExportRequest {
        ExportRequest {
            table_ref: orders(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            filter,
            chunk_size,
        }
    }

    fn drain(cursor: &mut dyn ExportCursor) -> Vec<Vec<Row>> {
        let mut chunks = Vec::new();
        while let Some(chunk) = cursor.next_chunk().unwrap() {
            chunks.push(chunk);
        }
        chunks
    }

    #[test]
    fn describe_reports_declared_types() {
        let columns = warehouse().describe_table(&orders()).unwrap();
        assert_eq!(columns.len(), 7);
        assert_eq!(columns[0].data_type, "NUMBER(38,0)");
        assert!(!columns[0].nullable);
        assert_eq!(columns[0].precision, Some(38));
        assert_eq!(columns[1].max_length, Some(16));
        assert!(columns[1].nullable);
    }

    #[test]
    fn missing_table_or_schema_is_not_found() {
        let warehouse = warehouse();
        for table in [
            SourceTableRef::new("main", "nope"),
            SourceTableRef::new("nope", "orders"),
        ] {
            assert!(matches!(
                warehouse.describe_table(&table).unwrap_err(),
                SyncError::TableNotFound(_)
            ));
        }
    }

    #[test]
    fn export_decodes_by_declared_type() {
        let warehouse = warehouse();
        let columns = [
            "id", "status", "paid", "order_date", "updated_at", "seen_at", "shape",
        ];
        let mut cursor = warehouse
            .open_export(&request(&columns, None, 10))
            .unwrap();
        let rows: Vec<Row> = drain(cursor.as_mut()).into_iter().flatten().collect();

        assert_eq!(rows.len(), 3);
        let first = &rows[0];
        assert_eq!(first[0], Value::Number(1.0));
        assert_eq!(first[1], Value::Text("open".into()));
        assert_eq!(first[2], Value::Boolean(true));
        assert_eq!(
            first[3],
            Value::Date(NaiveDate::from_ymd_opt(2024, 1, 1).unwrap())
        );
        assert!(matches!(first[4], Value::Timestamp(_)));
        assert!(matches!(first[5], Value::TimestampTz(_)));
        assert_eq!(first[6], Value::Text("POINT(1 2)".into()));
        assert_eq!(rows[2][1], Value::Null);
    }

    #[test]
    fn export_is_paged_and_filtered() {
        let warehouse = warehouse();
        let mut cursor = warehouse.open_export(&request(&["id"], None, 2)).unwrap();
        let chunks = drain(cursor.as_mut());
        assert_eq!(chunks.iter().map(Vec::len).collect::<Vec<_>>(), [2, 1]);

        let filter = Predicate::gt(
            "updated_at",
            Value::Timestamp(
                NaiveDateTime::parse_from_str("2024-01-01 12:00:00", "%Y-%m-%d %H:%M:%S")
                    .unwrap(),
            ),
        );
        let mut cursor = warehouse
            .open_export(&request(&["ID"], Some(filter), 10))
            .unwrap();
        let rows: Vec<Row> = drain(cursor.as_mut()).into_iter().flatten().collect();
        assert_eq!(rows, [vec![Value::Number(2.0)], vec![Value::Number(3.0)]]);
        cursor.release().unwrap();
        assert!(cursor.next_chunk().unwrap().is_none());
    }

    fn max_of(rows: &[Row], idx: usize) -> Option<Value> {
        rows.iter()
            .map(|row| row[idx].clone())
            .fold(None, |max, value| match max {
                Some(max) if !value.is_after(&max) => Some(max),
                _ => Some(value),
            })
    }

    #[test]
    fn incremental_passes_skip_the_watermark_row() {
        let warehouse = SqliteWarehouse::from_connection(Connection::open_in_memory().unwrap());
        warehouse
            .execute_batch(
                "CREATE TABLE events (id NUMBER, \"last updated\" TIMESTAMP_NTZ);
                 INSERT INTO events VALUES
                    (1, '2024-01-01T10:00:00'),
                    (2, '2024-01-02T10:00:00');",
            )
            .unwrap();
        let export = |filter: Option<Predicate>| -> Vec<Row> {
            let mut cursor = warehouse
                .open_export(&ExportRequest {
                    table_ref: SourceTableRef::new("main", "events"),
                    columns: vec!["ID".into(), "LAST UPDATED".into()],
                    filter,
                    chunk_size: 1,
                })
                .unwrap();
            drain(cursor.as_mut()).into_iter().flatten().collect()
        };

        let first = export(None);
        assert_eq!(first.len(), 2);
        let watermark = max_of(&first, 1).unwrap();

        let second = export(Some(Predicate::gt("last updated", watermark.clone())));
        assert!(second.is_empty());

        warehouse
            .execute_batch("INSERT INTO events VALUES (3, '2024-01-02T10:00:01');")
            .unwrap();
        let third = export(Some(Predicate::gt("last updated", watermark)));
        assert_eq!(third.len(), 1);
        assert_eq!(third[0][0], Value::Number(3.0));
    }

    #[test]
    fn zoned_watermarks_compare_as_instants() {
        let warehouse = SqliteWarehouse::from_connection(Connection::open_in_memory().unwrap());
        warehouse
            .execute_batch(
                "CREATE TABLE visits (id NUMBER, seen_at TIMESTAMP_TZ);
                 INSERT INTO visits VALUES
                    (1, '2024-01-01T10:00:00+02:00'),
                    (2, '2024-01-01T09:30:00+00:00');",
            )
            .unwrap();
        // 08:00 UTC, equal to the first row's instant.
        let watermark = Value::TimestampTz(
            DateTime::parse_from_rfc3339("2024-01-01T09:00:00+01:00").unwrap(),
        );
        let mut cursor = warehouse
            .open_export(&ExportRequest {
                table_ref: SourceTableRef::new("main", "visits"),
                columns: vec!["id".into()],
                filter: Some(Predicate::gt("seen_at", watermark)),
                chunk_size: 10,
            })
            .unwrap();
        let rows: Vec<Row> = drain(cursor.as_mut()).into_iter().flatten().collect();
        assert_eq!(rows, [vec![Value::Number(2.0)]]);
    }

    #[test]
    fn unknown_projection_is_rejected() {
        let err = warehouse()
            .open_export(&request(&["missing"], None, 10))
            .err()
            .unwrap();
        assert!(matches!(err, SyncError::InvalidRequest(_)));
    }

    #[test]
    fn stats_count_rows() {
        let stats = warehouse().table_stats(&orders()).unwrap();
        assert_eq!(stats.row_count, 3);
        assert!(stats.size_bytes > 0);
    }

    #[test]
    fn type_params_parse() {
        assert_eq!(type_params("NUMBER(12, 2)"), [12, 2]);
        assert_eq!(type_params("VARCHAR(64)"), [64]);
        assert!(type_params("TEXT").is_empty());
    }
}
