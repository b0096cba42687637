//! Staged files: Arrow IPC files between export and load.
//!
//! Layout is `<root>/<job_id>/attempt-<n>.arrow`. Each transport attempt
//! owns exactly one file, and a [`StagedFile`] guard removes it when the
//! attempt ends, whichever way it ends.

use crate::error::{SyncError, SyncResult};
use arrow::array::{
    Array, ArrayRef, BooleanArray, BooleanBuilder, Date32Array, Date32Builder, Float64Array,
    Float64Builder, StringArray, StringBuilder, TimestampMicrosecondArray,
    TimestampMicrosecondBuilder,
};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};
use arrow::ipc::reader::FileReader;
use arrow::ipc::writer::FileWriter;
use arrow::record_batch::RecordBatch;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tablesync_types::{ColumnDescriptor, DestinationType, JobId, Row, Value};

const NAIVE_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];

fn unix_epoch_date() -> NaiveDate {
    DateTime::<Utc>::UNIX_EPOCH.date_naive()
}

/// Arrow type used to stage a destination type.
pub fn arrow_type(ty: DestinationType) -> DataType {
    match ty {
        DestinationType::Double => DataType::Float64,
        DestinationType::Varchar { .. } => DataType::Utf8,
        DestinationType::Boolean => DataType::Boolean,
        DestinationType::Date => DataType::Date32,
        DestinationType::Timestamp => DataType::Timestamp(TimeUnit::Microsecond, None),
    }
}

/// Arrow schema for a mapped column list.
///
/// Every field is nullable; NOT NULL is enforced by the destination.
pub fn arrow_schema(columns: &[ColumnDescriptor]) -> Schema {
    Schema::new(
        columns
            .iter()
            .map(|c| Field::new(&c.name, arrow_type(c.destination_type), true))
            .collect::<Vec<_>>(),
    )
}

/// Root of the staging area.
#[derive(Debug, Clone)]
pub struct StagingArea {
    root: PathBuf,
}

/// A per-job directory found in the staging area.
#[derive(Debug, Clone)]
pub struct StagingEntry {
    /// Directory path.
    pub path: PathBuf,
    /// Owning job, if the directory name is a job ID.
    pub job_id: Option<JobId>,
    /// Last modification time.
    pub modified: DateTime<Utc>,
}

impl StagingArea {
    /// Creates a staging area rooted at `root`. Nothing is created on disk yet.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding a job's staged files.
    pub fn job_dir(&self, job_id: JobId) -> PathBuf {
        self.root.join(job_id.to_string())
    }

    /// Reserves the staged file for one transport attempt.
    pub fn stage(&self, job_id: JobId, attempt: u32) -> SyncResult<StagedFile> {
        let dir = self.job_dir(job_id);
        fs::create_dir_all(&dir)?;
        let path = dir.join(format!("attempt-{attempt}.arrow"));
        // Leftover from a crashed process reusing the same attempt number.
        remove_if_exists(&path)?;
        Ok(StagedFile {
            path,
            dir,
            removed: false,
        })
    }

    /// Lists per-job directories. A missing root yields nothing.
    pub fn entries(&self) -> SyncResult<Vec<StagingEntry>> {
        let read_dir = match fs::read_dir(&self.root) {
            Ok(read_dir) => read_dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut entries = Vec::new();
        for entry in read_dir {
            let entry = entry?;
            let metadata = entry.metadata()?;
            if !metadata.is_dir() {
                continue;
            }
            entries.push(StagingEntry {
                job_id: entry.file_name().to_str().and_then(|s| s.parse().ok()),
                path: entry.path(),
                modified: DateTime::<Utc>::from(metadata.modified()?),
            });
        }
        Ok(entries)
    }
}

fn remove_if_exists(path: &Path) -> SyncResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Guard over one staged file. Dropping it removes the file.
#[derive(Debug)]
pub struct StagedFile {
    path: PathBuf,
    dir: PathBuf,
    removed: bool,
}

impl StagedFile {
    /// Location of the file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Size of the file in bytes, zero if not written yet.
    pub fn size(&self) -> SyncResult<u64> {
        match fs::metadata(&self.path) {
            Ok(metadata) => Ok(metadata.len()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    /// Removes the file and, if empty, its job directory.
    pub fn cleanup(mut self) -> SyncResult<()> {
        self.removed = true;
        remove_if_exists(&self.path)?;
        // Fails while other attempts of the same job still hold files.
        let _ = fs::remove_dir(&self.dir);
        Ok(())
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        if !self.removed {
            let _ = fs::remove_file(&self.path);
            let _ = fs::remove_dir(&self.dir);
        }
    }
}

enum ColumnBuilder {
    Double(Float64Builder),
    Text(StringBuilder),
    Boolean(BooleanBuilder),
    Date(Date32Builder),
    Timestamp(TimestampMicrosecondBuilder),
}

impl ColumnBuilder {
    fn for_type(ty: DestinationType) -> Self {
        match ty {
            DestinationType::Double => ColumnBuilder::Double(Float64Builder::new()),
            DestinationType::Varchar { .. } => ColumnBuilder::Text(StringBuilder::new()),
            DestinationType::Boolean => ColumnBuilder::Boolean(BooleanBuilder::new()),
            DestinationType::Date => ColumnBuilder::Date(Date32Builder::new()),
            DestinationType::Timestamp => {
                ColumnBuilder::Timestamp(TimestampMicrosecondBuilder::new())
            }
        }
    }

    fn append(&mut self, value: &Value) -> Result<(), String> {
        if value.is_null() {
            match self {
                ColumnBuilder::Double(b) => b.append_null(),
                ColumnBuilder::Text(b) => b.append_null(),
                ColumnBuilder::Boolean(b) => b.append_null(),
                ColumnBuilder::Date(b) => b.append_null(),
                ColumnBuilder::Timestamp(b) => b.append_null(),
            }
            return Ok(());
        }
        match self {
            ColumnBuilder::Double(b) => b.append_value(to_f64(value)?),
            ColumnBuilder::Text(b) => b.append_value(plain_text(value)),
            ColumnBuilder::Boolean(b) => b.append_value(to_bool(value)?),
            ColumnBuilder::Date(b) => {
                let days = (to_date(value)? - unix_epoch_date()).num_days();
                let days =
                    i32::try_from(days).map_err(|_| format!("date out of range: {value}"))?;
                b.append_value(days);
            }
            ColumnBuilder::Timestamp(b) => {
                b.append_value(to_naive_timestamp(value)?.and_utc().timestamp_micros());
            }
        }
        Ok(())
    }

    fn finish(&mut self) -> ArrayRef {
        match self {
            ColumnBuilder::Double(b) => Arc::new(b.finish()),
            ColumnBuilder::Text(b) => Arc::new(b.finish()),
            ColumnBuilder::Boolean(b) => Arc::new(b.finish()),
            ColumnBuilder::Date(b) => Arc::new(b.finish()),
            ColumnBuilder::Timestamp(b) => Arc::new(b.finish()),
        }
    }
}

fn mismatch(value: &Value, target: &str) -> String {
    format!("cannot stage {value} as {target}")
}

fn to_f64(value: &Value) -> Result<f64, String> {
    match value {
        Value::Number(n) => Ok(*n),
        Value::Boolean(b) => Ok(if *b { 1.0 } else { 0.0 }),
        Value::Text(s) => s.trim().parse().map_err(|_| mismatch(value, "DOUBLE")),
        _ => Err(mismatch(value, "DOUBLE")),
    }
}

fn to_bool(value: &Value) -> Result<bool, String> {
    match value {
        Value::Boolean(b) => Ok(*b),
        Value::Number(n) => Ok(*n != 0.0),
        Value::Text(s) if s.eq_ignore_ascii_case("true") => Ok(true),
        Value::Text(s) if s.eq_ignore_ascii_case("false") => Ok(false),
        _ => Err(mismatch(value, "BOOLEAN")),
    }
}

fn to_date(value: &Value) -> Result<NaiveDate, String> {
    match value {
        Value::Date(d) => Ok(*d),
        Value::Timestamp(ts) => Ok(ts.date()),
        Value::TimestampTz(ts) => Ok(ts.naive_utc().date()),
        Value::Text(s) => {
            NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").map_err(|_| mismatch(value, "DATE"))
        }
        _ => Err(mismatch(value, "DATE")),
    }
}

/// Zoned timestamps become their UTC instant; the offset is dropped.
fn to_naive_timestamp(value: &Value) -> Result<NaiveDateTime, String> {
    match value {
        Value::Timestamp(ts) => Ok(*ts),
        Value::TimestampTz(ts) => Ok(ts.naive_utc()),
        Value::Date(d) => Ok(d.and_time(chrono::NaiveTime::MIN)),
        Value::Text(s) => {
            let s = s.trim();
            if let Ok(zoned) = DateTime::parse_from_rfc3339(s) {
                return Ok(zoned.naive_utc());
            }
            NAIVE_FORMATS
                .iter()
                .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
                .ok_or_else(|| mismatch(value, "TIMESTAMP"))
        }
        _ => Err(mismatch(value, "TIMESTAMP")),
    }
}

/// Unquoted text form of a value.
pub(crate) fn plain_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Number(n) => n.to_string(),
        Value::Text(s) => s.clone(),
        Value::Boolean(b) => b.to_string(),
        Value::Date(d) => d.to_string(),
        Value::Timestamp(ts) => ts.format("%Y-%m-%d %H:%M:%S%.f").to_string(),
        Value::TimestampTz(ts) => ts.to_rfc3339(),
    }
}

/// Writes chunks of rows to a staged Arrow IPC file.
pub struct StagedWriter {
    writer: FileWriter<BufWriter<File>>,
    schema: SchemaRef,
    names: Vec<String>,
    builders: Vec<ColumnBuilder>,
    rows: u64,
}

impl StagedWriter {
    /// Creates the file at `path` for `columns`.
    pub fn create(path: &Path, columns: &[ColumnDescriptor]) -> SyncResult<Self> {
        let schema = Arc::new(arrow_schema(columns));
        let file = BufWriter::new(File::create(path)?);
        let writer = FileWriter::try_new(file, &schema)?;
        Ok(Self {
            writer,
            schema,
            names: columns.iter().map(|c| c.name.clone()).collect(),
            builders: columns
                .iter()
                .map(|c| ColumnBuilder::for_type(c.destination_type))
                .collect(),
            rows: 0,
        })
    }

    /// Appends one chunk as a record batch.
    pub fn write_chunk(&mut self, rows: &[Row]) -> SyncResult<()> {
        if rows.is_empty() {
            return Ok(());
        }
        for row in rows {
            if row.len() != self.builders.len() {
                return Err(SyncError::Staging(format!(
                    "row has {} values, expected {}",
                    row.len(),
                    self.builders.len()
                )));
            }
            for ((builder, value), name) in self.builders.iter_mut().zip(row).zip(&self.names) {
                builder
                    .append(value)
                    .map_err(|e| SyncError::Staging(format!("column {name}: {e}")))?;
            }
        }
        let arrays = self.builders.iter_mut().map(ColumnBuilder::finish).collect();
        let batch = RecordBatch::try_new(Arc::clone(&self.schema), arrays)?;
        self.writer.write(&batch)?;
        self.rows += rows.len() as u64;
        Ok(())
    }

    /// Rows written so far.
    pub fn rows(&self) -> u64 {
        self.rows
    }

    /// Writes the footer and flushes. Returns the number of rows written.
    pub fn finish(mut self) -> SyncResult<u64> {
        self.writer.finish()?;
        let mut file = self.writer.into_inner()?;
        file.flush()?;
        Ok(self.rows)
    }
}

enum TypedCol<'a> {
    Float64(&'a Float64Array),
    Utf8(&'a StringArray),
    Boolean(&'a BooleanArray),
    Date32(&'a Date32Array),
    TimestampMicros(&'a TimestampMicrosecondArray),
}

fn downcast<'a, T: 'static>(array: &'a ArrayRef, name: &str) -> SyncResult<&'a T> {
    array
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| SyncError::Staging(format!("unexpected array type for column {name}")))
}

fn typed_columns<'a>(batch: &'a RecordBatch) -> SyncResult<Vec<TypedCol<'a>>> {
    batch
        .schema_ref()
        .fields()
        .iter()
        .zip(batch.columns())
        .map(|(field, array)| {
            let name = field.name();
            Ok(match field.data_type() {
                DataType::Float64 => TypedCol::Float64(downcast(array, name)?),
                DataType::Utf8 => TypedCol::Utf8(downcast(array, name)?),
                DataType::Boolean => TypedCol::Boolean(downcast(array, name)?),
                DataType::Date32 => TypedCol::Date32(downcast(array, name)?),
                DataType::Timestamp(TimeUnit::Microsecond, None) => {
                    TypedCol::TimestampMicros(downcast(array, name)?)
                }
                other => {
                    return Err(SyncError::Staging(format!(
                        "unsupported staged type {other} for column {name}"
                    )))
                }
            })
        })
        .collect()
}

fn cell(column: &TypedCol<'_>, row: usize) -> SyncResult<Value> {
    let value = match column {
        TypedCol::Float64(a) if a.is_valid(row) => Value::Number(a.value(row)),
        TypedCol::Utf8(a) if a.is_valid(row) => Value::Text(a.value(row).to_string()),
        TypedCol::Boolean(a) if a.is_valid(row) => Value::Boolean(a.value(row)),
        TypedCol::Date32(a) if a.is_valid(row) => {
            let days = chrono::Duration::days(i64::from(a.value(row)));
            let date = unix_epoch_date()
                .checked_add_signed(days)
                .ok_or_else(|| SyncError::Staging("staged date out of range".into()))?;
            Value::Date(date)
        }
        TypedCol::TimestampMicros(a) if a.is_valid(row) => {
            let ts = DateTime::from_timestamp_micros(a.value(row))
                .ok_or_else(|| SyncError::Staging("staged timestamp out of range".into()))?;
            Value::Timestamp(ts.naive_utc())
        }
        _ => Value::Null,
    };
    Ok(value)
}

fn batch_rows(batch: &RecordBatch) -> SyncResult<Vec<Row>> {
    let columns = typed_columns(batch)?;
    (0..batch.num_rows())
        .map(|row| columns.iter().map(|col| cell(col, row)).collect())
        .collect()
}

/// Reads a staged file back one record batch at a time.
pub struct StagedReader {
    reader: FileReader<BufReader<File>>,
    columns: Vec<String>,
}

impl StagedReader {
    /// Opens a staged file.
    pub fn open(path: &Path) -> SyncResult<Self> {
        let reader = FileReader::try_new(BufReader::new(File::open(path)?), None)?;
        let columns = reader
            .schema()
            .fields()
            .iter()
            .map(|f| f.name().clone())
            .collect();
        Ok(Self { reader, columns })
    }

    /// Column names in file order.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }
}

impl Iterator for StagedReader {
    type Item = SyncResult<Vec<Row>>;

    fn next(&mut self) -> Option<Self::Item> {
        self.reader
            .next()
            .map(|batch| batch.map_err(SyncError::from).and_then(|b| batch_rows(&b)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::type_map::map_columns;
    use tablesync_types::SourceColumn;

    fn columns() -> Vec<ColumnDescriptor> {
        map_columns(&[
            SourceColumn::new("ID", "NUMBER"),
            SourceColumn::new("NAME", "VARCHAR"),
            SourceColumn::new("ACTIVE", "BOOLEAN"),
            SourceColumn::new("BORN", "DATE"),
            SourceColumn::new("UPDATED_AT", "TIMESTAMP_TZ"),
        ])
    }

    fn ts(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").unwrap()
    }

    fn read_all(path: &Path) -> (Vec<String>, Vec<Row>) {
        let reader = StagedReader::open(path).unwrap();
        let names = reader.columns().to_vec();
        let rows = reader
            .collect::<SyncResult<Vec<_>>>()
            .unwrap()
            .into_iter()
            .flatten()
            .collect();
        (names, rows)
    }

    #[test]
    fn written_chunks_read_back_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("staged.arrow");
        let born = NaiveDate::from_ymd_opt(1990, 5, 17).unwrap();
        let zoned = DateTime::parse_from_rfc3339("2024-01-01T12:00:00+02:00").unwrap();

        let mut writer = StagedWriter::create(&path, &columns()).unwrap();
        writer
            .write_chunk(&[vec![
                Value::Number(1.0),
                Value::Text("ada".into()),
                Value::Boolean(true),
                Value::Date(born),
                Value::TimestampTz(zoned),
            ]])
            .unwrap();
        writer
            .write_chunk(&[vec![
                Value::Number(2.0),
                Value::Null,
                Value::Null,
                Value::Null,
                Value::Timestamp(ts("2024-02-01 08:30:00")),
            ]])
            .unwrap();
        assert_eq!(writer.finish().unwrap(), 2);

        let (names, rows) = read_all(&path);
        assert_eq!(names, ["ID", "NAME", "ACTIVE", "BORN", "UPDATED_AT"]);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0][1], Value::Text("ada".into()));
        assert_eq!(rows[0][3], Value::Date(born));
        // Offset is dropped after conversion to UTC.
        assert_eq!(rows[0][4], Value::Timestamp(ts("2024-01-01 10:00:00")));
        assert_eq!(rows[1][1], Value::Null);
        assert_eq!(rows[1][4], Value::Timestamp(ts("2024-02-01 08:30:00")));
    }

    #[test]
    fn empty_export_is_a_valid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.arrow");
        let writer = StagedWriter::create(&path, &columns()).unwrap();
        assert_eq!(writer.finish().unwrap(), 0);

        let (names, rows) = read_all(&path);
        assert_eq!(names.len(), 5);
        assert!(rows.is_empty());
    }

    #[test]
    fn text_column_accepts_any_value() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("text.arrow");
        let cols = map_columns(&[SourceColumn::new("V", "GEOGRAPHY")]);
        let mut writer = StagedWriter::create(&path, &cols).unwrap();
        writer
            .write_chunk(&[vec![Value::Number(2.5)], vec![Value::Boolean(false)]])
            .unwrap();
        writer.finish().unwrap();

        let (_, rows) = read_all(&path);
        assert_eq!(rows[0][0], Value::Text("2.5".into()));
        assert_eq!(rows[1][0], Value::Text("false".into()));
    }

    #[test]
    fn incompatible_value_is_a_staging_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.arrow");
        let cols = map_columns(&[SourceColumn::new("AMOUNT", "NUMBER")]);
        let mut writer = StagedWriter::create(&path, &cols).unwrap();
        let err = writer
            .write_chunk(&[vec![Value::Text("lots".into())]])
            .unwrap_err();
        assert!(matches!(err, SyncError::Staging(_)));
        assert!(err.to_string().contains("AMOUNT"));
    }

    #[test]
    fn wrong_row_width_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("width.arrow");
        let mut writer = StagedWriter::create(&path, &columns()).unwrap();
        assert!(writer.write_chunk(&[vec![Value::Null]]).is_err());
    }

    #[test]
    fn staged_file_is_removed_on_cleanup_and_drop() {
        let dir = tempfile::tempdir().unwrap();
        let area = StagingArea::new(dir.path().join("staging"));
        let job = JobId::new();

        let staged = area.stage(job, 1).unwrap();
        assert!(staged.path().ends_with(format!("{job}/attempt-1.arrow")));
        fs::write(staged.path(), b"data").unwrap();
        assert_eq!(staged.size().unwrap(), 4);
        staged.cleanup().unwrap();
        assert!(!area.job_dir(job).exists());

        let staged = area.stage(job, 2).unwrap();
        fs::write(staged.path(), b"data").unwrap();
        let path = staged.path().to_path_buf();
        drop(staged);
        assert!(!path.exists());
    }

    #[test]
    fn entries_lists_job_directories() {
        let dir = tempfile::tempdir().unwrap();
        let area = StagingArea::new(dir.path());
        assert!(StagingArea::new(dir.path().join("missing"))
            .entries()
            .unwrap()
            .is_empty());

        let job = JobId::new();
        fs::create_dir_all(area.job_dir(job)).unwrap();
        fs::create_dir_all(dir.path().join("not-a-job")).unwrap();
        fs::write(dir.path().join("stray.txt"), b"x").unwrap();

        let mut entries = area.entries().unwrap();
        entries.sort_by_key(|e| e.job_id.is_none());
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].job_id, Some(job));
        assert_eq!(entries[1].job_id, None);
    }
}
