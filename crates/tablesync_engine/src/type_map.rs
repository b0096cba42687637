//! Source-to-destination type mapping.
//!
//! The mapping is total: every source type name maps to a destination type.
//! Names without an explicit rule become unbounded text so that schema drift
//! in the source never aborts a sync.
//!
//! All timestamp variants map to a naive timestamp. Zoned values are
//! converted to their UTC instant and the offset is dropped.

use tablesync_types::{ColumnDescriptor, DestinationType, SourceColumn, SourceType};

/// Normalizes a raw source type name such as `NUMBER(38,0)` or `varchar`.
pub fn parse_source_type(raw: &str) -> SourceType {
    let upper = raw.trim().to_ascii_uppercase();
    let base = upper.split('(').next().unwrap_or_default().trim();
    match base {
        "NUMBER" | "DECIMAL" | "NUMERIC" | "INT" | "INTEGER" | "BIGINT" | "SMALLINT"
        | "TINYINT" | "BYTEINT" => SourceType::Number,
        "FLOAT" | "FLOAT4" | "FLOAT8" | "DOUBLE" | "DOUBLE PRECISION" | "REAL" => {
            SourceType::Float
        }
        "VARCHAR" | "STRING" | "CHARACTER VARYING" | "NVARCHAR" => SourceType::Varchar,
        "CHAR" | "CHARACTER" | "NCHAR" => SourceType::Char,
        "TEXT" => SourceType::Text,
        "BOOLEAN" | "BOOL" => SourceType::Boolean,
        "DATE" => SourceType::Date,
        "TIMESTAMP" | "TIMESTAMP_NTZ" | "DATETIME" | "TIMESTAMP WITHOUT TIME ZONE" => {
            SourceType::TimestampNtz
        }
        "TIMESTAMP_TZ" | "TIMESTAMPTZ" | "TIMESTAMP WITH TIME ZONE" => SourceType::TimestampTz,
        "TIMESTAMP_LTZ" | "TIMESTAMPLTZ" | "TIMESTAMP WITH LOCAL TIME ZONE" => {
            SourceType::TimestampLtz
        }
        other => SourceType::Other(other.to_string()),
    }
}

/// Maps a normalized source type to its destination type.
pub fn map_type(source: &SourceType, max_length: Option<u32>) -> DestinationType {
    match source {
        SourceType::Number | SourceType::Float => DestinationType::Double,
        SourceType::Varchar | SourceType::Char => DestinationType::Varchar { max_length },
        SourceType::Text | SourceType::Other(_) => DestinationType::Varchar { max_length: None },
        SourceType::Boolean => DestinationType::Boolean,
        SourceType::Date => DestinationType::Date,
        SourceType::TimestampNtz | SourceType::TimestampTz | SourceType::TimestampLtz => {
            DestinationType::Timestamp
        }
    }
}

/// Maps one source column.
pub fn map_column(column: &SourceColumn) -> ColumnDescriptor {
    let source_type = parse_source_type(&column.data_type);
    let destination_type = map_type(&source_type, column.max_length);
    ColumnDescriptor {
        name: column.name.clone(),
        source_type,
        destination_type,
        nullable: column.nullable,
        max_length: column.max_length,
        precision: column.precision,
        scale: column.scale,
    }
}

/// Maps a table's columns, preserving order.
pub fn map_columns(columns: &[SourceColumn]) -> Vec<ColumnDescriptor> {
    columns.iter().map(map_column).collect()
}
