//! Column descriptors on both sides of a sync.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A column as reported by the source warehouse's information schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceColumn {
    /// Column name.
    pub name: String,
    /// Raw type name, e.g. `NUMBER`, `VARCHAR`, `TIMESTAMP_TZ`.
    pub data_type: String,
    /// Maximum character length for textual columns.
    pub max_length: Option<u32>,
    /// Numeric precision.
    pub precision: Option<u32>,
    /// Numeric scale.
    pub scale: Option<u32>,
    /// Whether the column accepts NULL.
    pub nullable: bool,
}

impl SourceColumn {
    /// Creates a nullable column with no length, precision or scale.
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            max_length: None,
            precision: None,
            scale: None,
            nullable: true,
        }
    }

    /// Marks the column NOT NULL.
    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    /// Sets the maximum character length.
    pub fn with_max_length(mut self, max_length: u32) -> Self {
        self.max_length = Some(max_length);
        self
    }

    /// Sets numeric precision and scale.
    pub fn with_precision(mut self, precision: u32, scale: u32) -> Self {
        self.precision = Some(precision);
        self.scale = Some(scale);
        self
    }
}

/// Source warehouse type, normalized from the raw type name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    /// Fixed-point number (`NUMBER`, `DECIMAL`, `INT`, ...).
    Number,
    /// Floating point number (`FLOAT`, `DOUBLE`, `REAL`, ...).
    Float,
    /// Bounded text (`VARCHAR`, `STRING`).
    Varchar,
    /// Fixed-length text (`CHAR`, `CHARACTER`).
    Char,
    /// Unbounded text (`TEXT`).
    Text,
    /// Boolean.
    Boolean,
    /// Calendar date.
    Date,
    /// Timestamp without time zone.
    TimestampNtz,
    /// Timestamp with time zone.
    TimestampTz,
    /// Timestamp in the session's local time zone.
    TimestampLtz,
    /// Anything the mapper has no explicit rule for.
    Other(String),
}

impl SourceType {
    /// Returns the canonical source type name.
    pub fn name(&self) -> &str {
        match self {
            SourceType::Number => "NUMBER",
            SourceType::Float => "FLOAT",
            SourceType::Varchar => "VARCHAR",
            SourceType::Char => "CHAR",
            SourceType::Text => "TEXT",
            SourceType::Boolean => "BOOLEAN",
            SourceType::Date => "DATE",
            SourceType::TimestampNtz => "TIMESTAMP_NTZ",
            SourceType::TimestampTz => "TIMESTAMP_TZ",
            SourceType::TimestampLtz => "TIMESTAMP_LTZ",
            SourceType::Other(name) => name,
        }
    }

    /// Returns true for the timestamp variants that carry zone information.
    pub fn is_zoned_timestamp(&self) -> bool {
        matches!(self, SourceType::TimestampTz | SourceType::TimestampLtz)
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Destination store type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DestinationType {
    /// Double-precision float.
    Double,
    /// Variable-length text.
    Varchar {
        /// Declared length, when the source reported one.
        max_length: Option<u32>,
    },
    /// Boolean.
    Boolean,
    /// Calendar date.
    Date,
    /// Naive (zone-less) timestamp.
    Timestamp,
}

impl DestinationType {
    /// Renders the type as used in destination DDL.
    pub fn sql_name(&self) -> String {
        match self {
            DestinationType::Double => "DOUBLE".into(),
            DestinationType::Varchar {
                max_length: Some(len),
            } => format!("VARCHAR({len})"),
            DestinationType::Varchar { max_length: None } => "VARCHAR".into(),
            DestinationType::Boolean => "BOOLEAN".into(),
            DestinationType::Date => "DATE".into(),
            DestinationType::Timestamp => "TIMESTAMP".into(),
        }
    }

    /// Returns the compatibility family of this type.
    pub fn family(&self) -> TypeFamily {
        match self {
            DestinationType::Double => TypeFamily::Numeric,
            DestinationType::Varchar { .. } => TypeFamily::Text,
            DestinationType::Boolean => TypeFamily::Boolean,
            DestinationType::Date => TypeFamily::Date,
            DestinationType::Timestamp => TypeFamily::Timestamp,
        }
    }
}

impl fmt::Display for DestinationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.sql_name())
    }
}

/// Groups of destination types that can hold each other's values.
///
/// Two declarations are compatible when they fall in the same family,
/// e.g. `VARCHAR(10)` and `TEXT`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeFamily {
    /// Integer, decimal and floating point types.
    Numeric,
    /// Character types.
    Text,
    /// Boolean.
    Boolean,
    /// Date.
    Date,
    /// Timestamps, with or without zone.
    Timestamp,
    /// An unrecognized declaration, compared by its normalized name.
    Other(String),
}

impl TypeFamily {
    /// Classifies a declared column type as stored by the destination.
    pub fn of_declared(declared: &str) -> TypeFamily {
        let upper = declared.trim().to_ascii_uppercase();
        let base = upper
            .split('(')
            .next()
            .unwrap_or_default()
            .trim()
            .to_string();
        match base.as_str() {
            "DOUBLE" | "DOUBLE PRECISION" | "FLOAT" | "FLOAT4" | "FLOAT8" | "REAL" | "NUMBER"
            | "NUMERIC" | "DECIMAL" | "INT" | "INTEGER" | "BIGINT" | "SMALLINT" | "TINYINT" => {
                TypeFamily::Numeric
            }
            "VARCHAR" | "CHAR" | "CHARACTER" | "CHARACTER VARYING" | "TEXT" | "STRING" => {
                TypeFamily::Text
            }
            "BOOLEAN" | "BOOL" => TypeFamily::Boolean,
            "DATE" => TypeFamily::Date,
            "TIMESTAMP" | "DATETIME" | "TIMESTAMP_NTZ" | "TIMESTAMP_TZ" | "TIMESTAMP_LTZ"
            | "TIMESTAMPTZ" => TypeFamily::Timestamp,
            _ => TypeFamily::Other(base),
        }
    }
}

/// A fully mapped column: what the source holds and how the destination stores it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    /// Column name.
    pub name: String,
    /// Normalized source type.
    pub source_type: SourceType,
    /// Destination type chosen by the type mapper.
    pub destination_type: DestinationType,
    /// Whether the column accepts NULL.
    pub nullable: bool,
    /// Maximum character length, if reported.
    pub max_length: Option<u32>,
    /// Numeric precision, if reported.
    pub precision: Option<u32>,
    /// Numeric scale, if reported.
    pub scale: Option<u32>,
}
