//! Row values and row predicates.

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// A single cell value read from the source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    /// SQL NULL.
    Null,
    /// Any numeric value.
    Number(f64),
    /// Text.
    Text(String),
    /// Boolean.
    Boolean(bool),
    /// Calendar date.
    Date(NaiveDate),
    /// Timestamp without zone.
    Timestamp(NaiveDateTime),
    /// Timestamp with a UTC offset.
    TimestampTz(DateTime<FixedOffset>),
}

/// One source row, ordered like the table's columns.
pub type Row = Vec<Value>;

impl Value {
    /// Returns true for NULL.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Orders two values of comparable kinds.
    ///
    /// NULL compares with nothing. Zoned and naive timestamps compare on
    /// their UTC instant.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Number(a), Value::Number(b)) => a.partial_cmp(b),
            (Value::Text(a), Value::Text(b)) => Some(a.cmp(b)),
            (Value::Boolean(a), Value::Boolean(b)) => Some(a.cmp(b)),
            (Value::Date(a), Value::Date(b)) => Some(a.cmp(b)),
            (Value::Timestamp(a), Value::Timestamp(b)) => Some(a.cmp(b)),
            (Value::TimestampTz(a), Value::TimestampTz(b)) => Some(a.cmp(b)),
            (Value::Timestamp(a), Value::TimestampTz(b)) => Some(a.cmp(&b.naive_utc())),
            (Value::TimestampTz(a), Value::Timestamp(b)) => Some(a.naive_utc().cmp(b)),
            _ => None,
        }
    }

    /// Returns true if `self` is strictly greater than `other`.
    pub fn is_after(&self, other: &Value) -> bool {
        self.compare(other) == Some(Ordering::Greater)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("NULL"),
            Value::Number(n) => write!(f, "{n}"),
            Value::Text(s) => write!(f, "'{}'", s.replace('\'', "''")),
            Value::Boolean(b) => write!(f, "{}", if *b { "TRUE" } else { "FALSE" }),
            Value::Date(d) => write!(f, "'{d}'"),
            Value::Timestamp(ts) => write!(f, "'{}'", ts.format("%Y-%m-%d %H:%M:%S%.f")),
            Value::TimestampTz(ts) => write!(f, "'{}'", ts.to_rfc3339()),
        }
    }
}

/// A filter over source rows.
///
/// Column names match case-insensitively, like the warehouse's
/// unquoted identifiers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Predicate {
    /// `column = value`
    Eq {
        /// Column name.
        column: String,
        /// Operand.
        value: Value,
    },
    /// `column > value`
    Gt {
        /// Column name.
        column: String,
        /// Operand.
        value: Value,
    },
    /// `column >= value`
    Ge {
        /// Column name.
        column: String,
        /// Operand.
        value: Value,
    },
    /// `column < value`
    Lt {
        /// Column name.
        column: String,
        /// Operand.
        value: Value,
    },
    /// `column <= value`
    Le {
        /// Column name.
        column: String,
        /// Operand.
        value: Value,
    },
    /// `column IS NULL`
    IsNull {
        /// Column name.
        column: String,
    },
    /// Conjunction of all children. Empty means always true.
    And(Vec<Predicate>),
}

impl Predicate {
    /// `column = value`
    pub fn eq(column: impl Into<String>, value: Value) -> Self {
        Predicate::Eq {
            column: column.into(),
            value,
        }
    }

    /// `column > value`
    pub fn gt(column: impl Into<String>, value: Value) -> Self {
        Predicate::Gt {
            column: column.into(),
            value,
        }
    }

    /// `column < value`
    pub fn lt(column: impl Into<String>, value: Value) -> Self {
        Predicate::Lt {
            column: column.into(),
            value,
        }
    }

    /// Combines two predicates with AND, flattening nested conjunctions.
    pub fn and(self, other: Predicate) -> Self {
        let mut parts = match self {
            Predicate::And(parts) => parts,
            single => vec![single],
        };
        match other {
            Predicate::And(more) => parts.extend(more),
            single => parts.push(single),
        }
        Predicate::And(parts)
    }

    /// Evaluates the predicate against a row laid out as `columns`.
    ///
    /// Comparisons involving NULL or an unknown column are false.
    pub fn matches(&self, columns: &[String], row: &[Value]) -> bool {
        let lookup = |name: &str| {
            columns
                .iter()
                .position(|c| c.eq_ignore_ascii_case(name))
                .and_then(|idx| row.get(idx))
        };
        let cmp = |column: &str, value: &Value| lookup(column).and_then(|v| v.compare(value));

        match self {
            Predicate::Eq { column, value } => cmp(column, value) == Some(Ordering::Equal),
            Predicate::Gt { column, value } => cmp(column, value) == Some(Ordering::Greater),
            Predicate::Ge { column, value } => {
                matches!(cmp(column, value), Some(Ordering::Greater | Ordering::Equal))
            }
            Predicate::Lt { column, value } => cmp(column, value) == Some(Ordering::Less),
            Predicate::Le { column, value } => {
                matches!(cmp(column, value), Some(Ordering::Less | Ordering::Equal))
            }
            Predicate::IsNull { column } => lookup(column).is_some_and(Value::is_null),
            Predicate::And(parts) => parts.iter().all(|p| p.matches(columns, row)),
        }
    }

    /// Renders the predicate as a SQL `WHERE` fragment.
    pub fn to_sql(&self) -> String {
        match self {
            Predicate::Eq { column, value } => format!("{column} = {value}"),
            Predicate::Gt { column, value } => format!("{column} > {value}"),
            Predicate::Ge { column, value } => format!("{column} >= {value}"),
            Predicate::Lt { column, value } => format!("{column} < {value}"),
            Predicate::Le { column, value } => format!("{column} <= {value}"),
            Predicate::IsNull { column } => format!("{column} IS NULL"),
            Predicate::And(parts) if parts.is_empty() => "TRUE".into(),
            Predicate::And(parts) => parts
                .iter()
                .map(|p| format!("({})", p.to_sql()))
                .collect::<Vec<_>>()
                .join(" AND "),
        }
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_sql())
    }
}
