//! Column types, values and table schemas.

use std::fmt;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

/// Columns carrying the idempotency key of every committed row.
pub const SOURCE_KEY_COLUMN: &str = "_source_key";
pub const SOURCE_MARKER_COLUMN: &str = "_source_marker";
pub const SOURCE_OFFSET_COLUMN: &str = "_source_offset";

pub const RESERVED_COLUMNS: [&str; 3] =
    [SOURCE_KEY_COLUMN, SOURCE_MARKER_COLUMN, SOURCE_OFFSET_COLUMN];

/// Logical type of a column.
///
/// `Null` marks a column for which no value has been observed yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Null,
    Boolean,
    Integer,
    Float,
    Timestamp,
    Text,
}

impl ColumnType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnType::Null => "null",
            ColumnType::Boolean => "boolean",
            ColumnType::Integer => "integer",
            ColumnType::Float => "float",
            ColumnType::Timestamp => "timestamp",
            ColumnType::Text => "text",
        }
    }

    /// Whether values of type `incoming` can be written into a column of
    /// this type without losing information.
    pub fn accepts(self, incoming: ColumnType) -> bool {
        self == incoming
            || incoming == ColumnType::Null
            || self == ColumnType::Text
            || (self == ColumnType::Float && incoming == ColumnType::Integer)
    }

    /// Narrowest type holding values of both `self` and `other`.
    pub fn unify(self, other: ColumnType) -> ColumnType {
        match (self, other) {
            (a, b) if a == b => a,
            (ColumnType::Null, t) | (t, ColumnType::Null) => t,
            (ColumnType::Integer, ColumnType::Float) | (ColumnType::Float, ColumnType::Integer) => {
                ColumnType::Float
            }
            _ => ColumnType::Text,
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single typed cell.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    Timestamp(DateTime<Utc>),
    Text(String),
}

const TIMESTAMP_FORMATS: [&str; 4] = [
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
];

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    TIMESTAMP_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
        .map(|naive| naive.and_utc())
}

fn parse_float(raw: &str) -> Option<f64> {
    // Rejects "inf", "NaN" and friends, which are text in CSV exports.
    if !raw.bytes().any(|b| b.is_ascii_digit()) {
        return None;
    }
    raw.parse::<f64>().ok().filter(|v| v.is_finite())
}

impl Value {
    /// Infer the most specific value for a raw CSV field.
    ///
    /// Empty fields are null.
    pub fn infer(raw: &str) -> Value {
        if raw.is_empty() {
            return Value::Null;
        }
        if raw.eq_ignore_ascii_case("true") {
            return Value::Boolean(true);
        }
        if raw.eq_ignore_ascii_case("false") {
            return Value::Boolean(false);
        }
        if let Ok(v) = raw.parse::<i64>() {
            return Value::Integer(v);
        }
        if let Some(v) = parse_float(raw) {
            return Value::Float(v);
        }
        if let Some(ts) = parse_timestamp(raw) {
            return Value::Timestamp(ts);
        }
        Value::Text(raw.to_string())
    }

    /// Parse a raw CSV field as a value of the given column type.
    ///
    /// Returns `None` when the field does not fit the type.
    pub fn parse_as(raw: &str, column_type: ColumnType) -> Option<Value> {
        if raw.is_empty() {
            return Some(Value::Null);
        }
        match column_type {
            ColumnType::Null => Some(Value::infer(raw)),
            ColumnType::Text => Some(Value::Text(raw.to_string())),
            ColumnType::Boolean => match Value::infer(raw) {
                v @ Value::Boolean(_) => Some(v),
                _ => None,
            },
            ColumnType::Integer => raw.parse::<i64>().ok().map(Value::Integer),
            ColumnType::Float => parse_float(raw).map(Value::Float),
            ColumnType::Timestamp => parse_timestamp(raw).map(Value::Timestamp),
        }
    }

    pub fn column_type(&self) -> ColumnType {
        match self {
            Value::Null => ColumnType::Null,
            Value::Boolean(_) => ColumnType::Boolean,
            Value::Integer(_) => ColumnType::Integer,
            Value::Float(_) => ColumnType::Float,
            Value::Timestamp(_) => ColumnType::Timestamp,
            Value::Text(_) => ColumnType::Text,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Convert into a value of `target`, if the target accepts this type.
    pub fn coerce(self, target: ColumnType) -> Option<Value> {
        match (self, target) {
            (Value::Null, _) => Some(Value::Null),
            (v, t) if v.column_type() == t => Some(v),
            (Value::Integer(i), ColumnType::Float) => Some(Value::Float(i as f64)),
            (v, ColumnType::Text) => Some(Value::Text(v.to_string())),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::Boolean(v) => write!(f, "{v}"),
            Value::Integer(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Timestamp(v) => write!(f, "{}", v.to_rfc3339()),
            Value::Text(v) => f.write_str(v),
        }
    }
}

/// A named, nullable column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub column_type: ColumnType,
}

impl Column {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
        }
    }
}

/// Ordered set of columns.
///
/// Used both for the columns observed in a batch and for the destination
/// table, where it excludes the idempotency columns.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    columns: Vec<Column>,
}

impl TableSchema {
    pub fn new(columns: Vec<Column>) -> Self {
        Self { columns }
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn get(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// This schema followed by `extra`; columns already present are ignored.
    pub fn widened(&self, extra: &[Column]) -> TableSchema {
        let mut columns = self.columns.clone();
        for column in extra {
            if self.get(&column.name).is_none() {
                columns.push(column.clone());
            }
        }
        TableSchema { columns }
    }
}

impl FromIterator<Column> for TableSchema {
    fn from_iter<I: IntoIterator<Item = Column>>(iter: I) -> Self {
        Self {
            columns: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_infer_values() {
        assert_eq!(Value::infer(""), Value::Null);
        assert_eq!(Value::infer("TRUE"), Value::Boolean(true));
        assert_eq!(Value::infer("42"), Value::Integer(42));
        assert_eq!(Value::infer("-3.5"), Value::Float(-3.5));
        assert_eq!(Value::infer("NaN"), Value::Text("NaN".to_string()));
        assert_eq!(Value::infer("N"), Value::Text("N".to_string()));
        assert_eq!(
            Value::infer("2024-01-01 00:15:30"),
            Value::Timestamp(Utc.with_ymd_and_hms(2024, 1, 1, 0, 15, 30).unwrap())
        );
    }

    #[test]
    fn test_parse_as_rejects_mismatches() {
        assert_eq!(Value::parse_as("7", ColumnType::Float), Some(Value::Float(7.0)));
        assert_eq!(Value::parse_as("7.5", ColumnType::Integer), None);
        assert_eq!(Value::parse_as("abc", ColumnType::Timestamp), None);
        assert_eq!(Value::parse_as("", ColumnType::Integer), Some(Value::Null));
        assert_eq!(
            Value::parse_as("12", ColumnType::Text),
            Some(Value::Text("12".to_string()))
        );
    }

    #[test]
    fn test_unify() {
        assert_eq!(ColumnType::Null.unify(ColumnType::Integer), ColumnType::Integer);
        assert_eq!(ColumnType::Integer.unify(ColumnType::Float), ColumnType::Float);
        assert_eq!(ColumnType::Boolean.unify(ColumnType::Integer), ColumnType::Text);
    }

    #[test]
    fn test_accepts() {
        assert!(ColumnType::Float.accepts(ColumnType::Integer));
        assert!(ColumnType::Text.accepts(ColumnType::Timestamp));
        assert!(ColumnType::Integer.accepts(ColumnType::Null));
        assert!(!ColumnType::Integer.accepts(ColumnType::Float));
        assert!(!ColumnType::Integer.accepts(ColumnType::Text));
    }

    #[test]
    fn test_coerce() {
        assert_eq!(
            Value::Integer(3).coerce(ColumnType::Float),
            Some(Value::Float(3.0))
        );
        assert_eq!(
            Value::Boolean(false).coerce(ColumnType::Text),
            Some(Value::Text("false".to_string()))
        );
        assert_eq!(Value::Text("x".to_string()).coerce(ColumnType::Integer), None);
    }

    #[test]
    fn test_widened_appends_only_new_columns() {
        let schema = TableSchema::new(vec![
            Column::new("vendor_id", ColumnType::Integer),
            Column::new("fare_amount", ColumnType::Float),
        ]);
        let widened = schema.widened(&[
            Column::new("fare_amount", ColumnType::Float),
            Column::new("tip_amount", ColumnType::Float),
        ]);
        let names: Vec<_> = widened.columns().iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["vendor_id", "fare_amount", "tip_amount"]);
    }
}
