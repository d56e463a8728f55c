//! Raw query result rows
//!
//! ObjectServer columns are heterogeneous: the same result set can mix
//! strings, integers, reals and NULLs. Each cell is kept as a tagged
//! [`ColumnValue`] and coerced explicitly when a row is mapped.

use serde_json::Value;

/// A single result cell
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValue {
    /// SQL NULL or a missing cell
    Null,
    /// 정수
    Integer(i64),
    /// 실수
    Float(f64),
    /// 불리언
    Boolean(bool),
    /// 문자열
    Text(String),
}

impl ColumnValue {
    /// Label representation
    ///
    /// Integral numbers never carry a decimal point, other floats use the
    /// shortest round-trip form, NULL becomes the empty string.
    pub fn to_label(&self) -> String {
        match self {
            ColumnValue::Null => String::new(),
            ColumnValue::Integer(i) => i.to_string(),
            ColumnValue::Float(f) => {
                if f.fract() == 0.0 && f.abs() < 1e15 {
                    format!("{}", *f as i64)
                } else {
                    f.to_string()
                }
            }
            ColumnValue::Boolean(b) => b.to_string(),
            ColumnValue::Text(s) => s.clone(),
        }
    }

    /// Numeric representation
    ///
    /// Returns `None` for NULL and `Some(Err(()))` for values that are not
    /// numeric. Text is accepted when it parses as a float after trimming.
    pub fn to_f64(&self) -> Option<Result<f64, ()>> {
        match self {
            ColumnValue::Null => None,
            ColumnValue::Integer(i) => Some(Ok(*i as f64)),
            ColumnValue::Float(f) => Some(Ok(*f)),
            ColumnValue::Boolean(b) => Some(Ok(if *b { 1.0 } else { 0.0 })),
            ColumnValue::Text(s) => Some(s.trim().parse::<f64>().map_err(|_| ())),
        }
    }

    /// Short rendering for error messages
    pub fn describe(&self) -> String {
        match self {
            ColumnValue::Null => "NULL".to_string(),
            ColumnValue::Text(s) => format!("{:?}", s),
            other => other.to_label(),
        }
    }
}

impl From<&Value> for ColumnValue {
    fn from(value: &Value) -> Self {
        match value {
            Value::Null => ColumnValue::Null,
            Value::Bool(b) => ColumnValue::Boolean(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => ColumnValue::Integer(i),
                None => n.as_f64().map(ColumnValue::Float).unwrap_or(ColumnValue::Null),
            },
            Value::String(s) => ColumnValue::Text(s.clone()),
            // Nested structures have no scalar meaning; keep their JSON text
            other => ColumnValue::Text(other.to_string()),
        }
    }
}

impl From<&str> for ColumnValue {
    fn from(value: &str) -> Self {
        ColumnValue::Text(value.to_string())
    }
}

impl From<String> for ColumnValue {
    fn from(value: String) -> Self {
        ColumnValue::Text(value)
    }
}

impl From<i64> for ColumnValue {
    fn from(value: i64) -> Self {
        ColumnValue::Integer(value)
    }
}

impl From<f64> for ColumnValue {
    fn from(value: f64) -> Self {
        ColumnValue::Float(value)
    }
}

/// One result row: ordered column name/value pairs
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawRow {
    columns: Vec<(String, ColumnValue)>,
}

impl RawRow {
    /// Create an empty row
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a column
    pub fn with(mut self, name: impl Into<String>, value: impl Into<ColumnValue>) -> Self {
        self.push(name, value);
        self
    }

    /// Append a column in place
    pub fn push(&mut self, name: impl Into<String>, value: impl Into<ColumnValue>) {
        self.columns.push((name.into(), value.into()));
    }

    /// Look up a column; exact match first, then case-insensitive
    pub fn get(&self, name: &str) -> Option<&ColumnValue> {
        self.columns
            .iter()
            .find(|(n, _)| n == name)
            .or_else(|| self.columns.iter().find(|(n, _)| n.eq_ignore_ascii_case(name)))
            .map(|(_, v)| v)
    }

    /// Columns in result order
    pub fn columns(&self) -> &[(String, ColumnValue)] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

impl From<Vec<(String, ColumnValue)>> for RawRow {
    fn from(columns: Vec<(String, ColumnValue)>) -> Self {
        Self { columns }
    }
}
