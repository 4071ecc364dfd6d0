//! Dynamically typed rows as returned by a data endpoint.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// A row mapping column names to values.
pub type Row = BTreeMap<String, Value>;

/// A single column value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Uuid(Uuid),
    Timestamp(NaiveDateTime),
    Date(NaiveDate),
}

const TIMESTAMP_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            Value::Bool(v) => Some(i64::from(*v)),
            Value::Text(v) => v.parse().ok(),
            _ => None,
        }
    }

    /// Interpret the value as a timestamp.
    ///
    /// Dates map to midnight. Text is accepted in the formats SQLite and
    /// PostgreSQL render timestamps in, as well as RFC 3339 (converted to UTC).
    pub fn as_timestamp(&self) -> Option<NaiveDateTime> {
        match self {
            Value::Timestamp(ts) => Some(*ts),
            Value::Date(date) => Some(date.and_time(NaiveTime::MIN)),
            Value::Text(text) => parse_timestamp(text),
            _ => None,
        }
    }
}

pub(crate) fn parse_timestamp(text: &str) -> Option<NaiveDateTime> {
    let text = text.trim();
    for format in TIMESTAMP_FORMATS {
        if let Ok(ts) = NaiveDateTime::parse_from_str(text, format) {
            return Some(ts);
        }
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Some(ts.naive_utc());
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .map(|date| date.and_time(NaiveTime::MIN))
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::Int(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Text(v) => write!(f, "{v}"),
            Value::Uuid(v) => write!(f, "{v}"),
            Value::Timestamp(v) => write!(f, "{}", v.format("%Y-%m-%d %H:%M:%S%.f")),
            Value::Date(v) => write!(f, "{}", v.format("%Y-%m-%d")),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(i64::from(v))
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<Uuid> for Value {
    fn from(v: Uuid) -> Self {
        Value::Uuid(v)
    }
}

impl From<NaiveDateTime> for Value {
    fn from(v: NaiveDateTime) -> Self {
        Value::Timestamp(v)
    }
}

impl From<NaiveDate> for Value {
    fn from(v: NaiveDate) -> Self {
        Value::Date(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// Build a [`Row`] from `(column, value)` pairs.
pub fn row<I, K, V>(columns: I) -> Row
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<Value>,
{
    columns
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").unwrap()
    }

    #[test]
    fn test_text_timestamps() {
        let expected = ts("2024-03-01 12:30:00");
        assert_eq!(Value::from("2024-03-01 12:30:00").as_timestamp(), Some(expected));
        assert_eq!(Value::from("2024-03-01T12:30:00").as_timestamp(), Some(expected));
        assert_eq!(
            Value::from("2024-03-01T14:30:00+02:00").as_timestamp(),
            Some(expected)
        );
        assert_eq!(
            Value::from("2024-03-01").as_timestamp(),
            Some(ts("2024-03-01 00:00:00"))
        );
        assert_eq!(Value::from("yesterday").as_timestamp(), None);
        assert_eq!(Value::Int(3).as_timestamp(), None);
    }

    #[test]
    fn test_display_matches_sql_literal_format() {
        assert_eq!(
            Value::Timestamp(ts("2024-03-01 12:30:00")).to_string(),
            "2024-03-01 12:30:00"
        );
        let date = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        assert_eq!(Value::Date(date).to_string(), "2024-03-01");
        assert_eq!(Value::Null.to_string(), "NULL");
    }

    #[test]
    fn test_row_builder() {
        let r = row([("id", Value::from(1)), ("name", Value::from("a"))]);
        assert_eq!(r.get("id"), Some(&Value::Int(1)));
        assert_eq!(r.get("name").and_then(|v| v.as_i64()), None);
        assert_eq!(Value::from(None::<i64>), Value::Null);
    }
}
