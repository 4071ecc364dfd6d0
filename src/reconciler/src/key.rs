//! Primary-key values compared across source and target.

use crate::row::Value;
use std::collections::BTreeSet;
use std::fmt;

/// A normalized primary-key value.
///
/// Integers stay integers, every other type is reduced to its canonical string
/// form. `Int(5)` and `Text("5")` are different keys.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum KeyValue {
    Int(i64),
    Text(String),
}

/// Keys present in the target but not in the source.
pub type OrphanSet = BTreeSet<KeyValue>;

impl KeyValue {
    /// Normalize a column value into a key. `NULL` has no key.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Null => None,
            Value::Int(v) => Some(KeyValue::Int(*v)),
            other => Some(KeyValue::Text(other.to_string())),
        }
    }

    /// Render as a SQL literal: integers bare, everything else single-quoted.
    pub fn to_sql_literal(&self) -> String {
        match self {
            KeyValue::Int(v) => v.to_string(),
            KeyValue::Text(v) => format!("'{}'", v.replace('\'', "''")),
        }
    }
}

impl fmt::Display for KeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyValue::Int(v) => write!(f, "{v}"),
            KeyValue::Text(v) => write!(f, "{v}"),
        }
    }
}

impl From<i64> for KeyValue {
    fn from(v: i64) -> Self {
        KeyValue::Int(v)
    }
}

impl From<&str> for KeyValue {
    fn from(v: &str) -> Self {
        KeyValue::Text(v.to_string())
    }
}

impl From<String> for KeyValue {
    fn from(v: String) -> Self {
        KeyValue::Text(v)
    }
}
