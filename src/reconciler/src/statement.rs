//! The statement shapes the reconciler issues against an endpoint.

use crate::error::{ReconcileError, Result};
use crate::key::KeyValue;
use crate::timerange::{Dialect, Predicate};

/// Column alias used for fetched keys.
pub const KEY_ALIAS: &str = "id";
/// Column alias used for counts.
pub const COUNT_ALIAS: &str = "count";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregate {
    Min,
    Max,
}

impl Aggregate {
    fn as_sql(self) -> &'static str {
        match self {
            Aggregate::Min => "MIN",
            Aggregate::Max => "MAX",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    /// `SELECT <key> AS id FROM <table> [WHERE ...]`
    SelectKeys {
        table: String,
        key_column: String,
        predicate: Predicate,
    },
    /// One row holding `MIN(col) AS col` (or `MAX`) for every column.
    TimestampBounds {
        table: String,
        columns: Vec<String>,
        aggregate: Aggregate,
    },
    /// `DELETE FROM <table> WHERE <key> IN (...)`
    DeleteKeys {
        table: String,
        key_column: String,
        keys: Vec<KeyValue>,
    },
    /// Keys occurring more than once, with their counts.
    DuplicateKeys { table: String, key_column: String },
    /// Free-form SQL, only understood by SQL endpoints.
    Raw(String),
}

impl Statement {
    /// A short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Statement::SelectKeys { .. } => "select_keys",
            Statement::TimestampBounds { .. } => "timestamp_bounds",
            Statement::DeleteKeys { .. } => "delete_keys",
            Statement::DuplicateKeys { .. } => "duplicate_keys",
            Statement::Raw(_) => "raw",
        }
    }

    pub fn is_mutation(&self) -> bool {
        matches!(self, Statement::DeleteKeys { .. })
    }

    pub fn to_sql(&self) -> String {
        self.to_sql_in(Dialect::Generic)
    }

    pub fn to_sql_in(&self, dialect: Dialect) -> String {
        match self {
            Statement::SelectKeys {
                table,
                key_column,
                predicate,
            } => format!(
                "SELECT {key_column} AS {KEY_ALIAS} FROM {table}{}",
                predicate.where_clause_in(dialect)
            ),
            Statement::TimestampBounds {
                table,
                columns,
                aggregate,
            } => {
                let select = columns
                    .iter()
                    .map(|c| format!("{}({c}) AS {c}", aggregate.as_sql()))
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("SELECT {select} FROM {table}")
            }
            Statement::DeleteKeys {
                table,
                key_column,
                keys,
            } => {
                let values = keys
                    .iter()
                    .map(KeyValue::to_sql_literal)
                    .collect::<Vec<_>>()
                    .join(",");
                format!("DELETE FROM {table} WHERE {key_column} IN ({values})")
            }
            Statement::DuplicateKeys { table, key_column } => format!(
                "SELECT {key_column} AS {KEY_ALIAS}, COUNT({key_column}) AS {COUNT_ALIAS} \
                 FROM {table} GROUP BY {key_column} HAVING COUNT({key_column}) > 1"
            ),
            Statement::Raw(sql) => sql.clone(),
        }
    }
}

/// `SELECT COUNT(<key>|*) AS count FROM <table> [WHERE ...]`
pub fn count_sql(
    table: &str,
    key_column: Option<&str>,
    predicate: &Predicate,
    dialect: Dialect,
) -> String {
    format!(
        "SELECT COUNT({}) AS {COUNT_ALIAS} FROM {table}{}",
        key_column.unwrap_or("*"),
        predicate.where_clause_in(dialect)
    )
}

/// Accept plain (optionally schema-qualified) identifiers only.
pub fn validate_identifier(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && !name.starts_with('.')
        && !name.ends_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.');
    if valid {
        Ok(())
    } else {
        Err(ReconcileError::configuration(format!(
            "`{name}` is not a valid table or column name"
        )))
    }
}
