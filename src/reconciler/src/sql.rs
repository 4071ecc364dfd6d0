//! [`DataEndpoint`] over PostgreSQL or SQLite connection pools.

use crate::endpoint::DataEndpoint;
use crate::error::{QueryError, ReconcileError, Result};
use crate::row::{Row, Value};
use crate::statement::{COUNT_ALIAS, Statement, count_sql, validate_identifier};
use crate::timerange::{Dialect, Predicate};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use common::config::{Configuration, DatabaseConfig};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{
    Column, Database, Executor as _, PgPool, Postgres, Row as _, Sqlite, SqlitePool, TypeInfo,
    ValueRef,
};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// A data endpoint backed by a PostgreSQL or SQLite pool.
///
/// PostgreSQL sessions run with `TimeZone` set to UTC, so `TIMESTAMPTZ`
/// values and `TIMESTAMP` literals are both read as UTC wall-clock time.
/// Reads use the simple query protocol: every column arrives as text, and
/// types without a dedicated [`Value`] variant are kept as their text form.
#[derive(Clone, Debug)]
pub enum SqlEndpoint {
    Postgres(PgPool),
    Sqlite(SqlitePool),
}

impl SqlEndpoint {
    /// Connect to the database described by `config`.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, QueryError> {
        let dsn = config.dsn.as_str();
        tracing::info!(dsn = %redact(dsn), "Connecting to data endpoint");

        let endpoint = if dsn.starts_with("sqlite:") {
            if dsn.contains(":memory:") {
                // every connection to an in-memory database sees its own database
                let pool = SqlitePoolOptions::new()
                    .max_connections(1)
                    .idle_timeout(Option::<Duration>::None)
                    .max_lifetime(Option::<Duration>::None)
                    .connect(dsn)
                    .await?;
                SqlEndpoint::Sqlite(pool)
            } else {
                let dsn_with_create = if dsn.contains('?') {
                    if dsn.contains("mode=") {
                        dsn.to_string()
                    } else {
                        format!("{dsn}&mode=rwc")
                    }
                } else {
                    format!("{dsn}?mode=rwc")
                };
                let pool = SqlitePoolOptions::new()
                    .max_connections(config.max_connections)
                    .connect(&dsn_with_create)
                    .await
                    .map_err(|e| {
                        tracing::error!(error = %e, "Failed to connect to SQLite database");
                        e
                    })?;
                SqlEndpoint::Sqlite(pool)
            }
        } else {
            let pool = PgPoolOptions::new()
                .max_connections(config.max_connections)
                .after_connect(|conn, _meta| {
                    Box::pin(async move {
                        conn.execute("SET TIME ZONE 'UTC'").await?;
                        Ok(())
                    })
                })
                .connect(dsn)
                .await
                .map_err(|e| {
                    tracing::error!(error = %e, "Failed to connect to PostgreSQL database");
                    e
                })?;
            SqlEndpoint::Postgres(pool)
        };

        tracing::info!(backend = endpoint.backend(), "Data endpoint connected");
        Ok(endpoint)
    }

    /// Connect to the endpoint registered under `key` in the configuration.
    pub async fn from_settings(key: &str, config: &Configuration) -> Result<Self> {
        let database = config.database(key).ok_or_else(|| {
            ReconcileError::configuration(format!("no database configured under `{key}`"))
        })?;
        Ok(Self::connect(database).await?)
    }

    pub fn backend(&self) -> &'static str {
        match self {
            SqlEndpoint::Postgres(_) => "postgres",
            SqlEndpoint::Sqlite(_) => "sqlite",
        }
    }

    pub fn dialect(&self) -> Dialect {
        match self {
            SqlEndpoint::Postgres(_) => Dialect::Postgres,
            SqlEndpoint::Sqlite(_) => Dialect::Sqlite,
        }
    }

    /// Run raw SQL and materialize every row.
    pub async fn query(&self, sql: &str) -> Result<Vec<Row>, QueryError> {
        tracing::debug!(sql = %sql, "Running query");
        match self {
            SqlEndpoint::Postgres(pool) => {
                let rows = sqlx::raw_sql(sql).fetch_all(pool).await?;
                rows.iter().map(decode_pg_row).collect()
            }
            SqlEndpoint::Sqlite(pool) => {
                let rows = sqlx::query(sql).fetch_all(pool).await?;
                rows.iter().map(decode_sqlite_row).collect()
            }
        }
    }

    /// Run a statement that returns no rows; yields the number of affected rows.
    async fn execute_sql(&self, sql: &str) -> Result<u64, QueryError> {
        tracing::debug!(sql = %sql, "Executing statement");
        let affected = match self {
            SqlEndpoint::Postgres(pool) => sqlx::query(sql).execute(pool).await?.rows_affected(),
            SqlEndpoint::Sqlite(pool) => sqlx::query(sql).execute(pool).await?.rows_affected(),
        };
        Ok(affected)
    }

    /// Insert row mappings into `table`, emptying it first when `replace` is set.
    ///
    /// Column names are taken from the first row; every row must carry the
    /// same columns. All inserts run in one transaction.
    pub async fn insert_rows(
        &self,
        table: &str,
        rows: &[Row],
        replace: bool,
    ) -> Result<InsertSummary> {
        validate_identifier(table)?;
        let columns: Vec<String> = rows
            .first()
            .map(|r| r.keys().cloned().collect())
            .unwrap_or_default();
        for column in &columns {
            validate_identifier(column)?;
        }
        for (i, r) in rows.iter().enumerate() {
            if r.len() != columns.len() || !columns.iter().all(|c| r.contains_key(c)) {
                return Err(ReconcileError::configuration(format!(
                    "row {i} does not have the columns of the first row ({})",
                    columns.join(", ")
                )));
            }
        }

        if replace {
            let truncate = match self {
                SqlEndpoint::Postgres(_) => format!("TRUNCATE TABLE {table}"),
                SqlEndpoint::Sqlite(_) => format!("DELETE FROM {table}"),
            };
            self.execute_sql(&truncate).await?;
        }

        match self {
            SqlEndpoint::Postgres(pool) => {
                let mut tx = pool.begin().await.map_err(QueryError::from)?;
                for r in rows {
                    let sql = insert_sql(table, &columns, r, |n| format!("${n}"));
                    let mut query = sqlx::query(&sql);
                    for value in r.values().filter(|v| !v.is_null()) {
                        query = bind_pg(query, value);
                    }
                    query.execute(&mut *tx).await.map_err(QueryError::from)?;
                }
                tx.commit().await.map_err(QueryError::from)?;
            }
            SqlEndpoint::Sqlite(pool) => {
                let mut tx = pool.begin().await.map_err(QueryError::from)?;
                for r in rows {
                    let sql = insert_sql(table, &columns, r, |_| "?".to_string());
                    let mut query = sqlx::query(&sql);
                    for value in r.values().filter(|v| !v.is_null()) {
                        query = bind_sqlite(query, value);
                    }
                    query.execute(&mut *tx).await.map_err(QueryError::from)?;
                }
                tx.commit().await.map_err(QueryError::from)?;
            }
        }

        let summary = InsertSummary {
            table: table.to_string(),
            rows: rows.len(),
            columns,
        };
        tracing::info!(table = %table, rows = summary.rows, replace, "{summary}");
        Ok(summary)
    }
}

/// Build an insert for one row. `NULL`s are written inline so untyped
/// parameters never reach PostgreSQL.
fn insert_sql(
    table: &str,
    columns: &[String],
    row: &Row,
    placeholder: impl Fn(usize) -> String,
) -> String {
    let mut n = 0;
    let values = row
        .values()
        .map(|v| {
            if v.is_null() {
                "NULL".to_string()
            } else {
                n += 1;
                placeholder(n)
            }
        })
        .collect::<Vec<_>>()
        .join(", ");
    format!("INSERT INTO {table} ({}) VALUES ({values})", columns.join(", "))
}

type PgQuery<'q> = Query<'q, Postgres, <Postgres as Database>::Arguments<'q>>;
type SqliteQuery<'q> = Query<'q, Sqlite, <Sqlite as Database>::Arguments<'q>>;

fn bind_pg<'q>(query: PgQuery<'q>, value: &Value) -> PgQuery<'q> {
    match value {
        Value::Null => query,
        Value::Bool(v) => query.bind(*v),
        Value::Int(v) => query.bind(*v),
        Value::Float(v) => query.bind(*v),
        Value::Text(v) => query.bind(v.clone()),
        Value::Uuid(v) => query.bind(*v),
        Value::Timestamp(v) => query.bind(*v),
        Value::Date(v) => query.bind(*v),
    }
}

fn bind_sqlite<'q>(query: SqliteQuery<'q>, value: &Value) -> SqliteQuery<'q> {
    match value {
        Value::Null => query,
        Value::Bool(v) => query.bind(*v),
        Value::Int(v) => query.bind(*v),
        Value::Float(v) => query.bind(*v),
        Value::Text(v) => query.bind(v.clone()),
        Value::Uuid(v) => query.bind(v.to_string()),
        Value::Timestamp(v) => query.bind(*v),
        Value::Date(v) => query.bind(*v),
    }
}

/// Decode a row fetched in text format.
fn decode_pg_row(row: &PgRow) -> Result<Row, QueryError> {
    let mut out = Row::new();
    for (i, column) in row.columns().iter().enumerate() {
        let raw = row.try_get_raw(i)?;
        let value = if raw.is_null() {
            Value::Null
        } else {
            let type_name = raw.type_info().name().to_string();
            match type_name.as_str() {
                "INT2" => Value::Int(i64::from(row.try_get::<i16, _>(i)?)),
                "INT4" => Value::Int(i64::from(row.try_get::<i32, _>(i)?)),
                "INT8" => Value::Int(row.try_get::<i64, _>(i)?),
                "FLOAT4" => Value::Float(f64::from(row.try_get::<f32, _>(i)?)),
                "FLOAT8" => Value::Float(row.try_get::<f64, _>(i)?),
                "BOOL" => Value::Bool(row.try_get::<bool, _>(i)?),
                "UUID" => Value::Uuid(row.try_get::<Uuid, _>(i)?),
                "TIMESTAMP" => Value::Timestamp(row.try_get::<NaiveDateTime, _>(i)?),
                "TIMESTAMPTZ" => Value::Timestamp(row.try_get::<DateTime<Utc>, _>(i)?.naive_utc()),
                "DATE" => Value::Date(row.try_get::<NaiveDate, _>(i)?),
                "NUMERIC" => numeric(row.try_get_unchecked::<String, _>(i)?),
                _ => Value::Text(row.try_get_unchecked::<String, _>(i)?),
            }
        };
        out.insert(column.name().to_string(), value);
    }
    Ok(out)
}

/// Integral `NUMERIC` values become integers, anything else stays text.
fn numeric(text: String) -> Value {
    match text.parse::<i64>() {
        Ok(n) => Value::Int(n),
        Err(_) => Value::Text(text),
    }
}

fn decode_sqlite_row(row: &SqliteRow) -> Result<Row, QueryError> {
    let mut out = Row::new();
    for (i, column) in row.columns().iter().enumerate() {
        let raw = row.try_get_raw(i)?;
        let value = if raw.is_null() {
            Value::Null
        } else {
            // SQLite reports the storage class of the value itself
            let type_name = raw.type_info().name().to_string();
            match type_name.as_str() {
                "INTEGER" | "BIGINT" | "INT" | "INT8" | "BOOLEAN" => {
                    Value::Int(row.try_get_unchecked::<i64, _>(i)?)
                }
                "REAL" | "FLOAT" | "DOUBLE" => Value::Float(row.try_get_unchecked::<f64, _>(i)?),
                "BLOB" => {
                    let bytes = row.try_get_unchecked::<Vec<u8>, _>(i)?;
                    Value::Text(String::from_utf8_lossy(&bytes).into_owned())
                }
                _ => Value::Text(row.try_get_unchecked::<String, _>(i)?),
            }
        };
        out.insert(column.name().to_string(), value);
    }
    Ok(out)
}

fn redact(dsn: &str) -> String {
    common::cli::utils::redact_dsn(dsn)
}

#[async_trait]
impl DataEndpoint for SqlEndpoint {
    async fn count(
        &self,
        table: &str,
        key_column: Option<&str>,
        predicate: &Predicate,
    ) -> Result<u64, QueryError> {
        let sql = count_sql(table, key_column, predicate, self.dialect());
        tracing::debug!(sql = %sql, "Count query");
        let rows = self.query(&sql).await?;
        rows.first()
            .and_then(|r| r.get(COUNT_ALIAS))
            .and_then(Value::as_i64)
            .and_then(|n| u64::try_from(n).ok())
            .ok_or_else(|| QueryError::Decode {
                column: COUNT_ALIAS.to_string(),
                reason: "count query returned no usable value".to_string(),
            })
    }

    async fn execute(&self, statement: &Statement) -> Result<Vec<Row>, QueryError> {
        let sql = statement.to_sql_in(self.dialect());
        if statement.is_mutation() {
            let affected = self.execute_sql(&sql).await?;
            tracing::debug!(kind = statement.kind(), affected, "Statement executed");
            Ok(Vec::new())
        } else {
            self.query(&sql).await
        }
    }
}

/// Outcome of [`SqlEndpoint::insert_rows`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertSummary {
    pub table: String,
    pub rows: usize,
    pub columns: Vec<String>,
}

impl fmt::Display for InsertSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Inserted {} rows into `{}` with {} columns: {}",
            self.rows,
            self.table,
            self.columns.len(),
            self.columns.join(", ")
        )
    }
}
