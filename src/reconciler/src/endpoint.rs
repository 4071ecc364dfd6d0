use crate::error::{QueryError, ReconcileError};
use crate::key::KeyValue;
use crate::row::{Row, Value};
use crate::statement::{COUNT_ALIAS, KEY_ALIAS, Statement, validate_identifier};
use crate::timerange::Predicate;
use async_trait::async_trait;

/// A single store the reconciler reads from and deletes from.
///
/// Implementations issue exactly one query per call and never retry.
#[async_trait]
pub trait DataEndpoint: Send + Sync {
    /// Count rows of `table` matching `predicate`.
    ///
    /// With a key column only rows with a non-`NULL` key are counted,
    /// otherwise every row is.
    async fn count(
        &self,
        table: &str,
        key_column: Option<&str>,
        predicate: &Predicate,
    ) -> Result<u64, QueryError>;

    /// Run a statement and return its rows. Deletes return no rows.
    async fn execute(&self, statement: &Statement) -> Result<Vec<Row>, QueryError>;
}

/// Operations composed from [`DataEndpoint::execute`], available on every endpoint.
#[async_trait]
pub trait DataEndpointExt: DataEndpoint {
    /// Keys occurring more than once in `table`, with their counts, ordered by key.
    async fn find_duplicate_keys(
        &self,
        table: &str,
        key_column: &str,
    ) -> Result<Vec<(KeyValue, u64)>, ReconcileError> {
        validate_identifier(table)?;
        validate_identifier(key_column)?;
        let rows = self
            .execute(&Statement::DuplicateKeys {
                table: table.to_string(),
                key_column: key_column.to_string(),
            })
            .await?;

        let mut duplicates = Vec::with_capacity(rows.len());
        for row in &rows {
            let Some(key) = row.get(KEY_ALIAS).and_then(KeyValue::from_value) else {
                continue;
            };
            let count = row
                .get(COUNT_ALIAS)
                .and_then(Value::as_i64)
                .and_then(|n| u64::try_from(n).ok())
                .ok_or_else(|| QueryError::Decode {
                    column: COUNT_ALIAS.to_string(),
                    reason: "duplicate count is not a non-negative integer".to_string(),
                })?;
            duplicates.push((key, count));
        }
        duplicates.sort();
        Ok(duplicates)
    }
}

impl<T: DataEndpoint + ?Sized> DataEndpointExt for T {}
