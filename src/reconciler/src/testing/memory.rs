use crate::endpoint::DataEndpoint;
use crate::error::QueryError;
use crate::key::KeyValue;
use crate::row::{Row, Value};
use crate::statement::{Aggregate, COUNT_ALIAS, KEY_ALIAS, Statement};
use crate::timerange::Predicate;
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tokio::sync::Mutex;

/// A call received by a [`MemoryEndpoint`].
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Count {
        table: String,
        key_column: Option<String>,
        predicate: Predicate,
    },
    Execute(Statement),
}

impl Call {
    pub fn kind(&self) -> &'static str {
        match self {
            Call::Count { .. } => "count",
            Call::Execute(statement) => statement.kind(),
        }
    }
}

#[derive(Debug)]
struct FailureRule {
    kind: &'static str,
    skip: usize,
}

/// An in-memory [`DataEndpoint`] that interprets structured statements.
///
/// Every call is recorded and can be inspected afterwards. Raw SQL is rejected.
#[derive(Debug, Default)]
pub struct MemoryEndpoint {
    tables: Mutex<HashMap<String, Vec<Row>>>,
    calls: Mutex<Vec<Call>>,
    failures: Mutex<Vec<FailureRule>>,
}

impl MemoryEndpoint {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create `table` if it does not exist yet.
    pub async fn create_table(&self, table: &str) {
        self.tables
            .lock()
            .await
            .entry(table.to_string())
            .or_default();
    }

    /// Append rows to `table`, creating it if needed.
    pub async fn insert<I>(&self, table: &str, rows: I)
    where
        I: IntoIterator<Item = Row>,
    {
        self.tables
            .lock()
            .await
            .entry(table.to_string())
            .or_default()
            .extend(rows);
    }

    pub async fn rows(&self, table: &str) -> Vec<Row> {
        self.tables
            .lock()
            .await
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    /// Normalized keys currently stored in `table`.
    pub async fn keys(&self, table: &str, key_column: &str) -> BTreeSet<KeyValue> {
        self.rows(table)
            .await
            .iter()
            .filter_map(|row| row.get(key_column))
            .filter_map(KeyValue::from_value)
            .collect()
    }

    pub async fn calls(&self) -> Vec<Call> {
        self.calls.lock().await.clone()
    }

    /// Number of recorded calls of the given kind (`"count"` or a [`Statement::kind`]).
    pub async fn call_count(&self, kind: &str) -> usize {
        self.calls
            .lock()
            .await
            .iter()
            .filter(|call| call.kind() == kind)
            .count()
    }

    /// Delete statements received so far.
    pub async fn deletes(&self) -> Vec<Statement> {
        self.calls
            .lock()
            .await
            .iter()
            .filter_map(|call| match call {
                Call::Execute(statement) if statement.is_mutation() => Some(statement.clone()),
                _ => None,
            })
            .collect()
    }

    /// Fail a future call of `kind`, after letting `skip` such calls through.
    pub async fn fail_after(&self, kind: &'static str, skip: usize) {
        self.failures.lock().await.push(FailureRule { kind, skip });
    }

    async fn record(&self, call: Call) -> Result<(), QueryError> {
        let kind = call.kind();
        self.calls.lock().await.push(call);

        let mut failures = self.failures.lock().await;
        if let Some(pos) = failures.iter().position(|rule| rule.kind == kind) {
            if failures[pos].skip == 0 {
                failures.remove(pos);
                return Err(QueryError::Rejected(format!("injected {kind} failure")));
            }
            failures[pos].skip -= 1;
        }
        Ok(())
    }

    async fn table_rows(&self, table: &str) -> Result<Vec<Row>, QueryError> {
        self.tables
            .lock()
            .await
            .get(table)
            .cloned()
            .ok_or_else(|| QueryError::Rejected(format!("no such table: {table}")))
    }
}

fn key_to_value(key: &KeyValue) -> Value {
    match key {
        KeyValue::Int(v) => Value::Int(*v),
        KeyValue::Text(v) => Value::Text(v.clone()),
    }
}

#[async_trait]
impl DataEndpoint for MemoryEndpoint {
    async fn count(
        &self,
        table: &str,
        key_column: Option<&str>,
        predicate: &Predicate,
    ) -> Result<u64, QueryError> {
        self.record(Call::Count {
            table: table.to_string(),
            key_column: key_column.map(str::to_string),
            predicate: predicate.clone(),
        })
        .await?;

        let rows = self.table_rows(table).await?;
        let count = rows
            .iter()
            .filter(|row| predicate.matches(row))
            .filter(|row| match key_column {
                Some(column) => row.get(column).is_some_and(|v| !v.is_null()),
                None => true,
            })
            .count();
        Ok(count as u64)
    }

    async fn execute(&self, statement: &Statement) -> Result<Vec<Row>, QueryError> {
        self.record(Call::Execute(statement.clone())).await?;

        match statement {
            Statement::SelectKeys {
                table,
                key_column,
                predicate,
            } => {
                let rows = self.table_rows(table).await?;
                Ok(rows
                    .iter()
                    .filter(|row| predicate.matches(row))
                    .map(|row| {
                        let key = row.get(key_column).cloned().unwrap_or(Value::Null);
                        Row::from([(KEY_ALIAS.to_string(), key)])
                    })
                    .collect())
            }
            Statement::TimestampBounds {
                table,
                columns,
                aggregate,
            } => {
                let rows = self.table_rows(table).await?;
                let bounds: Row = columns
                    .iter()
                    .map(|column| {
                        let values = rows
                            .iter()
                            .filter_map(|row| row.get(column))
                            .filter_map(Value::as_timestamp);
                        let bound = match aggregate {
                            Aggregate::Min => values.min(),
                            Aggregate::Max => values.max(),
                        };
                        (column.clone(), Value::from(bound))
                    })
                    .collect();
                Ok(vec![bounds])
            }
            Statement::DeleteKeys {
                table,
                key_column,
                keys,
            } => {
                let doomed: BTreeSet<&KeyValue> = keys.iter().collect();
                let mut tables = self.tables.lock().await;
                let rows = tables
                    .get_mut(table)
                    .ok_or_else(|| QueryError::Rejected(format!("no such table: {table}")))?;
                rows.retain(|row| {
                    row.get(key_column)
                        .and_then(KeyValue::from_value)
                        .is_none_or(|key| !doomed.contains(&key))
                });
                Ok(Vec::new())
            }
            Statement::DuplicateKeys { table, key_column } => {
                let rows = self.table_rows(table).await?;
                let mut counts: BTreeMap<KeyValue, i64> = BTreeMap::new();
                for key in rows
                    .iter()
                    .filter_map(|row| row.get(key_column))
                    .filter_map(KeyValue::from_value)
                {
                    *counts.entry(key).or_default() += 1;
                }
                Ok(counts
                    .into_iter()
                    .filter(|(_, count)| *count > 1)
                    .map(|(key, count)| {
                        Row::from([
                            (KEY_ALIAS.to_string(), key_to_value(&key)),
                            (COUNT_ALIAS.to_string(), Value::Int(count)),
                        ])
                    })
                    .collect())
            }
            Statement::Raw(sql) => Err(QueryError::Unsupported(format!(
                "memory endpoint cannot run raw SQL: {sql}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::DataEndpointExt;
    use crate::row::row;

    #[tokio::test]
    async fn test_count_skips_null_keys() {
        let endpoint = MemoryEndpoint::new();
        endpoint
            .insert(
                "t",
                [
                    row([("id", Value::from(1))]),
                    row([("id", Value::Null)]),
                ],
            )
            .await;

        assert_eq!(endpoint.count("t", None, &Predicate::All).await.unwrap(), 2);
        assert_eq!(
            endpoint.count("t", Some("id"), &Predicate::All).await.unwrap(),
            1
        );
        assert_eq!(endpoint.call_count("count").await, 2);
    }

    #[tokio::test]
    async fn test_missing_table_is_query_error() {
        let endpoint = MemoryEndpoint::new();
        let err = endpoint
            .count("missing", None, &Predicate::All)
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::Rejected(_)));
    }

    #[tokio::test]
    async fn test_raw_sql_is_unsupported() {
        let endpoint = MemoryEndpoint::new();
        let err = endpoint
            .execute(&Statement::Raw("SELECT 1".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::Unsupported(_)));
    }

    #[tokio::test]
    async fn test_injected_failure_fires_once() {
        let endpoint = MemoryEndpoint::new();
        endpoint.create_table("t").await;
        endpoint.fail_after("count", 1).await;

        assert!(endpoint.count("t", None, &Predicate::All).await.is_ok());
        assert!(endpoint.count("t", None, &Predicate::All).await.is_err());
        assert!(endpoint.count("t", None, &Predicate::All).await.is_ok());
    }

    #[tokio::test]
    async fn test_duplicate_keys() {
        let endpoint = MemoryEndpoint::new();
        endpoint
            .insert(
                "t",
                [1, 2, 2, 3, 3, 3].map(|id| row([("id", Value::from(id))])),
            )
            .await;

        let duplicates = endpoint.find_duplicate_keys("t", "id").await.unwrap();
        assert_eq!(
            duplicates,
            vec![(KeyValue::Int(2), 2), (KeyValue::Int(3), 3)]
        );
    }
}
