#![allow(dead_code)]

use chrono::{Duration, NaiveDateTime};
use reconciler::row::row;
use reconciler::testing::MemoryEndpoint;
use reconciler::{DataEndpoint, ReconciliationPair, Row, Value};
use std::sync::Arc;

pub const TABLE: &str = "events";

pub fn ts(s: &str) -> NaiveDateTime {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").unwrap()
}

pub fn event(id: i64, created_at: NaiveDateTime) -> Row {
    row([("id", Value::from(id)), ("created_at", Value::from(created_at))])
}

/// An event with a second timestamp column trailing `created_at` by `lag`.
pub fn updated_event(id: i64, created_at: NaiveDateTime, lag: Duration) -> Row {
    row([
        ("id", Value::from(id)),
        ("created_at", Value::from(created_at)),
        ("updated_at", Value::from(created_at + lag)),
    ])
}

/// `count` events spaced `step` apart from `start`, with ids `1..=count`.
pub fn events(start: NaiveDateTime, step: Duration, count: i64) -> Vec<Row> {
    (0..count).map(|i| event(i + 1, start + step * i as i32)).collect()
}

/// Rows whose `id` is not in `orphans`.
pub fn without(rows: &[Row], orphans: &[i64]) -> Vec<Row> {
    rows.iter()
        .filter(|r| {
            !orphans
                .iter()
                .any(|id| r.get("id") == Some(&Value::Int(*id)))
        })
        .cloned()
        .collect()
}

pub struct Fixture {
    pub pair: ReconciliationPair,
    pub source: Arc<MemoryEndpoint>,
    pub target: Arc<MemoryEndpoint>,
}

pub async fn fixture(target_rows: Vec<Row>, source_rows: Vec<Row>) -> Fixture {
    let source = Arc::new(MemoryEndpoint::new());
    let target = Arc::new(MemoryEndpoint::new());
    source.create_table(TABLE).await;
    target.create_table(TABLE).await;
    source.insert(TABLE, source_rows).await;
    target.insert(TABLE, target_rows).await;

    let source_endpoint: Arc<dyn DataEndpoint> = source.clone();
    let target_endpoint: Arc<dyn DataEndpoint> = target.clone();
    Fixture {
        pair: ReconciliationPair::new("app", source_endpoint, target_endpoint),
        source,
        target,
    }
}
