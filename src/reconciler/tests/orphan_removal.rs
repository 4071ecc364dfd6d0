mod support;

use chrono::Duration;
use reconciler::row::row;
use reconciler::{KeyValue, ReconcileError, Statement, TimeRange, Value};
use std::collections::BTreeSet;
use support::*;
use uuid::Uuid;

fn keys(ids: &[i64]) -> BTreeSet<KeyValue> {
    ids.iter().map(|id| KeyValue::Int(*id)).collect()
}

#[tokio::test]
async fn test_finds_and_removes_deleted_source_rows() {
    let all = events(ts("2024-01-01 00:00:00"), Duration::days(1), 5);
    let f = fixture(all.clone(), without(&all, &[2, 4])).await;

    let orphans = f
        .pair
        .find_orphans(TABLE, "id", &TimeRange::all())
        .await
        .unwrap();
    assert_eq!(orphans, keys(&[2, 4]));

    let removed = f
        .pair
        .remove_orphans_from_target(TABLE, "id", &TimeRange::all())
        .await
        .unwrap();
    assert_eq!(removed, 2);
    assert_eq!(f.target.keys(TABLE, "id").await, keys(&[1, 3, 5]));

    let deletes = f.target.deletes().await;
    assert_eq!(deletes.len(), 1);
    assert_eq!(deletes[0].to_sql(), "DELETE FROM events WHERE id IN (2,4)");
    assert!(f.source.deletes().await.is_empty());
}

#[tokio::test]
async fn test_removal_is_idempotent() {
    let all = events(ts("2024-01-01 00:00:00"), Duration::hours(1), 20);
    let f = fixture(all.clone(), without(&all, &[3, 7, 19])).await;
    let range = TimeRange::between(ts("2024-01-01 00:00:00"), ts("2024-01-02 00:00:00"))
        .on(["created_at"]);

    let first = f
        .pair
        .remove_orphans_from_target(TABLE, "id", &range)
        .await
        .unwrap();
    let second = f
        .pair
        .remove_orphans_from_target(TABLE, "id", &range)
        .await
        .unwrap();

    assert_eq!(first, 3);
    assert_eq!(second, 0);
    assert_eq!(f.target.deletes().await.len(), 1);
}

#[tokio::test]
async fn test_empty_tables() {
    let f = fixture(vec![], vec![]).await;

    assert_eq!(
        f.pair
            .compare_counts(TABLE, None, &TimeRange::all())
            .await
            .unwrap(),
        0
    );
    assert!(
        f.pair
            .find_orphans(TABLE, "id", &TimeRange::all())
            .await
            .unwrap()
            .is_empty()
    );
    assert_eq!(
        f.pair
            .remove_orphans_from_target(TABLE, "id", &TimeRange::all())
            .await
            .unwrap(),
        0
    );
    assert!(f.target.deletes().await.is_empty());
}

#[tokio::test]
async fn test_compare_counts_within_range() {
    let all = events(ts("2024-01-01 00:00:00"), Duration::days(1), 10);
    // ids 2 and 8 fall on 2024-01-02 and 2024-01-08
    let f = fixture(all.clone(), without(&all, &[2, 8])).await;

    let everything = f
        .pair
        .compare_counts(TABLE, Some("id"), &TimeRange::all())
        .await
        .unwrap();
    assert_eq!(everything, 2);

    let first_week = TimeRange::between(ts("2024-01-01 00:00:00"), ts("2024-01-07 00:00:00"))
        .on(["created_at"]);
    assert_eq!(
        f.pair.compare_counts(TABLE, None, &first_week).await.unwrap(),
        1
    );
}

#[tokio::test]
async fn test_equal_counts_in_range_skip_key_comparison() {
    let all = events(ts("2024-01-01 00:00:00"), Duration::hours(1), 6);
    let f = fixture(all.clone(), all).await;
    let range = TimeRange::between(ts("2024-01-01 00:00:00"), ts("2024-01-02 00:00:00"))
        .on(["created_at"]);

    let orphans = f.pair.find_orphans(TABLE, "id", &range).await.unwrap();

    assert!(orphans.is_empty());
    assert_eq!(f.target.call_count("select_keys").await, 0);
    assert_eq!(f.source.call_count("select_keys").await, 0);
}

#[tokio::test]
async fn test_equal_counts_hide_replaced_rows() {
    // The count shortcut assumes the target never lags behind the source in a
    // bounded window. A replaced row keeps the counts equal and goes unseen.
    let at = ts("2024-01-01 06:00:00");
    let f = fixture(vec![event(1, at), event(2, at)], vec![event(1, at), event(3, at)]).await;
    let range = TimeRange::between(ts("2024-01-01 00:00:00"), ts("2024-01-02 00:00:00"))
        .on(["created_at"]);

    assert!(f.pair.find_orphans(TABLE, "id", &range).await.unwrap().is_empty());
    // without a range the key sets are always compared
    assert_eq!(
        f.pair
            .find_orphans(TABLE, "id", &TimeRange::all())
            .await
            .unwrap(),
        keys(&[2])
    );
}

#[tokio::test]
async fn test_uuid_and_text_keys_normalize_alike() {
    let at = ts("2024-01-01 06:00:00");
    let kept = Uuid::parse_str("67e55044-10b1-426f-9247-bb680e5fe0c8").unwrap();
    let gone = Uuid::parse_str("a1a2a3a4-b1b2-c1c2-d1d2-d3d4d5d6d7d8").unwrap();

    // the target stores uuids as text, the source natively
    let target_rows = vec![
        row([("id", Value::from(kept.to_string())), ("created_at", Value::from(at))]),
        row([("id", Value::from(gone.to_string())), ("created_at", Value::from(at))]),
    ];
    let source_rows = vec![row([("id", Value::from(kept)), ("created_at", Value::from(at))])];
    let f = fixture(target_rows, source_rows).await;

    let removed = f
        .pair
        .remove_orphans_from_target(TABLE, "id", &TimeRange::all())
        .await
        .unwrap();

    assert_eq!(removed, 1);
    assert_eq!(
        f.target.deletes().await[0].to_sql(),
        format!("DELETE FROM events WHERE id IN ('{gone}')")
    );
    assert_eq!(
        f.target.keys(TABLE, "id").await,
        BTreeSet::from([KeyValue::Text(kept.to_string())])
    );
}

#[tokio::test]
async fn test_integer_and_string_keys_are_distinct() {
    let at = ts("2024-01-01 06:00:00");
    let target_rows = vec![row([("id", Value::from(5)), ("created_at", Value::from(at))])];
    let source_rows = vec![row([("id", Value::from("5")), ("created_at", Value::from(at))])];
    let f = fixture(target_rows, source_rows).await;

    let orphans = f
        .pair
        .find_orphans(TABLE, "id", &TimeRange::all())
        .await
        .unwrap();
    assert_eq!(orphans, keys(&[5]));
}

#[tokio::test]
async fn test_configuration_errors_issue_no_queries() {
    let all = events(ts("2024-01-01 00:00:00"), Duration::hours(1), 4);
    let f = fixture(all.clone(), all).await;

    let no_columns = TimeRange::since(ts("2024-01-01 00:00:00"));
    let same_day = TimeRange::between(ts("2024-01-01 01:00:00"), ts("2024-01-01 20:00:00"))
        .on(["created_at"])
        .dates_only();

    for range in [no_columns, same_day] {
        let err = f.pair.find_orphans(TABLE, "id", &range).await.unwrap_err();
        assert!(matches!(err, ReconcileError::Configuration(_)), "{err}");
        let err = f
            .pair
            .remove_orphans_from_target(TABLE, "id", &range)
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::Configuration(_)), "{err}");
        let err = f.pair.compare_counts(TABLE, None, &range).await.unwrap_err();
        assert!(matches!(err, ReconcileError::Configuration(_)), "{err}");
    }

    let err = f
        .pair
        .find_orphans("events; DROP TABLE events", "id", &TimeRange::all())
        .await
        .unwrap_err();
    assert!(matches!(err, ReconcileError::Configuration(_)));

    assert!(f.target.calls().await.is_empty());
    assert!(f.source.calls().await.is_empty());
}

#[tokio::test]
async fn test_query_failure_propagates() {
    let all = events(ts("2024-01-01 00:00:00"), Duration::hours(1), 4);
    let f = fixture(all.clone(), without(&all, &[2])).await;
    f.source.fail_after("select_keys", 0).await;

    let err = f
        .pair
        .remove_orphans_from_target(TABLE, "id", &TimeRange::all())
        .await
        .unwrap_err();

    assert!(matches!(err, ReconcileError::Query(_)));
    assert!(f.target.deletes().await.is_empty());
    assert_eq!(f.target.keys(TABLE, "id").await.len(), 4);
}

#[tokio::test]
async fn test_null_keys_are_ignored() {
    let at = ts("2024-01-01 06:00:00");
    let mut target_rows = events(at, Duration::minutes(1), 3);
    target_rows.push(row([("id", Value::Null), ("created_at", Value::from(at))]));
    let f = fixture(target_rows, events(at, Duration::minutes(1), 2)).await;

    let orphans = f
        .pair
        .find_orphans(TABLE, "id", &TimeRange::all())
        .await
        .unwrap();
    assert_eq!(orphans, keys(&[3]));
}

#[tokio::test]
async fn test_delete_statement_targets_key_column() {
    let at = ts("2024-01-01 06:00:00");
    let target_rows = vec![
        row([("order_id", Value::from(10)), ("created_at", Value::from(at))]),
        row([("order_id", Value::from(11)), ("created_at", Value::from(at))]),
    ];
    let source_rows = vec![row([("order_id", Value::from(10)), ("created_at", Value::from(at))])];
    let f = fixture(target_rows, source_rows).await;

    f.pair
        .remove_orphans_from_target(TABLE, "order_id", &TimeRange::all())
        .await
        .unwrap();

    assert_eq!(
        f.target.deletes().await,
        vec![Statement::DeleteKeys {
            table: TABLE.to_string(),
            key_column: "order_id".to_string(),
            keys: vec![KeyValue::Int(11)],
        }]
    );
}
