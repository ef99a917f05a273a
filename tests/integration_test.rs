//! Integration tests for entity-cache
//!
//! These tests verify end-to-end read-through behavior across the service,
//! both DAO flavors, the engine and the in-memory store.

mod common;

use common::service;
use entity_cache::value::{fieldvals, SortDirection};
use entity_cache::{FieldVals, Row, Value};
use std::collections::BTreeMap;

fn user(name: &str, status_id: i64) -> FieldVals {
    fieldvals([("name", Value::from(name)), ("status_id", Value::from(status_id))])
}

/// Test 1: Read-through correctness
///
/// Cold and warm reads return the same rows as the store holds.
#[tokio::test]
async fn test_read_through_correctness() {
    let (service, _backend, store) = service();
    let users = service.record_dao("user").expect("Failed to create dao");

    let alpha = users.insert(user("alpha", 1)).await.expect("Failed to insert");
    users.insert(user("beta", 2)).await.expect("Failed to insert");

    let cold = users.by_pk(1).await.expect("Cold read failed");
    let warm = users.by_pk(1).await.expect("Warm read failed");
    assert_eq!(cold, Some(alpha.clone()));
    assert_eq!(cold, warm, "Cached row should match the store row");

    let stored: Vec<Row> = store.rows("user").await;
    assert_eq!(stored.len(), 2);

    let by_status = users
        .by_fields("by_status", fieldvals([("status_id", 2)]), None, None, None)
        .await
        .expect("Failed to query");
    assert_eq!(by_status, vec![Value::Integer(2)]);
    assert_eq!(
        users
            .by_fields("by_status", fieldvals([("status_id", 2)]), None, None, None)
            .await
            .expect("Failed to query"),
        by_status
    );
}

/// Test 2: Population idempotence
///
/// A repeated read never reaches the store a second time.
#[tokio::test]
async fn test_population_idempotence() {
    let (service, backend, store) = service();
    let users = service.record_dao("user").expect("Failed to create dao");
    users.insert(user("alpha", 1)).await.expect("Failed to insert");
    store.reset_calls();

    for _ in 0..3 {
        users.by_pk(1).await.expect("Failed to read");
        users
            .by_fields("by_name", fieldvals([("name", "alpha")]), None, None, None)
            .await
            .expect("Failed to query");
        users.count(None).await.expect("Failed to count");
    }

    assert_eq!(store.calls("record"), 1);
    assert_eq!(store.calls("by_fields"), 1);
    assert_eq!(store.calls("count"), 1);
    assert_eq!(backend.keys().len(), 3, "One cache entry per distinct query");
}

/// Test 3: Batch equivalence
///
/// Batched reads match per-key reads, with one store call and one cache
/// read per batch.
#[tokio::test]
async fn test_batch_equivalence() {
    let (service, backend, store) = service();
    let users = service.record_dao("user").expect("Failed to create dao");
    for (name, status) in [("a", 1), ("b", 1), ("c", 2), ("d", 3)] {
        users.insert(user(name, status)).await.expect("Failed to insert");
    }
    store.reset_calls();
    backend.reset_round_trips();

    let pks = BTreeMap::from([
        ("first", Value::from(1)),
        ("third", Value::from(3)),
        ("missing", Value::from(99)),
    ]);
    let batched = users.by_pks(pks.clone()).await.expect("Failed to batch read");
    assert_eq!(store.batches("records"), vec![3]);
    assert_eq!(backend.round_trips(), 2, "One multi-get and one populate pipeline");

    for (key, pk) in pks {
        let single = users.by_pk(pk).await.expect("Failed to read");
        assert_eq!(batched.get(key), single.as_ref(), "Mismatch for {}", key);
    }
    assert!(!batched.contains_key("missing"));
    assert_eq!(store.calls("record"), 0, "Singles were cached by the batch");

    let predicates: BTreeMap<i64, FieldVals> = (1..=4)
        .map(|status| (status, fieldvals([("status_id", status)])))
        .collect();
    let counts = users
        .count_multi(predicates.clone())
        .await
        .expect("Failed to count");
    let pages = users
        .by_fields_multi("by_status", predicates.clone(), None, None, None)
        .await
        .expect("Failed to query");
    assert_eq!(store.calls("count_multi"), 1);
    assert_eq!(store.calls("by_fields_multi"), 1);

    for (status, predicate) in predicates {
        assert_eq!(counts[&status], users.count(Some(predicate.clone())).await.unwrap());
        assert_eq!(
            pages[&status],
            users
                .by_fields("by_status", predicate, None, None, None)
                .await
                .unwrap()
        );
    }
    assert_eq!(counts[&4], 0);
    assert_eq!(store.calls("count"), 0);
    assert_eq!(store.calls("by_fields"), 0);
}

/// Test 4: Ordered batches share one store call
#[tokio::test]
async fn test_ordered_batch_equivalence() {
    let (service, _backend, store) = service();
    let users = service.record_dao("user").expect("Failed to create dao");
    for (name, status) in [("d", 1), ("b", 1), ("c", 2), ("a", 1)] {
        users.insert(user(name, status)).await.expect("Failed to insert");
    }

    let order = vec![("name".to_string(), SortDirection::Desc)];
    let predicates = BTreeMap::from([
        ("one", fieldvals([("status_id", 1)])),
        ("two", fieldvals([("status_id", 2)])),
    ]);
    let pages = users
        .by_fields_multi("by_status", predicates, Some(&order), Some(0), Some(2))
        .await
        .expect("Failed to query");

    // names d, b, a have ids 1, 2, 4
    assert_eq!(pages["one"], vec![Value::Integer(1), Value::Integer(2)]);
    assert_eq!(pages["two"], vec![Value::Integer(3)]);
    assert_eq!(store.batches("by_fields_offset_multi"), vec![2]);

    let single = users
        .by_fields("by_status", fieldvals([("status_id", 1)]), Some(&order), Some(0), Some(2))
        .await
        .expect("Failed to query");
    assert_eq!(single, pages["one"]);
    assert_eq!(store.calls("by_fields_offset"), 0, "Same key as the batched entry");
}

/// Test 5: Miss vs. stored-empty
///
/// Zero counts and empty lists are cached results, not misses.
#[tokio::test]
async fn test_empty_results_are_hits() {
    let (service, _backend, store) = service();
    let users = service.record_dao("user").expect("Failed to create dao");
    let memberships = service.link_dao("user_group").expect("Failed to create dao");

    for _ in 0..2 {
        assert_eq!(users.count(Some(fieldvals([("name", "")]))).await.unwrap(), 0);
        assert!(users
            .by_fields("by_name", fieldvals([("name", "")]), None, None, None)
            .await
            .unwrap()
            .is_empty());
        assert!(users.by_pk(42).await.unwrap().is_none());
        assert!(memberships
            .by_field("user_id", 42, None, None, None)
            .await
            .unwrap()
            .is_empty());
    }

    assert_eq!(store.calls("count"), 1);
    assert_eq!(store.calls("by_fields"), 1);
    assert_eq!(store.calls("record"), 1);
    assert_eq!(store.calls("link_by_fields"), 1);
}

/// Test 6: Insert scenario
///
/// A cached empty `by_name("alpha")` does not survive the insert of alpha.
#[tokio::test]
async fn test_insert_replaces_cached_empty_result() {
    let (service, _backend, _store) = service();
    let users = service.record_dao("user").expect("Failed to create dao");
    let by_name = || users.by_fields("by_name", fieldvals([("name", "alpha")]), None, None, None);

    assert!(by_name().await.unwrap().is_empty());

    let inserted = users
        .insert(fieldvals([("name", "alpha")]))
        .await
        .expect("Failed to insert");
    assert_eq!(inserted["id"], Value::Integer(1));

    assert_eq!(by_name().await.unwrap(), vec![Value::Integer(1)]);
}

/// Test 7: Partial-hit scenario
///
/// With id 1 cached and id 2 not, one store call carries only id 2.
#[tokio::test]
async fn test_partial_hit_fetches_only_misses() {
    let (service, _backend, store) = service();
    let users = service.record_dao("user").expect("Failed to create dao");
    users
        .insert_multi(vec![user("alpha", 1), user("beta", 1)])
        .await
        .expect("Failed to insert");

    users.by_pk(1).await.expect("Failed to warm cache");
    store.reset_calls();

    let rows = users
        .by_pks(BTreeMap::from([("a", Value::from(1)), ("b", Value::from(2))]))
        .await
        .expect("Failed to batch read");

    assert_eq!(store.batches("records"), vec![1]);
    assert_eq!(rows["a"]["name"], Value::from("alpha"));
    assert_eq!(rows["b"]["name"], Value::from("beta"));
}

/// Test 8: Blob fields round-trip as JSON
#[tokio::test]
async fn test_blob_fields() {
    let (service, _backend, store) = service();
    let users = service.record_dao("user").expect("Failed to create dao");

    let prefs = serde_json::json!({"theme": "dark", "langs": ["en", "fr"]});
    let alpha = users
        .insert(fieldvals([
            ("name", Value::from("alpha")),
            ("prefs", Value::Json(prefs.clone())),
        ]))
        .await
        .expect("Failed to insert");
    assert_eq!(alpha["prefs"], Value::Json(prefs.clone()));

    let stored = store.rows("user").await;
    assert!(matches!(stored[0]["prefs"], Value::Binary(_)), "Store holds encoded JSON");

    let all = users.all().await.expect("Failed to read all");
    assert_eq!(all.len(), 1);
    assert_eq!(all[0]["prefs"], Value::Json(prefs));
}

/// Test 9: Concurrent readers and writers
///
/// Clones of one service share the cache; no panics or lost rows.
#[tokio::test]
async fn test_concurrent_operations() {
    let (service, backend, store) = service();
    let mut handles = vec![];

    for i in 0..10 {
        let service = service.clone();
        let handle = tokio::spawn(async move {
            let users = service.record_dao("user").expect("Failed to create dao");
            let memberships = service.link_dao("user_group").expect("Failed to create dao");

            let row = users
                .insert(user(&format!("user_{}", i), i % 3))
                .await
                .expect("Failed to insert");
            for j in 0..5 {
                assert!(memberships
                    .insert(
                        fieldvals([("user_id", row["id"].clone()), ("group_id", Value::from(j))]),
                        false
                    )
                    .await
                    .expect("Link insert should not error"));
                users.by_pk(row["id"].clone()).await.expect("Failed to read");
                users
                    .count(Some(fieldvals([("status_id", i % 3)])))
                    .await
                    .expect("Failed to count");
            }
        });
        handles.push(handle);
    }

    for handle in handles {
        handle.await.expect("Task should not panic");
    }

    assert_eq!(store.rows("user").await.len(), 10);
    assert_eq!(store.rows("user_group").await.len(), 50);
    assert!(!backend.is_empty().await);

    let memberships = service.link_dao("user_group").unwrap();
    assert_eq!(memberships.count(fieldvals([("group_id", 0)])).await.unwrap(), 10);
}
