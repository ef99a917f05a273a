//! Invalidation tests for entity-cache
//!
//! Every write must leave no cached result that contradicts the store, and
//! cache failures must never turn into wrong answers.

mod common;

use common::{registry, service, FailingBackend};
use entity_cache::backend::InMemoryBackend;
use entity_cache::store::MemoryStore;
use entity_cache::value::{fieldvals, FieldType, SortDirection};
use entity_cache::{DataService, EntityDefinition, EntityRegistry, FieldVals, Value};

fn user(name: &str, status_id: i64) -> FieldVals {
    fieldvals([("name", Value::from(name)), ("status_id", Value::from(status_id))])
}

fn ids(ids: &[i64]) -> Vec<Value> {
    ids.iter().copied().map(Value::Integer).collect()
}

/// Test 1: Update invalidates old value, new value and primary key
#[tokio::test]
async fn test_update_invalidates_old_and_new_values() {
    let (service, _backend, _store) = service();
    let users = service.record_dao("user").expect("Failed to create dao");
    let alpha = users.insert(user("alpha", 1)).await.unwrap();

    let by_status = |status: i64| {
        users.by_fields("by_status", fieldvals([("status_id", status)]), None, None, None)
    };
    assert_eq!(by_status(1).await.unwrap(), ids(&[1]));
    assert!(by_status(2).await.unwrap().is_empty());
    assert_eq!(users.count(Some(fieldvals([("status_id", 1)]))).await.unwrap(), 1);
    users.by_pk(1).await.unwrap();

    let updated = users
        .update(&alpha, fieldvals([("status_id", 2)]))
        .await
        .expect("Failed to update");
    assert_eq!(updated["status_id"], Value::Integer(2));

    assert!(by_status(1).await.unwrap().is_empty(), "Old value query is stale");
    assert_eq!(by_status(2).await.unwrap(), ids(&[1]), "New value query is stale");
    assert_eq!(users.count(Some(fieldvals([("status_id", 1)]))).await.unwrap(), 0);
    assert_eq!(users.by_pk(1).await.unwrap(), Some(updated));
}

/// Test 2: Update leaves unrelated entries cached
#[tokio::test]
async fn test_update_keeps_unrelated_entries() {
    let (service, _backend, store) = service();
    let users = service.record_dao("user").expect("Failed to create dao");
    let alpha = users.insert(user("alpha", 1)).await.unwrap();
    users.insert(user("beta", 3)).await.unwrap();

    users.by_pk(2).await.unwrap();
    users
        .by_fields("by_status", fieldvals([("status_id", 3)]), None, None, None)
        .await
        .unwrap();
    store.reset_calls();

    users.update(&alpha, fieldvals([("name", "gamma")])).await.unwrap();

    users.by_pk(2).await.unwrap();
    users
        .by_fields("by_status", fieldvals([("status_id", 3)]), None, None, None)
        .await
        .unwrap();
    assert_eq!(store.calls("record"), 0);
    assert_eq!(store.calls("by_fields"), 0);
}

/// Test 3: Delete invalidates every value of the row
#[tokio::test]
async fn test_delete_invalidates() {
    let (service, _backend, _store) = service();
    let users = service.record_dao("user").expect("Failed to create dao");
    let rows = users
        .insert_multi(vec![user("alpha", 1), user("beta", 1)])
        .await
        .unwrap();

    assert_eq!(users.count(None).await.unwrap(), 2);
    assert_eq!(users.all().await.unwrap().len(), 2);
    assert!(users.by_pk(1).await.unwrap().is_some());
    assert_eq!(
        users
            .by_fields("by_name", fieldvals([("name", "alpha")]), None, None, None)
            .await
            .unwrap(),
        ids(&[1])
    );

    users.delete(&rows[0]).await.expect("Failed to delete");

    assert_eq!(users.count(None).await.unwrap(), 1);
    assert_eq!(users.all().await.unwrap().len(), 1);
    assert!(users.by_pk(1).await.unwrap().is_none());
    assert!(users
        .by_fields("by_name", fieldvals([("name", "alpha")]), None, None, None)
        .await
        .unwrap()
        .is_empty());

    users.delete_multi(&rows[1..]).await.expect("Failed to delete");
    assert_eq!(users.count(None).await.unwrap(), 0);
}

/// Test 4: Ordered query by a foreign key follows the referenced entity
#[tokio::test]
async fn test_ordered_query_invalidated_by_referenced_entity() {
    let (service, _backend, _store) = service();
    let users = service.record_dao("user").expect("Failed to create dao");
    let statuses = service.record_dao("user_status").expect("Failed to create dao");

    let active = statuses
        .insert(fieldvals([("id", Value::from(1)), ("label", Value::from("active"))]))
        .await
        .unwrap();
    users.insert(user("alpha", 2)).await.unwrap();
    users.insert(user("beta", 1)).await.unwrap();

    let order = vec![("status_id".to_string(), SortDirection::Asc)];
    let page = || users.by_fields("everyone", FieldVals::new(), Some(&order), Some(0), Some(10));
    assert_eq!(page().await.unwrap(), ids(&[2, 1]));

    // a write to user_status reaches the page through meta:user_status:id
    statuses
        .update(&active, fieldvals([("label", "enabled")]))
        .await
        .unwrap();
    let before = service.store().calls("by_fields_offset");
    page().await.unwrap();
    assert_eq!(service.store().calls("by_fields_offset"), before + 1);

    // and any change to the ordering field reorders it
    let beta = users.by_pk(2).await.unwrap().unwrap();
    users.update(&beta, fieldvals([("status_id", 3)])).await.unwrap();
    assert_eq!(page().await.unwrap(), ids(&[1, 2]));
}

/// Test 5: Link writes naming one half reach queries on the other
#[tokio::test]
async fn test_link_writes_reach_both_sides() {
    let (service, _backend, _store) = service();
    let memberships = service.link_dao("user_group").expect("Failed to create dao");
    let link = |u: i64, g: i64| fieldvals([("user_id", u), ("group_id", g)]);

    assert!(memberships.insert(link(1, 10), false).await.unwrap());
    assert!(memberships.insert(link(2, 10), false).await.unwrap());
    assert!(memberships.insert(link(1, 20), false).await.unwrap());

    let groups_of_1 = || memberships.by_field("user_id", 1, None, None, None);
    let users_of_10 = || memberships.by_field("group_id", 10, None, None, None);
    let count_of_1 = || memberships.count(fieldvals([("user_id", 1)]));

    assert_eq!(groups_of_1().await.unwrap(), ids(&[10, 20]));
    assert_eq!(users_of_10().await.unwrap(), ids(&[1, 2]));
    assert_eq!(count_of_1().await.unwrap(), 2);

    // delete every membership of group 10, naming only group_id
    assert!(memberships.delete(fieldvals([("group_id", 10)])).await.unwrap());
    assert_eq!(groups_of_1().await.unwrap(), ids(&[20]));
    assert!(users_of_10().await.unwrap().is_empty());
    assert_eq!(count_of_1().await.unwrap(), 1);

    // move group 20 to 30, naming only group_id
    assert!(memberships
        .update(fieldvals([("group_id", 30)]), fieldvals([("group_id", 20)]))
        .await
        .unwrap());
    assert_eq!(groups_of_1().await.unwrap(), ids(&[30]));
    assert_eq!(count_of_1().await.unwrap(), 1);

    // insert into a group user 1 was never read against
    assert!(memberships
        .insert_multi(vec![link(1, 40), link(3, 40)], false)
        .await
        .unwrap());
    assert_eq!(groups_of_1().await.unwrap(), ids(&[30, 40]));
    assert_eq!(memberships.count(FieldVals::new()).await.unwrap(), 3);

    assert!(memberships
        .delete_multi(vec![fieldvals([("user_id", 1)]), fieldvals([("user_id", 3)])])
        .await
        .unwrap());
    assert!(groups_of_1().await.unwrap().is_empty());
    assert_eq!(memberships.count(FieldVals::new()).await.unwrap(), 0);
}

/// Test 6: Ordered link queries follow the referenced entity
#[tokio::test]
async fn test_ordered_link_query_invalidated_by_foreign_update() {
    let (service, _backend, _store) = service();
    let groups = service.record_dao("group").expect("Failed to create dao");
    let memberships = service.link_dao("user_group").expect("Failed to create dao");

    let admins = groups.insert(fieldvals([("name", "admins")])).await.unwrap();
    groups.insert(fieldvals([("name", "builders")])).await.unwrap();
    for group_id in [1, 2] {
        assert!(memberships
            .insert(fieldvals([("user_id", 1), ("group_id", group_id)]), false)
            .await
            .unwrap());
    }

    let order = vec![("name".to_string(), SortDirection::Asc)];
    let page = || memberships.by_field("user_id", 1, Some(&order), None, Some(10));
    assert_eq!(page().await.unwrap(), ids(&[1, 2]));

    groups
        .update(&admins, fieldvals([("name", "zealots")]))
        .await
        .unwrap();
    assert_eq!(page().await.unwrap(), ids(&[2, 1]));

    // a new group row changes the foreign pk set the join sees
    groups.insert(fieldvals([("name", "aardvarks")])).await.unwrap();
    assert!(memberships
        .insert(fieldvals([("user_id", 1), ("group_id", 3)]), false)
        .await
        .unwrap());
    assert_eq!(page().await.unwrap(), ids(&[3, 2, 1]));
}

/// Test 7: A failed store write invalidates nothing
#[tokio::test]
async fn test_failed_store_write_keeps_cache() {
    let (service, backend, store) = service();
    let users = service.record_dao("user").expect("Failed to create dao");
    let memberships = service.link_dao("user_group").expect("Failed to create dao");

    let alpha = users.insert(user("alpha", 1)).await.unwrap();
    assert!(memberships
        .insert(fieldvals([("user_id", 1), ("group_id", 1)]), false)
        .await
        .unwrap());
    users.by_pk(1).await.unwrap();
    memberships.by_field("user_id", 1, None, None, None).await.unwrap();
    let cached = backend.keys();

    store.fail_writes(true);
    let err = users
        .update(&alpha, fieldvals([("name", "beta")]))
        .await
        .expect_err("Update should fail");
    assert!(err.is_store());
    assert!(users.delete(&alpha).await.is_err());
    assert!(!memberships
        .delete(fieldvals([("user_id", 1)]))
        .await
        .expect("Link store failures are soft"));
    store.fail_writes(false);

    assert_eq!(backend.keys(), cached);
    assert_eq!(users.by_pk(1).await.unwrap(), Some(alpha));
}

/// Test 8: Cache read failures degrade to the store
#[tokio::test]
async fn test_cache_read_failure_reads_store() {
    common::init_logging();
    let backend = FailingBackend::new();
    let store = MemoryStore::new();
    let service = DataService::new(backend.clone(), store.clone(), registry());
    let users = service.record_dao("user").expect("Failed to create dao");
    users.insert(user("alpha", 1)).await.unwrap();

    backend.fail_reads(true);
    for _ in 0..2 {
        let row = users.by_pk(1).await.expect("Read should fall back to store");
        assert_eq!(row.unwrap()["name"], Value::from("alpha"));
    }
    let rows = users
        .by_pks([("a", Value::from(1))].into_iter().collect())
        .await
        .expect("Batch read should fall back to store");
    assert_eq!(rows.len(), 1);
    assert_eq!(store.calls("record"), 2);
    assert_eq!(store.calls("records"), 1);

    backend.fail_reads(false);
    store.reset_calls();
    users.by_pk(1).await.unwrap();
    assert_eq!(store.calls("record"), 0, "Populate still went through");
}

/// Test 9: Invalidation failures do not fail the write
#[tokio::test]
async fn test_invalidation_failure_keeps_write() {
    common::init_logging();
    let backend = FailingBackend::new();
    let store = MemoryStore::new();
    let service = DataService::new(backend.clone(), store.clone(), registry());
    let users = service.record_dao("user").expect("Failed to create dao");
    let memberships = service.link_dao("user_group").expect("Failed to create dao");

    backend.fail_writes(true);
    let alpha = users
        .insert(user("alpha", 1))
        .await
        .expect("Write should succeed without the cache");
    assert!(memberships
        .insert(fieldvals([("user_id", 1), ("group_id", 1)]), false)
        .await
        .unwrap());
    assert_eq!(
        users.by_pk(1).await.unwrap(),
        Some(alpha),
        "Reads work without populating"
    );
    assert!(backend.inner.keys().is_empty());
    assert_eq!(store.rows("user").await.len(), 1);
    assert_eq!(store.rows("user_group").await.len(), 1);
}

/// Test 10: Numerically equal values share their meta-cache entries
#[tokio::test]
async fn test_equal_decimals_invalidate_each_other() {
    let mut registry = EntityRegistry::new();
    registry
        .register(
            EntityDefinition::record(
                "item",
                "id",
                [("id", FieldType::Integer), ("price", FieldType::Decimal)],
            )
            .with_auto_increment(),
        )
        .unwrap();
    let service = DataService::new(InMemoryBackend::new(), MemoryStore::new(), registry);
    let items = service.record_dao("item").expect("Failed to create dao");

    let by_price = |price: Value| {
        items.by_fields("by_price", fieldvals([("price", price)]), None, None, None)
    };
    assert!(by_price(Value::from("5.00")).await.unwrap().is_empty());

    items
        .insert(fieldvals([("price", 5)]))
        .await
        .expect("Failed to insert");

    assert_eq!(by_price(Value::from("5.00")).await.unwrap(), ids(&[1]));
    assert_eq!(by_price(Value::Integer(5)).await.unwrap(), ids(&[1]));
}
