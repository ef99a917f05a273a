//! In-process backing store implementing both driver traits.
//!
//! Useful for tests, benchmarks and embedders without a SQL layer. Tables
//! are created on first write. Every driver call is counted per operation,
//! together with its batch size, and reads or writes can be made to fail on
//! demand.

use super::{LinkDriver, RecordDriver};
use crate::entity::EntityDefinition;
use crate::error::{Error, Result};
use crate::value::{FieldVals, OrderBy, Row, SortDirection, Value};
use dashmap::DashMap;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use tokio::sync::Mutex;

/// SQLSTATE of a unique constraint violation.
const UNIQUE_VIOLATION: &str = "23505";
/// SQLSTATE of a NOT NULL violation.
const NOT_NULL_VIOLATION: &str = "23502";
/// SQLSTATE used for injected failures.
const INJECTED_FAILURE: &str = "HY000";
/// Driver operations served by an entity's write pool.
const WRITE_OPS: [&str; 5] = ["insert", "insert_multi", "update", "delete", "delete_multi"];

/// Row identity inside a table: the type-tagged text of its key fields.
type RowKey = Vec<String>;

#[derive(Clone, Default)]
struct Table {
    rows: BTreeMap<RowKey, Row>,
    last_id: i64,
}

/// In-memory store for record and link entities.
///
/// Clones share the same tables, counters and failure switches.
///
/// # Example
///
/// ```
/// use entity_cache::entity::EntityDefinition;
/// use entity_cache::store::{MemoryStore, RecordDriver};
/// use entity_cache::value::{fieldvals, FieldType, Value};
///
/// # async fn example() -> entity_cache::Result<()> {
/// let user = EntityDefinition::record("user", "id", [("id", FieldType::Integer)])
///     .with_auto_increment();
/// let store = MemoryStore::new();
///
/// let row = store.insert(&user, fieldvals::<_, &str, Value>([])).await?;
/// assert_eq!(row["id"], Value::Integer(1));
/// assert_eq!(store.calls("insert"), 1);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct MemoryStore {
    tables: Arc<Mutex<BTreeMap<String, Table>>>,
    calls: Arc<DashMap<&'static str, Vec<usize>>>,
    pool_calls: Arc<DashMap<String, usize>>,
    homogeneous_batches: Arc<AtomicUsize>,
    fail_reads: Arc<AtomicBool>,
    fail_writes: Arc<AtomicBool>,
    supports_replace: bool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore {
            tables: Arc::new(Mutex::new(BTreeMap::new())),
            calls: Arc::new(DashMap::new()),
            pool_calls: Arc::new(DashMap::new()),
            homogeneous_batches: Arc::new(AtomicUsize::new(0)),
            fail_reads: Arc::new(AtomicBool::new(false)),
            fail_writes: Arc::new(AtomicBool::new(false)),
            supports_replace: true,
        }
    }

    /// Store whose link inserts cannot use REPLACE semantics.
    pub fn without_replace(mut self) -> Self {
        self.supports_replace = false;
        self
    }

    /// Make every read fail with a store error until switched off.
    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, AtomicOrdering::SeqCst);
    }

    /// Make every write fail with a store error until switched off.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, AtomicOrdering::SeqCst);
    }

    /// Number of calls to driver operation `op` (e.g. `"records"`).
    pub fn calls(&self, op: &str) -> usize {
        self.calls.get(op).map_or(0, |batches| batches.len())
    }

    /// Batch size of every call to `op`, in call order.
    pub fn batches(&self, op: &str) -> Vec<usize> {
        self.calls
            .get(op)
            .map(|batches| batches.value().clone())
            .unwrap_or_default()
    }

    /// Number of driver calls of any kind.
    pub fn total_calls(&self) -> usize {
        self.calls.iter().map(|entry| entry.value().len()).sum()
    }

    /// Number of driver calls routed to source pool `pool`.
    ///
    /// Reads go to the entity's `source_pool_read`, writes to its
    /// `source_pool_write`.
    pub fn pool_calls(&self, pool: &str) -> usize {
        self.pool_calls.get(pool).map_or(0, |n| *n)
    }

    pub fn reset_calls(&self) {
        self.calls.clear();
        self.pool_calls.clear();
        self.homogeneous_batches.store(0, AtomicOrdering::SeqCst);
    }

    /// `insert_multi` calls that were flagged homogeneous.
    pub fn homogeneous_batches(&self) -> usize {
        self.homogeneous_batches.load(AtomicOrdering::SeqCst)
    }

    /// Load rows directly, bypassing counters and failure switches.
    ///
    /// # Errors
    ///
    /// Returns `Error::Store` on a duplicate or missing key.
    pub async fn seed(&self, entity: &EntityDefinition, rows: Vec<Row>) -> Result<()> {
        let mut tables = self.tables.lock().await;
        let table = tables.entry(entity.table.clone()).or_default();
        let mut staged = table.clone();
        for row in rows {
            insert_row(&mut staged, entity, row, false)?;
        }
        *table = staged;
        Ok(())
    }

    /// Current rows of `table`, in key order. Intended for assertions.
    pub async fn rows(&self, table: &str) -> Vec<Row> {
        let tables = self.tables.lock().await;
        tables
            .get(table)
            .map(|t| t.rows.values().cloned().collect())
            .unwrap_or_default()
    }

    fn record_call(&self, op: &'static str, entity: &EntityDefinition, batch: usize) {
        let pool = if WRITE_OPS.contains(&op.trim_start_matches("link_")) {
            &entity.source_pool_write
        } else {
            &entity.source_pool_read
        };
        *self.pool_calls.entry(pool.clone()).or_default() += 1;
        self.calls.entry(op).or_default().push(batch);
    }

    fn check_reads(&self) -> Result<()> {
        if self.fail_reads.load(AtomicOrdering::SeqCst) {
            return Err(Error::store_with_code(INJECTED_FAILURE, "injected read failure"));
        }
        Ok(())
    }

    fn check_writes(&self) -> Result<()> {
        if self.fail_writes.load(AtomicOrdering::SeqCst) {
            return Err(Error::store_with_code(INJECTED_FAILURE, "injected write failure"));
        }
        Ok(())
    }

    fn check_replace(&self, replace: bool) -> Result<()> {
        if replace && !self.supports_replace {
            return Err(Error::NotImplemented(
                "REPLACE is not supported by this store".to_string(),
            ));
        }
        Ok(())
    }

    async fn matching_rows(&self, entity: &EntityDefinition, fieldvals: &FieldVals) -> Vec<Row> {
        let tables = self.tables.lock().await;
        tables
            .get(&entity.table)
            .map(|t| {
                t.rows
                    .values()
                    .filter(|row| matches(row, fieldvals))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    async fn page_pks(
        &self,
        entity: &EntityDefinition,
        fieldvals: &FieldVals,
        order_by: &OrderBy,
        offset: Option<u64>,
        limit: Option<u64>,
    ) -> Result<Vec<Value>> {
        let pk = entity.pk()?;
        let mut rows = self.matching_rows(entity, fieldvals).await;
        rows.sort_by(|a, b| {
            compare_rows(a, b, order_by).then_with(|| field(a, pk).compare(field(b, pk)))
        });
        Ok(page(rows, offset, limit)
            .into_iter()
            .map(|row| field(&row, pk).clone())
            .collect())
    }

    async fn select(
        &self,
        entity: &EntityDefinition,
        select_field: &str,
        fieldvals: &FieldVals,
    ) -> Vec<Value> {
        let mut values: Vec<Value> = self
            .matching_rows(entity, fieldvals)
            .await
            .iter()
            .map(|row| field(row, select_field).clone())
            .collect();
        values.sort_by(Value::compare);
        values
    }

    #[allow(clippy::too_many_arguments)]
    async fn select_ordered(
        &self,
        entity: &EntityDefinition,
        foreign: &EntityDefinition,
        select_field: &str,
        fieldvals: &FieldVals,
        order_by: &OrderBy,
        offset: Option<u64>,
        limit: Option<u64>,
    ) -> Result<Vec<Value>> {
        foreign.pk()?;
        let links = self.matching_rows(entity, fieldvals).await;

        let tables = self.tables.lock().await;
        let foreign_rows = tables.get(&foreign.table).map(|t| &t.rows);
        let empty = Row::new();

        let mut joined: Vec<(Value, &Row)> = links
            .iter()
            .map(|link| {
                let value = field(link, select_field).clone();
                let foreign_row = foreign_rows
                    .and_then(|rows| rows.get(&vec![value.cache_repr()]))
                    .unwrap_or(&empty);
                (value, foreign_row)
            })
            .collect();
        joined.sort_by(|(va, ra), (vb, rb)| {
            compare_rows(ra, rb, order_by).then_with(|| va.compare(vb))
        });

        Ok(page(joined, offset, limit)
            .into_iter()
            .map(|(value, _)| value)
            .collect())
    }
}

fn field<'a>(row: &'a Row, name: &str) -> &'a Value {
    const NULL: &Value = &Value::Null;
    row.get(name).unwrap_or(NULL)
}

/// `IS NULL` semantics for NULL predicates, equality otherwise.
fn matches(row: &Row, fieldvals: &FieldVals) -> bool {
    fieldvals
        .iter()
        .all(|(name, value)| field(row, name) == value)
}

fn compare_rows(a: &Row, b: &Row, order_by: &OrderBy) -> Ordering {
    for (name, direction) in order_by {
        let ordering = field(a, name).compare(field(b, name));
        let ordering = match direction {
            SortDirection::Asc => ordering,
            SortDirection::Desc => ordering.reverse(),
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

fn page<T>(items: Vec<T>, offset: Option<u64>, limit: Option<u64>) -> Vec<T> {
    let offset = offset.map_or(0, |o| o as usize);
    let limit = limit.map_or(usize::MAX, |l| l as usize);
    items.into_iter().skip(offset).take(limit).collect()
}

fn row_key(entity: &EntityDefinition, row: &Row) -> Result<RowKey> {
    let names: Vec<&str> = match entity.primary_key.as_deref() {
        Some(pk) => vec![pk],
        None => {
            let (a, b) = entity.link_fields()?;
            vec![a, b]
        }
    };
    names
        .into_iter()
        .map(|name| match row.get(name) {
            Some(value) if !value.is_null() => Ok(value.cache_repr()),
            _ => Err(Error::store_with_code(
                NOT_NULL_VIOLATION,
                format!("{}.{} must not be null", entity.table, name),
            )),
        })
        .collect()
}

fn duplicate(entity: &EntityDefinition, key: &RowKey) -> Error {
    Error::store_with_code(
        UNIQUE_VIOLATION,
        format!("duplicate key ({}) in {}", key.join(", "), entity.table),
    )
}

fn insert_row(table: &mut Table, entity: &EntityDefinition, mut row: Row, replace: bool) -> Result<Row> {
    if let Some(pk) = entity.primary_key.as_deref() {
        match row.get(pk) {
            Some(Value::Integer(id)) => table.last_id = table.last_id.max(*id),
            Some(value) if !value.is_null() => {}
            _ if entity.auto_increment => {
                table.last_id += 1;
                row.insert(pk.to_string(), Value::Integer(table.last_id));
            }
            _ => {}
        }
    }

    let key = row_key(entity, &row)?;
    if !replace && table.rows.contains_key(&key) {
        return Err(duplicate(entity, &key));
    }
    table.rows.insert(key, row.clone());
    Ok(row)
}

fn apply(row: &Row, info: &FieldVals) -> Row {
    let mut updated = row.clone();
    for (name, value) in info {
        updated.insert(name.clone(), value.clone());
    }
    updated
}

/// Rewrite every row whose key is in `targets`, rejecting key collisions.
fn rewrite(table: &mut Table, entity: &EntityDefinition, targets: Vec<RowKey>, info: &FieldVals) -> Result<()> {
    let mut staged = table.rows.clone();
    let mut rewritten = Vec::with_capacity(targets.len());
    for key in &targets {
        if let Some(row) = staged.remove(key) {
            rewritten.push(apply(&row, info));
        }
    }
    for row in rewritten {
        let key = row_key(entity, &row)?;
        if staged.contains_key(&key) {
            return Err(duplicate(entity, &key));
        }
        staged.insert(key, row);
    }
    table.rows = staged;
    Ok(())
}

impl RecordDriver for MemoryStore {
    async fn record(&self, entity: &EntityDefinition, pk: &Value) -> Result<Option<Row>> {
        self.record_call("record", entity, 1);
        self.check_reads()?;
        let tables = self.tables.lock().await;
        Ok(tables
            .get(&entity.table)
            .and_then(|t| t.rows.get(&vec![pk.cache_repr()]))
            .cloned())
    }

    async fn records(&self, entity: &EntityDefinition, pks: &[Value]) -> Result<Vec<Row>> {
        self.record_call("records", entity, pks.len());
        self.check_reads()?;
        let tables = self.tables.lock().await;
        let Some(table) = tables.get(&entity.table) else {
            return Ok(Vec::new());
        };
        Ok(pks
            .iter()
            .filter_map(|pk| table.rows.get(&vec![pk.cache_repr()]))
            .cloned()
            .collect())
    }

    async fn count(&self, entity: &EntityDefinition, fieldvals: &FieldVals) -> Result<u64> {
        self.record_call("count", entity, 1);
        self.check_reads()?;
        Ok(self.matching_rows(entity, fieldvals).await.len() as u64)
    }

    async fn count_multi(&self, entity: &EntityDefinition, fieldvals_arr: &[FieldVals]) -> Result<Vec<u64>> {
        self.record_call("count_multi", entity, fieldvals_arr.len());
        self.check_reads()?;
        let mut counts = Vec::with_capacity(fieldvals_arr.len());
        for fieldvals in fieldvals_arr {
            counts.push(self.matching_rows(entity, fieldvals).await.len() as u64);
        }
        Ok(counts)
    }

    async fn by_fields(&self, entity: &EntityDefinition, fieldvals: &FieldVals) -> Result<Vec<Value>> {
        self.record_call("by_fields", entity, 1);
        self.check_reads()?;
        self.page_pks(entity, fieldvals, &OrderBy::new(), None, None)
            .await
    }

    async fn by_fields_multi(
        &self,
        entity: &EntityDefinition,
        fieldvals_arr: &[FieldVals],
    ) -> Result<Vec<Vec<Value>>> {
        self.record_call("by_fields_multi", entity, fieldvals_arr.len());
        self.check_reads()?;
        let mut results = Vec::with_capacity(fieldvals_arr.len());
        for fieldvals in fieldvals_arr {
            results.push(
                self.page_pks(entity, fieldvals, &OrderBy::new(), None, None)
                    .await?,
            );
        }
        Ok(results)
    }

    async fn by_fields_offset(
        &self,
        entity: &EntityDefinition,
        fieldvals: &FieldVals,
        order_by: &OrderBy,
        offset: Option<u64>,
        limit: Option<u64>,
    ) -> Result<Vec<Value>> {
        self.record_call("by_fields_offset", entity, 1);
        self.check_reads()?;
        self.page_pks(entity, fieldvals, order_by, offset, limit)
            .await
    }

    async fn by_fields_offset_multi(
        &self,
        entity: &EntityDefinition,
        fieldvals_arr: &[FieldVals],
        order_by: &OrderBy,
        offset: Option<u64>,
        limit: Option<u64>,
    ) -> Result<Vec<Vec<Value>>> {
        self.record_call("by_fields_offset_multi", entity, fieldvals_arr.len());
        self.check_reads()?;
        let mut results = Vec::with_capacity(fieldvals_arr.len());
        for fieldvals in fieldvals_arr {
            results.push(
                self.page_pks(entity, fieldvals, order_by, offset, limit)
                    .await?,
            );
        }
        Ok(results)
    }

    async fn all(&self, entity: &EntityDefinition) -> Result<Vec<Row>> {
        self.record_call("all", entity, 1);
        self.check_reads()?;
        let pk = entity.pk()?;
        let mut rows = self.matching_rows(entity, &FieldVals::new()).await;
        rows.sort_by(|a, b| field(a, pk).compare(field(b, pk)));
        Ok(rows)
    }

    async fn insert(&self, entity: &EntityDefinition, row: Row) -> Result<Row> {
        self.record_call("insert", entity, 1);
        self.check_writes()?;
        let mut tables = self.tables.lock().await;
        let table = tables.entry(entity.table.clone()).or_default();
        insert_row(table, entity, row, false)
    }

    async fn insert_multi(&self, entity: &EntityDefinition, rows: Vec<Row>, homogeneous: bool) -> Result<Vec<Row>> {
        self.record_call("insert_multi", entity, rows.len());
        if homogeneous {
            self.homogeneous_batches.fetch_add(1, AtomicOrdering::SeqCst);
        }
        self.check_writes()?;

        let mut tables = self.tables.lock().await;
        let table = tables.entry(entity.table.clone()).or_default();
        let mut staged = table.clone();
        let inserted = rows
            .into_iter()
            .map(|row| insert_row(&mut staged, entity, row, false))
            .collect::<Result<Vec<Row>>>()?;
        *table = staged;
        Ok(inserted)
    }

    async fn update(&self, entity: &EntityDefinition, pk: &Value, info: &FieldVals) -> Result<()> {
        self.record_call("update", entity, 1);
        self.check_writes()?;
        let mut tables = self.tables.lock().await;
        let table = tables.entry(entity.table.clone()).or_default();
        rewrite(table, entity, vec![vec![pk.cache_repr()]], info)
    }

    async fn delete(&self, entity: &EntityDefinition, pk: &Value) -> Result<()> {
        self.record_call("delete", entity, 1);
        self.check_writes()?;
        let mut tables = self.tables.lock().await;
        if let Some(table) = tables.get_mut(&entity.table) {
            table.rows.remove(&vec![pk.cache_repr()]);
        }
        Ok(())
    }

    async fn delete_multi(&self, entity: &EntityDefinition, pks: &[Value]) -> Result<()> {
        self.record_call("delete_multi", entity, pks.len());
        self.check_writes()?;
        let mut tables = self.tables.lock().await;
        if let Some(table) = tables.get_mut(&entity.table) {
            for pk in pks {
                table.rows.remove(&vec![pk.cache_repr()]);
            }
        }
        Ok(())
    }
}

impl LinkDriver for MemoryStore {
    async fn by_fields(
        &self,
        entity: &EntityDefinition,
        select_field: &str,
        fieldvals: &FieldVals,
    ) -> Result<Vec<Value>> {
        self.record_call("link_by_fields", entity, 1);
        self.check_reads()?;
        Ok(self.select(entity, select_field, fieldvals).await)
    }

    async fn by_fields_multi(
        &self,
        entity: &EntityDefinition,
        select_field: &str,
        fieldvals_arr: &[FieldVals],
    ) -> Result<Vec<Vec<Value>>> {
        self.record_call("link_by_fields_multi", entity, fieldvals_arr.len());
        self.check_reads()?;
        let mut results = Vec::with_capacity(fieldvals_arr.len());
        for fieldvals in fieldvals_arr {
            results.push(self.select(entity, select_field, fieldvals).await);
        }
        Ok(results)
    }

    async fn by_fields_limit(
        &self,
        entity: &EntityDefinition,
        foreign: &EntityDefinition,
        select_field: &str,
        fieldvals: &FieldVals,
        order_by: &OrderBy,
        offset: Option<u64>,
        limit: Option<u64>,
    ) -> Result<Vec<Value>> {
        self.record_call("link_by_fields_limit", entity, 1);
        self.check_reads()?;
        self.select_ordered(entity, foreign, select_field, fieldvals, order_by, offset, limit)
            .await
    }

    async fn by_fields_limit_multi(
        &self,
        entity: &EntityDefinition,
        foreign: &EntityDefinition,
        select_field: &str,
        fieldvals_arr: &[FieldVals],
        order_by: &OrderBy,
        offset: Option<u64>,
        limit: Option<u64>,
    ) -> Result<Vec<Vec<Value>>> {
        self.record_call("link_by_fields_limit_multi", entity, fieldvals_arr.len());
        self.check_reads()?;
        let mut results = Vec::with_capacity(fieldvals_arr.len());
        for fieldvals in fieldvals_arr {
            results.push(
                self.select_ordered(entity, foreign, select_field, fieldvals, order_by, offset, limit)
                    .await?,
            );
        }
        Ok(results)
    }

    async fn count(&self, entity: &EntityDefinition, fieldvals: &FieldVals) -> Result<u64> {
        self.record_call("link_count", entity, 1);
        self.check_reads()?;
        Ok(self.matching_rows(entity, fieldvals).await.len() as u64)
    }

    async fn count_multi(&self, entity: &EntityDefinition, fieldvals_arr: &[FieldVals]) -> Result<Vec<u64>> {
        self.record_call("link_count_multi", entity, fieldvals_arr.len());
        self.check_reads()?;
        let mut counts = Vec::with_capacity(fieldvals_arr.len());
        for fieldvals in fieldvals_arr {
            counts.push(self.matching_rows(entity, fieldvals).await.len() as u64);
        }
        Ok(counts)
    }

    async fn insert(&self, entity: &EntityDefinition, row: Row, replace: bool) -> Result<()> {
        self.record_call("link_insert", entity, 1);
        self.check_replace(replace)?;
        self.check_writes()?;
        let mut tables = self.tables.lock().await;
        let table = tables.entry(entity.table.clone()).or_default();
        insert_row(table, entity, row, replace).map(|_| ())
    }

    async fn insert_multi(&self, entity: &EntityDefinition, rows: Vec<Row>, replace: bool) -> Result<()> {
        self.record_call("link_insert_multi", entity, rows.len());
        self.check_replace(replace)?;
        self.check_writes()?;
        let mut tables = self.tables.lock().await;
        let table = tables.entry(entity.table.clone()).or_default();
        let mut staged = table.clone();
        for row in rows {
            insert_row(&mut staged, entity, row, replace)?;
        }
        *table = staged;
        Ok(())
    }

    async fn update(&self, entity: &EntityDefinition, new_info: &FieldVals, where_: &FieldVals) -> Result<()> {
        self.record_call("link_update", entity, 1);
        self.check_writes()?;
        let mut tables = self.tables.lock().await;
        let table = tables.entry(entity.table.clone()).or_default();
        let targets: Vec<RowKey> = table
            .rows
            .iter()
            .filter(|(_, row)| matches(row, where_))
            .map(|(key, _)| key.clone())
            .collect();
        rewrite(table, entity, targets, new_info)
    }

    async fn delete(&self, entity: &EntityDefinition, keys: &FieldVals) -> Result<()> {
        self.record_call("link_delete", entity, 1);
        self.check_writes()?;
        let mut tables = self.tables.lock().await;
        if let Some(table) = tables.get_mut(&entity.table) {
            table.rows.retain(|_, row| !matches(row, keys));
        }
        Ok(())
    }

    async fn delete_multi(&self, entity: &EntityDefinition, keys_arr: &[FieldVals]) -> Result<()> {
        self.record_call("link_delete_multi", entity, keys_arr.len());
        self.check_writes()?;
        let mut tables = self.tables.lock().await;
        if let Some(table) = tables.get_mut(&entity.table) {
            table
                .rows
                .retain(|_, row| !keys_arr.iter().any(|keys| matches(row, keys)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{fieldvals, FieldType};

    fn user() -> EntityDefinition {
        EntityDefinition::record(
            "user",
            "id",
            [
                ("id", FieldType::Integer),
                ("name", FieldType::String),
                ("age", FieldType::Integer),
            ],
        )
        .with_auto_increment()
    }

    fn group() -> EntityDefinition {
        EntityDefinition::record(
            "group",
            "id",
            [("id", FieldType::Integer), ("title", FieldType::String)],
        )
    }

    fn user_group() -> EntityDefinition {
        EntityDefinition::link(
            "user_group",
            [("user_id", FieldType::Integer), ("group_id", FieldType::Integer)],
        )
        .with_reference("group_id", "group")
    }

    async fn seeded() -> MemoryStore {
        let store = MemoryStore::new();
        store
            .seed(
                &user(),
                vec![
                    fieldvals([("name", Value::from("carol")), ("age", Value::from(30))]),
                    fieldvals([("name", Value::from("alice")), ("age", Value::from(30))]),
                    fieldvals([("name", Value::from("bob")), ("age", Value::from(25))]),
                ],
            )
            .await
            .expect("Failed to seed");
        store
    }

    #[tokio::test]
    async fn test_auto_increment_and_record() {
        let store = seeded().await;
        let row = RecordDriver::record(&store, &user(), &Value::Integer(2))
            .await
            .unwrap()
            .expect("row 2 exists");
        assert_eq!(row["name"], Value::from("alice"));
        assert!(RecordDriver::record(&store, &user(), &Value::Integer(9))
            .await
            .unwrap()
            .is_none());
        assert_eq!(store.calls("record"), 2);
    }

    #[tokio::test]
    async fn test_duplicate_pk_is_store_error() {
        let store = seeded().await;
        let err = RecordDriver::insert(&store, &user(), fieldvals([("id", 1)]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Store { code: Some(ref c), .. } if c == UNIQUE_VIOLATION));
    }

    #[tokio::test]
    async fn test_by_fields_offset_orders_and_pages() {
        let store = seeded().await;
        let order = vec![
            ("age".to_string(), SortDirection::Desc),
            ("name".to_string(), SortDirection::Asc),
        ];
        let pks = store
            .by_fields_offset(&user(), &FieldVals::new(), &order, Some(1), Some(2))
            .await
            .unwrap();
        // alice(30), carol(30), bob(25) -> skip alice
        assert_eq!(pks, vec![Value::Integer(1), Value::Integer(3)]);
    }

    #[tokio::test]
    async fn test_insert_multi_is_atomic() {
        let store = seeded().await;
        let rows = vec![
            fieldvals([("name", "dave")]),
            fieldvals([("id", Value::from(1)), ("name", Value::from("dup"))]),
        ];
        assert!(RecordDriver::insert_multi(&store, &user(), rows, false)
            .await
            .is_err());
        assert_eq!(store.rows("user").await.len(), 3);
    }

    #[tokio::test]
    async fn test_update_moves_primary_key() {
        let store = seeded().await;
        RecordDriver::update(&store, &user(), &Value::Integer(3), &fieldvals([("id", 10)]))
            .await
            .unwrap();
        assert!(RecordDriver::record(&store, &user(), &Value::Integer(10))
            .await
            .unwrap()
            .is_some());

        let collision =
            RecordDriver::update(&store, &user(), &Value::Integer(10), &fieldvals([("id", 1)])).await;
        assert!(collision.is_err());
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let store = seeded().await;
        store.fail_writes(true);
        assert!(RecordDriver::delete(&store, &user(), &Value::Integer(1))
            .await
            .unwrap_err()
            .is_store());
        assert_eq!(store.rows("user").await.len(), 3);

        store.fail_reads(true);
        assert!(RecordDriver::count(&store, &user(), &FieldVals::new())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_link_ordered_by_foreign_fields() {
        let store = MemoryStore::new();
        store
            .seed(
                &group(),
                vec![
                    fieldvals([("id", Value::from(1)), ("title", Value::from("zeta"))]),
                    fieldvals([("id", Value::from(2)), ("title", Value::from("alpha"))]),
                ],
            )
            .await
            .unwrap();
        store
            .seed(
                &user_group(),
                vec![
                    fieldvals([("user_id", 7), ("group_id", 1)]),
                    fieldvals([("user_id", 7), ("group_id", 2)]),
                ],
            )
            .await
            .unwrap();

        let order = vec![("title".to_string(), SortDirection::Asc)];
        let groups = store
            .by_fields_limit(
                &user_group(),
                &group(),
                "group_id",
                &fieldvals([("user_id", 7)]),
                &order,
                None,
                None,
            )
            .await
            .unwrap();
        assert_eq!(groups, vec![Value::Integer(2), Value::Integer(1)]);
    }

    #[tokio::test]
    async fn test_link_replace_capability() {
        let store = MemoryStore::new().without_replace();
        let err = LinkDriver::insert(
            &store,
            &user_group(),
            fieldvals([("user_id", 1), ("group_id", 1)]),
            true,
        )
        .await
        .unwrap_err();
        assert!(err.is_capability());
    }

    #[tokio::test]
    async fn test_link_update_and_delete() {
        let store = MemoryStore::new();
        let link = user_group();
        store
            .seed(
                &link,
                vec![
                    fieldvals([("user_id", 1), ("group_id", 1)]),
                    fieldvals([("user_id", 2), ("group_id", 1)]),
                ],
            )
            .await
            .unwrap();

        LinkDriver::update(&store, &link, &fieldvals([("group_id", 5)]), &fieldvals([("user_id", 1)]))
            .await
            .unwrap();
        assert_eq!(
            LinkDriver::by_fields(&store, &link, "user_id", &fieldvals([("group_id", 5)]))
                .await
                .unwrap(),
            vec![Value::Integer(1)]
        );

        LinkDriver::delete(&store, &link, &fieldvals([("group_id", 1)]))
            .await
            .unwrap();
        assert_eq!(store.rows("user_group").await.len(), 1);
    }
}
