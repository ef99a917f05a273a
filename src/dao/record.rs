//! DAO for entities with a single primary key.

use super::{bind_keyed, invalidate_logged, is_homogeneous, zip_keyed, QUERY_ALL, QUERY_COUNT, QUERY_RECORD};
use crate::backend::CacheBackend;
use crate::engine::{CacheEngine, OperationConfig};
use crate::entity::{EntityDefinition, EntityRegistry};
use crate::error::{Error, Result};
use crate::key::CacheKeyBuilder;
use crate::meta::{self, MetaFields, MetaRegistration};
use crate::store::RecordDriver;
use crate::value::{FieldVals, OrderBy, Row, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Cached access to one record entity.
///
/// # Example
///
/// ```
/// use entity_cache::backend::InMemoryBackend;
/// use entity_cache::dao::RecordDao;
/// use entity_cache::entity::{EntityDefinition, EntityRegistry};
/// use entity_cache::store::MemoryStore;
/// use entity_cache::value::{fieldvals, FieldType, Value};
/// use entity_cache::CacheEngine;
/// use std::sync::Arc;
///
/// # async fn example() -> entity_cache::Result<()> {
/// let mut registry = EntityRegistry::new();
/// registry.register(
///     EntityDefinition::record("user", "id", [("id", FieldType::Integer), ("name", FieldType::String)])
///         .with_auto_increment(),
/// )?;
///
/// let users = RecordDao::new(
///     Arc::new(CacheEngine::new(InMemoryBackend::new())),
///     Arc::new(MemoryStore::new()),
///     Arc::new(registry),
///     "user",
/// )?;
///
/// let alpha = users.insert(fieldvals([("name", "alpha")])).await?;
/// let found = users.by_fields("by_name", fieldvals([("name", "alpha")]), None, None, None).await?;
/// assert_eq!(found, vec![alpha["id"].clone()]);
/// # Ok(())
/// # }
/// ```
pub struct RecordDao<B: CacheBackend, S: RecordDriver> {
    engine: Arc<CacheEngine<B>>,
    store: Arc<S>,
    registry: Arc<EntityRegistry>,
    definition: Arc<EntityDefinition>,
    config: OperationConfig,
}

impl<B: CacheBackend, S: RecordDriver> Clone for RecordDao<B, S> {
    fn clone(&self) -> Self {
        RecordDao {
            engine: Arc::clone(&self.engine),
            store: Arc::clone(&self.store),
            registry: Arc::clone(&self.registry),
            definition: Arc::clone(&self.definition),
            config: self.config.clone(),
        }
    }
}

impl<B: CacheBackend, S: RecordDriver> RecordDao<B, S> {
    /// Create the DAO of record entity `entity`.
    ///
    /// # Errors
    ///
    /// Returns `Error::ConfigError` if the entity is unknown or is a link.
    pub fn new(
        engine: Arc<CacheEngine<B>>,
        store: Arc<S>,
        registry: Arc<EntityRegistry>,
        entity: &str,
    ) -> Result<Self> {
        let definition = registry.get(entity)?;
        definition.pk()?;
        let config = definition.operation_config();
        Ok(RecordDao {
            engine,
            store,
            registry,
            definition,
            config,
        })
    }

    pub fn definition(&self) -> &EntityDefinition {
        &self.definition
    }

    fn pk_field(&self) -> Result<&str> {
        self.definition.pk()
    }

    /// Row by primary key; `None` if it does not exist.
    ///
    /// Absence is cached too, until an insert creates the row.
    ///
    /// # Errors
    ///
    /// `Error::ValidationError` if `pk` does not bind, `Error::Store` if the
    /// store fails on a cache miss.
    pub async fn by_pk(&self, pk: impl Into<Value>) -> Result<Option<Row>> {
        let def = &*self.definition;
        let pk_field = self.pk_field()?;
        let pk = def.bind(pk_field, pk.into())?;
        let cache_key = CacheKeyBuilder::build_single(&def.name, QUERY_RECORD, &pk);

        let row: Option<Row> = self
            .engine
            .fetch_single(
                &cache_key,
                &self.config,
                || self.store.record(def, &pk),
                |_, _| vec![MetaRegistration::new(&def.name).value(pk_field, pk.clone())],
            )
            .await?;

        Ok(row.map(|row| def.decode_row(row)))
    }

    /// Rows of several primary keys, keyed like `pks`.
    ///
    /// Keys whose row does not exist are left out. One cache round trip and
    /// at most one store call.
    ///
    /// # Errors
    ///
    /// See [`RecordDao::by_pk`].
    pub async fn by_pks<K: Ord + Clone>(&self, pks: BTreeMap<K, Value>) -> Result<BTreeMap<K, Row>> {
        let def = &*self.definition;
        let pk_field = self.pk_field()?;
        let pks = pks
            .into_iter()
            .map(|(k, pk)| Ok((k, def.bind(pk_field, pk)?)))
            .collect::<Result<BTreeMap<K, Value>>>()?;

        let rows: BTreeMap<K, Option<Row>> = self
            .engine
            .fetch_multi(
                pks,
                &self.config,
                |pk| CacheKeyBuilder::build_single(&def.name, QUERY_RECORD, pk),
                |misses| async move {
                    let wanted: Vec<Value> = misses.values().cloned().collect();
                    let found: BTreeMap<String, Row> = self
                        .store
                        .records(def, &wanted)
                        .await?
                        .into_iter()
                        .filter_map(|row| {
                            let repr = row.get(pk_field)?.cache_repr();
                            Some((repr, row))
                        })
                        .collect();
                    Ok::<_, Error>(
                        misses
                            .into_iter()
                            .map(|(k, pk)| (k, found.get(&pk.cache_repr()).cloned()))
                            .collect(),
                    )
                },
                |_, pk, _| vec![MetaRegistration::new(&def.name).value(pk_field, pk.clone())],
            )
            .await?;

        Ok(rows
            .into_iter()
            .filter_map(|(k, row)| Some((k, def.decode_row(row?))))
            .collect())
    }

    /// Registrations an ordered query needs besides its predicate.
    ///
    /// Each `order_by` field is a field-wide dependency. A foreign-key field
    /// also depends on every row of the entity it references.
    ///
    /// # Errors
    ///
    /// `Error::ConfigError` for unknown fields or referenced entities.
    fn order_dependencies(&self, order_by: &OrderBy) -> Result<Vec<MetaRegistration>> {
        let def = &*self.definition;
        let mut local = MetaRegistration::new(&def.name);
        let mut registrations = Vec::new();
        for (field, _) in order_by {
            def.field_type(field)?;
            local = local.field_wide(field.as_str());
            if let Some(foreign_name) = def.foreign_entity(field) {
                let foreign = self.registry.get(foreign_name)?;
                registrations.push(MetaRegistration::new(foreign_name).field_wide(foreign.pk()?));
            }
        }
        registrations.push(local);
        Ok(registrations)
    }

    /// Primary keys of rows matching `fieldvals`.
    ///
    /// With `order_by`, `offset` or `limit` the ordering and pagination run
    /// in the store and the page is also invalidated by any change to an
    /// ordering field.
    ///
    /// # Errors
    ///
    /// `Error::ConfigError` for unknown fields or an ordering field whose
    /// referenced entity is unknown, `Error::Store` if the store fails.
    pub async fn by_fields(
        &self,
        query_id: &str,
        fieldvals: FieldVals,
        order_by: Option<&OrderBy>,
        offset: Option<u64>,
        limit: Option<u64>,
    ) -> Result<Vec<Value>> {
        let def = &*self.definition;
        let fieldvals = def.bind_fieldvals(fieldvals)?;

        if order_by.is_none() && offset.is_none() && limit.is_none() {
            let cache_key = CacheKeyBuilder::build(&def.name, query_id, &fieldvals);
            return self
                .engine
                .fetch_single(
                    &cache_key,
                    &self.config,
                    || self.store.by_fields(def, &fieldvals),
                    |_, _| vec![MetaRegistration::for_query(&def.name, &fieldvals)],
                )
                .await;
        }

        let order_by = order_by.cloned().unwrap_or_default();
        let mut registrations = self.order_dependencies(&order_by)?;
        let cache_key = CacheKeyBuilder::build_limit(
            &def.name,
            query_id,
            self.pk_field()?,
            &order_by,
            offset,
            limit,
            &fieldvals,
        );

        self.engine
            .fetch_single(
                &cache_key,
                &self.config,
                || {
                    self.store
                        .by_fields_offset(def, &fieldvals, &order_by, offset, limit)
                },
                |_, _| {
                    registrations.push(MetaRegistration::for_query(&def.name, &fieldvals));
                    registrations
                },
            )
            .await
    }

    /// Batched [`RecordDao::by_fields`], keyed like `keyed_fieldvals`.
    ///
    /// # Errors
    ///
    /// See [`RecordDao::by_fields`].
    pub async fn by_fields_multi<K: Ord + Clone>(
        &self,
        query_id: &str,
        keyed_fieldvals: BTreeMap<K, FieldVals>,
        order_by: Option<&OrderBy>,
        offset: Option<u64>,
        limit: Option<u64>,
    ) -> Result<BTreeMap<K, Vec<Value>>> {
        let def = &*self.definition;
        let keyed_fieldvals = bind_keyed(def, keyed_fieldvals)?;

        if order_by.is_none() && offset.is_none() && limit.is_none() {
            return self
                .engine
                .fetch_multi(
                    keyed_fieldvals,
                    &self.config,
                    |fieldvals| CacheKeyBuilder::build(&def.name, query_id, fieldvals),
                    |misses| async move {
                        let predicates: Vec<FieldVals> = misses.values().cloned().collect();
                        let results = self.store.by_fields_multi(def, &predicates).await?;
                        zip_keyed(misses, results)
                    },
                    |_, fieldvals, _| vec![MetaRegistration::for_query(&def.name, fieldvals)],
                )
                .await;
        }

        let order_by = order_by.cloned().unwrap_or_default();
        let dependencies = self.order_dependencies(&order_by)?;
        let pk_field = self.pk_field()?;
        let order_ref = &order_by;

        self.engine
            .fetch_multi(
                keyed_fieldvals,
                &self.config,
                |fieldvals| {
                    CacheKeyBuilder::build_limit(&def.name, query_id, pk_field, order_ref, offset, limit, fieldvals)
                },
                |misses| async move {
                    let predicates: Vec<FieldVals> = misses.values().cloned().collect();
                    let results = self
                        .store
                        .by_fields_offset_multi(def, &predicates, order_ref, offset, limit)
                        .await?;
                    zip_keyed(misses, results)
                },
                |_, fieldvals, _| {
                    let mut registrations = dependencies.clone();
                    registrations.push(MetaRegistration::for_query(&def.name, fieldvals));
                    registrations
                },
            )
            .await
    }

    /// Number of rows matching `fieldvals`; `None` counts every row.
    ///
    /// # Errors
    ///
    /// `Error::ConfigError` for unknown fields, `Error::Store` if the store
    /// fails.
    pub async fn count(&self, fieldvals: Option<FieldVals>) -> Result<u64> {
        let def = &*self.definition;
        let fieldvals = def.bind_fieldvals(fieldvals.unwrap_or_default())?;
        let cache_key = CacheKeyBuilder::build(&def.name, QUERY_COUNT, &fieldvals);

        self.engine
            .fetch_single(
                &cache_key,
                &self.config,
                || self.store.count(def, &fieldvals),
                |_, _| vec![MetaRegistration::for_query(&def.name, &fieldvals)],
            )
            .await
    }

    /// Batched [`RecordDao::count`], keyed like `keyed_fieldvals`.
    ///
    /// # Errors
    ///
    /// See [`RecordDao::count`].
    pub async fn count_multi<K: Ord + Clone>(
        &self,
        keyed_fieldvals: BTreeMap<K, FieldVals>,
    ) -> Result<BTreeMap<K, u64>> {
        let def = &*self.definition;
        let keyed_fieldvals = bind_keyed(def, keyed_fieldvals)?;

        self.engine
            .fetch_multi(
                keyed_fieldvals,
                &self.config,
                |fieldvals| CacheKeyBuilder::build(&def.name, QUERY_COUNT, fieldvals),
                |misses| async move {
                    let predicates: Vec<FieldVals> = misses.values().cloned().collect();
                    let counts = self.store.count_multi(def, &predicates).await?;
                    zip_keyed(misses, counts)
                },
                |_, fieldvals, _| vec![MetaRegistration::for_query(&def.name, fieldvals)],
            )
            .await
    }

    /// Every row, in primary-key order. Invalidated by any write to the
    /// entity.
    ///
    /// # Errors
    ///
    /// Returns `Error::Store` if the store fails on a cache miss.
    pub async fn all(&self) -> Result<Vec<Row>> {
        let def = &*self.definition;
        let cache_key = CacheKeyBuilder::build(&def.name, QUERY_ALL, &FieldVals::new());

        let rows: Vec<Row> = self
            .engine
            .fetch_single(
                &cache_key,
                &self.config,
                || self.store.all(def),
                |_, _| vec![MetaRegistration::new(&def.name).entity_wide()],
            )
            .await?;

        Ok(rows.into_iter().map(|row| def.decode_row(row)).collect())
    }

    /// Insert one row and return it as stored, generated key included.
    ///
    /// Every field of the stored row is invalidated, which also clears a
    /// cached absence of its primary key.
    ///
    /// # Errors
    ///
    /// `Error::ConfigError`/`Error::ValidationError` if `info` does not bind,
    /// `Error::Store` if the store rejects it. Nothing is invalidated then.
    pub async fn insert(&self, info: FieldVals) -> Result<Row> {
        let def = &*self.definition;
        let row = def.bind_fieldvals(def.with_blob_defaults(info))?;

        let stored = self.store.insert(def, row).await?;

        let mut fields = MetaFields::new();
        meta::collect_row(&mut fields, &stored);
        invalidate_logged(&self.engine, &def.name, &[fields]).await;

        Ok(def.decode_row(stored))
    }

    /// Insert several rows atomically, invalidating them in one pipeline.
    ///
    /// # Errors
    ///
    /// See [`RecordDao::insert`]. A rejected batch inserts nothing.
    pub async fn insert_multi(&self, infos: Vec<FieldVals>) -> Result<Vec<Row>> {
        if infos.is_empty() {
            return Ok(Vec::new());
        }
        let def = &*self.definition;
        let rows = infos
            .into_iter()
            .map(|info| def.bind_fieldvals(def.with_blob_defaults(info)))
            .collect::<Result<Vec<Row>>>()?;
        let homogeneous = is_homogeneous(&rows);

        let stored = self.store.insert_multi(def, rows, homogeneous).await?;

        let field_sets: Vec<MetaFields> = stored
            .iter()
            .map(|row| {
                let mut fields = MetaFields::new();
                meta::collect_row(&mut fields, row);
                fields
            })
            .collect();
        invalidate_logged(&self.engine, &def.name, &field_sets).await;

        Ok(stored.into_iter().map(|row| def.decode_row(row)).collect())
    }

    /// Write the fields of `info` that differ from `model`.
    ///
    /// Old and new values of every changed field are invalidated, plus the
    /// primary key. An empty or no-op `info` returns `model` untouched.
    ///
    /// # Errors
    ///
    /// `Error::ValidationError` if `model` has no primary key,
    /// `Error::Store` if the store fails. Nothing is invalidated then.
    pub async fn update(&self, model: &Row, info: FieldVals) -> Result<Row> {
        if info.is_empty() {
            return Ok(model.clone());
        }
        let def = &*self.definition;
        let pk_field = self.pk_field()?;
        let current = def.bind_fieldvals(model.clone())?;
        let changed: FieldVals = def
            .bind_fieldvals(info)?
            .into_iter()
            .filter(|(field, value)| current.get(field) != Some(value))
            .collect();
        if changed.is_empty() {
            return Ok(model.clone());
        }
        let pk = self.model_pk(&current)?;

        self.store.update(def, &pk, &changed).await?;

        let mut fields = MetaFields::new();
        meta::push_value(&mut fields, pk_field, pk);
        for (field, value) in &changed {
            if let Some(old) = current.get(field) {
                meta::push_value(&mut fields, field, old.clone());
            }
            meta::push_value(&mut fields, field, value.clone());
        }
        invalidate_logged(&self.engine, &def.name, &[fields]).await;

        let mut updated = current;
        updated.extend(changed);
        Ok(def.decode_row(updated))
    }

    /// Delete the row of `model` and invalidate every value it held.
    ///
    /// # Errors
    ///
    /// `Error::ValidationError` if `model` has no primary key,
    /// `Error::Store` if the store fails. Nothing is invalidated then.
    pub async fn delete(&self, model: &Row) -> Result<()> {
        let def = &*self.definition;
        let current = def.bind_fieldvals(model.clone())?;
        let pk = self.model_pk(&current)?;

        self.store.delete(def, &pk).await?;

        let mut fields = MetaFields::new();
        meta::collect_row(&mut fields, &current);
        invalidate_logged(&self.engine, &def.name, &[fields]).await;
        Ok(())
    }

    /// Delete several rows in one store call and one invalidation pipeline.
    ///
    /// # Errors
    ///
    /// See [`RecordDao::delete`].
    pub async fn delete_multi(&self, models: &[Row]) -> Result<()> {
        if models.is_empty() {
            return Ok(());
        }
        let def = &*self.definition;
        let current = models
            .iter()
            .map(|model| def.bind_fieldvals(model.clone()))
            .collect::<Result<Vec<Row>>>()?;
        let pks = current
            .iter()
            .map(|row| self.model_pk(row))
            .collect::<Result<Vec<Value>>>()?;

        self.store.delete_multi(def, &pks).await?;

        let field_sets: Vec<MetaFields> = current
            .iter()
            .map(|row| {
                let mut fields = MetaFields::new();
                meta::collect_row(&mut fields, row);
                fields
            })
            .collect();
        invalidate_logged(&self.engine, &def.name, &field_sets).await;
        Ok(())
    }

    fn model_pk(&self, row: &Row) -> Result<Value> {
        let pk_field = self.pk_field()?;
        row.get(pk_field)
            .filter(|pk| !pk.is_null())
            .cloned()
            .ok_or_else(|| {
                Error::ValidationError(format!(
                    "{} row has no primary key \"{}\"",
                    self.definition.name, pk_field
                ))
            })
    }
}
