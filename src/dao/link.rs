//! DAO for two-column linking entities.
//!
//! Reads select the values of one link field for a predicate on the other,
//! optionally ordered by fields of the entity the selected field references.
//! Writes return `Ok(false)` when the store rejects them, so callers can
//! treat e.g. a duplicate link as a soft failure.

use super::{bind_keyed, invalidate_logged, zip_keyed, QUERY_COUNT};
use crate::backend::CacheBackend;
use crate::engine::{CacheEngine, OperationConfig};
use crate::entity::{EntityDefinition, EntityRegistry};
use crate::error::{Error, Result};
use crate::key::CacheKeyBuilder;
use crate::meta::{self, MetaFields, MetaRegistration};
use crate::store::LinkDriver;
use crate::value::{FieldVals, OrderBy, Row, SortDirection, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

/// How an ordered link query joins the entity its selected field references.
struct ForeignOrder {
    foreign: Arc<EntityDefinition>,
    foreign_pk: String,
    order_by: OrderBy,
}

/// Cached access to one link entity.
///
/// # Example
///
/// ```
/// use entity_cache::backend::InMemoryBackend;
/// use entity_cache::dao::LinkDao;
/// use entity_cache::entity::{EntityDefinition, EntityRegistry};
/// use entity_cache::store::MemoryStore;
/// use entity_cache::value::{fieldvals, FieldType, Value};
/// use entity_cache::CacheEngine;
/// use std::sync::Arc;
///
/// # async fn example() -> entity_cache::Result<()> {
/// let mut registry = EntityRegistry::new();
/// registry.register(EntityDefinition::link(
///     "user_group",
///     [("user_id", FieldType::Integer), ("group_id", FieldType::Integer)],
/// ))?;
///
/// let memberships = LinkDao::new(
///     Arc::new(CacheEngine::new(InMemoryBackend::new())),
///     Arc::new(MemoryStore::new()),
///     Arc::new(registry),
///     "user_group",
/// )?;
///
/// assert!(memberships.insert(fieldvals([("user_id", 1), ("group_id", 7)]), false).await?);
/// let groups = memberships.by_field("user_id", 1, None, None, None).await?;
/// assert_eq!(groups, vec![Value::Integer(7)]);
/// # Ok(())
/// # }
/// ```
pub struct LinkDao<B: CacheBackend, S: LinkDriver> {
    engine: Arc<CacheEngine<B>>,
    store: Arc<S>,
    registry: Arc<EntityRegistry>,
    definition: Arc<EntityDefinition>,
    config: OperationConfig,
}

impl<B: CacheBackend, S: LinkDriver> Clone for LinkDao<B, S> {
    fn clone(&self) -> Self {
        LinkDao {
            engine: Arc::clone(&self.engine),
            store: Arc::clone(&self.store),
            registry: Arc::clone(&self.registry),
            definition: Arc::clone(&self.definition),
            config: self.config.clone(),
        }
    }
}

impl<B: CacheBackend, S: LinkDriver> LinkDao<B, S> {
    /// Create the DAO of link entity `entity`.
    ///
    /// # Errors
    ///
    /// Returns `Error::ConfigError` if the entity is unknown or has a
    /// primary key.
    pub fn new(
        engine: Arc<CacheEngine<B>>,
        store: Arc<S>,
        registry: Arc<EntityRegistry>,
        entity: &str,
    ) -> Result<Self> {
        let definition = registry.get(entity)?;
        definition.link_fields()?;
        let config = definition.operation_config();
        Ok(LinkDao {
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

    /// Plan the join of an ordered or paginated query; `None` for a plain one.
    ///
    /// Without `order_by` a page is ordered by the referenced primary key.
    fn foreign_order(
        &self,
        select_field: &str,
        order_by: Option<&OrderBy>,
        offset: Option<u64>,
        limit: Option<u64>,
    ) -> Result<Option<ForeignOrder>> {
        if order_by.is_none() && offset.is_none() && limit.is_none() {
            return Ok(None);
        }
        let def = &*self.definition;
        let foreign_name = def.foreign_entity(select_field).ok_or_else(|| {
            Error::ConfigError(format!(
                "{}.{} references no entity, cannot order or paginate by it",
                def.name, select_field
            ))
        })?;
        let foreign = self.registry.get(foreign_name)?;
        let foreign_pk = foreign.pk()?.to_string();

        let order_by = match order_by {
            Some(order_by) if !order_by.is_empty() => order_by.clone(),
            _ => vec![(foreign_pk.clone(), SortDirection::Asc)],
        };
        for (field, _) in &order_by {
            foreign.field_type(field)?;
        }

        Ok(Some(ForeignOrder {
            foreign,
            foreign_pk,
            order_by,
        }))
    }

    /// Meta registrations of a selected value list.
    ///
    /// A plain result also registers under every value it returned, so a
    /// write naming only the selected field still reaches it. An ordered
    /// result depends on the whole selected field and on the ordering
    /// fields of the referenced entity.
    fn selection_registrations(
        &self,
        select_field: &str,
        fieldvals: &FieldVals,
        selected: &[Value],
        order: Option<&ForeignOrder>,
    ) -> Vec<MetaRegistration> {
        let local = MetaRegistration::for_query(&self.definition.name, fieldvals);
        match order {
            None => vec![local.values(select_field, selected.iter().cloned())],
            Some(order) => {
                let foreign = order
                    .order_by
                    .iter()
                    .fold(MetaRegistration::new(&order.foreign.name), |r, (field, _)| {
                        r.field_wide(field.as_str())
                    })
                    .field_wide(order.foreign_pk.as_str());
                vec![local.field_wide(select_field), foreign]
            }
        }
    }

    /// A count filtered on one link field moves whenever a link of any value
    /// of the other field changes.
    fn count_registration(&self, fieldvals: &FieldVals) -> Result<MetaRegistration> {
        let mut registration = MetaRegistration::for_query(&self.definition.name, fieldvals);
        if !fieldvals.is_empty() {
            let (a, b) = self.definition.link_fields()?;
            for field in [a, b] {
                if !fieldvals.contains_key(field) {
                    registration = registration.field_wide(field);
                }
            }
        }
        Ok(registration)
    }

    /// Values of `select_field` of the links matching `fieldvals`.
    ///
    /// Plain queries return ascending values. With `order_by` (fields of the
    /// entity `select_field` references), `offset` or `limit` the store joins
    /// that entity and pages the result.
    ///
    /// # Errors
    ///
    /// `Error::ConfigError` if `select_field` is not a link field, or if an
    /// ordered query names an unknown field or `select_field` references no
    /// entity. `Error::Store` if the store fails.
    pub async fn by_fields(
        &self,
        query_id: &str,
        select_field: &str,
        fieldvals: FieldVals,
        order_by: Option<&OrderBy>,
        offset: Option<u64>,
        limit: Option<u64>,
    ) -> Result<Vec<Value>> {
        let def = &*self.definition;
        def.other_field(select_field)?;
        let fieldvals = def.bind_fieldvals(fieldvals)?;
        let order = self.foreign_order(select_field, order_by, offset, limit)?;

        let unordered = OrderBy::new();
        let order_ref = order.as_ref();
        let cache_key = CacheKeyBuilder::build_limit(
            &def.name,
            query_id,
            select_field,
            order_ref.map_or(&unordered, |o| &o.order_by),
            offset,
            limit,
            &fieldvals,
        );

        let store = &self.store;
        let fieldvals = &fieldvals;
        self.engine
            .fetch_single(
                &cache_key,
                &self.config,
                || async move {
                    match order_ref {
                        Some(o) => {
                            store
                                .by_fields_limit(def, &o.foreign, select_field, fieldvals, &o.order_by, offset, limit)
                                .await
                        }
                        None => store.by_fields(def, select_field, fieldvals).await,
                    }
                },
                |_, selected: &Vec<Value>| {
                    self.selection_registrations(select_field, fieldvals, selected, order_ref)
                },
            )
            .await
    }

    /// Values of the other link field for `field = value`.
    ///
    /// # Errors
    ///
    /// See [`LinkDao::by_fields`].
    pub async fn by_field(
        &self,
        field: &str,
        value: impl Into<Value>,
        order_by: Option<&OrderBy>,
        offset: Option<u64>,
        limit: Option<u64>,
    ) -> Result<Vec<Value>> {
        let select_field = self.definition.other_field(field)?.to_string();
        let mut fieldvals = FieldVals::new();
        fieldvals.insert(field.to_string(), value.into());
        self.by_fields(
            &format!("by_{}", field),
            &select_field,
            fieldvals,
            order_by,
            offset,
            limit,
        )
        .await
    }

    /// Batched [`LinkDao::by_fields`], keyed like `keyed_fieldvals`.
    ///
    /// # Errors
    ///
    /// See [`LinkDao::by_fields`].
    pub async fn by_fields_multi<K: Ord + Clone>(
        &self,
        query_id: &str,
        select_field: &str,
        keyed_fieldvals: BTreeMap<K, FieldVals>,
        order_by: Option<&OrderBy>,
        offset: Option<u64>,
        limit: Option<u64>,
    ) -> Result<BTreeMap<K, Vec<Value>>> {
        let def = &*self.definition;
        def.other_field(select_field)?;
        let keyed_fieldvals = bind_keyed(def, keyed_fieldvals)?;
        let order = self.foreign_order(select_field, order_by, offset, limit)?;

        let unordered = OrderBy::new();
        let order_ref = order.as_ref();
        let order_by = order_ref.map_or(&unordered, |o| &o.order_by);
        let store = &self.store;

        self.engine
            .fetch_multi(
                keyed_fieldvals,
                &self.config,
                |fieldvals| {
                    CacheKeyBuilder::build_limit(&def.name, query_id, select_field, order_by, offset, limit, fieldvals)
                },
                |misses| async move {
                    let predicates: Vec<FieldVals> = misses.values().cloned().collect();
                    let results = match order_ref {
                        Some(o) => {
                            store
                                .by_fields_limit_multi(
                                    def,
                                    &o.foreign,
                                    select_field,
                                    &predicates,
                                    &o.order_by,
                                    offset,
                                    limit,
                                )
                                .await?
                        }
                        None => store.by_fields_multi(def, select_field, &predicates).await?,
                    };
                    zip_keyed(misses, results)
                },
                |_, fieldvals, selected: &Vec<Value>| {
                    self.selection_registrations(select_field, fieldvals, selected, order_ref)
                },
            )
            .await
    }

    /// Batched [`LinkDao::by_field`], keyed like `values`.
    ///
    /// # Errors
    ///
    /// See [`LinkDao::by_fields`].
    pub async fn by_field_multi<K: Ord + Clone>(
        &self,
        field: &str,
        values: BTreeMap<K, Value>,
        order_by: Option<&OrderBy>,
        offset: Option<u64>,
        limit: Option<u64>,
    ) -> Result<BTreeMap<K, Vec<Value>>> {
        let select_field = self.definition.other_field(field)?.to_string();
        let keyed_fieldvals = values
            .into_iter()
            .map(|(k, value)| {
                let mut fieldvals = FieldVals::new();
                fieldvals.insert(field.to_string(), value);
                (k, fieldvals)
            })
            .collect();
        self.by_fields_multi(
            &format!("by_{}", field),
            &select_field,
            keyed_fieldvals,
            order_by,
            offset,
            limit,
        )
        .await
    }

    /// Number of links matching `fieldvals`; an empty predicate counts all.
    ///
    /// # Errors
    ///
    /// `Error::ConfigError` for unknown fields, `Error::Store` if the store
    /// fails.
    pub async fn count(&self, fieldvals: FieldVals) -> Result<u64> {
        let def = &*self.definition;
        let fieldvals = def.bind_fieldvals(fieldvals)?;
        let registration = self.count_registration(&fieldvals)?;
        let cache_key = CacheKeyBuilder::build(&def.name, QUERY_COUNT, &fieldvals);

        self.engine
            .fetch_single(
                &cache_key,
                &self.config,
                || self.store.count(def, &fieldvals),
                |_, _| vec![registration],
            )
            .await
    }

    /// Batched [`LinkDao::count`], keyed like `keyed_fieldvals`.
    ///
    /// # Errors
    ///
    /// See [`LinkDao::count`].
    pub async fn count_multi<K: Ord + Clone>(
        &self,
        keyed_fieldvals: BTreeMap<K, FieldVals>,
    ) -> Result<BTreeMap<K, u64>> {
        let def = &*self.definition;
        let keyed_fieldvals = bind_keyed(def, keyed_fieldvals)?;
        let registrations = keyed_fieldvals
            .values()
            .map(|fieldvals| {
                let registration = self.count_registration(fieldvals)?;
                Ok((CacheKeyBuilder::build(&def.name, QUERY_COUNT, fieldvals), registration))
            })
            .collect::<Result<BTreeMap<String, MetaRegistration>>>()?;
        let store = &self.store;

        self.engine
            .fetch_multi(
                keyed_fieldvals,
                &self.config,
                |fieldvals| CacheKeyBuilder::build(&def.name, QUERY_COUNT, fieldvals),
                |misses| async move {
                    let predicates: Vec<FieldVals> = misses.values().cloned().collect();
                    let counts = store.count_multi(def, &predicates).await?;
                    zip_keyed(misses, counts)
                },
                |cache_key, _, _| registrations.get(cache_key).cloned().into_iter().collect(),
            )
            .await
    }

    /// Bind a link row to write; both link fields must be set.
    fn link_row(&self, info: FieldVals) -> Result<Row> {
        let def = &*self.definition;
        let row = def.bind_fieldvals(info)?;
        let (a, b) = def.link_fields()?;
        for field in [a, b] {
            if row.get(field).map_or(true, Value::is_null) {
                return Err(Error::ValidationError(format!(
                    "link {} needs a non-null \"{}\"",
                    def.name, field
                )));
            }
        }
        Ok(row)
    }

    fn non_empty(&self, what: &str, fieldvals: FieldVals) -> Result<FieldVals> {
        if fieldvals.is_empty() {
            return Err(Error::ValidationError(format!(
                "{} on link {} needs at least one field",
                what, self.definition.name
            )));
        }
        self.definition.bind_fieldvals(fieldvals)
    }

    /// Turn the outcome of a store write into the link write result.
    async fn finish(&self, op: &str, written: Result<()>, fields: MetaFields) -> Result<bool> {
        match written {
            Ok(()) => {
                invalidate_logged(&self.engine, &self.definition.name, &[fields]).await;
                Ok(true)
            }
            Err(e) if e.is_store() => {
                error!("Link {} on {} failed: {}", op, self.definition.name, e);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Insert one link, overwriting an identical one with `replace`.
    ///
    /// # Errors
    ///
    /// `Error::ValidationError` if a link field is missing,
    /// `Error::NotImplemented` if the store cannot replace. A store failure
    /// is `Ok(false)`.
    pub async fn insert(&self, info: FieldVals, replace: bool) -> Result<bool> {
        let def = &*self.definition;
        let row = self.link_row(info)?;
        let mut fields = MetaFields::new();
        meta::collect_row(&mut fields, &row);

        let written = self.store.insert(def, row, replace).await;
        self.finish("insert", written, fields).await
    }

    /// Insert several links atomically.
    ///
    /// # Errors
    ///
    /// See [`LinkDao::insert`].
    pub async fn insert_multi(&self, infos: Vec<FieldVals>, replace: bool) -> Result<bool> {
        if infos.is_empty() {
            return Ok(true);
        }
        let def = &*self.definition;
        let rows = infos
            .into_iter()
            .map(|info| self.link_row(info))
            .collect::<Result<Vec<Row>>>()?;
        let mut fields = MetaFields::new();
        for row in &rows {
            meta::collect_row(&mut fields, row);
        }

        let written = self.store.insert_multi(def, rows, replace).await;
        self.finish("insert_multi", written, fields).await
    }

    /// Write `new_info` to every link matching `where_`.
    ///
    /// Values named on either side are invalidated. An empty `new_info`
    /// writes nothing and returns `Ok(false)`.
    ///
    /// # Errors
    ///
    /// `Error::ValidationError` for an empty `where_`. A store failure is
    /// `Ok(false)`.
    pub async fn update(&self, new_info: FieldVals, where_: FieldVals) -> Result<bool> {
        let def = &*self.definition;
        let where_ = self.non_empty("update", where_)?;
        let new_info = def.bind_fieldvals(new_info)?;
        if new_info.is_empty() {
            return Ok(false);
        }
        let mut fields = MetaFields::new();
        meta::collect_row(&mut fields, &where_);
        meta::collect_row(&mut fields, &new_info);

        let written = self.store.update(def, &new_info, &where_).await;
        self.finish("update", written, fields).await
    }

    /// Delete every link matching `keys`.
    ///
    /// # Errors
    ///
    /// `Error::ValidationError` for empty `keys`. A store failure is
    /// `Ok(false)`.
    pub async fn delete(&self, keys: FieldVals) -> Result<bool> {
        let def = &*self.definition;
        let keys = self.non_empty("delete", keys)?;
        let mut fields = MetaFields::new();
        meta::collect_row(&mut fields, &keys);

        let written = self.store.delete(def, &keys).await;
        self.finish("delete", written, fields).await
    }

    /// Delete every link matching any of `keys_arr`.
    ///
    /// # Errors
    ///
    /// See [`LinkDao::delete`].
    pub async fn delete_multi(&self, keys_arr: Vec<FieldVals>) -> Result<bool> {
        if keys_arr.is_empty() {
            return Ok(true);
        }
        let def = &*self.definition;
        let keys_arr = keys_arr
            .into_iter()
            .map(|keys| self.non_empty("delete_multi", keys))
            .collect::<Result<Vec<FieldVals>>>()?;
        let mut fields = MetaFields::new();
        for keys in &keys_arr {
            meta::collect_row(&mut fields, keys);
        }

        let written = self.store.delete_multi(def, &keys_arr).await;
        self.finish("delete_multi", written, fields).await
    }
}
