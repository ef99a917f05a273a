//! Shared entry point for applications.
//!
//! Holds the engine, the named cache pools, the store driver and the entity
//! registry behind `Arc` and hands out DAOs by entity name.

use crate::backend::CacheBackend;
use crate::dao::{LinkDao, RecordDao};
use crate::engine::CacheEngine;
use crate::entity::{EntityDefinition, EntityRegistry, DEFAULT_POOL};
use crate::error::{Error, Result};
use crate::observability::CacheMetrics;
use crate::store::{LinkDriver, RecordDriver};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Cached data access for every entity of a registry.
///
/// Clones share the engine, the store and the registry, so one service can
/// be handed to every request handler.
///
/// The meta-cache TTL of the engine is raised to the longest entity TTL of
/// the registry, so meta entries outlive the keys they index.
///
/// Each entity is cached in the pools its definition names:
/// `cache_pool_read` serves cached reads, `cache_pool_write` takes
/// population, meta lookups and invalidation. The `default` pool is the
/// engine's own backends unless replaced with [`DataService::with_cache_pool`].
/// Entities whose results depend on each other must share a write pool.
///
/// # Example
///
/// ```
/// use entity_cache::backend::InMemoryBackend;
/// use entity_cache::entity::EntityRegistry;
/// use entity_cache::store::MemoryStore;
/// use entity_cache::value::{fieldvals, Value};
/// use entity_cache::DataService;
///
/// # async fn example() -> entity_cache::Result<()> {
/// let registry = EntityRegistry::from_json(r#"[
///     {"name": "user", "table": "user", "primary_key": "id", "auto_increment": true,
///      "fields": {"id": "integer", "name": "string"}, "ttl_secs": 600}
/// ]"#)?;
/// let service = DataService::new(InMemoryBackend::new(), MemoryStore::new(), registry);
///
/// let users = service.record_dao("user")?;
/// let user = users.insert(fieldvals([("name", "alpha")])).await?;
/// assert_eq!(users.by_pk(user["id"].clone()).await?, Some(user));
/// # Ok(())
/// # }
/// ```
pub struct DataService<B: CacheBackend, S> {
    engine: Arc<CacheEngine<B>>,
    pools: Arc<BTreeMap<String, B>>,
    store: Arc<S>,
    registry: Arc<EntityRegistry>,
}

impl<B: CacheBackend, S> Clone for DataService<B, S> {
    fn clone(&self) -> Self {
        DataService {
            engine: Arc::clone(&self.engine),
            pools: Arc::clone(&self.pools),
            store: Arc::clone(&self.store),
            registry: Arc::clone(&self.registry),
        }
    }
}

impl<B: CacheBackend, S> DataService<B, S> {
    /// Create a service reading and writing through one cache backend.
    pub fn new(backend: B, store: S, registry: EntityRegistry) -> Self {
        Self::with_engine(CacheEngine::new(backend), store, registry)
    }

    /// Create a service with custom metrics.
    pub fn with_metrics(backend: B, store: S, registry: EntityRegistry, metrics: Box<dyn CacheMetrics>) -> Self {
        Self::with_engine(CacheEngine::new(backend).with_metrics(metrics), store, registry)
    }

    /// Create a service around a configured engine.
    pub fn with_engine(engine: CacheEngine<B>, store: S, registry: EntityRegistry) -> Self {
        let engine = match registry.longest_ttl() {
            Some(longest) => {
                let meta_ttl = engine.meta_ttl().map_or(longest, |ttl| ttl.max(longest));
                engine.with_meta_ttl(meta_ttl)
            }
            None => engine,
        };
        info!(
            "Data service ready for {} entities: {}",
            registry.len(),
            registry.names().collect::<Vec<_>>().join(", ")
        );
        DataService {
            engine: Arc::new(engine),
            pools: Arc::new(BTreeMap::new()),
            store: Arc::new(store),
            registry: Arc::new(registry),
        }
    }

    /// Register cache backend `backend` under pool name `name`.
    pub fn with_cache_pool(mut self, name: &str, backend: B) -> Self {
        info!("Cache pool \"{}\" registered", name);
        Arc::make_mut(&mut self.pools).insert(name.to_string(), backend);
        self
    }

    pub fn engine(&self) -> &CacheEngine<B> {
        &self.engine
    }

    /// Engine over the cache pools of `definition`.
    ///
    /// # Errors
    ///
    /// Returns `Error::ConfigError` if a pool name is not registered.
    pub fn engine_for(&self, definition: &EntityDefinition) -> Result<Arc<CacheEngine<B>>> {
        let (read, write) = (&definition.cache_pool_read, &definition.cache_pool_write);
        if read == DEFAULT_POOL && write == DEFAULT_POOL && !self.pools.contains_key(DEFAULT_POOL) {
            return Ok(Arc::clone(&self.engine));
        }
        let read = self.pool(read, self.engine.read_backend())?;
        let write = self.pool(write, self.engine.write_backend())?;
        Ok(Arc::new(self.engine.repooled(read, write)))
    }

    fn pool(&self, name: &str, default: &B) -> Result<B> {
        match self.pools.get(name) {
            Some(backend) => Ok(backend.clone()),
            None if name == DEFAULT_POOL => Ok(default.clone()),
            None => Err(Error::ConfigError(format!("unknown cache pool \"{}\"", name))),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn registry(&self) -> &EntityRegistry {
        &self.registry
    }
}

impl<B: CacheBackend, S: RecordDriver> DataService<B, S> {
    /// DAO of record entity `entity`.
    ///
    /// # Errors
    ///
    /// Returns `Error::ConfigError` if the entity is unknown or a link, or
    /// names a cache pool that is not registered.
    pub fn record_dao(&self, entity: &str) -> Result<RecordDao<B, S>> {
        let engine = self.engine_for(&*self.registry.get(entity)?)?;
        RecordDao::new(
            engine,
            Arc::clone(&self.store),
            Arc::clone(&self.registry),
            entity,
        )
    }
}

impl<B: CacheBackend, S: LinkDriver> DataService<B, S> {
    /// DAO of link entity `entity`.
    ///
    /// # Errors
    ///
    /// Returns `Error::ConfigError` if the entity is unknown or has a
    /// primary key, or names a cache pool that is not registered.
    pub fn link_dao(&self, entity: &str) -> Result<LinkDao<B, S>> {
        let engine = self.engine_for(&*self.registry.get(entity)?)?;
        LinkDao::new(
            engine,
            Arc::clone(&self.store),
            Arc::clone(&self.registry),
            entity,
        )
    }
}
