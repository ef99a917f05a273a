//! Cache-coherency engine: read-through caching and meta-cache invalidation.

use crate::backend::{CacheBackend, Pipeline};
use crate::codec;
use crate::error::Result;
use crate::key::CacheKeyBuilder;
use crate::meta::{self, MetaFields, MetaRegistration};
use crate::observability::{CacheMetrics, NoOpMetrics, TtlPolicy};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Configuration for per-operation overrides.
///
/// # Setup-Time vs Per-Operation Configuration
///
/// - **Setup-time configuration**: set once on `CacheEngine` with
///   `with_metrics()`, `with_ttl_policy()` or `with_meta_ttl()`.
/// - **Per-operation configuration**: `OperationConfig` overrides the TTL of
///   one fetch. The DAOs build it from the entity definition's `ttl_secs`.
///
/// # Example
///
/// ```
/// use entity_cache::OperationConfig;
/// use std::time::Duration;
///
/// let config = OperationConfig::default().with_ttl(Duration::from_secs(300));
/// assert_eq!(config.ttl_override, Some(Duration::from_secs(300)));
/// ```
#[derive(Clone, Debug, Default)]
pub struct OperationConfig {
    /// Override the default TTL for this operation only.
    ///
    /// - **If `Some(duration)`**: use this override
    /// - **If `None`**: fall back to the engine's `ttl_policy`
    pub ttl_override: Option<Duration>,
}

impl OperationConfig {
    /// Override TTL for this operation.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl_override = Some(ttl);
        self
    }
}

/// Read-through cache over a read pool and a write pool.
///
/// Reads (`get`/`mget` of cached results) go to the read backend. Every
/// mutation and every meta-cache lookup goes to the write backend, so
/// invalidation never acts on a lagging replica.
///
/// Cache failures never fail a read: an unreachable backend or an
/// undecodable entry is treated as a miss, and a failed population is logged
/// and the computed value returned anyway.
///
/// # Example
///
/// ```
/// use entity_cache::{CacheEngine, OperationConfig, backend::InMemoryBackend};
///
/// # async fn example() -> entity_cache::Result<()> {
/// let engine = CacheEngine::new(InMemoryBackend::new());
/// let config = OperationConfig::default();
///
/// let total: u64 = engine
///     .fetch_single("user:count:all", &config, || async { Ok(42) }, |_, _| Vec::new())
///     .await?;
/// assert_eq!(total, 42);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct CacheEngine<B: CacheBackend> {
    read: B,
    write: B,
    metrics: Arc<dyn CacheMetrics>,
    ttl_policy: TtlPolicy,
    meta_ttl: Option<Duration>,
}

impl<B: CacheBackend> CacheEngine<B> {
    /// Create new engine reading and writing through one backend.
    pub fn new(backend: B) -> Self {
        Self::with_pools(backend.clone(), backend)
    }

    /// Create new engine with separate read and write pools.
    pub fn with_pools(read: B, write: B) -> Self {
        CacheEngine {
            read,
            write,
            metrics: Arc::new(NoOpMetrics),
            ttl_policy: TtlPolicy::default(),
            meta_ttl: None,
        }
    }

    /// Same metrics, TTL policy and meta TTL over other pools.
    pub fn repooled(&self, read: B, write: B) -> Self {
        CacheEngine {
            read,
            write,
            metrics: Arc::clone(&self.metrics),
            ttl_policy: self.ttl_policy.clone(),
            meta_ttl: self.meta_ttl,
        }
    }

    /// Set custom metrics handler.
    pub fn with_metrics(mut self, metrics: Box<dyn CacheMetrics>) -> Self {
        self.metrics = Arc::from(metrics);
        self
    }

    /// Set custom TTL policy.
    pub fn with_ttl_policy(mut self, policy: TtlPolicy) -> Self {
        self.ttl_policy = policy;
        self
    }

    /// Set the floor TTL of meta-cache entries.
    ///
    /// Use at least the longest TTL of any entity sharing this engine, e.g.
    /// [`crate::entity::EntityRegistry::longest_ttl`]. A meta entry is never
    /// given a shorter TTL than the key it is registering.
    pub fn with_meta_ttl(mut self, ttl: Duration) -> Self {
        self.meta_ttl = Some(ttl);
        self
    }

    /// Floor TTL of meta-cache entries, if set.
    pub fn meta_ttl(&self) -> Option<Duration> {
        self.meta_ttl
    }

    /// Backend serving cached reads.
    pub fn read_backend(&self) -> &B {
        &self.read
    }

    /// Backend receiving writes and meta-cache lookups.
    pub fn write_backend(&self) -> &B {
        &self.write
    }

    /// TTL for a key in `namespace` under `config`.
    pub fn resolve_ttl(&self, namespace: &str, config: &OperationConfig) -> Option<Duration> {
        config
            .ttl_override
            .or_else(|| self.ttl_policy.get_ttl(namespace))
    }

    /// TTL for a meta entry indexing a key that lives for `key_ttl`.
    fn meta_ttl_for(&self, key_ttl: Option<Duration>) -> Option<Duration> {
        match (self.meta_ttl, key_ttl) {
            (Some(meta), Some(key)) => Some(meta.max(key)),
            // either side never expires, so neither does the index
            _ => None,
        }
    }

    /// Read one cached value, computing and caching it on miss.
    ///
    /// On miss `compute` runs once; `on_populate` receives the cache key and
    /// the computed value and returns the meta-cache registrations, which are
    /// written in the same pipeline as the value.
    ///
    /// # Errors
    ///
    /// Only errors returned by `compute` are propagated.
    pub async fn fetch_single<T, C, Fut, P>(
        &self,
        cache_key: &str,
        config: &OperationConfig,
        compute: C,
        on_populate: P,
    ) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        C: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
        P: FnOnce(&str, &T) -> Vec<MetaRegistration>,
    {
        let timer = Instant::now();

        match self.read.get(cache_key).await {
            Ok(Some(bytes)) => match codec::decode::<T>(&bytes) {
                Ok(value) => {
                    self.metrics.record_hit(cache_key, timer.elapsed());
                    return Ok(value);
                }
                Err(e) => {
                    warn!("Discarding undecodable cache entry {}: {}", cache_key, e);
                    self.metrics.record_error(cache_key, &e.to_string());
                }
            },
            Ok(None) => {}
            Err(e) => {
                warn!("Cache read failed for {}, reading from store: {}", cache_key, e);
                self.metrics.record_error(cache_key, &e.to_string());
            }
        }
        self.metrics.record_miss(cache_key, timer.elapsed());

        let value = compute().await?;
        let registrations = on_populate(cache_key, &value);

        let ttl = self.resolve_ttl(CacheKeyBuilder::namespace(cache_key), config);
        let mut pipeline = self.write.pipeline_start();
        match codec::encode(&value) {
            Ok(bytes) => {
                self.queue_populate(&mut pipeline, cache_key, bytes, ttl, &registrations);
                self.submit_populate(pipeline, &[cache_key]).await;
            }
            Err(e) => {
                error!("Failed to encode value for {}: {}", cache_key, e);
                self.metrics.record_error(cache_key, &e.to_string());
            }
        }

        Ok(value)
    }

    /// Batched read-through.
    ///
    /// Builds one cache key per entry of `args`, reads them all in one
    /// multi-get and calls `compute` once with only the missed entries (not at
    /// all when everything hit). Results keep the caller's keys. Misses are
    /// written back in one pipeline together with their meta registrations.
    ///
    /// An entry `compute` returns nothing for is left out of the result and
    /// not cached.
    ///
    /// # Errors
    ///
    /// Only errors returned by `compute` are propagated.
    pub async fn fetch_multi<K, A, T, KB, C, Fut, P>(
        &self,
        args: BTreeMap<K, A>,
        config: &OperationConfig,
        key_builder: KB,
        compute: C,
        on_populate: P,
    ) -> Result<BTreeMap<K, T>>
    where
        K: Ord + Clone,
        A: Clone,
        T: Serialize + DeserializeOwned,
        KB: Fn(&A) -> String,
        C: FnOnce(BTreeMap<K, A>) -> Fut,
        Fut: Future<Output = Result<BTreeMap<K, T>>>,
        P: Fn(&str, &A, &T) -> Vec<MetaRegistration>,
    {
        let mut results = BTreeMap::new();
        if args.is_empty() {
            return Ok(results);
        }

        let timer = Instant::now();
        let cache_keys: Vec<String> = args.values().map(&key_builder).collect();
        let key_refs: Vec<&str> = cache_keys.iter().map(String::as_str).collect();

        let cached = match self.read.mget(&key_refs).await {
            Ok(cached) => cached,
            Err(e) => {
                warn!("Cache multi-get failed, reading {} entries from store: {}", key_refs.len(), e);
                self.metrics.record_error(key_refs[0], &e.to_string());
                vec![None; key_refs.len()]
            }
        };

        let mut misses = BTreeMap::new();
        let mut miss_keys = BTreeMap::new();
        for (((k, arg), cache_key), bytes) in args.into_iter().zip(cache_keys).zip(cached) {
            let decoded = bytes.and_then(|bytes| match codec::decode::<T>(&bytes) {
                Ok(value) => Some(value),
                Err(e) => {
                    warn!("Discarding undecodable cache entry {}: {}", cache_key, e);
                    self.metrics.record_error(&cache_key, &e.to_string());
                    None
                }
            });
            match decoded {
                Some(value) => {
                    self.metrics.record_hit(&cache_key, timer.elapsed());
                    results.insert(k, value);
                }
                None => {
                    self.metrics.record_miss(&cache_key, timer.elapsed());
                    misses.insert(k.clone(), arg);
                    miss_keys.insert(k, cache_key);
                }
            }
        }

        if misses.is_empty() {
            return Ok(results);
        }

        debug!("fetch_multi: {} hits, {} misses", results.len(), misses.len());
        let computed = compute(misses.clone()).await?;

        let mut pipeline = self.write.pipeline_start();
        let mut populated = Vec::with_capacity(computed.len());
        for (k, value) in computed {
            let (Some(arg), Some(cache_key)) = (misses.get(&k), miss_keys.get(&k)) else {
                // not something we asked for
                continue;
            };
            let ttl = self.resolve_ttl(CacheKeyBuilder::namespace(cache_key), config);
            match codec::encode(&value) {
                Ok(bytes) => {
                    let registrations = on_populate(cache_key, arg, &value);
                    self.queue_populate(&mut pipeline, cache_key, bytes, ttl, &registrations);
                    populated.push(cache_key.as_str());
                }
                Err(e) => {
                    error!("Failed to encode value for {}: {}", cache_key, e);
                    self.metrics.record_error(cache_key, &e.to_string());
                }
            }
            results.insert(k, value);
        }
        self.submit_populate(pipeline, &populated).await;

        Ok(results)
    }

    fn queue_populate(
        &self,
        pipeline: &mut Pipeline,
        cache_key: &str,
        bytes: Vec<u8>,
        ttl: Option<Duration>,
        registrations: &[MetaRegistration],
    ) {
        let meta_ttl = self.meta_ttl_for(ttl);
        // index before value: a live key must always be reachable from meta
        for registration in registrations {
            for meta_key in registration.meta_keys() {
                pipeline.sadd(meta_key, vec![cache_key.to_string()], meta_ttl);
            }
        }
        pipeline.set(cache_key, bytes, ttl);
    }

    async fn submit_populate(&self, pipeline: Pipeline, cache_keys: &[&str]) {
        if pipeline.is_empty() {
            return;
        }
        let timer = Instant::now();
        match self.write.pipeline_execute(pipeline).await {
            Ok(()) => {
                for key in cache_keys {
                    self.metrics.record_set(key, timer.elapsed());
                }
            }
            Err(e) => {
                warn!("Failed to populate {} cache entries: {}", cache_keys.len(), e);
                for key in cache_keys {
                    self.metrics.record_error(key, &e.to_string());
                }
            }
        }
    }

    /// Delete every cache key registered under `fields` of `entity`.
    ///
    /// See [`CacheEngine::invalidate_multi`].
    ///
    /// # Errors
    ///
    /// Returns `Err` if the meta lookup or the delete pipeline fails.
    pub async fn invalidate(&self, entity: &str, fields: &MetaFields) -> Result<()> {
        self.invalidate_multi(entity, std::slice::from_ref(fields))
            .await
    }

    /// Delete every cache key registered under any of `field_sets`.
    ///
    /// One meta-cache lookup for all value-level, field-wide and entity-wide
    /// entries involved, then one pipeline deleting the member keys and the
    /// meta entries themselves. Missing meta entries mean nothing to delete.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the meta lookup or the delete pipeline fails.
    pub async fn invalidate_multi(&self, entity: &str, field_sets: &[MetaFields]) -> Result<()> {
        let timer = Instant::now();

        let meta_keys: BTreeSet<String> = field_sets
            .iter()
            .flat_map(|fields| meta::invalidation_keys(entity, fields))
            .collect();
        let meta_refs: Vec<&str> = meta_keys.iter().map(String::as_str).collect();

        let members: BTreeSet<String> = self
            .write
            .smembers_multi(&meta_refs)
            .await?
            .into_iter()
            .flatten()
            .collect();

        let mut pipeline = self.write.pipeline_start();
        pipeline
            .delete_multi(members.iter().map(String::as_str))
            .delete_multi(meta_keys.iter().map(String::as_str));
        self.write.pipeline_execute(pipeline).await?;

        debug!(
            "Invalidated {} cache keys via {} meta entries of {}",
            members.len(),
            meta_keys.len(),
            entity
        );
        self.metrics
            .record_invalidation(entity, members.len(), timer.elapsed());
        Ok(())
    }

    /// Evict one cache key.
    ///
    /// # Errors
    ///
    /// Returns `Err` if backend error occurs
    pub async fn delete(&self, cache_key: &str) -> Result<()> {
        let timer = Instant::now();
        self.write.delete(cache_key).await?;
        self.metrics.record_delete(cache_key, timer.elapsed());
        Ok(())
    }

    /// Evict several cache keys in one call.
    ///
    /// # Errors
    ///
    /// Returns `Err` if backend error occurs
    pub async fn delete_multi(&self, cache_keys: &[&str]) -> Result<()> {
        let timer = Instant::now();
        self.write.mdelete(cache_keys).await?;
        for key in cache_keys {
            self.metrics.record_delete(key, timer.elapsed());
        }
        Ok(())
    }
}
