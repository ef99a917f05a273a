//! In-memory cache backend (default, thread-safe, async).
//!
//! Uses DashMap for concurrent access with per-key sharding and handles TTL
//! expiration on access. Sets live in their own map so the meta-cache can use
//! native set semantics.

use super::{CacheBackend, CacheOp, Pipeline};
use crate::error::{Error, Result};
use dashmap::DashMap;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// In-memory cache entry with optional expiration.
struct CacheEntry {
    data: Vec<u8>,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn new(data: Vec<u8>, ttl: Option<Duration>) -> Self {
        let expires_at = ttl.map(|d| Instant::now() + d);
        CacheEntry { data, expires_at }
    }

    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|exp| Instant::now() > exp)
    }
}

#[derive(Default)]
struct SetEntry {
    members: BTreeSet<String>,
    expires_at: Option<Instant>,
}

impl SetEntry {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|exp| Instant::now() > exp)
    }
}

/// Thread-safe async in-memory cache backend.
///
/// Clones share the same store. Every trait call counts as one round trip
/// (a whole pipeline counts once), which is what the batching guarantees of
/// the engine are measured against.
///
/// # Example
///
/// ```no_run
/// use entity_cache::backend::{InMemoryBackend, CacheBackend};
/// use std::time::Duration;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let backend = InMemoryBackend::new();
///
///     backend.set("key1", b"value".to_vec(), None).await?;
///     assert!(backend.get("key1").await?.is_some());
///
///     backend.set("key2", b"expires".to_vec(), Some(Duration::from_secs(300))).await?;
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct InMemoryBackend {
    store: Arc<DashMap<String, CacheEntry>>,
    sets: Arc<DashMap<String, SetEntry>>,
    round_trips: Arc<AtomicUsize>,
}

impl InMemoryBackend {
    /// Create a new in-memory cache backend.
    pub fn new() -> Self {
        InMemoryBackend {
            store: Arc::new(DashMap::new()),
            sets: Arc::new(DashMap::new()),
            round_trips: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of live value entries (sets excluded).
    pub async fn len(&self) -> usize {
        self.store.iter().filter(|e| !e.is_expired()).count()
    }

    /// Check if cache holds no live values.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Live keys of value entries, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .store
            .iter()
            .filter(|e| !e.is_expired())
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        keys
    }

    /// Members of a set without counting a round trip. Intended for assertions.
    pub fn members(&self, key: &str) -> BTreeSet<String> {
        self.sets
            .get(key)
            .filter(|s| !s.is_expired())
            .map(|s| s.members.clone())
            .unwrap_or_default()
    }

    /// Calls made against this backend (and its clones) so far.
    pub fn round_trips(&self) -> usize {
        self.round_trips.load(Ordering::SeqCst)
    }

    /// Reset the round-trip counter.
    pub fn reset_round_trips(&self) {
        self.round_trips.store(0, Ordering::SeqCst);
    }

    /// Get memory statistics.
    pub async fn stats(&self) -> CacheStats {
        let total_bytes: usize = self.store.iter().map(|entry| entry.data.len()).sum();
        let expired_count = self.store.iter().filter(|entry| entry.is_expired()).count();

        CacheStats {
            total_entries: self.store.len(),
            expired_entries: expired_count,
            total_sets: self.sets.len(),
            total_bytes,
            round_trips: self.round_trips(),
        }
    }

    /// Print cache statistics to debug log.
    pub async fn log_stats(&self) {
        let stats = self.stats().await;
        debug!(
            "Cache Stats: {} entries ({} expired), {} sets, {} bytes, {} round trips",
            stats.total_entries,
            stats.expired_entries,
            stats.total_sets,
            stats.total_bytes,
            stats.round_trips
        );
    }

    fn tick(&self) {
        self.round_trips.fetch_add(1, Ordering::SeqCst);
    }

    fn read(&self, key: &str) -> Option<Vec<u8>> {
        if let Some(entry) = self.store.get(key) {
            if !entry.is_expired() {
                return Some(entry.data.clone());
            }
        }
        // the read guard is gone here, so removing cannot deadlock the shard
        self.store.remove_if(key, |_, e| e.is_expired());
        None
    }

    fn write(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) {
        self.store.insert(key.to_string(), CacheEntry::new(value, ttl));
    }

    fn remove(&self, key: &str) {
        self.store.remove(key);
        self.sets.remove(key);
    }

    fn add_members(&self, key: &str, members: &[String], ttl: Option<Duration>) {
        let mut set = self.sets.entry(key.to_string()).or_default();
        if set.is_expired() {
            set.members.clear();
            set.expires_at = None;
        }
        set.members.extend(members.iter().cloned());
        if let Some(d) = ttl {
            set.expires_at = Some(Instant::now() + d);
        }
    }

    fn touch(&self, key: &str, ttl: Duration) {
        if ttl.is_zero() {
            self.remove(key);
            return;
        }
        let expires_at = Some(Instant::now() + ttl);
        if let Some(mut entry) = self.store.get_mut(key) {
            entry.expires_at = expires_at;
        }
        if let Some(mut set) = self.sets.get_mut(key) {
            set.expires_at = expires_at;
        }
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheBackend for InMemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.tick();
        let value = self.read(key);
        debug!(
            "InMemory GET {} -> {}",
            key,
            if value.is_some() { "HIT" } else { "MISS" }
        );
        Ok(value)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        self.tick();
        self.write(key, value, ttl);
        debug!("InMemory SET {} (TTL: {:?})", key, ttl);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.tick();
        self.remove(key);
        debug!("InMemory DELETE {}", key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.tick();
        let in_store = self.store.get(key).is_some_and(|e| !e.is_expired());
        let in_sets = self.sets.get(key).is_some_and(|s| !s.is_expired());
        Ok(in_store || in_sets)
    }

    async fn mget(&self, keys: &[&str]) -> Result<Vec<Option<Vec<u8>>>> {
        self.tick();
        let results: Vec<Option<Vec<u8>>> = keys.iter().map(|k| self.read(k)).collect();
        debug!("InMemory MGET {} keys", keys.len());
        Ok(results)
    }

    async fn mset(&self, rows: Vec<(String, Vec<u8>)>, ttl: Option<Duration>) -> Result<()> {
        self.tick();
        let count = rows.len();
        for (key, value) in rows {
            self.write(&key, value, ttl);
        }
        debug!("InMemory MSET {} keys (TTL: {:?})", count, ttl);
        Ok(())
    }

    async fn mdelete(&self, keys: &[&str]) -> Result<()> {
        self.tick();
        for key in keys {
            self.remove(key);
        }
        debug!("InMemory MDELETE {} keys", keys.len());
        Ok(())
    }

    async fn increment(&self, key: &str, offset: i64) -> Result<i64> {
        self.tick();
        let mut entry = self
            .store
            .entry(key.to_string())
            .or_insert_with(|| CacheEntry::new(b"0".to_vec(), None));
        if entry.is_expired() {
            *entry = CacheEntry::new(b"0".to_vec(), None);
        }
        let current = std::str::from_utf8(&entry.data)
            .ok()
            .and_then(|s| s.parse::<i64>().ok())
            .ok_or_else(|| Error::BackendError(format!("value at {} is not an integer", key)))?;
        let next = current + offset;
        entry.data = next.to_string().into_bytes();
        Ok(next)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        self.tick();
        self.touch(key, ttl);
        Ok(())
    }

    async fn sadd(&self, key: &str, members: &[String], ttl: Option<Duration>) -> Result<()> {
        self.tick();
        self.add_members(key, members, ttl);
        Ok(())
    }

    async fn smembers_multi(&self, keys: &[&str]) -> Result<Vec<BTreeSet<String>>> {
        self.tick();
        Ok(keys.iter().map(|k| self.members(k)).collect())
    }

    async fn pipeline_execute(&self, pipeline: Pipeline) -> Result<()> {
        self.tick();
        let count = pipeline.len();
        for op in pipeline.into_ops() {
            match op {
                CacheOp::Set { key, value, ttl } => self.write(&key, value, ttl),
                CacheOp::Delete(key) => self.remove(&key),
                CacheOp::Expire { key, ttl } => self.touch(&key, ttl),
                CacheOp::SAdd { key, members, ttl } => self.add_members(&key, &members, ttl),
            }
        }
        debug!("InMemory PIPELINE {} ops", count);
        Ok(())
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }

    async fn clear_all(&self) -> Result<()> {
        self.store.clear();
        self.sets.clear();
        warn!("InMemory CLEAR_ALL executed - all cache cleared!");
        Ok(())
    }
}

/// Cache statistics.
#[derive(Clone, Debug)]
pub struct CacheStats {
    pub total_entries: usize,
    pub expired_entries: usize,
    pub total_sets: usize,
    pub total_bytes: usize,
    pub round_trips: usize,
}
