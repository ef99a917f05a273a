//! Metrics hooks and TTL policies of the cache engine.
//!
//! [`CacheMetrics`] receives one call per cache hit, miss, population and
//! error, and one call per invalidation with the number of keys it removed.
//! Wire it to a metrics system by implementing the methods you care about:
//!
//! ```
//! use entity_cache::backend::InMemoryBackend;
//! use entity_cache::observability::CacheMetrics;
//! use entity_cache::CacheEngine;
//! use std::sync::atomic::{AtomicU64, Ordering};
//! use std::time::Duration;
//!
//! #[derive(Default)]
//! struct InvalidationCounter(AtomicU64);
//!
//! impl CacheMetrics for InvalidationCounter {
//!     fn record_invalidation(&self, _entity: &str, keys: usize, _duration: Duration) {
//!         self.0.fetch_add(keys as u64, Ordering::Relaxed);
//!     }
//! }
//!
//! let engine = CacheEngine::new(InMemoryBackend::new())
//!     .with_metrics(Box::new(InvalidationCounter::default()));
//! ```
//!
//! Unimplemented methods log through the `log` crate. The engine defaults to
//! [`NoOpMetrics`].
//!
//! [`TtlPolicy`] decides how long results of an entity live when its
//! definition sets no `ttl_secs`:
//!
//! ```
//! use entity_cache::observability::TtlPolicy;
//! use std::time::Duration;
//!
//! let policy = TtlPolicy::PerEntity(|entity| match entity {
//!     "session" => Duration::from_secs(300),
//!     _ => Duration::from_secs(3600),
//! });
//! assert_eq!(policy.get_ttl("session"), Some(Duration::from_secs(300)));
//! ```

use std::time::Duration;

/// Cache event sink of a [`crate::CacheEngine`].
pub trait CacheMetrics: Send + Sync {
    /// A cached result was served.
    fn record_hit(&self, key: &str, duration: Duration) {
        debug!("Cache HIT: {} took {:?}", key, duration);
    }

    /// A result had to be computed by the store.
    fn record_miss(&self, key: &str, duration: Duration) {
        debug!("Cache MISS: {} took {:?}", key, duration);
    }

    /// A computed result and its meta registrations were written.
    fn record_set(&self, key: &str, duration: Duration) {
        debug!("Cache SET: {} took {:?}", key, duration);
    }

    /// `key` was evicted explicitly.
    fn record_delete(&self, key: &str, duration: Duration) {
        debug!("Cache DELETE: {} took {:?}", key, duration);
    }

    /// A write to `entity` removed `keys` cached results.
    fn record_invalidation(&self, entity: &str, keys: usize, duration: Duration) {
        debug!("Cache INVALIDATE: {} keys of {} took {:?}", keys, entity, duration);
    }

    /// A cache operation on `key` failed and was absorbed.
    fn record_error(&self, key: &str, error: &str) {
        warn!("Cache ERROR for {}: {}", key, error);
    }
}

/// Discards every event.
#[derive(Clone, Default)]
pub struct NoOpMetrics;

impl CacheMetrics for NoOpMetrics {
    fn record_hit(&self, _key: &str, _duration: Duration) {}
    fn record_miss(&self, _key: &str, _duration: Duration) {}
    fn record_set(&self, _key: &str, _duration: Duration) {}
    fn record_delete(&self, _key: &str, _duration: Duration) {}
    fn record_invalidation(&self, _entity: &str, _keys: usize, _duration: Duration) {}
    fn record_error(&self, _key: &str, _error: &str) {}
}

/// Lifetime of cached results of entities without their own TTL.
#[derive(Clone, Debug, Default)]
pub enum TtlPolicy {
    /// No TTL; the backend's eviction decides.
    #[default]
    Default,

    /// Same TTL for every entity.
    Fixed(Duration),

    /// Never expire.
    Infinite,

    /// TTL chosen by entity name.
    PerEntity(fn(&str) -> Duration),
}

impl TtlPolicy {
    /// TTL of results cached for `entity`.
    pub fn get_ttl(&self, entity: &str) -> Option<Duration> {
        match self {
            TtlPolicy::Default | TtlPolicy::Infinite => None,
            TtlPolicy::Fixed(d) => Some(*d),
            TtlPolicy::PerEntity(f) => Some(f(entity)),
        }
    }
}
