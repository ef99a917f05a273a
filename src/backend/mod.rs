//! Cache backend implementations.

use crate::codec;
use crate::error::{Error, Result};
use std::collections::BTreeSet;
use std::time::Duration;

pub mod inmemory;
#[cfg(feature = "memcached")]
pub mod memcached;
#[cfg(feature = "redis")]
pub mod redis;

pub use inmemory::InMemoryBackend;
#[cfg(feature = "memcached")]
pub use memcached::{MemcachedBackend, MemcachedConfig};
#[cfg(feature = "redis")]
pub use redis::{PoolStats, RedisBackend, RedisConfig};

/// One queued cache mutation.
#[derive(Clone, Debug, PartialEq)]
pub enum CacheOp {
    Set {
        key: String,
        value: Vec<u8>,
        ttl: Option<Duration>,
    },
    Delete(String),
    Expire {
        key: String,
        ttl: Duration,
    },
    /// Add members to a set, then (re)apply `ttl` to the whole set.
    SAdd {
        key: String,
        members: Vec<String>,
        ttl: Option<Duration>,
    },
}

/// Batch of cache mutations submitted in one round trip.
///
/// Obtained from [`CacheBackend::pipeline_start`] and handed back to
/// [`CacheBackend::pipeline_execute`]. Operations run in submission order.
#[derive(Clone, Debug, Default)]
pub struct Pipeline {
    ops: Vec<CacheOp>,
}

impl Pipeline {
    pub fn new() -> Self {
        Pipeline { ops: Vec::new() }
    }

    pub fn set(&mut self, key: impl Into<String>, value: Vec<u8>, ttl: Option<Duration>) -> &mut Self {
        self.ops.push(CacheOp::Set {
            key: key.into(),
            value,
            ttl,
        });
        self
    }

    pub fn delete(&mut self, key: impl Into<String>) -> &mut Self {
        self.ops.push(CacheOp::Delete(key.into()));
        self
    }

    pub fn delete_multi<I, K>(&mut self, keys: I) -> &mut Self
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        self.ops
            .extend(keys.into_iter().map(|k| CacheOp::Delete(k.into())));
        self
    }

    pub fn expire(&mut self, key: impl Into<String>, ttl: Duration) -> &mut Self {
        self.ops.push(CacheOp::Expire {
            key: key.into(),
            ttl,
        });
        self
    }

    pub fn sadd(&mut self, key: impl Into<String>, members: Vec<String>, ttl: Option<Duration>) -> &mut Self {
        if !members.is_empty() {
            self.ops.push(CacheOp::SAdd {
                key: key.into(),
                members,
                ttl,
            });
        }
        self
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ops(&self) -> &[CacheOp] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<CacheOp> {
        self.ops
    }
}

/// Trait for cache backend implementations.
///
/// All methods use `&self`; implementations share state through interior
/// mutability or an external store. Keys are strings, values opaque bytes
/// produced by [`crate::codec`].
///
/// Only `get`, `set` and `delete` are required. The batched and set-based
/// operations have sequential default implementations for backends that lack
/// a native form (Memcached has no sets and no pipelining).
#[allow(async_fn_in_trait)]
pub trait CacheBackend: Send + Sync + Clone {
    /// Retrieve value from cache by key.
    ///
    /// # Returns
    /// - `Ok(Some(bytes))` - Key exists, whatever its content
    /// - `Ok(None)` - Key does not exist
    ///
    /// # Errors
    /// Returns `Err` if backend error occurs (connection lost, etc.)
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Store value in cache with optional TTL.
    ///
    /// # Errors
    /// Returns `Err` if backend error occurs
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()>;

    /// Remove value from cache. Removing a missing key is not an error.
    ///
    /// # Errors
    /// Returns `Err` if backend error occurs
    async fn delete(&self, key: &str) -> Result<()>;

    /// Check if key exists in cache.
    ///
    /// # Errors
    /// Returns `Err` if backend error occurs
    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }

    /// Bulk get, results in the order of `keys`.
    ///
    /// # Errors
    /// Returns `Err` if backend error occurs
    async fn mget(&self, keys: &[&str]) -> Result<Vec<Option<Vec<u8>>>> {
        let mut results = Vec::with_capacity(keys.len());
        for key in keys {
            results.push(self.get(key).await?);
        }
        Ok(results)
    }

    /// Bulk set with one TTL for every row.
    ///
    /// # Errors
    /// Returns `Err` if backend error occurs
    async fn mset(&self, rows: Vec<(String, Vec<u8>)>, ttl: Option<Duration>) -> Result<()> {
        for (key, value) in rows {
            self.set(&key, value, ttl).await?;
        }
        Ok(())
    }

    /// Bulk delete.
    ///
    /// # Errors
    /// Returns `Err` if backend error occurs
    async fn mdelete(&self, keys: &[&str]) -> Result<()> {
        for key in keys {
            self.delete(key).await?;
        }
        Ok(())
    }

    /// Add `offset` to an integer counter, creating it at zero. Returns the new value.
    ///
    /// # Errors
    /// Returns `Err` if the stored value is not an integer or the backend fails
    async fn increment(&self, key: &str, offset: i64) -> Result<i64> {
        let current = match self.get(key).await? {
            Some(bytes) => std::str::from_utf8(&bytes)
                .ok()
                .and_then(|s| s.trim().parse::<i64>().ok())
                .ok_or_else(|| {
                    Error::BackendError(format!("value at {} is not an integer", key))
                })?,
            None => 0,
        };
        let next = current + offset;
        self.set(key, next.to_string().into_bytes(), None).await?;
        Ok(next)
    }

    /// Subtract `offset` from an integer counter. Returns the new value.
    ///
    /// # Errors
    /// Returns `Err` if the stored value is not an integer or the backend fails
    async fn decrement(&self, key: &str, offset: i64) -> Result<i64> {
        self.increment(key, -offset).await
    }

    /// Set the remaining time-to-live of an existing key.
    ///
    /// A zero TTL deletes the key.
    ///
    /// # Errors
    /// Returns `Err` if backend error occurs
    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        if ttl.is_zero() {
            return self.delete(key).await;
        }
        if let Some(value) = self.get(key).await? {
            self.set(key, value, Some(ttl)).await?;
        }
        Ok(())
    }

    /// Add members to the set stored at `key` and apply `ttl` to it.
    ///
    /// The default is a read-modify-write of an encoded set. Two concurrent
    /// writers may lose a member; a lost member only means a stale entry
    /// survives until its own TTL.
    ///
    /// # Errors
    /// Returns `Err` if backend error occurs
    async fn sadd(&self, key: &str, members: &[String], ttl: Option<Duration>) -> Result<()> {
        let mut set = match self.get(key).await? {
            Some(bytes) => codec::decode_members(&bytes),
            None => BTreeSet::new(),
        };
        set.extend(members.iter().cloned());
        self.set(key, codec::encode_members(&set)?, ttl).await
    }

    /// Members of every set in `keys`, in order. Missing sets are empty.
    ///
    /// # Errors
    /// Returns `Err` if backend error occurs
    async fn smembers_multi(&self, keys: &[&str]) -> Result<Vec<BTreeSet<String>>> {
        Ok(self
            .mget(keys)
            .await?
            .into_iter()
            .map(|bytes| bytes.map(|b| codec::decode_members(&b)).unwrap_or_default())
            .collect())
    }

    /// Start collecting mutations for one round trip.
    fn pipeline_start(&self) -> Pipeline {
        Pipeline::new()
    }

    /// Submit a pipeline.
    ///
    /// The default runs the operations one by one, in order.
    ///
    /// # Errors
    /// Returns the first backend error; later operations are not attempted
    async fn pipeline_execute(&self, pipeline: Pipeline) -> Result<()> {
        for op in pipeline.into_ops() {
            match op {
                CacheOp::Set { key, value, ttl } => self.set(&key, value, ttl).await?,
                CacheOp::Delete(key) => self.delete(&key).await?,
                CacheOp::Expire { key, ttl } => self.expire(&key, ttl).await?,
                CacheOp::SAdd { key, members, ttl } => self.sadd(&key, &members, ttl).await?,
            }
        }
        Ok(())
    }

    /// Health check - verify backend is accessible.
    ///
    /// # Errors
    /// Returns `Err` if backend is not accessible
    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }

    /// Optional: Clear all cache (use with caution).
    ///
    /// # Errors
    /// Returns `Err` if operation is not implemented or fails
    async fn clear_all(&self) -> Result<()> {
        Err(Error::NotImplemented(
            "clear_all not implemented for this backend".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Backend that only implements the required methods.
    #[derive(Clone, Default)]
    struct MinimalBackend {
        inner: InMemoryBackend,
    }

    impl CacheBackend for MinimalBackend {
        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
            self.inner.set(key, value, ttl).await
        }

        async fn delete(&self, key: &str) -> Result<()> {
            self.inner.delete(key).await
        }
    }

    #[tokio::test]
    async fn test_default_sadd_and_smembers() {
        let backend = MinimalBackend::default();
        backend
            .sadd("meta:user:name", &["user:a".to_string()], None)
            .await
            .expect("Failed to sadd");
        backend
            .sadd("meta:user:name", &["user:b".to_string(), "user:a".to_string()], None)
            .await
            .expect("Failed to sadd");

        let sets = backend
            .smembers_multi(&["meta:user:name", "meta:missing"])
            .await
            .expect("Failed to smembers");
        assert_eq!(sets[0].len(), 2);
        assert!(sets[1].is_empty());
    }

    #[tokio::test]
    async fn test_default_increment_decrement() {
        let backend = MinimalBackend::default();
        assert_eq!(backend.increment("counter", 5).await.unwrap(), 5);
        assert_eq!(backend.decrement("counter", 2).await.unwrap(), 3);

        backend.set("bad", b"x".to_vec(), None).await.unwrap();
        assert!(backend.increment("bad", 1).await.is_err());
    }

    #[tokio::test]
    async fn test_default_pipeline_runs_in_order() {
        let backend = MinimalBackend::default();
        let mut pipeline = backend.pipeline_start();
        pipeline
            .set("k", b"1".to_vec(), None)
            .delete("k")
            .set("k", b"2".to_vec(), None);
        assert_eq!(pipeline.len(), 3);

        backend.pipeline_execute(pipeline).await.unwrap();
        assert_eq!(backend.get("k").await.unwrap(), Some(b"2".to_vec()));
    }

    #[tokio::test]
    async fn test_default_expire_zero_deletes() {
        let backend = MinimalBackend::default();
        backend.set("k", b"v".to_vec(), None).await.unwrap();
        backend.expire("k", Duration::ZERO).await.unwrap();
        assert!(!backend.exists("k").await.unwrap());
    }

    #[test]
    fn test_pipeline_skips_empty_sadd() {
        let mut pipeline = Pipeline::new();
        pipeline.sadd("meta:x", Vec::new(), None);
        assert!(pipeline.is_empty());
    }
}
