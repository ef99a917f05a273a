//! Memcached cache backend implementation.
//!
//! Memcached has neither sets nor pipelines. Meta-cache sets are stored as
//! encoded member lists through the trait defaults, and pipelines run their
//! operations one by one.

use super::CacheBackend;
use crate::error::{Error, Result};
use async_memcached::AsciiProtocol;
use deadpool_memcached::{Manager, Pool};
use futures::future::try_join_all;
use std::collections::HashMap;
use std::fmt::Display;
use std::time::Duration;

/// Default Memcached connection pool size.
/// Override with MEMCACHED_POOL_SIZE environment variable
const DEFAULT_POOL_SIZE: u32 = 16;

/// Memcached treats expirations above 30 days as absolute unix timestamps.
const MAX_RELATIVE_TTL_SECS: u64 = 60 * 60 * 24 * 30;

/// Configuration for Memcached backend.
#[derive(Clone, Debug)]
pub struct MemcachedConfig {
    pub servers: Vec<String>, // e.g., ["localhost:11211", "cache2:11211"]
    pub connection_timeout: Duration,
    pub pool_size: u32,
}

impl Default for MemcachedConfig {
    fn default() -> Self {
        MemcachedConfig {
            servers: vec!["localhost:11211".to_string()],
            connection_timeout: Duration::from_secs(5),
            pool_size: DEFAULT_POOL_SIZE,
        }
    }
}

/// Memcached backend over a `deadpool-memcached` connection pool.
///
/// # Example
///
/// ```no_run
/// # use entity_cache::backend::{MemcachedBackend, MemcachedConfig, CacheBackend};
/// # use entity_cache::error::Result;
/// # async fn example() -> Result<()> {
/// let config = MemcachedConfig {
///     servers: vec!["localhost:11211".to_string()],
///     ..Default::default()
/// };
///
/// let backend = MemcachedBackend::new(config).await?;
/// backend.set("user:record:1f2e", b"value".to_vec(), None).await?;
/// let value = backend.get("user:record:1f2e").await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct MemcachedBackend {
    pool: Pool,
}

fn pool_error(e: impl Display) -> Error {
    Error::BackendError(format!("Failed to get Memcached connection: {}", e))
}

fn expiration(ttl: Option<Duration>) -> Option<i64> {
    ttl.map(|d| d.as_secs().clamp(1, MAX_RELATIVE_TTL_SECS) as i64)
}

impl MemcachedBackend {
    /// Create new Memcached backend from configuration.
    ///
    /// Only the first server is used; deadpool-memcached manages one address.
    ///
    /// # Errors
    /// Returns `Err` if no server is configured or the pool cannot be built
    pub async fn new(config: MemcachedConfig) -> Result<Self> {
        let addr = config
            .servers
            .first()
            .ok_or_else(|| Error::ConfigError("No memcached servers specified".to_string()))?
            .clone();

        let manager = Manager::new(addr.clone());
        let pool = Pool::builder(manager)
            .max_size(config.pool_size as usize)
            .build()
            .map_err(|e| Error::ConfigError(format!("Failed to create connection pool: {}", e)))?;

        info!(
            "Memcached backend initialized with server: {} (pool size: {})",
            addr, config.pool_size
        );

        Ok(MemcachedBackend { pool })
    }

    /// Create from server address directly.
    ///
    /// Pool size is `MEMCACHED_POOL_SIZE` if set, otherwise 16.
    ///
    /// # Errors
    /// Returns `Err` if connection pool creation fails
    pub async fn from_server(addr: String) -> Result<Self> {
        let pool_size = std::env::var("MEMCACHED_POOL_SIZE")
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
            .unwrap_or(DEFAULT_POOL_SIZE);

        let config = MemcachedConfig {
            servers: vec![addr],
            pool_size,
            ..Default::default()
        };
        Self::new(config).await
    }
}

impl CacheBackend for MemcachedBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.pool.get().await.map_err(pool_error)?;

        match conn.get(key).await {
            // a stored empty payload is still a hit
            Ok(Some(value)) => {
                debug!("Memcached GET {} -> HIT", key);
                Ok(Some(value.data.unwrap_or_default()))
            }
            Ok(None) => {
                debug!("Memcached GET {} -> MISS", key);
                Ok(None)
            }
            Err(e) => Err(Error::BackendError(format!(
                "Memcached GET failed for key {}: {}",
                key, e
            ))),
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.pool.get().await.map_err(pool_error)?;

        conn.set(key, value.as_slice(), expiration(ttl), None)
            .await
            .map_err(|e| {
                Error::BackendError(format!("Memcached SET failed for key {}: {}", key, e))
            })?;

        debug!("Memcached SET {} (TTL: {:?})", key, ttl);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.pool.get().await.map_err(pool_error)?;

        match conn.delete(key).await {
            Ok(()) => {}
            Err(e) if e.to_string().contains("not found") => {}
            Err(e) => {
                return Err(Error::BackendError(format!(
                    "Memcached DELETE failed for key {}: {}",
                    key, e
                )))
            }
        }

        debug!("Memcached DELETE {}", key);
        Ok(())
    }

    async fn mget(&self, keys: &[&str]) -> Result<Vec<Option<Vec<u8>>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.pool.get().await.map_err(pool_error)?;

        // get_multi reports "not found" when none of the keys exist
        let values = match conn.get_multi(keys).await {
            Ok(values) => values,
            Err(e) if e.to_string().contains("not found") => {
                debug!("Memcached MGET {} keys (all miss)", keys.len());
                return Ok(vec![None; keys.len()]);
            }
            Err(e) => return Err(Error::BackendError(format!("Memcached MGET failed: {}", e))),
        };

        let mut found: HashMap<String, Vec<u8>> = values
            .into_iter()
            .map(|value| {
                (
                    String::from_utf8_lossy(&value.key).into_owned(),
                    value.data.unwrap_or_default(),
                )
            })
            .collect();

        debug!("Memcached MGET {} keys, {} hits", keys.len(), found.len());
        Ok(keys.iter().map(|key| found.remove(*key)).collect())
    }

    async fn mdelete(&self, keys: &[&str]) -> Result<()> {
        // no multi-delete in the protocol; one pooled connection per key
        try_join_all(keys.iter().map(|key| self.delete(key))).await?;
        debug!("Memcached MDELETE {} keys", keys.len());
        Ok(())
    }

    /// Memcached counters are unsigned: a decrement stops at zero.
    async fn increment(&self, key: &str, offset: i64) -> Result<i64> {
        let mut conn = self.pool.get().await.map_err(pool_error)?;

        let amount = offset.unsigned_abs();
        let result = if offset >= 0 {
            conn.increment(key, amount).await
        } else {
            conn.decrement(key, amount).await
        };

        match result {
            Ok(value) => i64::try_from(value).map_err(|_| {
                Error::BackendError(format!("counter {} overflows i64: {}", key, value))
            }),
            Err(e) if e.to_string().contains("not found") => {
                let initial = offset.max(0);
                conn.set(key, initial.to_string().as_bytes(), None, None)
                    .await
                    .map_err(|e| {
                        Error::BackendError(format!("Memcached SET failed for key {}: {}", key, e))
                    })?;
                Ok(initial)
            }
            Err(e) => Err(Error::BackendError(format!(
                "Memcached INCR failed for key {}: {}",
                key, e
            ))),
        }
    }

    async fn health_check(&self) -> Result<bool> {
        match self.pool.get().await {
            Ok(mut conn) => Ok(conn.get("__health_check__").await.is_ok()),
            Err(_) => Ok(false),
        }
    }

    async fn clear_all(&self) -> Result<()> {
        let mut conn = self.pool.get().await.map_err(pool_error)?;

        conn.flush_all()
            .await
            .map_err(|e| Error::BackendError(format!("Memcached FLUSH_ALL failed: {}", e)))?;

        warn!("Memcached FLUSH_ALL executed - all cache cleared!");
        Ok(())
    }
}
