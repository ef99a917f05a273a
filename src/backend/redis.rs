//! Redis cache backend implementation.

use super::{CacheBackend, CacheOp, Pipeline};
use crate::error::{Error, Result};
use deadpool_redis::redis::{self, AsyncCommands};
use deadpool_redis::{Config as PoolConfig, Connection, Pool, Runtime};
use std::collections::BTreeSet;
use std::time::Duration;

/// Pool statistics information.
#[derive(Debug, Clone)]
pub struct PoolStats {
    pub connections: u32,
    pub idle_connections: u32,
}

/// Default Redis connection pool size.
/// Override with REDIS_POOL_SIZE environment variable
const DEFAULT_POOL_SIZE: u32 = 16;

/// Configuration for Redis backend.
#[derive(Clone, Debug)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub database: u32,
    pub pool_size: u32,
    pub connection_timeout: Duration,
}

impl Default for RedisConfig {
    fn default() -> Self {
        RedisConfig {
            host: "localhost".to_string(),
            port: 6379,
            username: None,
            password: None,
            database: 0,
            pool_size: DEFAULT_POOL_SIZE,
            connection_timeout: Duration::from_secs(5),
        }
    }
}

impl RedisConfig {
    /// Build Redis connection string.
    pub fn connection_string(&self) -> String {
        match (&self.username, &self.password) {
            (Some(username), Some(password)) => format!(
                "redis://{}:{}@{}:{}/{}",
                username, password, self.host, self.port, self.database
            ),
            (None, Some(password)) => format!(
                "redis://default:{}@{}:{}/{}",
                password, self.host, self.port, self.database
            ),
            _ => format!("redis://{}:{}/{}", self.host, self.port, self.database),
        }
    }
}

/// Redis backend with connection pooling.
///
/// One pool per named cache pool; use two instances for a read/write split.
/// Pipelines run as `MULTI`/`EXEC`, so the mutations of one logical operation
/// become visible together.
///
/// # Example
///
/// ```no_run
/// # use entity_cache::backend::{RedisBackend, RedisConfig, CacheBackend};
/// # use entity_cache::error::Result;
/// # async fn example() -> Result<()> {
/// let backend = RedisBackend::new(RedisConfig::default()).await?;
///
/// backend.set("key", b"value".to_vec(), None).await?;
/// let value = backend.get("key").await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RedisBackend {
    pool: Pool,
}

impl RedisBackend {
    /// Create new Redis backend from configuration.
    ///
    /// # Errors
    /// Returns `Err` if pool creation fails.
    pub async fn new(config: RedisConfig) -> Result<Self> {
        let pool = Self::create_pool(&config.connection_string(), config.pool_size)?;

        info!(
            "Redis backend initialized: {}:{} (pool size: {})",
            config.host, config.port, config.pool_size
        );

        Ok(RedisBackend { pool })
    }

    /// Create from connection string directly.
    ///
    /// Pool size comes from `REDIS_POOL_SIZE` when set, else 16.
    ///
    /// # Errors
    /// Returns `Err` if pool creation fails.
    pub async fn from_connection_string(conn_str: &str) -> Result<Self> {
        let pool_size = std::env::var("REDIS_POOL_SIZE")
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
            .unwrap_or(DEFAULT_POOL_SIZE);

        let pool = Self::create_pool(conn_str, pool_size)?;

        info!(
            "Redis backend initialized from connection string (pool size: {})",
            pool_size
        );

        Ok(RedisBackend { pool })
    }

    fn create_pool(conn_str: &str, pool_size: u32) -> Result<Pool> {
        let mut cfg = PoolConfig::from_url(conn_str);
        cfg.pool = Some(deadpool_redis::PoolConfig::new(pool_size as usize));

        cfg.create_pool(Some(Runtime::Tokio1))
            .map_err(|e| Error::ConfigError(format!("Failed to create Redis pool: {}", e)))
    }

    /// Get current pool statistics.
    pub fn pool_stats(&self) -> PoolStats {
        let status = self.pool.status();
        PoolStats {
            connections: status.size as u32,
            idle_connections: status.available as u32,
        }
    }

    async fn conn(&self) -> Result<Connection> {
        self.pool
            .get()
            .await
            .map_err(|e| Error::BackendError(format!("Failed to get Redis connection: {}", e)))
    }
}

impl CacheBackend for RedisBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn().await?;

        // EXISTS travels with GET so presence, not content, decides a hit
        let (exists, value): (bool, Option<Vec<u8>>) = redis::pipe()
            .exists(key)
            .get(key)
            .query_async(&mut *conn)
            .await
            .map_err(|e| Error::BackendError(format!("Redis GET failed for key {}: {}", key, e)))?;

        if exists {
            debug!("Redis GET {} -> HIT", key);
            Ok(Some(value.unwrap_or_default()))
        } else {
            debug!("Redis GET {} -> MISS", key);
            Ok(None)
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.conn().await?;

        match ttl {
            Some(duration) => {
                conn.set_ex::<_, _, ()>(key, value, duration.as_secs().max(1))
                    .await
                    .map_err(|e| {
                        Error::BackendError(format!("Redis SETEX failed for key {}: {}", key, e))
                    })?;
            }
            None => {
                conn.set::<_, _, ()>(key, value).await.map_err(|e| {
                    Error::BackendError(format!("Redis SET failed for key {}: {}", key, e))
                })?;
            }
        }

        debug!("Redis SET {} (TTL: {:?})", key, ttl);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.conn().await?;

        conn.del::<_, ()>(key)
            .await
            .map_err(|e| Error::BackendError(format!("Redis DEL failed for key {}: {}", key, e)))?;

        debug!("Redis DELETE {}", key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn().await?;

        conn.exists(key).await.map_err(|e| {
            Error::BackendError(format!("Redis EXISTS failed for key {}: {}", key, e))
        })
    }

    async fn mget(&self, keys: &[&str]) -> Result<Vec<Option<Vec<u8>>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn().await?;

        let mut pipe = redis::pipe();
        pipe.atomic();
        for key in keys {
            pipe.exists(*key).get(*key);
        }

        let pairs: Vec<(bool, Option<Vec<u8>>)> = pipe
            .query_async(&mut *conn)
            .await
            .map_err(|e| Error::BackendError(format!("Redis MGET failed: {}", e)))?;

        debug!("Redis MGET {} keys", keys.len());
        Ok(pairs
            .into_iter()
            .map(|(exists, value)| exists.then(|| value.unwrap_or_default()))
            .collect())
    }

    async fn mset(&self, rows: Vec<(String, Vec<u8>)>, ttl: Option<Duration>) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut pipeline = Pipeline::new();
        for (key, value) in rows {
            pipeline.set(key, value, ttl);
        }
        self.pipeline_execute(pipeline).await
    }

    async fn mdelete(&self, keys: &[&str]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn().await?;

        conn.del::<_, ()>(keys)
            .await
            .map_err(|e| Error::BackendError(format!("Redis DEL (bulk) failed: {}", e)))?;

        debug!("Redis MDELETE {} keys", keys.len());
        Ok(())
    }

    async fn increment(&self, key: &str, offset: i64) -> Result<i64> {
        let mut conn = self.conn().await?;

        conn.incr(key, offset)
            .await
            .map_err(|e| Error::BackendError(format!("Redis INCRBY failed for key {}: {}", key, e)))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        if ttl.is_zero() {
            return self.delete(key).await;
        }
        let mut conn = self.conn().await?;

        conn.expire::<_, ()>(key, ttl.as_secs().max(1) as i64)
            .await
            .map_err(|e| Error::BackendError(format!("Redis EXPIRE failed for key {}: {}", key, e)))
    }

    async fn sadd(&self, key: &str, members: &[String], ttl: Option<Duration>) -> Result<()> {
        let mut pipeline = Pipeline::new();
        pipeline.sadd(key, members.to_vec(), ttl);
        self.pipeline_execute(pipeline).await
    }

    async fn smembers_multi(&self, keys: &[&str]) -> Result<Vec<BTreeSet<String>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn().await?;

        let mut pipe = redis::pipe();
        for key in keys {
            pipe.smembers(*key);
        }

        let sets: Vec<BTreeSet<String>> = pipe
            .query_async(&mut *conn)
            .await
            .map_err(|e| Error::BackendError(format!("Redis SMEMBERS failed: {}", e)))?;

        Ok(sets)
    }

    async fn pipeline_execute(&self, pipeline: Pipeline) -> Result<()> {
        if pipeline.is_empty() {
            return Ok(());
        }
        let count = pipeline.len();
        let mut conn = self.conn().await?;

        let mut pipe = redis::pipe();
        pipe.atomic();
        for op in pipeline.into_ops() {
            match op {
                CacheOp::Set {
                    key,
                    value,
                    ttl: Some(ttl),
                } => {
                    pipe.set_ex(key, value, ttl.as_secs().max(1)).ignore();
                }
                CacheOp::Set {
                    key,
                    value,
                    ttl: None,
                } => {
                    pipe.set(key, value).ignore();
                }
                CacheOp::Delete(key) => {
                    pipe.del(key).ignore();
                }
                CacheOp::Expire { key, ttl } if ttl.is_zero() => {
                    pipe.del(key).ignore();
                }
                CacheOp::Expire { key, ttl } => {
                    pipe.expire(key, ttl.as_secs().max(1) as i64).ignore();
                }
                CacheOp::SAdd { key, members, ttl } => {
                    pipe.sadd(&key, members).ignore();
                    if let Some(ttl) = ttl {
                        pipe.expire(&key, ttl.as_secs().max(1) as i64).ignore();
                    }
                }
            }
        }

        pipe.query_async::<()>(&mut *conn)
            .await
            .map_err(|e| Error::BackendError(format!("Redis pipeline failed: {}", e)))?;

        debug!("Redis PIPELINE {} ops", count);
        Ok(())
    }

    async fn health_check(&self) -> Result<bool> {
        let mut conn = self.conn().await?;

        let pong: String = redis::cmd("PING")
            .query_async(&mut *conn)
            .await
            .map_err(|e| Error::BackendError(format!("Redis PING failed: {}", e)))?;

        Ok(pong.contains("PONG"))
    }

    async fn clear_all(&self) -> Result<()> {
        let mut conn = self.conn().await?;

        redis::cmd("FLUSHDB")
            .query_async::<()>(&mut *conn)
            .await
            .map_err(|e| Error::BackendError(format!("Redis FLUSHDB failed: {}", e)))?;

        warn!("Redis FLUSHDB executed - all cache cleared!");
        Ok(())
    }
}
