//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use entity_cache::backend::{CacheBackend, InMemoryBackend, Pipeline};
use entity_cache::store::MemoryStore;
use entity_cache::{DataService, EntityRegistry, Error, Result};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Entities of a small user directory.
///
/// `user.status_id` references `user_status`; `user_group` links users and
/// groups.
pub const ENTITIES: &str = r#"[
    {
        "name": "user",
        "table": "user",
        "primary_key": "id",
        "auto_increment": true,
        "fields": {
            "id": "integer",
            "email": "string",
            "name": "string",
            "status_id": "integer",
            "prefs": "binary"
        },
        "referenced_entities": {"status_id": "user_status"},
        "json_fields": ["prefs"],
        "ttl_secs": 3600
    },
    {
        "name": "user_status",
        "table": "user_status",
        "primary_key": "id",
        "fields": {"id": "integer", "label": "string"}
    },
    {
        "name": "group",
        "table": "group",
        "primary_key": "id",
        "auto_increment": true,
        "fields": {"id": "integer", "name": "string"}
    },
    {
        "name": "user_group",
        "table": "user_group",
        "fields": {"user_id": "integer", "group_id": "integer"},
        "referenced_entities": {"user_id": "user", "group_id": "group"}
    }
]"#;

pub fn registry() -> EntityRegistry {
    EntityRegistry::from_json(ENTITIES).expect("Failed to load entities")
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Service over a fresh in-memory cache and store.
pub fn service() -> (DataService<InMemoryBackend, MemoryStore>, InMemoryBackend, MemoryStore) {
    init_logging();
    let backend = InMemoryBackend::new();
    let store = MemoryStore::new();
    let service = DataService::new(backend.clone(), store.clone(), registry());
    (service, backend, store)
}

/// In-memory backend whose reads or writes can be switched to fail.
#[derive(Clone, Default)]
pub struct FailingBackend {
    pub inner: InMemoryBackend,
    fail_reads: Arc<AtomicBool>,
    fail_writes: Arc<AtomicBool>,
}

impl FailingBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check(&self, flag: &AtomicBool, what: &str) -> Result<()> {
        if flag.load(Ordering::SeqCst) {
            return Err(Error::BackendError(format!("injected {} failure", what)));
        }
        Ok(())
    }
}

impl CacheBackend for FailingBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.check(&self.fail_reads, "read")?;
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        self.check(&self.fail_writes, "write")?;
        self.inner.set(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.check(&self.fail_writes, "write")?;
        self.inner.delete(key).await
    }

    async fn mget(&self, keys: &[&str]) -> Result<Vec<Option<Vec<u8>>>> {
        self.check(&self.fail_reads, "read")?;
        self.inner.mget(keys).await
    }

    async fn smembers_multi(&self, keys: &[&str]) -> Result<Vec<BTreeSet<String>>> {
        self.check(&self.fail_writes, "meta lookup")?;
        self.inner.smembers_multi(keys).await
    }

    async fn pipeline_execute(&self, pipeline: Pipeline) -> Result<()> {
        self.check(&self.fail_writes, "pipeline")?;
        self.inner.pipeline_execute(pipeline).await
    }
}
