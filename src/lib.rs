//! # entity-cache
//!
//! Cached data-access objects over a pluggable cache and a pluggable store.
//!
//! Every entity is read through a DAO that looks in the cache first and
//! falls back to the backing store on a miss. Writes go to the store and then
//! invalidate every cached result that could depend on the fields they
//! touched, found through a meta-cache index instead of a scan of the cache.
//!
//! ## Features
//!
//! - **Read-through caching:** single and batched, with one multi-get and one
//!   store call per batch
//! - **Meta-cache invalidation:** value-level, field-wide and entity-wide
//!   indexes maintained alongside every cached result
//! - **Backend Agnostic:** in-memory, Redis (`redis` feature) and Memcached
//!   (`memcached` feature), or any [`CacheBackend`]
//! - **Store Agnostic:** any [`store::RecordDriver`] / [`store::LinkDriver`];
//!   [`store::MemoryStore`] works in-process
//! - **Configuration driven:** entities are plain data, loadable from JSON
//!
//! ## Quick Start
//!
//! ```
//! use entity_cache::backend::InMemoryBackend;
//! use entity_cache::entity::EntityRegistry;
//! use entity_cache::store::MemoryStore;
//! use entity_cache::value::{fieldvals, Value};
//! use entity_cache::DataService;
//!
//! # async fn example() -> entity_cache::Result<()> {
//! let registry = EntityRegistry::from_json(r#"[
//!     {"name": "user", "table": "user", "primary_key": "id", "auto_increment": true,
//!      "fields": {"id": "integer", "name": "string"}},
//!     {"name": "group", "table": "group", "primary_key": "id", "auto_increment": true,
//!      "fields": {"id": "integer", "name": "string"}},
//!     {"name": "user_group", "table": "user_group",
//!      "fields": {"user_id": "integer", "group_id": "integer"},
//!      "referenced_entities": {"user_id": "user", "group_id": "group"}}
//! ]"#)?;
//!
//! let service = DataService::new(InMemoryBackend::new(), MemoryStore::new(), registry);
//! let users = service.record_dao("user")?;
//! let memberships = service.link_dao("user_group")?;
//!
//! let user = users.insert(fieldvals([("name", "alpha")])).await?;
//! memberships
//!     .insert(fieldvals([("user_id", user["id"].clone()), ("group_id", Value::from(1))]), false)
//!     .await?;
//!
//! // cached until a write touches user_id or group_id values it depends on
//! let groups = memberships.by_field("user_id", user["id"].clone(), None, None, None).await?;
//! assert_eq!(groups, vec![Value::Integer(1)]);
//! # Ok(())
//! # }
//! ```

#[macro_use]
extern crate log;

pub mod backend;
pub mod codec;
pub mod dao;
pub mod engine;
pub mod entity;
pub mod error;
pub mod key;
pub mod meta;
pub mod observability;
pub mod service;
pub mod store;
pub mod value;

// Re-exports for convenience
pub use backend::CacheBackend;
pub use dao::{LinkDao, RecordDao};
pub use engine::{CacheEngine, OperationConfig};
pub use entity::{EntityDefinition, EntityRegistry};
pub use error::{Error, Result};
pub use service::DataService;
pub use store::{LinkDriver, MemoryStore, RecordDriver};
pub use value::{FieldType, FieldVals, Row, Value};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
