//! Entity definitions loaded from configuration.
//!
//! A definition describes one table: its typed fields, its key, which fields
//! reference other entities, which binary fields carry JSON, and which cache
//! and source pools serve it.
//!
//! # Example
//!
//! ```
//! use entity_cache::entity::EntityRegistry;
//!
//! let registry = EntityRegistry::from_json(r#"[
//!     {
//!         "name": "user",
//!         "table": "user",
//!         "primary_key": "id",
//!         "auto_increment": true,
//!         "fields": { "id": "integer", "email": "string", "status_id": "integer" },
//!         "referenced_entities": { "status_id": "user_status" },
//!         "ttl_secs": 3600
//!     }
//! ]"#).unwrap();
//!
//! let user = registry.get("user").unwrap();
//! assert_eq!(user.pk().unwrap(), "id");
//! ```

use crate::engine::OperationConfig;
use crate::error::{Error, Result};
use crate::key::META_PREFIX;
use crate::value::{FieldType, FieldVals, Row, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Pool name used when a definition names none.
pub const DEFAULT_POOL: &str = "default";

fn default_pool() -> String {
    DEFAULT_POOL.to_string()
}

/// Stored form of a blob field that was inserted without a value.
const EMPTY_BLOB: &[u8] = b"[]";

/// Description of one record or link table.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EntityDefinition {
    /// Entity name, also the cache namespace.
    pub name: String,
    pub table: String,
    /// Set for record entities; link entities have none.
    #[serde(default)]
    pub primary_key: Option<String>,
    /// Every field with its storage type. A link entity has exactly two.
    pub fields: BTreeMap<String, FieldType>,
    /// Foreign-key field → name of the referenced entity.
    #[serde(default)]
    pub referenced_entities: BTreeMap<String, String>,
    /// Binary fields holding JSON documents.
    #[serde(default)]
    pub json_fields: Vec<String>,
    #[serde(default = "default_pool")]
    pub cache_pool_read: String,
    #[serde(default = "default_pool")]
    pub cache_pool_write: String,
    #[serde(default = "default_pool")]
    pub source_pool_read: String,
    #[serde(default = "default_pool")]
    pub source_pool_write: String,
    /// TTL of cached query results; falls back to the engine's policy.
    #[serde(default)]
    pub ttl_secs: Option<u64>,
    /// The store generates the primary key.
    #[serde(default)]
    pub auto_increment: bool,
}

impl EntityDefinition {
    /// Definition of a record entity with pool defaults.
    pub fn record<I, K>(name: &str, primary_key: &str, fields: I) -> Self
    where
        I: IntoIterator<Item = (K, FieldType)>,
        K: Into<String>,
    {
        EntityDefinition {
            primary_key: Some(primary_key.to_string()),
            ..Self::bare(name, fields)
        }
    }

    /// Definition of a link entity with pool defaults.
    pub fn link<I, K>(name: &str, fields: I) -> Self
    where
        I: IntoIterator<Item = (K, FieldType)>,
        K: Into<String>,
    {
        Self::bare(name, fields)
    }

    fn bare<I, K>(name: &str, fields: I) -> Self
    where
        I: IntoIterator<Item = (K, FieldType)>,
        K: Into<String>,
    {
        EntityDefinition {
            name: name.to_string(),
            table: name.to_string(),
            primary_key: None,
            fields: fields.into_iter().map(|(k, t)| (k.into(), t)).collect(),
            referenced_entities: BTreeMap::new(),
            json_fields: Vec::new(),
            cache_pool_read: default_pool(),
            cache_pool_write: default_pool(),
            source_pool_read: default_pool(),
            source_pool_write: default_pool(),
            ttl_secs: None,
            auto_increment: false,
        }
    }

    pub fn with_reference(mut self, field: &str, entity: &str) -> Self {
        self.referenced_entities
            .insert(field.to_string(), entity.to_string());
        self
    }

    pub fn with_json_field(mut self, field: &str) -> Self {
        self.json_fields.push(field.to_string());
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl_secs = Some(ttl.as_secs());
        self
    }

    /// Serve cached reads from `read` and cache writes and meta lookups
    /// from `write`.
    pub fn with_cache_pools(mut self, read: &str, write: &str) -> Self {
        self.cache_pool_read = read.to_string();
        self.cache_pool_write = write.to_string();
        self
    }

    pub fn with_source_pools(mut self, read: &str, write: &str) -> Self {
        self.source_pool_read = read.to_string();
        self.source_pool_write = write.to_string();
        self
    }

    pub fn with_auto_increment(mut self) -> Self {
        self.auto_increment = true;
        self
    }

    /// Check the definition is internally consistent.
    ///
    /// # Errors
    ///
    /// Returns `Error::ConfigError` describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        let bad = |msg: String| Err(Error::ConfigError(format!("entity \"{}\": {}", self.name, msg)));

        if self.name.is_empty() || self.name.contains(':') {
            return bad("name must be non-empty and contain no ':'".to_string());
        }
        if self.name == META_PREFIX {
            return bad(format!("\"{}\" is reserved for the meta-cache", META_PREFIX));
        }
        match &self.primary_key {
            Some(pk) if !self.fields.contains_key(pk) => {
                return bad(format!("primary key \"{}\" is not a field", pk));
            }
            None if self.fields.len() != 2 => {
                return bad(format!(
                    "a link entity needs exactly two fields, has {}",
                    self.fields.len()
                ));
            }
            _ => {}
        }
        if self.auto_increment && self.primary_key.is_none() {
            return bad("auto_increment requires a primary key".to_string());
        }
        for field in self.referenced_entities.keys().chain(&self.json_fields) {
            if !self.fields.contains_key(field) {
                return bad(format!("unknown field \"{}\"", field));
            }
        }
        Ok(())
    }

    pub fn is_link(&self) -> bool {
        self.primary_key.is_none()
    }

    /// Primary-key field of a record entity.
    ///
    /// # Errors
    ///
    /// Returns `Error::ConfigError` for link entities.
    pub fn pk(&self) -> Result<&str> {
        self.primary_key.as_deref().ok_or_else(|| {
            Error::ConfigError(format!("entity \"{}\" has no primary key", self.name))
        })
    }

    /// The two key fields of a link entity, sorted.
    ///
    /// # Errors
    ///
    /// Returns `Error::ConfigError` for record entities.
    pub fn link_fields(&self) -> Result<(&str, &str)> {
        let mut fields = self.fields.keys();
        match (self.is_link(), fields.next(), fields.next()) {
            (true, Some(a), Some(b)) => Ok((a.as_str(), b.as_str())),
            _ => Err(Error::ConfigError(format!(
                "entity \"{}\" is not a link entity",
                self.name
            ))),
        }
    }

    /// The link field that is not `field`.
    ///
    /// # Errors
    ///
    /// Returns `Error::ConfigError` if `field` is not a link field.
    pub fn other_field(&self, field: &str) -> Result<&str> {
        match self.link_fields()? {
            (a, b) if a == field => Ok(b),
            (a, b) if b == field => Ok(a),
            _ => Err(Error::ConfigError(format!(
                "\"{}\" is not a field of link entity \"{}\"",
                field, self.name
            ))),
        }
    }

    /// Declared type of `field`.
    ///
    /// # Errors
    ///
    /// Returns `Error::ConfigError` for unknown fields.
    pub fn field_type(&self, field: &str) -> Result<FieldType> {
        self.fields.get(field).copied().ok_or_else(|| {
            Error::ConfigError(format!(
                "unknown field \"{}\" on entity \"{}\"",
                field, self.name
            ))
        })
    }

    /// Entity referenced by foreign-key `field`, if any.
    pub fn foreign_entity(&self, field: &str) -> Option<&str> {
        self.referenced_entities.get(field).map(String::as_str)
    }

    pub fn is_json_field(&self, field: &str) -> bool {
        self.json_fields.iter().any(|f| f == field)
    }

    /// Coerce one value to the field's declared type, JSON-encoding blobs.
    ///
    /// # Errors
    ///
    /// `Error::ConfigError` for unknown fields, `Error::ValidationError` for
    /// values that cannot take the field's type.
    pub fn bind(&self, field: &str, value: Value) -> Result<Value> {
        let field_type = self.field_type(field)?;
        let value = match value {
            Value::Json(json) if self.is_json_field(field) => {
                Value::Binary(serde_json::to_vec(&json)?)
            }
            other => other,
        };
        field_type.bind(field, value)
    }

    /// Bind every field of a lookup or a write.
    ///
    /// # Errors
    ///
    /// See [`EntityDefinition::bind`].
    pub fn bind_fieldvals(&self, fieldvals: FieldVals) -> Result<FieldVals> {
        fieldvals
            .into_iter()
            .map(|(field, value)| {
                let bound = self.bind(&field, value)?;
                Ok((field, bound))
            })
            .collect()
    }

    /// Fill in absent blob fields of a row about to be inserted.
    pub fn with_blob_defaults(&self, mut row: Row) -> Row {
        for field in &self.json_fields {
            row.entry(field.clone())
                .or_insert_with(|| Value::Binary(EMPTY_BLOB.to_vec()));
        }
        row
    }

    /// Decode the JSON blob fields of a stored row.
    ///
    /// A blob that does not parse is left in its stored form.
    pub fn decode_row(&self, mut row: Row) -> Row {
        for field in &self.json_fields {
            let Some(value) = row.get_mut(field) else {
                continue;
            };
            let bytes = match value {
                Value::Binary(b) => b.as_slice(),
                Value::String(s) => s.as_bytes(),
                _ => continue,
            };
            match serde_json::from_slice::<serde_json::Value>(bytes) {
                Ok(json) => *value = Value::Json(json),
                Err(e) => warn!(
                    "Blob field {}.{} is not valid JSON, returning raw value: {}",
                    self.name, field, e
                ),
            }
        }
        row
    }

    /// TTL of cached query results for this entity.
    pub fn ttl(&self) -> Option<Duration> {
        self.ttl_secs.map(Duration::from_secs)
    }

    /// Engine configuration for reads of this entity.
    pub fn operation_config(&self) -> OperationConfig {
        OperationConfig {
            ttl_override: self.ttl(),
        }
    }
}

/// Resolves entity names to definitions.
///
/// Cheap to clone; definitions are shared.
#[derive(Clone, Debug, Default)]
pub struct EntityRegistry {
    entities: BTreeMap<String, Arc<EntityDefinition>>,
}

impl EntityRegistry {
    pub fn new() -> Self {
        EntityRegistry::default()
    }

    /// Load a JSON array of entity definitions.
    ///
    /// # Errors
    ///
    /// Returns `Error::DeserializationError` on malformed JSON and
    /// `Error::ConfigError` on an invalid or duplicate definition.
    pub fn from_json(json: &str) -> Result<Self> {
        let definitions: Vec<EntityDefinition> = serde_json::from_str(json)?;
        let mut registry = EntityRegistry::new();
        for definition in definitions {
            registry.register(definition)?;
        }
        info!("Loaded {} entity definitions", registry.len());
        Ok(registry)
    }

    /// Add a definition.
    ///
    /// # Errors
    ///
    /// Returns `Error::ConfigError` if the definition is invalid or the name
    /// is already taken.
    pub fn register(&mut self, definition: EntityDefinition) -> Result<Arc<EntityDefinition>> {
        definition.validate()?;
        if self.entities.contains_key(&definition.name) {
            return Err(Error::ConfigError(format!(
                "entity \"{}\" is defined twice",
                definition.name
            )));
        }
        let definition = Arc::new(definition);
        self.entities
            .insert(definition.name.clone(), Arc::clone(&definition));
        Ok(definition)
    }

    /// Look up a definition by entity name.
    ///
    /// # Errors
    ///
    /// Returns `Error::ConfigError` for unknown names.
    pub fn get(&self, name: &str) -> Result<Arc<EntityDefinition>> {
        self.entities
            .get(name)
            .cloned()
            .ok_or_else(|| Error::ConfigError(format!("unknown entity \"{}\"", name)))
    }

    /// Longest TTL of any entity; a meta-cache TTL at least this long
    /// outlives every key it indexes.
    pub fn longest_ttl(&self) -> Option<Duration> {
        self.entities.values().filter_map(|d| d.ttl()).max()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entities.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn user() -> EntityDefinition {
        EntityDefinition::record(
            "user",
            "id",
            [
                ("id", FieldType::Integer),
                ("email", FieldType::String),
                ("prefs", FieldType::Binary),
            ],
        )
        .with_json_field("prefs")
        .with_auto_increment()
    }

    #[test]
    fn test_validate_rejects_bad_definitions() {
        assert!(user().validate().is_ok());

        let mut reserved = user();
        reserved.name = "meta".to_string();
        assert!(matches!(reserved.validate(), Err(Error::ConfigError(_))));

        let missing_pk = EntityDefinition::record("user", "uid", [("id", FieldType::Integer)]);
        assert!(missing_pk.validate().is_err());

        let three = EntityDefinition::link(
            "user_group",
            [
                ("user_id", FieldType::Integer),
                ("group_id", FieldType::Integer),
                ("extra", FieldType::Integer),
            ],
        );
        assert!(three.validate().is_err());

        let bad_ref = user().with_reference("nope", "group");
        assert!(bad_ref.validate().is_err());
    }

    #[test]
    fn test_link_fields() {
        let link = EntityDefinition::link(
            "user_group",
            [("user_id", FieldType::Integer), ("group_id", FieldType::Integer)],
        );
        assert_eq!(link.link_fields().unwrap(), ("group_id", "user_id"));
        assert_eq!(link.other_field("user_id").unwrap(), "group_id");
        assert!(link.other_field("id").is_err());
        assert!(link.pk().is_err());
        assert!(user().link_fields().is_err());
    }

    #[test]
    fn test_bind_coerces_and_rejects_unknown_fields() {
        let def = user();
        assert_eq!(def.bind("id", Value::from("5")).unwrap(), Value::Integer(5));
        assert!(matches!(
            def.bind("nope", Value::from(1)),
            Err(Error::ConfigError(_))
        ));
        assert!(matches!(
            def.bind("id", Value::from("five")),
            Err(Error::ValidationError(_))
        ));
    }

    #[test]
    fn test_blob_roundtrip() {
        let def = user();
        let stored = def
            .bind("prefs", Value::Json(json!({"theme": "dark"})))
            .unwrap();
        assert!(matches!(stored, Value::Binary(_)));

        let row: Row = [("prefs".to_string(), stored)].into_iter().collect();
        let decoded = def.decode_row(row);
        assert_eq!(decoded["prefs"], Value::Json(json!({"theme": "dark"})));
    }

    #[test]
    fn test_blob_defaults_and_bad_json() {
        let def = user();
        let row = def.with_blob_defaults(Row::new());
        assert_eq!(row["prefs"], Value::Binary(b"[]".to_vec()));

        let raw: Row = [("prefs".to_string(), Value::Binary(b"{oops".to_vec()))]
            .into_iter()
            .collect();
        assert_eq!(def.decode_row(raw)["prefs"], Value::Binary(b"{oops".to_vec()));
    }

    #[test]
    fn test_registry_from_json() {
        let registry = EntityRegistry::from_json(
            r#"[
                {"name": "user", "table": "user", "primary_key": "id",
                 "fields": {"id": "integer", "name": "string"}, "ttl_secs": 60},
                {"name": "user_group", "table": "user_group",
                 "fields": {"user_id": "integer", "group_id": "integer"},
                 "referenced_entities": {"user_id": "user", "group_id": "group"},
                 "cache_pool_read": "replica", "ttl_secs": 600}
            ]"#,
        )
        .expect("Failed to load registry");

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.longest_ttl(), Some(Duration::from_secs(600)));
        let link = registry.get("user_group").unwrap();
        assert!(link.is_link());
        assert_eq!(link.cache_pool_read, "replica");
        assert_eq!(link.cache_pool_write, "default");
        assert_eq!(link.foreign_entity("group_id"), Some("group"));
        assert!(registry.get("group").is_err());
    }

    #[test]
    fn test_registry_rejects_duplicates_and_bad_json() {
        let mut registry = EntityRegistry::new();
        registry.register(user()).unwrap();
        assert!(registry.register(user()).is_err());

        assert!(EntityRegistry::from_json("{not json").is_err());
    }
}
