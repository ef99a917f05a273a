//! Meta-cache bookkeeping.
//!
//! A meta-cache entry is a backend set whose members are cache keys. Each
//! populated query result registers its key under the field values it
//! depended on; a write looks those sets up and deletes every member. Three
//! granularities exist:
//!
//! ```text
//! meta:{entity}:{field}:{value-digest}   one value of one field
//! meta:{entity}:{field}                  any value of one field
//! meta:{entity}                          any row of the entity
//! ```
//!
//! Every invalidation touches all three levels for the fields it names, so a
//! registration only has to pick the narrowest level that is still correct.

use crate::key::CacheKeyBuilder;
use crate::value::{FieldVals, Value};
use std::collections::{BTreeMap, BTreeSet};

/// Field name → every value of that field touched by a write.
pub type MetaFields = BTreeMap<String, Vec<Value>>;

/// Meta-cache entries a freshly populated cache key must be added to.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MetaRegistration {
    pub entity: String,
    /// Value-level dependencies.
    pub values: MetaFields,
    /// Field-wide dependencies.
    pub fields: BTreeSet<String>,
    /// Depends on every row of the entity.
    pub entity_wide: bool,
}

impl MetaRegistration {
    pub fn new(entity: impl Into<String>) -> Self {
        MetaRegistration {
            entity: entity.into(),
            ..Default::default()
        }
    }

    /// Registration for a query filtered on `fieldvals`.
    ///
    /// An unfiltered query depends on every row, so it is entity-wide.
    pub fn for_query(entity: impl Into<String>, fieldvals: &FieldVals) -> Self {
        let registration = MetaRegistration::new(entity);
        if fieldvals.is_empty() {
            registration.entity_wide()
        } else {
            registration.fieldvals(fieldvals)
        }
    }

    pub fn value(mut self, field: impl Into<String>, value: Value) -> Self {
        let values = self.values.entry(field.into()).or_default();
        if !values.contains(&value) {
            values.push(value);
        }
        self
    }

    pub fn values<I>(self, field: &str, values: I) -> Self
    where
        I: IntoIterator<Item = Value>,
    {
        values
            .into_iter()
            .fold(self, |registration, value| registration.value(field, value))
    }

    pub fn fieldvals(self, fieldvals: &FieldVals) -> Self {
        fieldvals
            .iter()
            .fold(self, |registration, (field, value)| {
                registration.value(field.as_str(), value.clone())
            })
    }

    pub fn field_wide(mut self, field: impl Into<String>) -> Self {
        self.fields.insert(field.into());
        self
    }

    pub fn entity_wide(mut self) -> Self {
        self.entity_wide = true;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty() && self.fields.is_empty() && !self.entity_wide
    }

    /// Every meta-cache key this registration adds the cache key to.
    pub fn meta_keys(&self) -> Vec<String> {
        let mut keys = Vec::new();
        for (field, values) in &self.values {
            for value in values {
                keys.push(CacheKeyBuilder::meta_value_key(&self.entity, field, value));
            }
        }
        for field in &self.fields {
            keys.push(CacheKeyBuilder::meta_field_key(&self.entity, field));
        }
        if self.entity_wide {
            keys.push(CacheKeyBuilder::meta_entity_key(&self.entity));
        }
        keys
    }
}

/// Meta-cache keys to consult when `fields` of `entity` change.
///
/// Covers the value-level entry of each value, the field-wide entry of each
/// field and the entity-wide entry.
pub fn invalidation_keys(entity: &str, fields: &MetaFields) -> BTreeSet<String> {
    let mut keys = BTreeSet::new();
    for (field, values) in fields {
        for value in values {
            keys.insert(CacheKeyBuilder::meta_value_key(entity, field, value));
        }
        keys.insert(CacheKeyBuilder::meta_field_key(entity, field));
    }
    keys.insert(CacheKeyBuilder::meta_entity_key(entity));
    keys
}

/// Append every value of `row` to `fields`.
pub fn collect_row(fields: &mut MetaFields, row: &FieldVals) {
    for (field, value) in row {
        push_value(fields, field, value.clone());
    }
}

/// Append one value to `fields`, skipping duplicates.
pub fn push_value(fields: &mut MetaFields, field: &str, value: Value) {
    let values = fields.entry(field.to_string()).or_default();
    if !values.contains(&value) {
        values.push(value);
    }
}
