//! Cache key and meta-cache key construction.
//!
//! Query keys look like
//!
//! ```text
//! {namespace}:{query_id}:{digest}
//! {namespace}:{query_id}:{select}:{offset},{limit}:{order_digest}:{digest}
//! ```
//!
//! where `digest` hashes the bound field values. Values are hashed rather than
//! concatenated, so `("a:b", "c")` and `("a", "b:c")` can never share a key.

use crate::value::{FieldVals, OrderBy, Value};
use sha2::{Digest, Sha256};

/// Prefix shared by every meta-cache key.
pub const META_PREFIX: &str = "meta";

/// Hex characters kept from each SHA-256 digest.
const DIGEST_LEN: usize = 32;

/// Builder for cache keys.
pub struct CacheKeyBuilder;

impl CacheKeyBuilder {
    /// Key of a plain (unordered) query.
    pub fn build(namespace: &str, query_id: &str, fieldvals: &FieldVals) -> String {
        format!(
            "{}:{}:{}",
            namespace,
            query_id,
            Self::digest_fieldvals(fieldvals)
        )
    }

    /// Key of a single-value lookup, e.g. a record by primary key.
    pub fn build_single(namespace: &str, query_id: &str, value: &Value) -> String {
        format!(
            "{}:{}:{}",
            namespace,
            query_id,
            Self::digest_parts([value.cache_repr().as_str()])
        )
    }

    /// Key of an ordered and/or paginated query.
    ///
    /// `order_by` is hashed in the given sequence: `ORDER BY a, b` and
    /// `ORDER BY b, a` are different queries.
    pub fn build_limit(
        namespace: &str,
        query_id: &str,
        select_field: &str,
        order_by: &OrderBy,
        offset: Option<u64>,
        limit: Option<u64>,
        fieldvals: &FieldVals,
    ) -> String {
        let order: Vec<String> = order_by
            .iter()
            .map(|(field, direction)| format!("{} {}", field, direction))
            .collect();

        format!(
            "{}:{}:{}:{},{}:{}:{}",
            namespace,
            query_id,
            select_field,
            offset.map(|o| o.to_string()).unwrap_or_default(),
            limit.map(|l| l.to_string()).unwrap_or_default(),
            Self::digest_parts(order.iter().map(String::as_str)),
            Self::digest_fieldvals(fieldvals)
        )
    }

    /// Meta-cache key holding the cache keys that depend on `field = value`.
    pub fn meta_value_key(entity: &str, field: &str, value: &Value) -> String {
        format!(
            "{}:{}:{}:{}",
            META_PREFIX,
            entity,
            field,
            Self::digest_parts([value.cache_repr().as_str()])
        )
    }

    /// Meta-cache key holding the cache keys that depend on any value of `field`.
    pub fn meta_field_key(entity: &str, field: &str) -> String {
        format!("{}:{}:{}", META_PREFIX, entity, field)
    }

    /// Meta-cache key holding the cache keys of unfiltered queries on `entity`.
    pub fn meta_entity_key(entity: &str) -> String {
        format!("{}:{}", META_PREFIX, entity)
    }

    /// Namespace portion of a cache key.
    pub fn namespace(cache_key: &str) -> &str {
        cache_key.split(':').next().unwrap_or(cache_key)
    }

    /// Digest of a field/value set. Field names take part in the hash.
    pub fn digest_fieldvals(fieldvals: &FieldVals) -> String {
        let reprs: Vec<String> = fieldvals
            .iter()
            .flat_map(|(field, value)| [field.clone(), value.cache_repr()])
            .collect();
        Self::digest_parts(reprs.iter().map(String::as_str))
    }

    fn digest_parts<'a>(parts: impl IntoIterator<Item = &'a str>) -> String {
        let mut hasher = Sha256::new();
        for part in parts {
            // length prefix keeps part boundaries unambiguous
            hasher.update((part.len() as u64).to_le_bytes());
            hasher.update(part.as_bytes());
        }
        let mut digest = hex::encode(hasher.finalize());
        digest.truncate(DIGEST_LEN);
        digest
    }
}
