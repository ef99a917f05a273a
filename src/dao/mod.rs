//! Data access objects built on the cache engine.
//!
//! [`RecordDao`] serves entities with a single primary key, [`LinkDao`]
//! two-column linking entities. Both bind every field against the entity
//! definition, read through the engine and invalidate through the meta-cache
//! after each committed write.

use crate::backend::CacheBackend;
use crate::engine::CacheEngine;
use crate::entity::EntityDefinition;
use crate::error::{Error, Result};
use crate::meta::MetaFields;
use crate::value::{FieldVals, Row};
use std::collections::BTreeMap;

pub mod link;
pub mod record;

pub use link::LinkDao;
pub use record::RecordDao;

/// Query id of primary-key lookups.
pub(crate) const QUERY_RECORD: &str = "record";
/// Query id of counts.
pub(crate) const QUERY_COUNT: &str = "count";
/// Query id of full-table reads.
pub(crate) const QUERY_ALL: &str = "all";

/// Bind every predicate of a keyed batch.
pub(crate) fn bind_keyed<K: Ord>(
    definition: &EntityDefinition,
    keyed: BTreeMap<K, FieldVals>,
) -> Result<BTreeMap<K, FieldVals>> {
    keyed
        .into_iter()
        .map(|(k, fieldvals)| Ok((k, definition.bind_fieldvals(fieldvals)?)))
        .collect()
}

/// Pair the results of a batched driver call with the keys they answer.
///
/// # Errors
///
/// Returns `Error::Store` if the driver answered a different number of
/// queries than it was asked.
pub(crate) fn zip_keyed<K: Ord, A, T>(keys: BTreeMap<K, A>, results: Vec<T>) -> Result<BTreeMap<K, T>> {
    if keys.len() != results.len() {
        return Err(Error::store(format!(
            "driver returned {} results for {} queries",
            results.len(),
            keys.len()
        )));
    }
    Ok(keys.into_keys().zip(results).collect())
}

/// Every row has the same field set.
pub(crate) fn is_homogeneous(rows: &[Row]) -> bool {
    rows.windows(2).all(|pair| pair[0].keys().eq(pair[1].keys()))
}

/// Invalidate after a committed write. Failures are logged, never returned:
/// the store already holds the new state.
pub(crate) async fn invalidate_logged<B: CacheBackend>(
    engine: &CacheEngine<B>,
    entity: &str,
    field_sets: &[MetaFields],
) {
    if field_sets.is_empty() {
        return;
    }
    if let Err(e) = engine.invalidate_multi(entity, field_sets).await {
        error!(
            "Cache invalidation failed for {} after a committed write, stale entries live until TTL: {}",
            entity, e
        );
    }
}
