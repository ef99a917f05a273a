//! Versioned envelope codec for cached query results.
//!
//! Every cached value is wrapped in an envelope before it reaches a backend:
//!
//! ```text
//! ┌─────────────────┬─────────────────┬──────────────────────────┐
//! │  MAGIC (4 bytes)│ VERSION (varint)│POSTCARD PAYLOAD (N bytes)│
//! └─────────────────┴─────────────────┴──────────────────────────┘
//!   "ECDA"              u32                postcard::to_allocvec(T)
//! ```
//!
//! Backends never see an empty byte string, and a hit is decided purely by
//! whether the entry exists: an envelope holding `0`, `[]` or `None` is a
//! real, cached result.

use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Magic header of every cached entry.
pub const CACHE_MAGIC: [u8; 4] = *b"ECDA";

/// Current schema version.
///
/// Bump when the shape of a cached result changes (e.g. `Value` gains a
/// variant). Old entries then fail validation and are recomputed.
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

/// Versioned envelope for cache entries.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CacheEnvelope<T> {
    pub magic: [u8; 4],
    pub version: u32,
    pub payload: T,
}

impl<T> CacheEnvelope<T> {
    pub fn new(payload: T) -> Self {
        Self {
            magic: CACHE_MAGIC,
            version: CURRENT_SCHEMA_VERSION,
            payload,
        }
    }
}

/// Encode a query result for cache storage.
///
/// # Errors
///
/// Returns `Error::SerializationError` if Postcard serialization fails.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    postcard::to_allocvec(&CacheEnvelope::new(value)).map_err(|e| {
        error!("Cache serialization failed: {}", e);
        Error::SerializationError(e.to_string())
    })
}

/// Decode a cached query result, validating magic and schema version.
///
/// # Errors
///
/// - `Error::DeserializationError`: corrupted payload
/// - `Error::InvalidCacheEntry`: bad magic
/// - `Error::VersionMismatch`: written by a different schema version
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    let envelope: CacheEnvelope<T> = postcard::from_bytes(bytes)
        .map_err(|e| Error::DeserializationError(e.to_string()))?;

    if envelope.magic != CACHE_MAGIC {
        return Err(Error::InvalidCacheEntry(format!(
            "Invalid magic: expected {:?}, got {:?}",
            CACHE_MAGIC, envelope.magic
        )));
    }

    if envelope.version != CURRENT_SCHEMA_VERSION {
        return Err(Error::VersionMismatch {
            expected: CURRENT_SCHEMA_VERSION,
            found: envelope.version,
        });
    }

    Ok(envelope.payload)
}

/// Encode a meta-cache member set for backends without native sets.
pub fn encode_members(members: &BTreeSet<String>) -> Result<Vec<u8>> {
    encode(members)
}

/// Decode a meta-cache member set. Unreadable sets decode as empty.
pub fn decode_members(bytes: &[u8]) -> BTreeSet<String> {
    match decode(bytes) {
        Ok(members) => members,
        Err(e) => {
            warn!("Discarding unreadable meta-cache set: {}", e);
            BTreeSet::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{Row, Value};

    #[test]
    fn test_row_roundtrip() {
        let mut row = Row::new();
        row.insert("id".into(), Value::Integer(1));
        row.insert("name".into(), Value::from("alpha"));
        row.insert("score".into(), Value::Float(1.5));
        row.insert("deleted_on".into(), Value::Null);

        let bytes = encode(&Some(row.clone())).unwrap();
        let decoded: Option<Row> = decode(&bytes).unwrap();
        assert_eq!(decoded, Some(row));
    }

    #[test]
    fn test_empty_results_are_not_empty_bytes() {
        for bytes in [
            encode(&0u64).unwrap(),
            encode(&Vec::<Value>::new()).unwrap(),
            encode(&Option::<Row>::None).unwrap(),
        ] {
            assert!(bytes.len() > CACHE_MAGIC.len());
        }

        let zero: u64 = decode(&encode(&0u64).unwrap()).unwrap();
        assert_eq!(zero, 0);
    }

    #[test]
    fn test_version_mismatch_rejected() {
        let mut envelope = CacheEnvelope::new(5u64);
        envelope.version = 999;
        let bytes = postcard::to_allocvec(&envelope).unwrap();

        match decode::<u64>(&bytes).unwrap_err() {
            Error::VersionMismatch { expected, found } => {
                assert_eq!(expected, CURRENT_SCHEMA_VERSION);
                assert_eq!(found, 999);
            }
            e => panic!("Expected VersionMismatch, got {:?}", e),
        }
    }

    #[test]
    fn test_invalid_magic_rejected() {
        let mut envelope = CacheEnvelope::new(5u64);
        envelope.magic = *b"XXXX";
        let bytes = postcard::to_allocvec(&envelope).unwrap();

        assert!(matches!(
            decode::<u64>(&bytes),
            Err(Error::InvalidCacheEntry(_))
        ));
    }

    #[test]
    fn test_truncated_payload_rejected() {
        let bytes = encode(&"x".repeat(64)).unwrap();
        assert!(matches!(
            decode::<String>(&bytes[..bytes.len() / 2]),
            Err(Error::DeserializationError(_))
        ));
    }

    #[test]
    fn test_members_roundtrip_and_garbage() {
        let members: BTreeSet<String> = ["a:1", "b:2"].iter().map(|s| s.to_string()).collect();
        let bytes = encode_members(&members).unwrap();
        assert_eq!(decode_members(&bytes), members);
        assert!(decode_members(b"garbage").is_empty());
    }
}
