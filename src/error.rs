//! Error types for the data-access layer.

use std::fmt;

/// Result type for DAO, engine and backend operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the data-access layer.
///
/// Store and configuration errors always reach the caller. Cache backend
/// errors are absorbed by the engine wherever a correct answer can still be
/// produced from the backing store.
#[derive(Debug, Clone)]
pub enum Error {
    /// The backing store rejected or failed a call.
    ///
    /// Common causes:
    /// - Connection lost
    /// - Constraint violation (duplicate key, foreign key)
    /// - Malformed query
    ///
    /// **Recovery:** Nothing was written; cached state is still valid.
    Store {
        /// Backend-reported error code, if any.
        code: Option<String>,
        /// Backend-reported message.
        message: String,
    },

    /// Cache backend error (Redis, Memcached, etc).
    ///
    /// Reads fall back to the backing store; writes log it and carry on.
    BackendError(String),

    /// Configuration error.
    ///
    /// Raised for:
    /// - Unknown entity or field names
    /// - Ordered queries on a field that is not a foreign key
    /// - Invalid backend configuration
    ///
    /// **Recovery:** Fix configuration. Never retried.
    ConfigError(String),

    /// Serialization failed when converting a result to cache bytes.
    SerializationError(String),

    /// Deserialization failed when converting cache bytes to a result.
    ///
    /// **Recovery:** The entry is treated as a miss and recomputed.
    DeserializationError(String),

    /// Invalid cache entry: corrupted envelope or bad magic.
    InvalidCacheEntry(String),

    /// Schema version mismatch between code and cached data.
    VersionMismatch {
        /// Expected schema version (from compiled code)
        expected: u32,
        /// Found schema version (from cached entry)
        found: u32,
    },

    /// A value could not be bound to its declared field type.
    ValidationError(String),

    /// Capability not provided by a backend or driver.
    ///
    /// Example: a link driver asked for REPLACE semantics it cannot provide.
    NotImplemented(String),

    /// Generic error with custom message.
    Other(String),
}

impl Error {
    /// Build a store error without a code.
    pub fn store(message: impl Into<String>) -> Self {
        Error::Store {
            code: None,
            message: message.into(),
        }
    }

    /// Build a store error carrying the backend's error code.
    pub fn store_with_code(code: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Store {
            code: Some(code.into()),
            message: message.into(),
        }
    }

    /// True for failures of the backing store itself.
    pub fn is_store(&self) -> bool {
        matches!(self, Error::Store { .. })
    }

    /// True for errors a link write must raise instead of reporting `false`.
    pub fn is_capability(&self) -> bool {
        matches!(self, Error::ConfigError(_) | Error::NotImplemented(_))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Store {
                code: Some(code),
                message,
            } => write!(f, "Store error [{}]: {}", code, message),
            Error::Store {
                code: None,
                message,
            } => write!(f, "Store error: {}", message),
            Error::BackendError(msg) => write!(f, "Backend error: {}", msg),
            Error::ConfigError(msg) => write!(f, "Config error: {}", msg),
            Error::SerializationError(msg) => write!(f, "Serialization error: {}", msg),
            Error::DeserializationError(msg) => write!(f, "Deserialization error: {}", msg),
            Error::InvalidCacheEntry(msg) => write!(f, "Invalid cache entry: {}", msg),
            Error::VersionMismatch { expected, found } => {
                write!(
                    f,
                    "Cache version mismatch: expected {}, found {}",
                    expected, found
                )
            }
            Error::ValidationError(msg) => write!(f, "Validation error: {}", msg),
            Error::NotImplemented(msg) => write!(f, "Not implemented: {}", msg),
            Error::Other(msg) => write!(f, "Error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

// ============================================================================
// Conversions from other error types
// ============================================================================

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        if e.is_io() {
            Error::BackendError(e.to_string())
        } else if e.is_syntax() || e.is_data() || e.is_eof() {
            Error::DeserializationError(e.to_string())
        } else {
            Error::SerializationError(e.to_string())
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::BackendError(e.to_string())
    }
}

impl From<String> for Error {
    fn from(e: String) -> Self {
        Error::Other(e)
    }
}

impl From<&str> for Error {
    fn from(e: &str) -> Self {
        Error::Other(e.to_string())
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for Error {
    fn from(e: redis::RedisError) -> Self {
        Error::BackendError(format!("Redis error: {}", e))
    }
}
