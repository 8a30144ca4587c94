//! Error types for coordination operations.

use std::fmt;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the cache, lock, rate limiter and store clients.
///
/// The enum is `Clone` because a collapsed cache execution hands the same
/// outcome to every waiting caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Remote store unreachable, timed out or returned a failure.
    BackendError(String),

    /// Invalid configuration or a type that must not be cached.
    ConfigError(String),

    /// Value could not be encoded.
    SerializationError(String),

    /// Cached bytes could not be decoded into the requested type.
    DeserializationError(String),

    /// Envelope header is missing or corrupted.
    InvalidCacheEntry(String),

    /// Envelope was written by an incompatible schema version.
    VersionMismatch { expected: u32, found: u32 },

    /// The store does not know the requested script (e.g. after a restart).
    ScriptNotFound(String),

    /// The circuit breaker is open; the remote call was not attempted.
    CircuitOpen,

    /// The task computing a collapsed value was dropped before finishing.
    Cancelled,

    /// The caller-supplied factory failed.
    FactoryError(String),
}

impl Error {
    /// True for failures of the remote store itself (as opposed to
    /// configuration or data errors).
    pub fn is_remote(&self) -> bool {
        matches!(
            self,
            Error::BackendError(_) | Error::ScriptNotFound(_) | Error::CircuitOpen
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::BackendError(msg) => write!(f, "Backend error: {}", msg),
            Error::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            Error::SerializationError(msg) => write!(f, "Serialization error: {}", msg),
            Error::DeserializationError(msg) => write!(f, "Deserialization error: {}", msg),
            Error::InvalidCacheEntry(msg) => write!(f, "Invalid cache entry: {}", msg),
            Error::VersionMismatch { expected, found } => write!(
                f,
                "Cache schema version mismatch: expected {}, found {}",
                expected, found
            ),
            Error::ScriptNotFound(name) => write!(f, "Script not loaded on store: {}", name),
            Error::CircuitOpen => write!(f, "Circuit breaker is open"),
            Error::Cancelled => write!(f, "Operation cancelled"),
            Error::FactoryError(msg) => write!(f, "Value factory failed: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::SerializationError(e.to_string())
    }
}

impl From<postcard::Error> for Error {
    fn from(e: postcard::Error) -> Self {
        Error::SerializationError(e.to_string())
    }
}

#[cfg(feature = "redis")]
impl From<deadpool_redis::redis::RedisError> for Error {
    fn from(e: deadpool_redis::redis::RedisError) -> Self {
        if e.code() == Some("NOSCRIPT") {
            Error::ScriptNotFound(e.to_string())
        } else {
            Error::BackendError(e.to_string())
        }
    }
}

#[cfg(feature = "redis")]
impl From<deadpool_redis::PoolError> for Error {
    fn from(e: deadpool_redis::PoolError) -> Self {
        Error::BackendError(format!("Failed to get Redis connection: {}", e))
    }
}
