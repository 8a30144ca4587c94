//! Value serializers used by the managed cache.
//!
//! Every serializer carries a short tag that becomes the first segment of
//! the fully-qualified cache key, so values written by one format are never
//! read back by another.
//!
//! # Postcard envelope
//!
//! ```text
//! [MAGIC: 4 bytes] [VERSION: 4 bytes LE] [POSTCARD PAYLOAD]
//! ```

use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Magic header written in front of every postcard payload.
pub const CACHE_MAGIC: [u8; 4] = *b"CORD";

/// Schema version of the postcard envelope.
///
/// Bump when the layout of cached values changes incompatibly; old entries
/// are then rejected with `Error::VersionMismatch` and treated as misses.
pub const SCHEMA_VERSION: u32 = 1;

const HEADER_LEN: usize = 8;

/// Turns typed values into bytes and back.
pub trait Serializer: Send + Sync + 'static {
    /// Short format tag, e.g. `"pc"` or `"json"`.
    fn tag(&self) -> &'static str;

    /// Encode a value.
    fn serialize<T: Serialize>(&self, value: &T) -> Result<Vec<u8>>;

    /// Decode a value.
    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T>;
}

/// Compact binary format with a versioned envelope. The default.
#[derive(Clone, Copy, Debug, Default)]
pub struct PostcardSerializer;

impl Serializer for PostcardSerializer {
    fn tag(&self) -> &'static str {
        "pc"
    }

    fn serialize<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        let payload = postcard::to_allocvec(value)?;
        let mut bytes = Vec::with_capacity(HEADER_LEN + payload.len());
        bytes.extend_from_slice(&CACHE_MAGIC);
        bytes.extend_from_slice(&SCHEMA_VERSION.to_le_bytes());
        bytes.extend_from_slice(&payload);
        Ok(bytes)
    }

    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        if bytes.len() < HEADER_LEN {
            return Err(Error::InvalidCacheEntry(format!(
                "Entry too short: {} bytes",
                bytes.len()
            )));
        }
        if bytes[..4] != CACHE_MAGIC {
            return Err(Error::InvalidCacheEntry(
                "Magic header mismatch".to_string(),
            ));
        }

        let mut version = [0u8; 4];
        version.copy_from_slice(&bytes[4..HEADER_LEN]);
        let found = u32::from_le_bytes(version);
        if found != SCHEMA_VERSION {
            return Err(Error::VersionMismatch {
                expected: SCHEMA_VERSION,
                found,
            });
        }

        postcard::from_bytes(&bytes[HEADER_LEN..])
            .map_err(|e| Error::DeserializationError(e.to_string()))
    }
}

/// Plain JSON. Larger, but readable from other languages and `redis-cli`.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn tag(&self) -> &'static str {
        "json"
    }

    fn serialize<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        serde_json::from_slice(bytes).map_err(|e| Error::DeserializationError(e.to_string()))
    }
}
