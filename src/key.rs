//! Key formatting for cache entries, rate-limit counters and leases.

use crate::entity::CacheValue;
use crate::serialization::Serializer;

/// Builds the store keys used by every component.
pub struct CacheKeyBuilder;

impl CacheKeyBuilder {
    /// Fully-qualified cache key: `{serializerTag}-{typeName}-{callerKey}`.
    ///
    /// The same caller key reused for two value types, or for two formats,
    /// maps to two distinct entries.
    pub fn build<T: CacheValue, S: Serializer>(serializer: &S, key: &str) -> String {
        format!("{}-{}-{}", serializer.tag(), T::type_name(), key)
    }

    /// Counter key for the `index`-th entry (0-based) of a rate-limit window.
    pub fn rate_limit(key: &str, index: usize) -> String {
        format!("{}:{}", key, index)
    }

    /// Lease key guarding a distributed lock.
    pub fn lock(key: &str) -> String {
        format!("lock:{}", key)
    }
}
