//! Metrics hooks for the managed cache.

use std::fmt;
use std::time::Duration;

/// Cache tier that served a hit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CacheTier {
    Local,
    Remote,
}

impl fmt::Display for CacheTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheTier::Local => write!(f, "local"),
            CacheTier::Remote => write!(f, "remote"),
        }
    }
}

/// Receives cache events. Plug in Prometheus, StatsD or a test counter.
///
/// Only hits and misses are required; everything else defaults to a no-op.
pub trait CacheMetrics: Send + Sync {
    fn record_hit(&self, key: &str, tier: CacheTier, duration: Duration);

    fn record_miss(&self, key: &str, duration: Duration);

    /// A factory ran to produce the value for `key`.
    fn record_factory(&self, _key: &str, _duration: Duration) {}

    /// A remote call failed or was short-circuited; the caller was not told.
    fn record_error(&self, _key: &str, _error: &str) {}

    /// A local entry was evicted because another process invalidated it.
    fn record_invalidation(&self, _key: &str) {}

    /// Memory compaction evicted `count` local entries.
    fn record_eviction(&self, _count: usize) {}
}

/// Default metrics sink that discards everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoOpMetrics;

impl CacheMetrics for NoOpMetrics {
    fn record_hit(&self, _key: &str, _tier: CacheTier, _duration: Duration) {}

    fn record_miss(&self, _key: &str, _duration: Duration) {}
}
