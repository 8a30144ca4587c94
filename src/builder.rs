//! Fluent builder for [`ManagedCache`].

use crate::backend::RemoteStore;
use crate::cache::ManagedCache;
use crate::config::CoordConfig;
use crate::memory::{CompactionPolicy, MemoryProbe, ProcMemoryProbe};
use crate::observability::{CacheMetrics, NoOpMetrics};
use crate::resilience::{CircuitBreaker, RetryPolicy};
use crate::serialization::{PostcardSerializer, Serializer};
use std::sync::Arc;
use std::time::Duration;

/// Default TTL when none is configured: 5 minutes.
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

/// Default interval between subscription liveness checks.
pub const DEFAULT_SUBSCRIPTION_CHECK: Duration = Duration::from_secs(10);

/// Configures and builds a [`ManagedCache`].
///
/// # Example
///
/// ```
/// use coord_kit::backend::InMemoryStore;
/// use coord_kit::serialization::JsonSerializer;
/// use coord_kit::ManagedCache;
/// use std::time::Duration;
///
/// # #[tokio::main]
/// # async fn main() {
/// let cache = ManagedCache::builder(InMemoryStore::new())
///     .with_serializer(JsonSerializer)
///     .with_machine_id("api-1")
///     .with_default_ttl(Duration::from_secs(60))
///     .with_breaker(5, Duration::from_secs(5))
///     .build();
///
/// assert_eq!(cache.machine_id(), "api-1");
/// # }
/// ```
pub struct ManagedCacheBuilder<R: RemoteStore, S: Serializer = PostcardSerializer> {
    pub(crate) store: R,
    pub(crate) serializer: S,
    pub(crate) machine_id: String,
    pub(crate) self_notify: bool,
    pub(crate) default_ttl: Duration,
    pub(crate) breaker: CircuitBreaker,
    pub(crate) retry: RetryPolicy,
    pub(crate) metrics: Arc<dyn CacheMetrics>,
    pub(crate) memory_probe: Arc<dyn MemoryProbe>,
    pub(crate) compaction: Option<CompactionPolicy>,
    pub(crate) subscription_check_interval: Duration,
}

impl<R: RemoteStore> ManagedCacheBuilder<R, PostcardSerializer> {
    /// Builder with defaults: postcard format, random machine id, 5 minute
    /// TTL, breaker opening after 5 failures for 5 seconds, no compaction.
    pub fn new(store: R) -> Self {
        ManagedCacheBuilder {
            store,
            serializer: PostcardSerializer,
            machine_id: uuid::Uuid::new_v4().to_string(),
            self_notify: false,
            default_ttl: DEFAULT_TTL,
            breaker: CircuitBreaker::default(),
            retry: RetryPolicy::default(),
            metrics: Arc::new(NoOpMetrics),
            memory_probe: Arc::new(ProcMemoryProbe),
            compaction: None,
            subscription_check_interval: DEFAULT_SUBSCRIPTION_CHECK,
        }
    }

    /// Builder seeded from a [`CoordConfig`].
    pub fn from_config(store: R, config: &CoordConfig) -> Self {
        let mut builder = ManagedCacheBuilder::new(store)
            .with_machine_id(config.machine_id.clone())
            .with_self_notify(config.self_notify)
            .with_default_ttl(config.default_ttl())
            .with_breaker(config.breaker_failure_threshold, config.breaker_cool_down())
            .with_retry(RetryPolicy {
                retries: config.delete_retries,
                ..RetryPolicy::default()
            })
            .with_subscription_check_interval(config.subscription_check_interval());

        if let Some(ceiling) = config.memory_ceiling_bytes {
            builder = builder.with_compaction(
                ceiling,
                config.compaction_fraction,
                config.compaction_interval(),
            );
        }
        builder
    }
}

impl<R: RemoteStore, S: Serializer> ManagedCacheBuilder<R, S> {
    /// Switch the wire format. Entries written in different formats never
    /// collide: the format tag is part of every key.
    pub fn with_serializer<S2: Serializer>(self, serializer: S2) -> ManagedCacheBuilder<R, S2> {
        ManagedCacheBuilder {
            store: self.store,
            serializer,
            machine_id: self.machine_id,
            self_notify: self.self_notify,
            default_ttl: self.default_ttl,
            breaker: self.breaker,
            retry: self.retry,
            metrics: self.metrics,
            memory_probe: self.memory_probe,
            compaction: self.compaction,
            subscription_check_interval: self.subscription_check_interval,
        }
    }

    pub fn with_machine_id(mut self, machine_id: impl Into<String>) -> Self {
        self.machine_id = machine_id.into();
        self
    }

    /// Also apply invalidations this instance published itself.
    pub fn with_self_notify(mut self, self_notify: bool) -> Self {
        self.self_notify = self_notify;
        self
    }

    /// TTL for local entries filled by [`ManagedCache::get`] from a remote
    /// entry without expiry.
    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn with_breaker(mut self, failure_threshold: u32, cool_down: Duration) -> Self {
        self.breaker = CircuitBreaker::new(failure_threshold, cool_down);
        self
    }

    /// Retry policy for remote deletes.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn CacheMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_memory_probe(mut self, probe: Arc<dyn MemoryProbe>) -> Self {
        self.memory_probe = probe;
        self
    }

    /// Evict `fraction` of local entries whenever resident memory exceeds
    /// `ceiling_bytes`, checking every `interval`.
    pub fn with_compaction(mut self, ceiling_bytes: u64, fraction: f64, interval: Duration) -> Self {
        self.compaction = Some(CompactionPolicy {
            ceiling_bytes,
            fraction: fraction.clamp(0.0, 1.0),
            interval,
        });
        self
    }

    pub fn with_subscription_check_interval(mut self, interval: Duration) -> Self {
        self.subscription_check_interval = interval;
        self
    }

    /// Build the cache. Background tasks start only inside a tokio runtime.
    pub fn build(self) -> ManagedCache<R, S> {
        ManagedCache::from_builder(self)
    }
}
