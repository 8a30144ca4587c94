//! Two-tier managed cache.
//!
//! Reads go local tier first, then the remote store, then a caller-supplied
//! factory. Concurrent misses for one key collapse into a single execution
//! per process. Writes and deletes that reach the remote tier publish an
//! invalidation so every other process drops its local copy.
//!
//! ```text
//! get_or_create(key)
//!   ├─ local hit ─────────────────────────────→ value
//!   └─ collapse(key)
//!        ├─ breaker(remote get) hit → local ──→ value
//!        └─ factory → local → remote → publish → value
//! ```

use crate::backend::{RemoteStore, Subscription};
use crate::builder::ManagedCacheBuilder;
use crate::collapse::RequestCollapser;
use crate::entity::{self, CacheValue};
use crate::error::{Error, Result};
use crate::invalidation::{InvalidationListener, InvalidationMessage, INVALIDATION_CHANNEL};
use crate::key::CacheKeyBuilder;
use crate::local::LocalTier;
use crate::memory::spawn_compaction;
use crate::observability::{CacheMetrics, CacheTier};
use crate::resilience::{BreakerState, CircuitBreaker, RetryPolicy};
use crate::serialization::{PostcardSerializer, Serializer};
use std::fmt::Display;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Local + remote cache with stampede protection and cross-process
/// invalidation.
///
/// Cloning is cheap and shares all state. Background tasks stop once the
/// last clone is dropped.
///
/// # Example
///
/// ```
/// use coord_kit::backend::InMemoryStore;
/// use coord_kit::{CacheValue, ManagedCache};
/// use serde::{Deserialize, Serialize};
/// use std::time::Duration;
///
/// #[derive(Clone, Serialize, Deserialize)]
/// struct Profile {
///     name: String,
/// }
///
/// impl CacheValue for Profile {}
///
/// # #[tokio::main]
/// # async fn main() -> coord_kit::Result<()> {
/// let cache = ManagedCache::new(InMemoryStore::new());
///
/// let profile = cache
///     .get_or_create("user:1", Duration::from_secs(60), || async {
///         Ok::<_, std::io::Error>(Profile { name: "Ada".into() })
///     })
///     .await?;
/// assert_eq!(profile.name, "Ada");
/// # Ok(())
/// # }
/// ```
pub struct ManagedCache<R: RemoteStore, S: Serializer = PostcardSerializer> {
    inner: Arc<CacheInner<R, S>>,
    _background: Arc<Vec<BackgroundTask>>,
}

impl<R: RemoteStore, S: Serializer> Clone for ManagedCache<R, S> {
    fn clone(&self) -> Self {
        ManagedCache {
            inner: Arc::clone(&self.inner),
            _background: Arc::clone(&self._background),
        }
    }
}

struct CacheInner<R: RemoteStore, S: Serializer> {
    store: R,
    serializer: S,
    local: Arc<LocalTier>,
    collapser: RequestCollapser<Arc<Vec<u8>>>,
    breaker: CircuitBreaker,
    retry: RetryPolicy,
    metrics: Arc<dyn CacheMetrics>,
    machine_id: String,
    self_notify: bool,
    default_ttl: Duration,
    subscribed: AtomicBool,
    subscription: Mutex<Option<Subscription>>,
}

/// Aborts its task when dropped.
struct BackgroundTask(JoinHandle<()>);

impl Drop for BackgroundTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl<R: RemoteStore> ManagedCache<R, PostcardSerializer> {
    /// Cache with default settings and the postcard format.
    pub fn new(store: R) -> Self {
        ManagedCacheBuilder::new(store).build()
    }

    pub fn builder(store: R) -> ManagedCacheBuilder<R, PostcardSerializer> {
        ManagedCacheBuilder::new(store)
    }
}

impl<R: RemoteStore, S: Serializer> ManagedCache<R, S> {
    pub(crate) fn from_builder(builder: ManagedCacheBuilder<R, S>) -> Self {
        let local = Arc::new(LocalTier::new());
        let inner = Arc::new(CacheInner {
            store: builder.store,
            serializer: builder.serializer,
            local: Arc::clone(&local),
            collapser: RequestCollapser::new(),
            breaker: builder.breaker,
            retry: builder.retry,
            metrics: Arc::clone(&builder.metrics),
            machine_id: builder.machine_id,
            self_notify: builder.self_notify,
            default_ttl: builder.default_ttl,
            subscribed: AtomicBool::new(false),
            subscription: Mutex::new(None),
        });

        let mut background = Vec::new();
        if tokio::runtime::Handle::try_current().is_ok() {
            background.push(BackgroundTask(spawn_liveness(
                Arc::downgrade(&inner),
                builder.subscription_check_interval,
            )));
            if let Some(policy) = builder.compaction {
                background.push(BackgroundTask(spawn_compaction(
                    Arc::downgrade(&local),
                    builder.memory_probe,
                    builder.metrics,
                    policy,
                )));
            }
        } else {
            warn!("⚠ ManagedCache built outside a tokio runtime: no liveness or compaction task");
        }

        info!(
            "✓ ManagedCache ready (machine {}, format {}, default TTL {:?})",
            inner.machine_id,
            inner.serializer.tag(),
            inner.default_ttl
        );

        ManagedCache {
            inner,
            _background: Arc::new(background),
        }
    }

    /// Return the cached value for `key`, creating it with `factory` on a
    /// full miss.
    ///
    /// Within one process at most one factory per key runs at a time;
    /// concurrent callers wait for it and receive the same result, error
    /// included. A zero `ttl` caches without expiry.
    ///
    /// Remote failures are logged and absorbed: the value is then served
    /// from the factory and kept in the local tier only.
    ///
    /// # Errors
    ///
    /// - `Error::ConfigError`: `T` is a primitive or trait object type
    /// - `Error::FactoryError`: the factory failed (nothing is cached)
    /// - `Error::SerializationError`: the value could not be encoded
    /// - `Error::Cancelled`: the caller running the shared execution was dropped
    pub async fn get_or_create<T, F, Fut, E>(&self, key: &str, ttl: Duration, factory: F) -> Result<T>
    where
        T: CacheValue,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Display,
    {
        entity::guard::<T>()?;
        let timer = Instant::now();
        self.subscribe_lazily().await;

        let cache_key = self.cache_key::<T>(key);
        if let Some(value) = self.local_value::<T>(&cache_key) {
            self.inner
                .metrics
                .record_hit(&cache_key, CacheTier::Local, timer.elapsed());
            return Ok(value);
        }

        let bytes = self
            .inner
            .collapser
            .run(&cache_key, || {
                self.load_or_create::<T, F, Fut, E>(&cache_key, ttl, timer, factory)
            })
            .await?;
        self.decode(&bytes)
    }

    /// Body of one collapsed execution.
    async fn load_or_create<T, F, Fut, E>(
        &self,
        cache_key: &str,
        ttl: Duration,
        timer: Instant,
        factory: F,
    ) -> Result<Arc<Vec<u8>>>
    where
        T: CacheValue,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Display,
    {
        // A previous generation may have filled the tier since our check.
        if let Some(bytes) = self.inner.local.get(cache_key) {
            return Ok(bytes);
        }

        if let Some(bytes) = self.read_remote::<T>(cache_key, ttl).await {
            self.inner
                .metrics
                .record_hit(cache_key, CacheTier::Remote, timer.elapsed());
            return Ok(bytes);
        }
        self.inner.metrics.record_miss(cache_key, timer.elapsed());

        let started = Instant::now();
        let value = factory()
            .await
            .map_err(|e| Error::FactoryError(e.to_string()))?;
        self.inner
            .metrics
            .record_factory(cache_key, started.elapsed());
        debug!("Factory produced {} in {:?}", cache_key, started.elapsed());

        let bytes = Arc::new(self.inner.serializer.serialize(&value)?);
        self.inner.local.insert(cache_key, Arc::clone(&bytes), ttl);
        self.write_remote(cache_key, &bytes, ttl).await;
        Ok(bytes)
    }

    /// Tier lookup without a factory. Remote failures read as a miss.
    pub async fn get<T: CacheValue>(&self, key: &str) -> Result<Option<T>> {
        entity::guard::<T>()?;
        let timer = Instant::now();
        self.subscribe_lazily().await;

        let cache_key = self.cache_key::<T>(key);
        if let Some(value) = self.local_value::<T>(&cache_key) {
            self.inner
                .metrics
                .record_hit(&cache_key, CacheTier::Local, timer.elapsed());
            return Ok(Some(value));
        }

        match self
            .read_remote::<T>(&cache_key, self.inner.default_ttl)
            .await
        {
            Some(bytes) => {
                self.inner
                    .metrics
                    .record_hit(&cache_key, CacheTier::Remote, timer.elapsed());
                self.decode(&bytes).map(Some)
            }
            None => {
                self.inner.metrics.record_miss(&cache_key, timer.elapsed());
                Ok(None)
            }
        }
    }

    /// Write both tiers and invalidate other processes' local copies.
    ///
    /// The remote write is best-effort: while the breaker is open or the
    /// store fails, the value lives in this process's local tier only.
    pub async fn set<T: CacheValue>(&self, key: &str, value: &T, ttl: Duration) -> Result<()> {
        entity::guard::<T>()?;
        self.subscribe_lazily().await;

        let cache_key = self.cache_key::<T>(key);
        let bytes = Arc::new(self.inner.serializer.serialize(value)?);
        self.inner.local.insert(&cache_key, Arc::clone(&bytes), ttl);
        self.write_remote(&cache_key, &bytes, ttl).await;
        Ok(())
    }

    /// Remove `key` from both tiers and invalidate other processes.
    ///
    /// The remote delete is retried with backoff through the breaker.
    ///
    /// # Errors
    ///
    /// The last remote error once retries are exhausted, or
    /// `Error::CircuitOpen`. The local entry is gone either way.
    pub async fn delete<T: CacheValue>(&self, key: &str) -> Result<()> {
        entity::guard::<T>()?;
        let cache_key = self.cache_key::<T>(key);
        self.inner.local.remove(&cache_key);

        let store = &self.inner.store;
        if let Err(e) = self
            .inner
            .retry
            .run(&self.inner.breaker, || store.delete(&cache_key))
            .await
        {
            error!("✗ Remote delete of {} failed: {}", cache_key, e);
            self.inner.metrics.record_error(&cache_key, &e.to_string());
            return Err(e);
        }

        debug!("✓ Deleted {} from both tiers", cache_key);
        self.publish_invalidation(&cache_key).await;
        Ok(())
    }

    /// Whether this process's local tier holds a live entry for `key`.
    pub fn contains_local<T: CacheValue>(&self, key: &str) -> bool {
        self.inner.local.contains(&self.cache_key::<T>(key))
    }

    /// Drop `key` from the local tier only. Returns whether it was present.
    pub fn invalidate_local<T: CacheValue>(&self, key: &str) -> bool {
        self.inner.local.remove(&self.cache_key::<T>(key))
    }

    pub fn local_len(&self) -> usize {
        self.inner.local.len()
    }

    pub fn default_ttl(&self) -> Duration {
        self.inner.default_ttl
    }

    pub fn machine_id(&self) -> &str {
        &self.inner.machine_id
    }

    pub fn breaker_state(&self) -> BreakerState {
        self.inner.breaker.state()
    }

    /// Make sure the invalidation subscription is alive, re-creating it if
    /// the delivery task has ended.
    ///
    /// Re-establishing a subscription clears the local tier, since
    /// invalidations may have been missed in between.
    pub async fn ensure_subscribed(&self) -> Result<()> {
        self.inner.ensure_subscribed().await
    }

    fn cache_key<T: CacheValue>(&self, key: &str) -> String {
        CacheKeyBuilder::build::<T, S>(&self.inner.serializer, key)
    }

    fn decode<T: CacheValue>(&self, bytes: &[u8]) -> Result<T> {
        self.inner.serializer.deserialize(bytes)
    }

    fn local_value<T: CacheValue>(&self, cache_key: &str) -> Option<T> {
        let bytes = self.inner.local.get(cache_key)?;
        match self.decode::<T>(&bytes) {
            Ok(value) => {
                debug!("✓ Local hit for {}", cache_key);
                Some(value)
            }
            Err(e) => {
                warn!("⚠ Dropping undecodable local entry {}: {}", cache_key, e);
                self.inner.local.remove(cache_key);
                None
            }
        }
    }

    /// Remote lookup through the breaker. On a hit the local tier is filled
    /// with the remote's remaining TTL, or `ttl` when the entry never
    /// expires remotely.
    async fn read_remote<T: CacheValue>(&self, cache_key: &str, ttl: Duration) -> Option<Arc<Vec<u8>>> {
        match self
            .inner
            .breaker
            .call(self.inner.store.get(cache_key))
            .await
        {
            Ok(Some(stored)) if stored.ttl_remaining == Some(Duration::ZERO) => {
                // Expiring this instant; a zero local TTL would mean "forever".
                debug!("✗ Remote entry {} at end of life, treated as miss", cache_key);
                None
            }
            Ok(Some(stored)) => {
                if let Err(e) = self.decode::<T>(&stored.data) {
                    warn!("⚠ Ignoring undecodable remote entry {}: {}", cache_key, e);
                    return None;
                }
                let local_ttl = stored.ttl_remaining.unwrap_or(ttl);
                let bytes = Arc::new(stored.data);
                self.inner
                    .local
                    .insert(cache_key, Arc::clone(&bytes), local_ttl);
                debug!("✓ Remote hit for {} (local TTL {:?})", cache_key, local_ttl);
                Some(bytes)
            }
            Ok(None) => {
                debug!("✗ Remote miss for {}", cache_key);
                None
            }
            Err(e) => {
                warn!("⚠ Remote read of {} failed, serving without it: {}", cache_key, e);
                self.inner.metrics.record_error(cache_key, &e.to_string());
                None
            }
        }
    }

    /// Best-effort remote write followed by an invalidation.
    async fn write_remote(&self, cache_key: &str, bytes: &[u8], ttl: Duration) {
        match self
            .inner
            .breaker
            .call(self.inner.store.set(cache_key, bytes.to_vec(), ttl))
            .await
        {
            Ok(()) => {
                debug!("✓ Remote write of {} (TTL {:?})", cache_key, ttl);
                self.publish_invalidation(cache_key).await;
            }
            Err(e) => {
                warn!("⚠ Remote write of {} dropped: {}", cache_key, e);
                self.inner.metrics.record_error(cache_key, &e.to_string());
            }
        }
    }

    async fn publish_invalidation(&self, cache_key: &str) {
        let message = match InvalidationMessage::new(&self.inner.machine_id, cache_key).encode() {
            Ok(message) => message,
            Err(e) => {
                error!("✗ Could not encode invalidation for {}: {}", cache_key, e);
                return;
            }
        };

        if let Err(e) = self
            .inner
            .breaker
            .call(self.inner.store.publish(INVALIDATION_CHANNEL, message))
            .await
        {
            warn!("⚠ Invalidation for {} not published: {}", cache_key, e);
            self.inner.metrics.record_error(cache_key, &e.to_string());
        }
    }

    async fn subscribe_lazily(&self) {
        if self.inner.subscribed.load(Ordering::Acquire) {
            return;
        }
        if let Err(e) = self.inner.ensure_subscribed().await {
            warn!("⚠ Invalidation subscription unavailable, will retry: {}", e);
        }
    }
}

impl<R: RemoteStore, S: Serializer> CacheInner<R, S> {
    async fn ensure_subscribed(&self) -> Result<()> {
        let mut slot = self.subscription.lock().await;
        match slot.as_ref() {
            Some(subscription) if subscription.is_alive() => return Ok(()),
            Some(_) => error!(
                "✗ Invalidation subscription on {} lost, resubscribing",
                INVALIDATION_CHANNEL
            ),
            None => {}
        }

        let listener = Arc::new(InvalidationListener::new(
            self.machine_id.clone(),
            self.self_notify,
            Arc::clone(&self.local),
            Arc::clone(&self.metrics),
        ));
        let subscription = self
            .store
            .subscribe(INVALIDATION_CHANNEL, listener.into_handler())
            .await?;

        // Anything cached while unsubscribed may be stale.
        let stale = self.local.len();
        if stale > 0 {
            self.local.clear();
            warn!(
                "⚠ Cleared {} local entries after (re)subscribing to {}",
                stale, INVALIDATION_CHANNEL
            );
        }

        *slot = Some(subscription);
        self.subscribed.store(true, Ordering::Release);
        info!(
            "✓ Subscribed to {} as {}",
            INVALIDATION_CHANNEL, self.machine_id
        );
        Ok(())
    }
}

fn spawn_liveness<R: RemoteStore, S: Serializer>(
    cache: Weak<CacheInner<R, S>>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let Some(cache) = cache.upgrade() else {
                break;
            };
            if let Err(e) = cache.ensure_subscribed().await {
                warn!("⚠ Subscription check failed: {}", e);
            }
            let purged = cache.local.purge_expired();
            if purged > 0 {
                debug!("Purged {} expired local entries", purged);
            }
        }
    })
}
