//! Distributed mutual exclusion built on store leases.

use crate::backend::RemoteStore;
use crate::error::{Error, Result};
use crate::key::CacheKeyBuilder;
use std::time::Duration;
use tokio::time::Instant;

/// Default delay between acquisition attempts.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Lease-based lock shared by every process using the same store.
///
/// A holder proves ownership with a random token, so only the process that
/// acquired a lease can release it. A crashed holder's lease expires on its
/// own. Waiters poll; there is no FIFO fairness.
///
/// # Example
///
/// ```
/// use coord_kit::backend::InMemoryStore;
/// use coord_kit::lock::DistributedLock;
/// use std::time::Duration;
///
/// # #[tokio::main]
/// # async fn main() -> coord_kit::Result<()> {
/// let lock = DistributedLock::new(InMemoryStore::new());
///
/// if let Some(handle) = lock
///     .try_acquire("invoice:7", Duration::from_secs(30), Duration::from_secs(1))
///     .await?
/// {
///     // critical section
///     handle.release().await;
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct DistributedLock<R: RemoteStore> {
    store: R,
    poll_interval: Duration,
}

impl<R: RemoteStore> DistributedLock<R> {
    pub fn new(store: R) -> Self {
        DistributedLock {
            store,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.max(Duration::from_millis(1));
        self
    }

    /// Try to take the lock on `key` for `lease`, waiting up to `timeout`.
    ///
    /// Returns `Ok(None)` when the lock is still held by someone else once
    /// `timeout` has passed. A zero `timeout` makes exactly one attempt.
    /// Store errors during acquisition count as failed attempts. When a
    /// lease turns out to already carry this call's token (the reply to an
    /// earlier attempt was lost) the lock is held and returned.
    ///
    /// # Errors
    ///
    /// `Error::ConfigError` for a zero `lease`.
    pub async fn try_acquire(
        &self,
        key: &str,
        lease: Duration,
        timeout: Duration,
    ) -> Result<Option<LockHandle<R>>> {
        if lease.is_zero() {
            return Err(Error::ConfigError(format!(
                "Lock lease for {} must be positive",
                key
            )));
        }

        let lock_key = CacheKeyBuilder::lock(key);
        let token = uuid::Uuid::new_v4().to_string();
        // None: too far out to represent, wait indefinitely.
        let deadline = Instant::now().checked_add(timeout);
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let acquired = match self.store.acquire_lease(&lock_key, &token, lease).await {
                Ok(true) => true,
                Ok(false) => self.holds(&lock_key, &token).await,
                Err(e) => {
                    warn!("⚠ Lock attempt {} on {} failed: {}", attempts, lock_key, e);
                    false
                }
            };
            if acquired {
                debug!("✓ Lock {} acquired after {} attempt(s)", lock_key, attempts);
                return Ok(Some(LockHandle {
                    store: self.store.clone(),
                    key: lock_key,
                    token,
                    lease,
                    released: false,
                }));
            }

            let now = Instant::now();
            let pause = match deadline {
                Some(deadline) if now >= deadline => {
                    debug!("✗ Lock {} not acquired within {:?}", lock_key, timeout);
                    return Ok(None);
                }
                Some(deadline) => self.poll_interval.min(deadline - now),
                None => self.poll_interval,
            };
            tokio::time::sleep(pause).await;
        }
    }

    /// Whether the lease on `lock_key` carries `token`.
    async fn holds(&self, lock_key: &str, token: &str) -> bool {
        match self.store.get(lock_key).await {
            Ok(Some(value)) if value.data == token.as_bytes() => {
                warn!("⚠ Lock {} already held under our token, earlier reply was lost", lock_key);
                true
            }
            Ok(_) => false,
            Err(e) => {
                warn!("⚠ Could not read lease {}: {}", lock_key, e);
                false
            }
        }
    }
}

/// A held lock. Released by [`LockHandle::release`] or when dropped.
pub struct LockHandle<R: RemoteStore> {
    store: R,
    key: String,
    token: String,
    lease: Duration,
    released: bool,
}

impl<R: RemoteStore> LockHandle<R> {
    /// Store key of the lease (`lock:{key}`).
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn lease(&self) -> Duration {
        self.lease
    }

    /// Whether the store still holds this handle's lease.
    ///
    /// False after expiry even if nobody else has taken the lock. A store
    /// error reads as not held.
    pub async fn is_held(&self) -> bool {
        match self.store.get(&self.key).await {
            Ok(Some(value)) => value.data == self.token.as_bytes(),
            Ok(None) => false,
            Err(e) => {
                warn!("⚠ Could not read lease {}: {}", self.key, e);
                false
            }
        }
    }

    /// Release the lease. Returns whether the store confirmed it.
    ///
    /// A failed release is not an error: the lease expires on its own.
    pub async fn release(mut self) -> bool {
        self.released = true;
        release_lease(&self.store, &self.key, &self.token).await
    }
}

async fn release_lease<R: RemoteStore>(store: &R, key: &str, token: &str) -> bool {
    match store.release_lease(key, token).await {
        Ok(true) => {
            debug!("✓ Lock {} released", key);
            true
        }
        Ok(false) => {
            debug!("Lock {} had already expired or changed hands", key);
            false
        }
        Err(e) => {
            warn!("⚠ Failed to release lock {}, lease will expire: {}", key, e);
            false
        }
    }
}

impl<R: RemoteStore> Drop for LockHandle<R> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("⚠ Lock {} dropped outside a runtime, lease will expire", self.key);
            return;
        };

        let store = self.store.clone();
        let key = std::mem::take(&mut self.key);
        let token = std::mem::take(&mut self.token);
        runtime.spawn(async move {
            release_lease(&store, &key, &token).await;
        });
    }
}

#[cfg(all(test, feature = "inmemory"))]
mod tests {
    use super::*;
    use crate::backend::{InMemoryStore, MessageHandler, Script, StoredValue, Subscription};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Store whose first lease grant is applied but answered with an error.
    #[derive(Clone, Default)]
    struct LostReplyStore {
        inner: InMemoryStore,
        dropped: Arc<AtomicBool>,
        attempts: Arc<AtomicUsize>,
    }

    impl RemoteStore for LostReplyStore {
        async fn get(&self, key: &str) -> Result<Option<StoredValue>> {
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()> {
            self.inner.set(key, value, ttl).await
        }

        async fn delete(&self, key: &str) -> Result<()> {
            self.inner.delete(key).await
        }

        async fn publish(&self, channel: &str, message: Vec<u8>) -> Result<()> {
            self.inner.publish(channel, message).await
        }

        async fn subscribe(&self, channel: &str, handler: MessageHandler) -> Result<Subscription> {
            self.inner.subscribe(channel, handler).await
        }

        async fn acquire_lease(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let granted = self.inner.acquire_lease(key, token, ttl).await?;
            if granted && !self.dropped.swap(true, Ordering::SeqCst) {
                return Err(Error::BackendError("read timed out".into()));
            }
            Ok(granted)
        }

        async fn release_lease(&self, key: &str, token: &str) -> Result<bool> {
            self.inner.release_lease(key, token).await
        }

        async fn load_script(&self, script: &'static Script) -> Result<()> {
            self.inner.load_script(script).await
        }

        async fn eval_script(
            &self,
            script: &'static Script,
            keys: &[String],
            args: &[i64],
        ) -> Result<Vec<i64>> {
            self.inner.eval_script(script, keys, args).await
        }

        async fn health_check(&self) -> Result<bool> {
            Ok(true)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_grant_reply_still_acquires() {
        let store = LostReplyStore::default();
        let lock = DistributedLock::new(store.clone());

        let handle = lock
            .try_acquire("job", Duration::from_secs(30), Duration::from_secs(1))
            .await
            .expect("acquire")
            .expect("own lease recognised");
        assert_eq!(store.attempts.load(Ordering::SeqCst), 2);
        assert!(handle.is_held().await);
        assert!(handle.release().await);
        assert!(store.inner.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_timeout_keeps_waiting() {
        let lock = DistributedLock::new(InMemoryStore::new());
        let held = lock
            .try_acquire("k", Duration::from_secs(5), Duration::ZERO)
            .await
            .expect("acquire")
            .expect("free lock");

        // Lease expiry frees the lock; a Duration::MAX timeout must not
        // overflow while waiting for it.
        let next = lock
            .try_acquire("k", Duration::from_secs(5), Duration::MAX)
            .await
            .expect("acquire");
        assert!(next.is_some());
        drop(held);
    }

    #[tokio::test]
    async fn test_second_acquire_fails_while_held() {
        let lock = DistributedLock::new(InMemoryStore::new());
        let lease = Duration::from_secs(30);

        let first = lock
            .try_acquire("job", lease, Duration::ZERO)
            .await
            .expect("acquire")
            .expect("free lock");
        assert_eq!(first.key(), "lock:job");
        assert!(first.is_held().await);

        let second = lock
            .try_acquire("job", lease, Duration::from_millis(250))
            .await
            .expect("acquire");
        assert!(second.is_none());

        assert!(first.release().await);
        let third = lock
            .try_acquire("job", lease, Duration::ZERO)
            .await
            .expect("acquire");
        assert!(third.is_some());
    }

    #[tokio::test]
    async fn test_waiter_acquires_after_release() {
        let lock = DistributedLock::new(InMemoryStore::new())
            .with_poll_interval(Duration::from_millis(10));
        let lease = Duration::from_secs(30);

        let held = lock
            .try_acquire("k", lease, Duration::ZERO)
            .await
            .expect("acquire")
            .expect("free lock");

        let waiter = {
            let lock = lock.clone();
            tokio::spawn(async move { lock.try_acquire("k", lease, Duration::from_secs(2)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        held.release().await;

        let handle = waiter
            .await
            .expect("join")
            .expect("acquire")
            .expect("acquired after release");
        assert!(handle.is_held().await);
    }

    #[tokio::test]
    async fn test_mutual_exclusion_under_contention() {
        let lock = DistributedLock::new(InMemoryStore::new())
            .with_poll_interval(Duration::from_millis(1));
        let inside = Arc::new(AtomicUsize::new(0));
        let completed = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let lock = lock.clone();
            let inside = inside.clone();
            let completed = completed.clone();
            tasks.push(tokio::spawn(async move {
                let handle = lock
                    .try_acquire("shared", Duration::from_secs(30), Duration::from_secs(10))
                    .await
                    .expect("acquire")
                    .expect("acquired eventually");
                assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                tokio::time::sleep(Duration::from_millis(5)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
                completed.fetch_add(1, Ordering::SeqCst);
                handle.release().await;
            }));
        }
        for task in futures::future::join_all(tasks).await {
            task.expect("task panicked");
        }
        assert_eq!(completed.load(Ordering::SeqCst), 8);
    }

    #[tokio::test]
    async fn test_drop_releases_lease() {
        let store = InMemoryStore::new();
        let lock = DistributedLock::new(store.clone());

        {
            let _handle = lock
                .try_acquire("k", Duration::from_secs(30), Duration::ZERO)
                .await
                .expect("acquire")
                .expect("free lock");
        }

        let mut reacquired = None;
        for _ in 0..100 {
            reacquired = lock
                .try_acquire("k", Duration::from_secs(30), Duration::ZERO)
                .await
                .expect("acquire");
            if reacquired.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(reacquired.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_expires_without_release() {
        let lock = DistributedLock::new(InMemoryStore::new());
        let handle = lock
            .try_acquire("k", Duration::from_secs(5), Duration::ZERO)
            .await
            .expect("acquire")
            .expect("free lock");

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(!handle.is_held().await);
        let other = lock
            .try_acquire("k", Duration::from_secs(5), Duration::ZERO)
            .await
            .expect("acquire");
        assert!(other.is_some());
        // The stale handle cannot release the new holder's lease.
        assert!(!handle.release().await);
    }

    #[tokio::test]
    async fn test_zero_lease_rejected() {
        let lock = DistributedLock::new(InMemoryStore::new());
        let result = lock.try_acquire("k", Duration::ZERO, Duration::ZERO).await;
        assert!(matches!(result, Err(Error::ConfigError(_))));
    }
}
