//! Explicit startup wiring for the coordination components.

use crate::backend::RemoteStore;
use crate::builder::ManagedCacheBuilder;
use crate::cache::ManagedCache;
use crate::config::CoordConfig;
use crate::error::{Error, Result};
use crate::lock::DistributedLock;
use crate::rate_limit::{RateLimitResult, RateLimitWindow, RateLimiter};
use crate::serialization::PostcardSerializer;
use std::collections::HashMap;
use std::sync::Arc;

/// Cache, rate limiter and lock sharing one store, built from one config.
///
/// Cloning is cheap; hand clones to request handlers.
///
/// # Example
///
/// ```
/// use coord_kit::{CoordConfig, Coordinator};
///
/// # #[tokio::main]
/// # async fn main() -> coord_kit::Result<()> {
/// let coordinator = Coordinator::in_memory(&CoordConfig::default())?;
/// let cache = coordinator.cache();
/// assert!(coordinator.window("login").is_none());
/// # let _ = cache;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Coordinator<R: RemoteStore> {
    store: R,
    cache: ManagedCache<R, PostcardSerializer>,
    rate_limiter: RateLimiter<R>,
    lock: DistributedLock<R>,
    windows: Arc<HashMap<String, RateLimitWindow>>,
}

impl<R: RemoteStore> Coordinator<R> {
    /// Wire every component on `store`.
    ///
    /// # Errors
    ///
    /// `Error::ConfigError` when `config` fails validation.
    pub fn new(store: R, config: &CoordConfig) -> Result<Self> {
        config.validate()?;

        let cache = ManagedCacheBuilder::from_config(store.clone(), config).build();
        let rate_limiter = RateLimiter::new(store.clone());
        let lock = DistributedLock::new(store.clone()).with_poll_interval(config.lock_poll_interval());

        info!(
            "✓ Coordinator initialised (machine {}, {} rate limit windows)",
            config.machine_id,
            config.rate_limit_windows.len()
        );

        Ok(Coordinator {
            store,
            cache,
            rate_limiter,
            lock,
            windows: Arc::new(config.rate_limit_windows.clone()),
        })
    }

    pub fn store(&self) -> &R {
        &self.store
    }

    pub fn cache(&self) -> &ManagedCache<R, PostcardSerializer> {
        &self.cache
    }

    pub fn rate_limiter(&self) -> &RateLimiter<R> {
        &self.rate_limiter
    }

    pub fn lock(&self) -> &DistributedLock<R> {
        &self.lock
    }

    /// Configured rate-limit window by name.
    pub fn window(&self, name: &str) -> Option<&RateLimitWindow> {
        self.windows.get(name)
    }

    /// Check `key` against the configured window `name`.
    pub async fn check_rate_limit(&self, name: &str, key: &str) -> Result<RateLimitResult> {
        let window = self
            .window(name)
            .ok_or_else(|| Error::ConfigError(format!("Unknown rate limit window: {}", name)))?;
        self.rate_limiter.check(key, window).await
    }

    /// Ping the store.
    pub async fn health_check(&self) -> Result<bool> {
        self.store.health_check().await
    }
}

#[cfg(feature = "inmemory")]
impl Coordinator<crate::backend::InMemoryStore> {
    /// Coordinator over a fresh in-process store.
    pub fn in_memory(config: &CoordConfig) -> Result<Self> {
        Coordinator::new(crate::backend::InMemoryStore::new(), config)
    }
}

#[cfg(feature = "redis")]
impl Coordinator<crate::backend::RedisStore> {
    /// Connect to `config.connection_string` and wire every component.
    pub async fn connect(config: &CoordConfig) -> Result<Self> {
        let store = crate::backend::RedisStore::from_url(config.connection_string.clone()).await?;
        Coordinator::new(store, config)
    }
}

#[cfg(all(test, feature = "inmemory"))]
mod tests {
    use super::*;
    use crate::rate_limit::WindowEntry;
    use std::time::Duration;

    fn config_with_login_window() -> CoordConfig {
        let mut config = CoordConfig::default();
        config.rate_limit_windows.insert(
            "login".to_string(),
            RateLimitWindow::new(1, vec![WindowEntry::new(2, 60)]),
        );
        config
    }

    #[tokio::test]
    async fn test_named_window_check() {
        let coordinator = Coordinator::in_memory(&config_with_login_window()).expect("wire");

        assert!(!coordinator
            .check_rate_limit("login", "10.0.0.1")
            .await
            .expect("check")
            .over_limit);
        assert!(!coordinator
            .check_rate_limit("login", "10.0.0.1")
            .await
            .expect("check")
            .over_limit);
        assert!(coordinator
            .check_rate_limit("login", "10.0.0.1")
            .await
            .expect("check")
            .over_limit);

        let err = coordinator
            .check_rate_limit("signup", "10.0.0.1")
            .await
            .expect_err("unknown window");
        assert!(matches!(err, Error::ConfigError(_)));
    }

    #[tokio::test]
    async fn test_invalid_config_fails_fast() {
        let mut config = CoordConfig::default();
        config
            .rate_limit_windows
            .insert("broken".to_string(), RateLimitWindow::new(9, vec![]));
        assert!(matches!(
            Coordinator::in_memory(&config),
            Err(Error::ConfigError(_))
        ));
    }

    #[tokio::test]
    async fn test_components_share_store() {
        let coordinator = Coordinator::in_memory(&CoordConfig::default()).expect("wire");
        assert!(coordinator.health_check().await.expect("health"));

        let handle = coordinator
            .lock()
            .try_acquire("job", Duration::from_secs(10), Duration::ZERO)
            .await
            .expect("acquire")
            .expect("free");
        let value = coordinator
            .store()
            .get("lock:job")
            .await
            .expect("get")
            .expect("lease visible on shared store");
        assert_eq!(value.data, handle.token().as_bytes());
        handle.release().await;
    }
}
