//! Redis store implementation.

use super::{ChannelEvent, MessageHandler, RemoteStore, Script, StoredValue, Subscription};
use crate::error::{Error, Result};
use dashmap::DashMap;
use deadpool_redis::redis::{self, AsyncCommands};
use deadpool_redis::{Config, Pool, PoolConfig, Runtime};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;

/// Default Redis connection pool size.
/// Formula: (CPU cores × 2) + 1
/// For 8-core systems: 16 connections is optimal
/// Override with REDIS_POOL_SIZE environment variable
const DEFAULT_POOL_SIZE: usize = 16;

/// Compare-and-delete: only the holder of the token may release a lease.
const RELEASE_LEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// Expiry in milliseconds for `PX`: at least 1, at most `i64::MAX`.
fn px_millis(ttl: Duration) -> u64 {
    ttl.as_millis().clamp(1, i64::MAX as u128) as u64
}

/// Configuration for the Redis backend.
#[derive(Clone, Debug)]
pub struct RedisConfig {
    pub url: String, // e.g., "redis://localhost:6379/0"
    pub connection_timeout: Duration,
    pub pool_size: usize,
}

impl Default for RedisConfig {
    fn default() -> Self {
        RedisConfig {
            url: "redis://127.0.0.1:6379".to_string(),
            connection_timeout: Duration::from_secs(5),
            pool_size: 10,
        }
    }
}

/// Redis store with a pooled command connection and one dedicated
/// connection per pub/sub subscription.
///
/// # Example
///
/// ```no_run
/// # use coord_kit::backend::{RedisStore, RedisConfig, RemoteStore};
/// # use coord_kit::error::Result;
/// # use std::time::Duration;
/// # async fn example() -> Result<()> {
/// let config = RedisConfig {
///     url: "redis://localhost:6379".to_string(),
///     ..Default::default()
/// };
///
/// let store = RedisStore::new(config).await?;
/// store.set("key", b"value".to_vec(), Duration::from_secs(60)).await?;
/// let value = store.get("key").await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RedisStore {
    pool: Pool,
    client: ::redis::Client,
    release_script: Arc<redis::Script>,
    script_hashes: Arc<DashMap<&'static str, String>>,
}

impl RedisStore {
    /// Create new Redis store from configuration.
    ///
    /// # Errors
    /// Returns `Err` if the URL is invalid or pool creation fails
    pub async fn new(config: RedisConfig) -> Result<Self> {
        let mut pool_config = PoolConfig::new(config.pool_size);
        pool_config.timeouts.wait = Some(config.connection_timeout);
        pool_config.timeouts.create = Some(config.connection_timeout);

        let mut cfg = Config::from_url(config.url.clone());
        cfg.pool = Some(pool_config);
        let pool = cfg
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| Error::ConfigError(format!("Failed to create connection pool: {}", e)))?;

        let client = ::redis::Client::open(config.url.as_str())
            .map_err(|e| Error::ConfigError(format!("Invalid Redis URL: {}", e)))?;

        info!(
            "✓ Redis backend initialized with server: {} (pool size: {})",
            config.url, config.pool_size
        );

        Ok(RedisStore {
            pool,
            client,
            release_script: Arc::new(redis::Script::new(RELEASE_LEASE_SCRIPT)),
            script_hashes: Arc::new(DashMap::new()),
        })
    }

    /// Create from a connection string directly.
    ///
    /// Pool size is determined by:
    /// 1. `REDIS_POOL_SIZE` environment variable (if set)
    /// 2. `DEFAULT_POOL_SIZE` constant (16)
    ///
    /// # Errors
    /// Returns `Err` if the URL is invalid or pool creation fails
    pub async fn from_url(url: impl Into<String>) -> Result<Self> {
        let pool_size = std::env::var("REDIS_POOL_SIZE")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(DEFAULT_POOL_SIZE);

        let config = RedisConfig {
            url: url.into(),
            pool_size,
            ..Default::default()
        };
        Self::new(config).await
    }

    fn script_hash(&self, script: &'static Script) -> String {
        self.script_hashes
            .entry(script.name)
            .or_insert_with(|| redis::Script::new(script.source).get_hash().to_string())
            .value()
            .clone()
    }
}

impl RemoteStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<StoredValue>> {
        let mut conn = self.pool.get().await?;

        let (data, pttl): (Option<Vec<u8>>, i64) = redis::pipe()
            .atomic()
            .get(key)
            .cmd("PTTL")
            .arg(key)
            .query_async(&mut conn)
            .await?;

        match (data, pttl) {
            // PTTL is -2 once the key is gone.
            (Some(data), pttl) if pttl != -2 => {
                debug!("✓ Redis GET {} -> HIT", key);
                // PTTL is -1 for keys without expiry.
                let ttl_remaining = u64::try_from(pttl).ok().map(Duration::from_millis);
                Ok(Some(StoredValue {
                    data,
                    ttl_remaining,
                }))
            }
            _ => {
                debug!("✓ Redis GET {} -> MISS", key);
                Ok(None)
            }
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()> {
        let mut conn = self.pool.get().await?;

        if ttl.is_zero() {
            conn.set::<_, _, ()>(key, value).await?;
        } else {
            conn.pset_ex::<_, _, ()>(key, value, px_millis(ttl)).await?;
        }

        debug!("✓ Redis SET {} (TTL: {:?})", key, ttl);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.pool.get().await?;
        conn.del::<_, ()>(key).await?;
        debug!("✓ Redis DELETE {}", key);
        Ok(())
    }

    async fn publish(&self, channel: &str, message: Vec<u8>) -> Result<()> {
        let mut conn = self.pool.get().await?;
        conn.publish::<_, _, ()>(channel, message).await?;
        debug!("✓ Redis PUBLISH {}", channel);
        Ok(())
    }

    async fn subscribe(&self, channel: &str, handler: MessageHandler) -> Result<Subscription> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| Error::BackendError(format!("Failed to get pub/sub connection: {}", e)))?;
        pubsub
            .subscribe(channel)
            .await
            .map_err(|e| Error::BackendError(format!("Failed to subscribe to {}: {}", channel, e)))?;

        info!("✓ Subscribed to Redis channel {}", channel);

        let name = channel.to_string();
        let task = tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                handler(ChannelEvent::Message(msg.get_payload_bytes().to_vec()));
            }
            error!("✗ Redis pub/sub connection for {} closed", name);
        });

        Ok(Subscription::new(channel, task))
    }

    async fn acquire_lease(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.pool.get().await?;
        let millis = px_millis(ttl);

        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(millis)
            .query_async(&mut conn)
            .await?;

        Ok(reply.is_some())
    }

    async fn release_lease(&self, key: &str, token: &str) -> Result<bool> {
        let mut conn = self.pool.get().await?;
        let deleted: i64 = self
            .release_script
            .key(key)
            .arg(token)
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted == 1)
    }

    async fn load_script(&self, script: &'static Script) -> Result<()> {
        let mut conn = self.pool.get().await?;
        let sha: String = redis::cmd("SCRIPT")
            .arg("LOAD")
            .arg(script.source)
            .query_async(&mut conn)
            .await?;

        debug!("✓ Redis SCRIPT LOAD {} -> {}", script.name, sha);
        self.script_hashes.insert(script.name, sha);
        Ok(())
    }

    async fn eval_script(
        &self,
        script: &'static Script,
        keys: &[String],
        args: &[i64],
    ) -> Result<Vec<i64>> {
        let sha = self.script_hash(script);
        let mut conn = self.pool.get().await?;

        let mut cmd = redis::cmd("EVALSHA");
        cmd.arg(&sha).arg(keys.len());
        for key in keys {
            cmd.arg(key);
        }
        for arg in args {
            cmd.arg(*arg);
        }

        // NOSCRIPT replies become Error::ScriptNotFound via From<RedisError>.
        let reply: Vec<i64> = cmd.query_async(&mut conn).await?;
        Ok(reply)
    }

    async fn health_check(&self) -> Result<bool> {
        match self.pool.get().await {
            Ok(mut conn) => {
                let pong: redis::RedisResult<String> =
                    redis::cmd("PING").query_async(&mut conn).await;
                Ok(pong.is_ok())
            }
            Err(_) => Ok(false),
        }
    }
}
