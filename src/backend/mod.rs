//! Remote store abstraction shared by the cache, lock and rate limiter.
//!
//! A [`RemoteStore`] is a key/value store with expiry, publish/subscribe,
//! leases and atomic server-side scripts. Any call may fail with a
//! transient `Error::BackendError`; callers decide whether to absorb it.

use crate::error::Result;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

#[cfg(feature = "inmemory")]
pub mod inmemory;

#[cfg(feature = "redis")]
pub mod redis;

#[cfg(feature = "inmemory")]
pub use inmemory::InMemoryStore;

#[cfg(feature = "redis")]
pub use self::redis::{RedisConfig, RedisStore};

/// A value read from the store together with its remaining lifetime.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredValue {
    pub data: Vec<u8>,
    /// `None` when the entry never expires.
    pub ttl_remaining: Option<Duration>,
}

/// Delivery from a pub/sub subscription.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChannelEvent {
    Message(Vec<u8>),
    /// The subscriber fell behind and `n` messages were lost.
    Lagged(u64),
}

/// Callback invoked for every event on a subscribed channel.
///
/// Runs on the delivery task; keep it cheap.
pub type MessageHandler = Arc<dyn Fn(ChannelEvent) + Send + Sync>;

/// Live subscription to one channel. Delivery stops when dropped.
pub struct Subscription {
    channel: String,
    task: JoinHandle<()>,
}

impl Subscription {
    pub fn new(channel: impl Into<String>, task: JoinHandle<()>) -> Self {
        Subscription {
            channel: channel.into(),
            task,
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// False once the delivery task has ended (connection lost, channel
    /// closed).
    pub fn is_alive(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Store operations available to a native script implementation.
///
/// Mirrors the subset of commands the Lua scripts use.
pub trait ScriptContext {
    /// Increment an integer counter, creating it at 0 first. Keeps any
    /// existing expiry.
    fn incr(&mut self, key: &str) -> i64;

    /// Set the expiry of an existing key.
    fn expire(&mut self, key: &str, ttl: Duration);

    fn del(&mut self, key: &str);
}

/// Native implementation of a script for stores that cannot run Lua.
pub type NativeScript = fn(&mut dyn ScriptContext, &[String], &[i64]) -> Vec<i64>;

/// A server-side script executed atomically by the store.
pub struct Script {
    /// Stable identifier, used in logs and by stores that cache by name.
    pub name: &'static str,
    /// Lua source, as run by Redis.
    pub source: &'static str,
    /// Equivalent native implementation, as run by the in-memory store.
    pub native: NativeScript,
}

/// Key/value + pub/sub store shared by every process.
///
/// A zero `ttl` means the entry never expires.
pub trait RemoteStore: Clone + Send + Sync + 'static {
    fn get(&self, key: &str) -> impl Future<Output = Result<Option<StoredValue>>> + Send;

    /// Overwrite `key`, resetting its expiry.
    fn set(&self, key: &str, value: Vec<u8>, ttl: Duration)
        -> impl Future<Output = Result<()>> + Send;

    fn delete(&self, key: &str) -> impl Future<Output = Result<()>> + Send;

    fn publish(&self, channel: &str, message: Vec<u8>) -> impl Future<Output = Result<()>> + Send;

    fn subscribe(
        &self,
        channel: &str,
        handler: MessageHandler,
    ) -> impl Future<Output = Result<Subscription>> + Send;

    /// Set-if-absent: store `token` at `key` for `ttl` unless the key is held.
    fn acquire_lease(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> impl Future<Output = Result<bool>> + Send;

    /// Delete `key` only if it still holds `token`.
    fn release_lease(&self, key: &str, token: &str) -> impl Future<Output = Result<bool>> + Send;

    /// Register `script` with the store so it can be evaluated.
    fn load_script(&self, script: &'static Script) -> impl Future<Output = Result<()>> + Send;

    /// Run `script` atomically.
    ///
    /// Returns `Error::ScriptNotFound` if the store does not have it loaded.
    fn eval_script(
        &self,
        script: &'static Script,
        keys: &[String],
        args: &[i64],
    ) -> impl Future<Output = Result<Vec<i64>>> + Send;

    fn health_check(&self) -> impl Future<Output = Result<bool>> + Send;
}
