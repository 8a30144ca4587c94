//! In-process store.
//!
//! Simulates the full remote store contract inside one process so several
//! caches, limiters and locks can share it as if they were separate
//! services talking to one server. Scripts run their native implementation
//! under a store-wide lock.

use super::{
    ChannelEvent, MessageHandler, RemoteStore, Script, ScriptContext, StoredValue, Subscription,
};
use crate::error::{Error, Result};
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

/// Messages buffered per channel before slow subscribers start lagging.
const CHANNEL_CAPACITY: usize = 1024;

#[derive(Clone, Debug)]
struct StoredEntry {
    data: Vec<u8>,
    expires_at: Option<Instant>,
}

impl StoredEntry {
    fn new(data: Vec<u8>, ttl: Duration) -> Self {
        StoredEntry {
            data,
            expires_at: expiry(ttl),
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

fn expiry(ttl: Duration) -> Option<Instant> {
    if ttl.is_zero() {
        None
    } else {
        Instant::now().checked_add(ttl)
    }
}

#[derive(Default)]
struct Inner {
    entries: DashMap<String, StoredEntry>,
    channels: DashMap<String, broadcast::Sender<Vec<u8>>>,
    scripts: DashSet<&'static str>,
    script_lock: Mutex<()>,
}

/// In-memory [`RemoteStore`]. Cloning shares the same underlying state.
///
/// # Example
///
/// ```
/// # use coord_kit::backend::{InMemoryStore, RemoteStore};
/// # use std::time::Duration;
/// # #[tokio::main]
/// # async fn main() -> coord_kit::Result<()> {
/// let store = InMemoryStore::new();
/// store.set("key", b"value".to_vec(), Duration::from_secs(60)).await?;
/// let value = store.get("key").await?;
/// assert_eq!(value.map(|v| v.data), Some(b"value".to_vec()));
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live (non-expired) entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.inner
            .entries
            .iter()
            .filter(|e| !e.is_expired(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget every loaded script, as a store restart would.
    pub fn flush_scripts(&self) {
        self.inner.scripts.clear();
        warn!("⚠ In-memory store script cache flushed");
    }

    /// Close a pub/sub channel, ending every subscription on it.
    pub fn close_channel(&self, channel: &str) {
        self.inner.channels.remove(channel);
        warn!("⚠ In-memory channel {} closed", channel);
    }

    fn live_entry(&self, key: &str) -> Option<StoredEntry> {
        let now = Instant::now();
        let entry = self.inner.entries.get(key)?;
        if entry.is_expired(now) {
            drop(entry);
            self.inner.entries.remove_if(key, |_, e| e.is_expired(now));
            return None;
        }
        Some(entry.value().clone())
    }
}

struct InMemoryScriptContext<'a> {
    entries: &'a DashMap<String, StoredEntry>,
}

impl ScriptContext for InMemoryScriptContext<'_> {
    fn incr(&mut self, key: &str) -> i64 {
        let now = Instant::now();
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| StoredEntry::new(b"0".to_vec(), Duration::ZERO));
        if entry.is_expired(now) {
            *entry = StoredEntry::new(b"0".to_vec(), Duration::ZERO);
        }

        let current = std::str::from_utf8(&entry.data)
            .ok()
            .and_then(|s| s.parse::<i64>().ok())
            .unwrap_or(0);
        let next = current + 1;
        entry.data = next.to_string().into_bytes();
        next
    }

    fn expire(&mut self, key: &str, ttl: Duration) {
        if let Some(mut entry) = self.entries.get_mut(key) {
            entry.expires_at = expiry(ttl);
        }
    }

    fn del(&mut self, key: &str) {
        self.entries.remove(key);
    }
}

impl RemoteStore for InMemoryStore {
    async fn get(&self, key: &str) -> Result<Option<StoredValue>> {
        let now = Instant::now();
        Ok(self.live_entry(key).map(|entry| StoredValue {
            ttl_remaining: entry.expires_at.map(|at| at.saturating_duration_since(now)),
            data: entry.data,
        }))
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()> {
        self.inner
            .entries
            .insert(key.to_string(), StoredEntry::new(value, ttl));
        debug!("✓ InMemory SET {} (TTL: {:?})", key, ttl);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.inner.entries.remove(key);
        debug!("✓ InMemory DELETE {}", key);
        Ok(())
    }

    async fn publish(&self, channel: &str, message: Vec<u8>) -> Result<()> {
        if let Some(sender) = self.inner.channels.get(channel) {
            // No receivers is not an error, same as PUBLISH returning 0.
            let _ = sender.send(message);
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str, handler: MessageHandler) -> Result<Subscription> {
        let mut receiver = self
            .inner
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe();

        let name = channel.to_string();
        let task = tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(message) => handler(ChannelEvent::Message(message)),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        handler(ChannelEvent::Lagged(missed))
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("In-memory channel {} closed, subscription ended", name);
                        break;
                    }
                }
            }
        });

        Ok(Subscription::new(channel, task))
    }

    async fn acquire_lease(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let lease = StoredEntry::new(token.as_bytes().to_vec(), ttl);
        match self.inner.entries.entry(key.to_string()) {
            Entry::Occupied(mut held) => {
                if held.get().is_expired(now) {
                    held.insert(lease);
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(free) => {
                free.insert(lease);
                Ok(true)
            }
        }
    }

    async fn release_lease(&self, key: &str, token: &str) -> Result<bool> {
        let now = Instant::now();
        Ok(self
            .inner
            .entries
            .remove_if(key, |_, entry| {
                !entry.is_expired(now) && entry.data == token.as_bytes()
            })
            .is_some())
    }

    async fn load_script(&self, script: &'static Script) -> Result<()> {
        self.inner.scripts.insert(script.name);
        debug!("✓ InMemory SCRIPT LOAD {}", script.name);
        Ok(())
    }

    async fn eval_script(
        &self,
        script: &'static Script,
        keys: &[String],
        args: &[i64],
    ) -> Result<Vec<i64>> {
        if !self.inner.scripts.contains(script.name) {
            return Err(Error::ScriptNotFound(script.name.to_string()));
        }

        let _guard = self
            .inner
            .script_lock
            .lock()
            .map_err(|_| Error::BackendError("In-memory script lock poisoned".to_string()))?;
        let mut ctx = InMemoryScriptContext {
            entries: &self.inner.entries,
        };
        Ok((script.native)(&mut ctx, keys, args))
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_script(ctx: &mut dyn ScriptContext, keys: &[String], _args: &[i64]) -> Vec<i64> {
        keys.iter().map(|k| ctx.incr(k)).collect()
    }

    static COUNTER: Script = Script {
        name: "test_counter",
        source: "return 0",
        native: counting_script,
    };

    #[tokio::test]
    async fn test_set_get_delete() {
        let store = InMemoryStore::new();
        store
            .set("k", b"v".to_vec(), Duration::from_secs(10))
            .await
            .expect("set");

        let value = store.get("k").await.expect("get").expect("present");
        assert_eq!(value.data, b"v".to_vec());
        assert!(value.ttl_remaining.expect("has ttl") <= Duration::from_secs(10));

        store.delete("k").await.expect("delete");
        assert!(store.get("k").await.expect("get").is_none());
    }

    #[tokio::test]
    async fn test_zero_ttl_never_expires() {
        let store = InMemoryStore::new();
        store.set("k", b"v".to_vec(), Duration::ZERO).await.expect("set");
        let value = store.get("k").await.expect("get").expect("present");
        assert_eq!(value.ttl_remaining, None);
    }

    #[tokio::test]
    async fn test_huge_ttl_and_lease_do_not_overflow() {
        let store = InMemoryStore::new();
        store.set("k", b"v".to_vec(), Duration::MAX).await.expect("set");
        let value = store.get("k").await.expect("get").expect("present");
        assert_eq!(value.ttl_remaining, None);

        assert!(store
            .acquire_lease("lease", "t", Duration::MAX)
            .await
            .expect("acquire"));
        assert!(!store
            .acquire_lease("lease", "u", Duration::from_secs(1))
            .await
            .expect("contended"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire() {
        let store = InMemoryStore::new();
        store
            .set("k", b"v".to_vec(), Duration::from_secs(5))
            .await
            .expect("set");

        tokio::time::advance(Duration::from_secs(3)).await;
        let value = store.get("k").await.expect("get").expect("still present");
        assert_eq!(value.ttl_remaining, Some(Duration::from_secs(2)));

        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(store.get("k").await.expect("get").is_none());
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_set_if_absent_and_token_release() {
        let store = InMemoryStore::new();
        let ttl = Duration::from_secs(30);

        assert!(store.acquire_lease("lock:a", "t1", ttl).await.expect("acquire"));
        assert!(!store.acquire_lease("lock:a", "t2", ttl).await.expect("acquire"));

        assert!(!store.release_lease("lock:a", "t2").await.expect("release"));
        assert!(store.release_lease("lock:a", "t1").await.expect("release"));
        assert!(store.acquire_lease("lock:a", "t2", ttl).await.expect("acquire"));

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(store.acquire_lease("lock:a", "t3", ttl).await.expect("acquire"));
        assert!(!store.release_lease("lock:a", "t2").await.expect("release"));
    }

    #[tokio::test]
    async fn test_script_requires_load() {
        let store = InMemoryStore::new();
        let keys = vec!["c".to_string()];

        let err = store
            .eval_script(&COUNTER, &keys, &[])
            .await
            .expect_err("not loaded");
        assert!(matches!(err, Error::ScriptNotFound(_)));

        store.load_script(&COUNTER).await.expect("load");
        assert_eq!(store.eval_script(&COUNTER, &keys, &[]).await.expect("eval"), vec![1]);
        assert_eq!(store.eval_script(&COUNTER, &keys, &[]).await.expect("eval"), vec![2]);

        store.flush_scripts();
        assert!(store.eval_script(&COUNTER, &keys, &[]).await.is_err());
    }

    #[tokio::test]
    async fn test_publish_subscribe() {
        let store = InMemoryStore::new();
        let received = Arc::new(AtomicUsize::new(0));
        let seen = received.clone();
        let handler: MessageHandler = Arc::new(move |event| {
            if let ChannelEvent::Message(bytes) = event {
                assert_eq!(bytes, b"hello".to_vec());
                seen.fetch_add(1, Ordering::SeqCst);
            }
        });

        let sub = store.subscribe("events", handler).await.expect("subscribe");
        store.publish("events", b"hello".to_vec()).await.expect("publish");

        for _ in 0..100 {
            if received.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(received.load(Ordering::SeqCst), 1);
        assert!(sub.is_alive());

        store.close_channel("events");
        for _ in 0..100 {
            if !sub.is_alive() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(!sub.is_alive());
    }
}
