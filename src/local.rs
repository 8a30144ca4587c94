//! In-process (local) cache tier.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// One local-tier entry. The bytes are shared so hits never copy them.
#[derive(Debug)]
struct LocalEntry {
    data: Arc<Vec<u8>>,
    expires_at: Option<Instant>,
    hits: AtomicU64,
    /// Milliseconds since the tier's epoch.
    last_access: AtomicU64,
}

impl LocalEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Thread-safe local tier keyed by fully-qualified cache key.
///
/// Tracks hit counts and last access so compaction can evict the least
/// frequently used entries first, breaking ties by least recent use.
#[derive(Debug)]
pub struct LocalTier {
    entries: DashMap<String, LocalEntry>,
    epoch: Instant,
}

impl Default for LocalTier {
    fn default() -> Self {
        LocalTier {
            entries: DashMap::new(),
            epoch: Instant::now(),
        }
    }
}

impl LocalTier {
    pub fn new() -> Self {
        Self::default()
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Live entry bytes, recording the access. Expired entries are removed.
    pub fn get(&self, key: &str) -> Option<Arc<Vec<u8>>> {
        let now = Instant::now();
        let entry = self.entries.get(key)?;
        if entry.is_expired(now) {
            drop(entry);
            self.entries.remove_if(key, |_, e| e.is_expired(now));
            return None;
        }

        entry.hits.fetch_add(1, Ordering::Relaxed);
        entry.last_access.store(self.now_ms(), Ordering::Relaxed);
        Some(Arc::clone(&entry.data))
    }

    /// Insert or replace. A zero `ttl` keeps the entry until evicted.
    pub fn insert(&self, key: &str, data: Arc<Vec<u8>>, ttl: Duration) {
        // Zero, or too far out to represent, means no expiry.
        let expires_at = if ttl.is_zero() {
            None
        } else {
            Instant::now().checked_add(ttl)
        };
        self.entries.insert(
            key.to_string(),
            LocalEntry {
                data,
                expires_at,
                hits: AtomicU64::new(0),
                last_access: AtomicU64::new(self.now_ms()),
            },
        );
    }

    pub fn remove(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn contains(&self, key: &str) -> bool {
        let now = Instant::now();
        self.entries
            .get(key)
            .is_some_and(|entry| !entry.is_expired(now))
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        before.saturating_sub(self.entries.len())
    }

    /// Evict `fraction` of the entries, least frequently used first.
    ///
    /// Expired entries go first and count towards the quota. Returns the
    /// number of entries removed.
    pub fn compact(&self, fraction: f64) -> usize {
        let fraction = fraction.clamp(0.0, 1.0);
        let total = self.entries.len();
        let quota = (total as f64 * fraction).ceil() as usize;
        if quota == 0 {
            return 0;
        }

        let mut removed = self.purge_expired();
        if removed >= quota {
            return removed;
        }

        let mut candidates: Vec<(String, u64, u64)> = self
            .entries
            .iter()
            .map(|entry| {
                (
                    entry.key().clone(),
                    entry.hits.load(Ordering::Relaxed),
                    entry.last_access.load(Ordering::Relaxed),
                )
            })
            .collect();
        candidates.sort_by_key(|(_, hits, last_access)| (*hits, *last_access));

        for (key, _, _) in candidates.into_iter().take(quota - removed) {
            if self.entries.remove(&key).is_some() {
                removed += 1;
            }
        }

        debug!("Local tier compacted: {} of {} entries evicted", removed, total);
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes(s: &str) -> Arc<Vec<u8>> {
        Arc::new(s.as_bytes().to_vec())
    }

    #[tokio::test(start_paused = true)]
    async fn test_insert_get_expire() {
        let tier = LocalTier::new();
        tier.insert("a", bytes("1"), Duration::from_secs(2));

        assert_eq!(tier.get("a").expect("hit").as_slice(), b"1");
        assert!(tier.contains("a"));

        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(!tier.contains("a"));
        assert!(tier.get("a").is_none());
        assert!(tier.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrepresentable_ttl_never_expires() {
        let tier = LocalTier::new();
        tier.insert("a", bytes("1"), Duration::MAX);

        tokio::time::advance(Duration::from_secs(365 * 86_400)).await;
        assert_eq!(tier.purge_expired(), 0);
        assert!(tier.contains("a"));
    }

    #[test]
    fn test_remove_and_clear() {
        let tier = LocalTier::new();
        tier.insert("a", bytes("1"), Duration::ZERO);
        tier.insert("b", bytes("2"), Duration::ZERO);

        assert!(tier.remove("a"));
        assert!(!tier.remove("a"));
        assert_eq!(tier.len(), 1);

        tier.clear();
        assert!(tier.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_compact_evicts_least_used() {
        let tier = LocalTier::new();
        for key in ["cold", "warm", "hot", "hotter"] {
            tier.insert(key, bytes(key), Duration::from_secs(60));
        }
        tier.get("warm");
        for _ in 0..3 {
            tier.get("hot");
        }
        for _ in 0..5 {
            tier.get("hotter");
        }

        let removed = tier.compact(0.5);
        assert_eq!(removed, 2);
        assert!(!tier.contains("cold"));
        assert!(!tier.contains("warm"));
        assert!(tier.contains("hot"));
        assert!(tier.contains("hotter"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_compact_breaks_ties_by_recency() {
        let tier = LocalTier::new();
        tier.insert("older", bytes("o"), Duration::ZERO);
        tokio::time::advance(Duration::from_millis(10)).await;
        tier.insert("newer", bytes("n"), Duration::ZERO);

        assert_eq!(tier.compact(0.5), 1);
        assert!(tier.contains("newer"));
        assert!(!tier.contains("older"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_compact_counts_expired_first() {
        let tier = LocalTier::new();
        tier.insert("short", bytes("s"), Duration::from_secs(1));
        tier.insert("long", bytes("l"), Duration::from_secs(100));
        tokio::time::advance(Duration::from_secs(2)).await;

        assert_eq!(tier.compact(0.5), 1);
        assert!(tier.contains("long"));
    }
}
