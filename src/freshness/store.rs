//! Versioned TTL cache store
//!
//! One `CacheStore` per cache class. Entries carry the time they were
//! written, a version and a hit counter. Fresh reads go through [`get`];
//! fallbacks read through [`last_known`], which ignores the TTL. Writes
//! evict the oldest entries once the store exceeds its capacity.
//!
//! Versions come from a per-store sequence, so a key's version strictly
//! increases on every overwrite and is never reused after a removal. A fetch
//! that started against version `v` can use [`set_if_version`] to discard
//! its result if anything else wrote or removed the key in the meantime.
//!
//! [`get`]: CacheStore::get
//! [`last_known`]: CacheStore::last_known
//! [`set_if_version`]: CacheStore::set_if_version

use std::collections::HashMap;
use std::fmt::Display;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

/// A cached value with its bookkeeping
#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
    pub data: Arc<T>,
    pub timestamp: Instant,
    pub version: u64,
    pub hits: u64,
}

impl<T> CacheEntry<T> {
    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.timestamp)
    }
}

/// Per-entry introspection data
#[derive(Debug, Clone, Serialize)]
pub struct EntryStats {
    pub key: String,
    pub item_count: usize,
    pub age_ms: u64,
    pub hits: u64,
    pub version: u64,
    pub expired: bool,
}

/// Introspection data for one cache class
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheClassStats {
    pub size: usize,
    pub capacity: usize,
    pub ttl_ms: u64,
    pub entries: Vec<EntryStats>,
}

impl CacheClassStats {
    pub fn total_hits(&self) -> u64 {
        self.entries.iter().map(|e| e.hits).sum()
    }
}

/// Implemented by cached payloads that can report how many items they hold
pub trait ItemCount {
    fn item_count(&self) -> usize;
}

impl<T> ItemCount for Vec<T> {
    fn item_count(&self) -> usize {
        self.len()
    }
}

#[derive(Debug)]
pub struct CacheStore<K, T> {
    entries: HashMap<K, CacheEntry<T>>,
    ttl: Duration,
    capacity: usize,
    next_version: u64,
    /// Keys removed by capacity eviction since the last `take_evicted`
    evicted: Vec<K>,
}

impl<K, T> CacheStore<K, T>
where
    K: Eq + Hash + Clone,
{
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            ttl,
            capacity: capacity.max(1),
            next_version: 1,
            evicted: Vec::new(),
        }
    }

    /// Change TTL and capacity; shrinking the capacity evicts immediately
    pub fn reconfigure(&mut self, ttl: Duration, capacity: usize) {
        self.ttl = ttl;
        self.capacity = capacity.max(1);
        self.evict_overflow();
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn is_fresh(&self, entry: &CacheEntry<T>, now: Instant) -> bool {
        entry.age(now) < self.ttl
    }

    /// Fresh data for `key`, counting a hit
    pub fn get(&mut self, key: &K, now: Instant) -> Option<Arc<T>> {
        let ttl = self.ttl;
        let entry = self.entries.get_mut(key)?;
        if entry.age(now) >= ttl {
            return None;
        }
        entry.hits += 1;
        Some(entry.data.clone())
    }

    /// Fresh entry for `key` without counting a hit
    pub fn peek(&self, key: &K, now: Instant) -> Option<&CacheEntry<T>> {
        self.entries
            .get(key)
            .filter(|entry| self.is_fresh(entry, now))
    }

    /// Data for `key` regardless of age
    pub fn last_known(&self, key: &K) -> Option<Arc<T>> {
        self.entries.get(key).map(|entry| entry.data.clone())
    }

    pub fn version(&self, key: &K) -> Option<u64> {
        self.entries.get(key).map(|entry| entry.version)
    }

    /// Create or overwrite the entry for `key` and return its new version
    pub fn set(&mut self, key: K, data: Arc<T>, now: Instant) -> u64 {
        let version = self.next_version;
        self.next_version += 1;
        self.entries.insert(
            key,
            CacheEntry {
                data,
                timestamp: now,
                version,
                hits: 0,
            },
        );
        self.evict_overflow();
        version
    }

    /// Write only if the key is still at `expected` (`None` = absent).
    /// Returns false when the write was superseded and discarded.
    pub fn set_if_version(
        &mut self,
        key: K,
        data: Arc<T>,
        expected: Option<u64>,
        now: Instant,
    ) -> bool {
        if self.version(&key) != expected {
            return false;
        }
        self.set(key, data, now);
        true
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    /// Keys evicted for capacity since the previous call
    pub fn take_evicted(&mut self) -> Vec<K> {
        std::mem::take(&mut self.evicted)
    }

    pub fn remove(&mut self, key: &K) -> Option<CacheEntry<T>> {
        self.entries.remove(key)
    }

    pub fn retain(&mut self, mut keep: impl FnMut(&K) -> bool) {
        self.entries.retain(|key, _| keep(key));
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.evicted.clear();
    }

    /// Remove the oldest entries until the store fits its capacity.
    /// Ties on timestamp are broken by version, i.e. write order.
    fn evict_overflow(&mut self) {
        let overflow = self.entries.len().saturating_sub(self.capacity);
        if overflow == 0 {
            return;
        }

        let mut by_age: Vec<(Instant, u64, K)> = self
            .entries
            .iter()
            .map(|(key, entry)| (entry.timestamp, entry.version, key.clone()))
            .collect();
        by_age.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));

        for (_, _, key) in by_age.into_iter().take(overflow) {
            self.entries.remove(&key);
            self.evicted.push(key);
        }

        tracing::debug!(evicted = overflow, capacity = self.capacity, "Evicted oldest cache entries");
    }
}

impl<K, T> CacheStore<K, T>
where
    K: Eq + Hash + Clone + Display,
    T: ItemCount,
{
    pub fn stats(&self, now: Instant) -> CacheClassStats {
        let mut entries: Vec<EntryStats> = self
            .entries
            .iter()
            .map(|(key, entry)| EntryStats {
                key: key.to_string(),
                item_count: entry.data.item_count(),
                age_ms: entry.age(now).as_millis() as u64,
                hits: entry.hits,
                version: entry.version,
                expired: !self.is_fresh(entry, now),
            })
            .collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));

        CacheClassStats {
            size: self.entries.len(),
            capacity: self.capacity,
            ttl_ms: self.ttl.as_millis() as u64,
            entries,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(ttl_secs: u64, capacity: usize) -> CacheStore<String, Vec<u32>> {
        CacheStore::new(Duration::from_secs(ttl_secs), capacity)
    }

    #[test]
    fn test_get_respects_ttl_but_last_known_does_not() {
        let mut cache = store(30, 10);
        let t0 = Instant::now();
        cache.set("p1".to_string(), Arc::new(vec![1, 2]), t0);

        assert!(cache.get(&"p1".to_string(), t0 + Duration::from_secs(29)).is_some());
        assert!(cache.get(&"p1".to_string(), t0 + Duration::from_secs(30)).is_none());
        assert_eq!(
            cache.last_known(&"p1".to_string()).as_deref(),
            Some(&vec![1, 2])
        );
    }

    #[test]
    fn test_hits_count_reads_and_reset_on_write() {
        let mut cache = store(30, 10);
        let t0 = Instant::now();
        let key = "p1".to_string();
        cache.set(key.clone(), Arc::new(vec![1]), t0);
        cache.get(&key, t0);
        cache.get(&key, t0);
        cache.last_known(&key);
        assert_eq!(cache.peek(&key, t0).unwrap().hits, 2);

        cache.set(key.clone(), Arc::new(vec![2]), t0);
        assert_eq!(cache.peek(&key, t0).unwrap().hits, 0);
    }

    #[test]
    fn test_version_strictly_increases_even_after_remove() {
        let mut cache = store(30, 10);
        let t0 = Instant::now();
        let key = "p1".to_string();
        let v1 = cache.set(key.clone(), Arc::new(vec![]), t0);
        let v2 = cache.set(key.clone(), Arc::new(vec![]), t0);
        cache.remove(&key);
        let v3 = cache.set(key.clone(), Arc::new(vec![]), t0);
        assert!(v1 < v2 && v2 < v3);
    }

    #[test]
    fn test_set_if_version_discards_superseded_write() {
        let mut cache = store(30, 10);
        let t0 = Instant::now();
        let key = "p1".to_string();
        let seen = cache.version(&key);
        cache.set(key.clone(), Arc::new(vec![9]), t0);

        assert!(!cache.set_if_version(key.clone(), Arc::new(vec![1]), seen, t0));
        assert_eq!(cache.last_known(&key).as_deref(), Some(&vec![9]));

        let seen = cache.version(&key);
        assert!(cache.set_if_version(key.clone(), Arc::new(vec![2]), seen, t0));
        assert_eq!(cache.last_known(&key).as_deref(), Some(&vec![2]));
    }

    #[test]
    fn test_eviction_keeps_most_recent_writes() {
        let mut cache = store(30, 3);
        let t0 = Instant::now();
        for i in 0..5u64 {
            cache.set(format!("p{}", i), Arc::new(vec![]), t0 + Duration::from_millis(i));
        }
        assert_eq!(cache.len(), 3);
        for i in 2..5 {
            assert!(cache.last_known(&format!("p{}", i)).is_some());
        }
    }

    #[test]
    fn test_evicted_keys_are_reported_once() {
        let mut cache = store(30, 2);
        let t0 = Instant::now();
        for (i, key) in ["a", "b", "c", "d"].into_iter().enumerate() {
            cache.set(key.to_string(), Arc::new(vec![]), t0 + Duration::from_millis(i as u64));
        }
        assert_eq!(cache.take_evicted(), vec!["a".to_string(), "b".to_string()]);
        assert!(cache.take_evicted().is_empty());
        assert!(cache.contains(&"d".to_string()));
        assert!(!cache.contains(&"a".to_string()));
    }

    #[test]
    fn test_eviction_ties_break_by_write_order() {
        let mut cache = store(30, 2);
        let t0 = Instant::now();
        for key in ["a", "b", "c"] {
            cache.set(key.to_string(), Arc::new(vec![]), t0);
        }
        assert!(cache.last_known(&"a".to_string()).is_none());
        assert!(cache.last_known(&"b".to_string()).is_some());
        assert!(cache.last_known(&"c".to_string()).is_some());
    }

    #[test]
    fn test_reconfigure_shrinks_capacity() {
        let mut cache = store(30, 5);
        let t0 = Instant::now();
        for i in 0..5u64 {
            cache.set(format!("p{}", i), Arc::new(vec![]), t0 + Duration::from_millis(i));
        }
        cache.reconfigure(Duration::from_secs(1), 2);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.ttl(), Duration::from_secs(1));
    }

    #[test]
    fn test_stats_report_expiry() {
        let mut cache = store(10, 5);
        let t0 = Instant::now();
        cache.set("old".to_string(), Arc::new(vec![1, 2, 3]), t0);
        cache.set("new".to_string(), Arc::new(vec![1]), t0 + Duration::from_secs(8));

        let stats = cache.stats(t0 + Duration::from_secs(12));
        assert_eq!(stats.size, 2);
        let old = stats.entries.iter().find(|e| e.key == "old").unwrap();
        assert!(old.expired);
        assert_eq!(old.item_count, 3);
        let new = stats.entries.iter().find(|e| e.key == "new").unwrap();
        assert!(!new.expired);
    }
}
