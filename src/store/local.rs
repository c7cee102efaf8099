//! In-Process Tier
//!
//! A sharded, bounded LRU sitting in front of the remote store. Each shard is
//! an `IndexMap` in recency order (front = oldest, back = newest) behind its
//! own lock, so unrelated keys never contend on a single global lock.

use crate::clock::ClockRef;
use crate::store::entry::{shard_index, CacheEntry, KEY_SHARD_COUNT};
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

// =============================================================================
// Local Shard
// =============================================================================

#[derive(Debug)]
struct LocalShard {
    /// Entries in LRU order (front = oldest, back = newest)
    entries: IndexMap<String, CacheEntry>,
    /// Maximum entries this shard holds
    capacity: usize,
}

impl LocalShard {
    fn new(capacity: usize) -> Self {
        Self {
            entries: IndexMap::new(),
            capacity: capacity.max(1),
        }
    }
}

// =============================================================================
// Local Tier
// =============================================================================

/// Bounded in-process cache with per-shard LRU eviction
pub struct LocalTier {
    shards: Vec<Mutex<LocalShard>>,
    clock: ClockRef,
    /// Stored bytes across all shards
    stored_bytes: AtomicU64,
    /// Entry count across all shards
    entry_count: AtomicU64,
    /// Entries dropped to make room
    evictions: AtomicU64,
}

impl LocalTier {
    /// Create a tier holding roughly `capacity` entries across the default shard count
    pub fn new(capacity: usize, clock: ClockRef) -> Self {
        let shard_count = KEY_SHARD_COUNT.min(capacity.max(1));
        Self::with_shards(capacity, shard_count, clock)
    }

    /// Create a tier with an explicit shard count
    pub fn with_shards(capacity: usize, shard_count: usize, clock: ClockRef) -> Self {
        let shard_count = shard_count.max(1);
        let per_shard = capacity.div_ceil(shard_count);
        let shards = (0..shard_count)
            .map(|_| Mutex::new(LocalShard::new(per_shard)))
            .collect();

        Self {
            shards,
            clock,
            stored_bytes: AtomicU64::new(0),
            entry_count: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    #[inline]
    fn shard_for(&self, key: &str) -> &Mutex<LocalShard> {
        &self.shards[shard_index(key, self.shards.len())]
    }

    fn account_removed(&self, entry: &CacheEntry) {
        self.stored_bytes
            .fetch_sub(entry.stored_size(), Ordering::Relaxed);
        self.entry_count.fetch_sub(1, Ordering::Relaxed);
    }

    /// Look up an entry, promoting it to most recently used.
    ///
    /// Expired entries are dropped and reported as a miss.
    pub fn get(&self, key: &str) -> Option<CacheEntry> {
        let now = self.clock.now();
        let mut shard = self.shard_for(key).lock();

        let entry = shard.entries.shift_remove(key)?;
        if entry.is_expired(now) {
            drop(shard);
            self.account_removed(&entry);
            return None;
        }

        let result = entry.clone();
        shard.entries.insert(key.to_string(), entry);
        Some(result)
    }

    /// Insert or replace an entry, evicting the least recently used on overflow
    pub fn insert(&self, entry: CacheEntry) {
        let key = entry.key.clone();
        let size = entry.stored_size();
        let mut evicted = Vec::new();

        {
            let mut shard = self.shard_for(&key).lock();
            if let Some(old) = shard.entries.shift_remove(&key) {
                evicted.push((old, false));
            }
            while shard.entries.len() >= shard.capacity {
                match shard.entries.shift_remove_index(0) {
                    Some((_, oldest)) => evicted.push((oldest, true)),
                    None => break,
                }
            }
            shard.entries.insert(key, entry);
        }

        self.stored_bytes.fetch_add(size, Ordering::Relaxed);
        self.entry_count.fetch_add(1, Ordering::Relaxed);
        for (old, is_eviction) in evicted {
            self.account_removed(&old);
            if is_eviction {
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Remove an entry
    pub fn remove(&self, key: &str) -> Option<CacheEntry> {
        let removed = self.shard_for(key).lock().entries.shift_remove(key);
        if let Some(entry) = &removed {
            self.account_removed(entry);
        }
        removed
    }

    /// Remove every entry whose key starts with `prefix`
    pub fn remove_prefix(&self, prefix: &str) -> u64 {
        let mut removed = 0u64;
        for shard in &self.shards {
            let drained: Vec<CacheEntry> = {
                let mut shard = shard.lock();
                let keys: Vec<String> = shard
                    .entries
                    .keys()
                    .filter(|k| k.starts_with(prefix))
                    .cloned()
                    .collect();
                keys.iter()
                    .filter_map(|k| shard.entries.shift_remove(k))
                    .collect()
            };
            for entry in &drained {
                self.account_removed(entry);
            }
            removed += drained.len() as u64;
        }
        removed
    }

    /// Drop expired entries across all shards
    pub fn purge_expired(&self) -> u64 {
        let now = self.clock.now();
        let mut purged = 0u64;
        for shard in &self.shards {
            let expired: Vec<CacheEntry> = {
                let mut shard = shard.lock();
                let keys: Vec<String> = shard
                    .entries
                    .iter()
                    .filter(|(_, e)| e.is_expired(now))
                    .map(|(k, _)| k.clone())
                    .collect();
                keys.iter()
                    .filter_map(|k| shard.entries.shift_remove(k))
                    .collect()
            };
            for entry in &expired {
                self.account_removed(entry);
            }
            purged += expired.len() as u64;
        }
        purged
    }

    /// Check presence without touching recency
    pub fn contains(&self, key: &str) -> bool {
        self.shard_for(key).lock().entries.contains_key(key)
    }

    /// Get entry count
    pub fn len(&self) -> u64 {
        self.entry_count.load(Ordering::Relaxed)
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes currently held (post-compression)
    pub fn stored_bytes(&self) -> u64 {
        self.stored_bytes.load(Ordering::Relaxed)
    }

    /// Entries dropped to make room so far
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Clear all entries
    pub fn clear(&self) {
        for shard in &self.shards {
            shard.lock().entries.clear();
        }
        self.stored_bytes.store(0, Ordering::Relaxed);
        self.entry_count.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{secs, Clock, ManualClock};
    use crate::store::entry::Payload;
    use std::sync::Arc;

    fn entry(clock: &ManualClock, key: &str, value: &str, ttl: Option<u64>) -> CacheEntry {
        let now = clock.now();
        CacheEntry::new(
            key,
            Payload::Plain(value.to_string()),
            now,
            ttl.map(|t| now + secs(t)),
        )
    }

    #[test]
    fn test_insert_and_get() {
        let clock = Arc::new(ManualClock::new());
        let tier = LocalTier::new(100, clock.clone());

        tier.insert(entry(&clock, "repo:a/b:tree", "[]", None));
        let hit = tier.get("repo:a/b:tree").unwrap();
        assert_eq!(hit.payload, Payload::Plain("[]".into()));
        assert_eq!(tier.len(), 1);
        assert_eq!(tier.stored_bytes(), 2);
        assert!(tier.get("repo:a/b:missing").is_none());
    }

    #[test]
    fn test_replace_keeps_accounting() {
        let clock = Arc::new(ManualClock::new());
        let tier = LocalTier::new(100, clock.clone());

        tier.insert(entry(&clock, "k", "aaaa", None));
        tier.insert(entry(&clock, "k", "bb", None));
        assert_eq!(tier.len(), 1);
        assert_eq!(tier.stored_bytes(), 2);
        assert_eq!(tier.evictions(), 0);
    }

    #[test]
    fn test_lru_eviction_order() {
        let clock = Arc::new(ManualClock::new());
        let tier = LocalTier::with_shards(2, 1, clock.clone());

        tier.insert(entry(&clock, "a", "1", None));
        tier.insert(entry(&clock, "b", "2", None));

        // Touch "a" so "b" becomes least recently used
        assert!(tier.get("a").is_some());
        tier.insert(entry(&clock, "c", "3", None));

        assert!(tier.contains("a"));
        assert!(!tier.contains("b"));
        assert!(tier.contains("c"));
        assert_eq!(tier.len(), 2);
        assert_eq!(tier.evictions(), 1);
    }

    #[test]
    fn test_expired_entries_miss() {
        let clock = Arc::new(ManualClock::new());
        let tier = LocalTier::new(100, clock.clone());

        tier.insert(entry(&clock, "short", "v", Some(10)));
        tier.insert(entry(&clock, "long", "v", Some(1000)));

        clock.advance(secs(11));
        assert!(tier.get("short").is_none());
        assert!(tier.get("long").is_some());
        assert_eq!(tier.len(), 1);

        clock.advance(secs(1000));
        assert_eq!(tier.purge_expired(), 1);
        assert!(tier.is_empty());
    }

    #[test]
    fn test_remove_prefix() {
        let clock = Arc::new(ManualClock::new());
        let tier = LocalTier::new(100, clock.clone());

        tier.insert(entry(&clock, "repo:acme/widgets:tree", "1", None));
        tier.insert(entry(&clock, "repo:acme/widgets:file:README.md", "2", None));
        tier.insert(entry(&clock, "repo:acme/gadgets:tree", "3", None));

        assert_eq!(tier.remove_prefix("repo:acme/widgets:"), 2);
        assert_eq!(tier.len(), 1);
        assert!(tier.contains("repo:acme/gadgets:tree"));

        assert!(tier.remove("repo:acme/gadgets:tree").is_some());
        assert!(tier.remove("repo:acme/gadgets:tree").is_none());
        assert_eq!(tier.stored_bytes(), 0);
    }
}
