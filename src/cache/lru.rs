//! LRU Index Module
//!
//! Tracks size and recency of every stored payload and selects sweep victims.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::cache::CacheEntry;
use crate::hash::CacheKey;

// == LRU Index ==
/// In-memory index of the payloads held on disk.
///
/// Recency is a monotonic counter bumped on every access, so eviction order
/// is strict even when several accesses share a timestamp.
#[derive(Debug, Default)]
pub struct LruIndex {
    /// Entry metadata by key
    entries: HashMap<CacheKey, CacheEntry>,
    /// Sum of all entry sizes
    total_bytes: u64,
    /// Last access sequence handed out
    clock: u64,
}

impl LruIndex {
    // == Constructor ==
    /// Creates a new empty index.
    pub fn new() -> Self {
        Self::default()
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    // == Insert ==
    /// Records a payload as the most recently used entry.
    ///
    /// Replaces any previous entry for the key and returns it.
    pub fn insert(&mut self, key: CacheKey, size: u64) -> Option<CacheEntry> {
        let seq = self.tick();
        self.put_entry(CacheEntry::new(key, size, seq))
    }

    /// Records a payload found on disk at start-up.
    ///
    /// Callers insert recovered entries oldest first so that the access
    /// sequence follows the given timestamps.
    pub fn insert_recovered(
        &mut self,
        key: CacheKey,
        size: u64,
        last_accessed: DateTime<Utc>,
    ) -> Option<CacheEntry> {
        let seq = self.tick();
        let mut entry = CacheEntry::new(key, size, seq);
        entry.last_accessed = last_accessed;
        self.put_entry(entry)
    }

    fn put_entry(&mut self, entry: CacheEntry) -> Option<CacheEntry> {
        self.total_bytes += entry.size;
        let previous = self.entries.insert(entry.key.clone(), entry);
        if let Some(prev) = &previous {
            self.total_bytes -= prev.size;
        }
        previous
    }

    // == Touch ==
    /// Marks a key as recently used.
    ///
    /// Returns false if the key is not indexed.
    pub fn touch(&mut self, key: &CacheKey) -> bool {
        let seq = self.clock + 1;
        match self.entries.get_mut(key) {
            Some(entry) => {
                entry.touch(seq);
                self.clock = seq;
                true
            }
            None => false,
        }
    }

    // == Remove ==
    /// Removes a key from the index.
    pub fn remove(&mut self, key: &CacheKey) -> Option<CacheEntry> {
        let removed = self.entries.remove(key);
        if let Some(entry) = &removed {
            self.total_bytes -= entry.size;
        }
        removed
    }

    /// Drops every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.total_bytes = 0;
    }

    // == Evict ==
    /// Removes least recently used entries until the total size is at or
    /// below `target_bytes`, returning them oldest first.
    pub fn evict_to(&mut self, target_bytes: u64) -> Vec<CacheEntry> {
        if self.total_bytes <= target_bytes {
            return Vec::new();
        }

        let mut by_age: Vec<&CacheEntry> = self.entries.values().collect();
        by_age.sort_unstable_by(|a, b| a.recency_cmp(b));
        let by_age: Vec<CacheKey> = by_age.into_iter().map(|entry| entry.key.clone()).collect();

        let mut evicted = Vec::new();
        for key in by_age {
            if self.total_bytes <= target_bytes {
                break;
            }
            if let Some(entry) = self.remove(&key) {
                evicted.push(entry);
            }
        }
        evicted
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Returns all entries, most recently used first.
    pub fn entries(&self) -> Vec<CacheEntry> {
        let mut entries: Vec<CacheEntry> = self.entries.values().cloned().collect();
        entries.sort_unstable_by(|a, b| b.recency_cmp(a));
        entries
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
