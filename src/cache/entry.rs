//! Cache Entry Module
//!
//! Eviction metadata kept for every payload stored on disk.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::hash::CacheKey;

// == Cache Entry ==
/// Metadata for a single stored payload.
///
/// The payload itself lives on disk; the entry only carries what the sweep
/// needs to pick victims.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    /// Stable key the payload is stored under
    pub key: CacheKey,
    /// Payload size in bytes
    pub size: u64,
    /// Wall-clock time of the last read, write or existence check
    pub last_accessed: DateTime<Utc>,
    /// Monotonic access counter; ties in wall-clock time are broken by this
    pub(crate) access_seq: u64,
}

impl CacheEntry {
    // == Constructor ==
    /// Creates an entry accessed now.
    pub fn new(key: CacheKey, size: u64, access_seq: u64) -> Self {
        Self {
            key,
            size,
            last_accessed: Utc::now(),
            access_seq,
        }
    }

    // == Touch ==
    /// Marks the entry as accessed now with the given sequence number.
    pub fn touch(&mut self, access_seq: u64) {
        self.last_accessed = Utc::now();
        self.access_seq = access_seq;
    }

    /// Orders entries from least to most recently used.
    pub fn recency_cmp(&self, other: &CacheEntry) -> Ordering {
        self.access_seq.cmp(&other.access_seq)
    }

    /// Serializable snapshot for diagnostics output.
    pub fn info(&self) -> EntryInfo {
        EntryInfo {
            key: self.key.to_string(),
            size: self.size,
            last_accessed: self.last_accessed,
        }
    }
}

/// Read-only view of an entry, suitable for JSON output.
#[derive(Debug, Clone, Serialize)]
pub struct EntryInfo {
    pub key: String,
    pub size: u64,
    pub last_accessed: DateTime<Utc>,
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> CacheKey {
        CacheKey::new(s).unwrap()
    }

    #[test]
    fn test_entry_creation() {
        let before = Utc::now();
        let entry = CacheEntry::new(key("a"), 50, 1);

        assert_eq!(entry.size, 50);
        assert_eq!(entry.key, key("a"));
        assert!(entry.last_accessed >= before);
    }

    #[test]
    fn test_touch_advances_recency() {
        let mut older = CacheEntry::new(key("a"), 10, 1);
        let newer = CacheEntry::new(key("b"), 10, 2);
        assert_eq!(newer.recency_cmp(&older), Ordering::Greater);

        older.touch(3);
        assert_eq!(older.recency_cmp(&newer), Ordering::Greater);
    }

    #[test]
    fn test_info_serializes() {
        let entry = CacheEntry::new(key("a"), 7, 1);
        let json = serde_json::to_value(entry.info()).unwrap();
        assert_eq!(json["size"], 7);
        assert_eq!(json["key"].as_str().unwrap(), key("a").as_str());
    }
}
