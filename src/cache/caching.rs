//! Data Caching Interface
//!
//! The storage operations the coordinator needs from a cache.

use bytes::Bytes;

use crate::cache::DiskCache;
use crate::hash::CacheKey;

/// Key-value payload storage used by
/// [`ResourceLoadCoordinator`](crate::coordinator::ResourceLoadCoordinator).
///
/// Implementations swallow their own storage failures: a failed read is a
/// miss and a failed write is dropped.
pub trait DataCaching: Send + Sync {
    /// Returns the stored payload, counting as an access.
    fn get(&self, key: &CacheKey) -> Option<Bytes>;

    /// Returns true if a payload is stored, counting as an access.
    fn has(&self, key: &CacheKey) -> bool;

    /// Stores `data` under `key`, replacing any previous payload. May complete
    /// after returning.
    fn put(&self, data: Bytes, key: &CacheKey);

    fn remove(&self, key: &CacheKey);

    fn remove_all(&self);
}

impl DataCaching for DiskCache {
    fn get(&self, key: &CacheKey) -> Option<Bytes> {
        DiskCache::get(self, key)
    }

    fn has(&self, key: &CacheKey) -> bool {
        DiskCache::has(self, key)
    }

    fn put(&self, data: Bytes, key: &CacheKey) {
        DiskCache::put(self, data, key)
    }

    fn remove(&self, key: &CacheKey) {
        DiskCache::remove(self, key)
    }

    fn remove_all(&self) {
        DiskCache::remove_all(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use tempfile::TempDir;

    #[test]
    fn test_disk_cache_through_trait_object() {
        let dir = TempDir::new().unwrap();
        let disk = DiskCache::new(CacheConfig::new("trait-test").with_root_dir(dir.path())).unwrap();
        let key = CacheKey::new("https://cdn.example/a").unwrap();

        let cache: &dyn DataCaching = &disk;
        cache.put(Bytes::from_static(b"payload"), &key);
        disk.flush();
        assert_eq!(cache.get(&key), Some(Bytes::from_static(b"payload")));
        assert!(cache.has(&key));

        cache.remove(&key);
        disk.flush();
        assert!(!cache.has(&key));

        cache.put(Bytes::from_static(b"again"), &key);
        cache.remove_all();
        disk.flush();
        assert!(disk.is_empty());
    }
}
