//! Cache Module
//!
//! Provides a persistent, size-bounded disk cache with LRU eviction.

mod caching;
mod entry;
mod lru;
mod stats;
pub(crate) mod store;


// Re-export public types
pub use caching::DataCaching;
pub use entry::{CacheEntry, EntryInfo};
pub use lru::LruIndex;
pub use stats::CacheStats;
pub use store::{DiskCache, SweepReport};
