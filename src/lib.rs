//! Asset Cache - streaming resource loader with a persistent LRU disk cache
//!
//! Fetches remote resources over HTTP with cancellable, concurrent requests,
//! keeps complete payloads in a size-bounded disk cache keyed by a SHA-256 of
//! the URL, and decides per request whether to serve from cache or network.

pub mod cache;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod hash;
pub mod loader;
mod tasks;

pub use cache::{CacheStats, DataCaching, DiskCache, SweepReport};
pub use config::{CacheConfig, Config, LoaderConfig};
pub use coordinator::{Asset, ResolveHandle, ResourceLoadCoordinator};
pub use error::{Error, Result};
pub use hash::{hash, CacheKey};
pub use loader::{ByteLoader, ByteRange, Cancellable, DataLoader, LoadHandle, LoadRequest};
