//! Background Tasks Module
//!
//! Contains the background work that runs alongside a cache.
//!
//! # Tasks
//! - Cache worker: applies writes/removals in order and runs the periodic LRU sweep

mod worker;

pub(crate) use worker::{spawn_cache_worker, CacheWorker, Command};
