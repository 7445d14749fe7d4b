//! Disk Cache Module
//!
//! Persistent key-to-bytes store with LRU eviction. Reads run on the caller's
//! thread; writes, removals and sweeps run on a dedicated serial worker.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cache::{CacheEntry, CacheStats, LruIndex};
use crate::config::CacheConfig;
use crate::error::Result;
use crate::hash::CacheKey;
use crate::tasks::{spawn_cache_worker, CacheWorker, Command};

const TEMP_EXTENSION: &str = "tmp";

// == Sweep Report ==
/// Outcome of one eviction pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Number of entries evicted
    pub evicted: usize,
    /// Bytes released by the evicted entries
    pub freed_bytes: u64,
    /// Bytes still held after the pass
    pub remaining_bytes: u64,
}

/// Index and counters guarded together so occupancy never drifts from stats.
#[derive(Debug, Default)]
pub(crate) struct CacheState {
    pub(crate) index: LruIndex,
    pub(crate) stats: CacheStats,
}

/// State shared between the cache handle and its worker thread.
#[derive(Debug)]
pub(crate) struct CacheShared {
    name: String,
    dir: PathBuf,
    config: RwLock<CacheConfig>,
    state: Mutex<CacheState>,
}

impl CacheShared {
    fn entry_path(&self, key: &CacheKey) -> PathBuf {
        self.dir.join(key.as_str())
    }

    fn temp_path(&self, key: &CacheKey) -> PathBuf {
        self.entry_path(key).with_extension(TEMP_EXTENSION)
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn initial_sweep_delay(&self) -> Duration {
        self.config.read().initial_sweep_delay
    }

    pub(crate) fn sweep_interval(&self) -> Duration {
        self.config.read().sweep_interval
    }

    // == Apply Command ==
    /// Executes one queued command. Runs on the worker thread only.
    pub(crate) fn apply(&self, command: Command) {
        match command {
            Command::Put { key, data } => self.write_entry(&key, &data),
            Command::Remove { key } => self.remove_entry(&key),
            Command::RemoveAll => self.remove_all_entries(),
            Command::Sweep { reply } => {
                let report = self.sweep();
                let _ = reply.send(report);
            }
            Command::Flush { reply } => {
                let _ = reply.send(());
            }
            Command::Shutdown => {}
        }
    }

    // == Write ==
    /// Writes the payload to a temporary file and renames it into place so
    /// concurrent readers see either the old or the new payload.
    fn write_entry(&self, key: &CacheKey, data: &[u8]) {
        let path = self.entry_path(key);
        let temp_path = self.temp_path(key);

        let result = fs::write(&temp_path, data).and_then(|_| fs::rename(&temp_path, &path));

        let mut state = self.state.lock();
        match result {
            Ok(()) => {
                state.index.insert(key.clone(), data.len() as u64);
                state.stats.record_write();
                debug!(cache = %self.name, key = %key, size = data.len(), "Stored cache entry");
            }
            Err(e) => {
                state.stats.record_write_failure();
                warn!(cache = %self.name, key = %key, error = %e, "Failed to store cache entry");
                let _ = fs::remove_file(&temp_path);
            }
        }
        let (len, bytes) = (state.index.len(), state.index.total_bytes());
        state.stats.set_occupancy(len, bytes);
    }

    // == Remove ==
    fn remove_entry(&self, key: &CacheKey) {
        {
            let mut state = self.state.lock();
            state.index.remove(key);
            let (len, bytes) = (state.index.len(), state.index.total_bytes());
            state.stats.set_occupancy(len, bytes);
        }
        remove_file_quietly(&self.name, &self.entry_path(key));
    }

    fn remove_all_entries(&self) {
        {
            let mut state = self.state.lock();
            state.index.clear();
            state.stats.set_occupancy(0, 0);
        }

        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(cache = %self.name, dir = ?self.dir, error = %e, "Failed to read cache directory");
                return;
            }
        };

        let mut removed = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_file() && remove_file_quietly(&self.name, &path) {
                removed += 1;
            }
        }
        info!(cache = %self.name, count = removed, "Cleared cache");
    }

    // == Sweep ==
    /// Evicts least recently used entries once the size limit is exceeded,
    /// trimming down to `size_limit * trim_ratio`.
    pub(crate) fn sweep(&self) -> SweepReport {
        let (limit, target) = {
            let config = self.config.read();
            (config.size_limit, config.trim_target())
        };

        let (victims, remaining_bytes) = {
            let mut state = self.state.lock();
            if state.index.total_bytes() <= limit {
                return SweepReport {
                    remaining_bytes: state.index.total_bytes(),
                    ..SweepReport::default()
                };
            }
            let victims = state.index.evict_to(target);
            state.stats.record_evictions(victims.len());
            let (len, bytes) = (state.index.len(), state.index.total_bytes());
            state.stats.set_occupancy(len, bytes);
            (victims, bytes)
        };

        for victim in &victims {
            remove_file_quietly(&self.name, &self.entry_path(&victim.key));
        }

        let report = SweepReport {
            evicted: victims.len(),
            freed_bytes: victims.iter().map(|v| v.size).sum(),
            remaining_bytes,
        };
        info!(
            cache = %self.name,
            evicted = report.evicted,
            freed_bytes = report.freed_bytes,
            remaining_bytes = report.remaining_bytes,
            "Cache sweep evicted entries"
        );
        report
    }
}

/// Returns true if the file was removed. A missing file is not an error.
fn remove_file_quietly(cache: &str, path: &Path) -> bool {
    match fs::remove_file(path) {
        Ok(()) => true,
        Err(e) if e.kind() == ErrorKind::NotFound => false,
        Err(e) => {
            warn!(cache = %cache, path = ?path, error = %e, "Failed to remove cache file");
            false
        }
    }
}

// == Disk Cache ==
/// A thread-safe LRU disk cache.
///
/// Entries are evicted least recently used first once the total size exceeds
/// the configured limit. Sweeps run periodically on the cache's worker
/// thread and may run in parallel to reads.
///
/// `put`, `remove` and `remove_all` return immediately; a `get` issued right
/// after a `put` is not guaranteed to observe the new payload. Use
/// [`flush`](DiskCache::flush) to wait for queued writes.
///
/// Storage failures never surface from this type: failed writes are logged
/// and dropped, failed reads count as misses.
///
/// Multiple instances with the same `root_dir` and `name` must not exist at
/// the same time.
#[derive(Debug)]
pub struct DiskCache {
    shared: Arc<CacheShared>,
    worker: CacheWorker,
}

impl DiskCache {
    // == Constructor ==
    /// Opens (or creates) the cache directory and starts the worker.
    ///
    /// Payloads already present in the directory are indexed again, oldest
    /// modification time first; leftovers of interrupted writes are deleted.
    pub fn new(config: CacheConfig) -> Result<Self> {
        config.validate()?;

        let dir = config.storage_dir();
        fs::create_dir_all(&dir)?;

        let index = recover_index(&config.name, &dir)?;
        let mut stats = CacheStats::new();
        stats.set_occupancy(index.len(), index.total_bytes());
        if !index.is_empty() {
            info!(
                cache = %config.name,
                entries = index.len(),
                bytes = index.total_bytes(),
                "Recovered cache index"
            );
        }

        let shared = Arc::new(CacheShared {
            name: config.name.clone(),
            dir,
            config: RwLock::new(config),
            state: Mutex::new(CacheState { index, stats }),
        });
        let worker = spawn_cache_worker(shared.clone())?;

        Ok(Self { shared, worker })
    }

    // == Get ==
    /// Retrieves the payload stored for the key, refreshing its recency.
    ///
    /// Blocks on disk I/O but never on the worker queue.
    pub fn get(&self, key: &CacheKey) -> Option<Bytes> {
        let path = self.shared.entry_path(key);
        match fs::read(&path) {
            Ok(data) => {
                let mut state = self.shared.state.lock();
                state.index.touch(key);
                state.stats.record_hit();
                Some(Bytes::from(data))
            }
            Err(e) => {
                if e.kind() != ErrorKind::NotFound {
                    warn!(cache = %self.shared.name, key = %key, error = %e, "Failed to read cache entry");
                }
                self.shared.state.lock().stats.record_miss();
                None
            }
        }
    }

    // == Has ==
    /// Returns true if a payload is stored for the key.
    ///
    /// Only file metadata is read. Counts as an access for recency.
    pub fn has(&self, key: &CacheKey) -> bool {
        if !self.shared.state.lock().index.contains(key) {
            return false;
        }

        let exists = fs::metadata(self.shared.entry_path(key)).is_ok_and(|m| m.is_file());
        let mut state = self.shared.state.lock();
        if exists {
            state.index.touch(key)
        } else {
            // Removed behind our back; drop the stale entry.
            state.index.remove(key);
            let (len, bytes) = (state.index.len(), state.index.total_bytes());
            state.stats.set_occupancy(len, bytes);
            false
        }
    }

    // == Put ==
    /// Stores the payload for the key. Returns immediately; the write happens
    /// on the worker thread.
    pub fn put(&self, data: Bytes, key: &CacheKey) {
        self.worker.send(Command::Put {
            key: key.clone(),
            data,
        });
    }

    // == Remove ==
    /// Removes the payload for the key. Returns immediately.
    pub fn remove(&self, key: &CacheKey) {
        self.worker.send(Command::Remove { key: key.clone() });
    }

    /// Removes every payload. Returns immediately.
    pub fn remove_all(&self) {
        self.worker.send(Command::RemoveAll);
    }

    // == Sweep ==
    /// Runs one eviction pass on the worker and blocks until it completes.
    ///
    /// Must not be called from an async task on a single-threaded runtime;
    /// use `spawn_blocking` there.
    pub fn sweep(&self) -> SweepReport {
        let (reply, done) = crossbeam_channel::bounded(1);
        if !self.worker.send(Command::Sweep { reply }) {
            return SweepReport::default();
        }
        done.recv().unwrap_or_default()
    }

    // == Flush ==
    /// Blocks until every command queued before this call has been applied.
    pub fn flush(&self) {
        let (reply, done) = crossbeam_channel::bounded(1);
        if self.worker.send(Command::Flush { reply }) {
            let _ = done.recv();
        }
    }

    // == Limits ==
    /// Changes the size limit. Takes effect at the next sweep.
    pub fn set_size_limit(&self, size_limit: u64) {
        self.shared.config.write().size_limit = size_limit;
    }

    /// Changes the periodic sweep interval. Takes effect when the next sweep
    /// is scheduled.
    pub fn set_sweep_interval(&self, interval: Duration) {
        if !interval.is_zero() {
            self.shared.config.write().sweep_interval = interval;
        }
    }

    pub fn size_limit(&self) -> u64 {
        self.shared.config.read().size_limit
    }

    // == Introspection ==
    /// Returns current cache statistics.
    pub fn stats(&self) -> CacheStats {
        self.shared.state.lock().stats.clone()
    }

    /// Returns the indexed entries, most recently used first.
    pub fn entries(&self) -> Vec<CacheEntry> {
        self.shared.state.lock().index.entries()
    }

    /// Total bytes currently indexed.
    pub fn total_size(&self) -> u64 {
        self.shared.state.lock().index.total_bytes()
    }

    pub fn len(&self) -> usize {
        self.shared.state.lock().index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.state.lock().index.is_empty()
    }

    pub fn name(&self) -> &str {
        self.shared.name()
    }

    /// Directory holding the payload files.
    pub fn path(&self) -> &Path {
        &self.shared.dir
    }
}

// == Index Recovery ==
/// Indexes payload files left by a previous instance and deletes temporary
/// files from interrupted writes.
fn recover_index(name: &str, dir: &Path) -> Result<LruIndex> {
    let mut found: Vec<(DateTime<Utc>, CacheKey, u64)> = Vec::new();

    for entry in fs::read_dir(dir)?.flatten() {
        let path = entry.path();
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        if !metadata.is_file() {
            continue;
        }

        if path.extension().is_some_and(|ext| ext == TEMP_EXTENSION) {
            debug!(cache = %name, path = ?path, "Removing interrupted write");
            remove_file_quietly(name, &path);
            continue;
        }

        let Some(key) = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(CacheKey::from_hashed)
        else {
            continue;
        };

        let modified = metadata
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        found.push((modified, key, metadata.len()));
    }

    found.sort_by(|a, b| a.0.cmp(&b.0));

    let mut index = LruIndex::new();
    for (modified, key, size) in found {
        index.insert_recovered(key, size, modified);
    }
    Ok(index)
}
