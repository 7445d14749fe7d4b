//! Cache Worker Task
//!
//! Dedicated thread that applies a cache's writes, removals and sweeps in
//! FIFO order and schedules the periodic LRU sweep.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use bytes::Bytes;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, info, warn};

use crate::cache::store::CacheShared;
use crate::cache::SweepReport;
use crate::error::Result;
use crate::hash::CacheKey;

/// Work items for the cache worker.
#[derive(Debug)]
pub(crate) enum Command {
    Put { key: CacheKey, data: Bytes },
    Remove { key: CacheKey },
    RemoveAll,
    Sweep { reply: Sender<SweepReport> },
    Flush { reply: Sender<()> },
    Shutdown,
}

/// Handle to a running cache worker. Dropping it drains the queue and joins
/// the thread.
#[derive(Debug)]
pub(crate) struct CacheWorker {
    sender: Sender<Command>,
    handle: Option<JoinHandle<()>>,
}

impl CacheWorker {
    /// Queues a command. Returns false if the worker is gone.
    pub(crate) fn send(&self, command: Command) -> bool {
        match self.sender.send(command) {
            Ok(()) => true,
            Err(_) => {
                warn!("Cache worker is not running; command dropped");
                false
            }
        }
    }
}

impl Drop for CacheWorker {
    fn drop(&mut self) {
        let _ = self.sender.send(Command::Shutdown);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Cache worker panicked");
            }
        }
    }
}

/// Spawns the worker thread for a cache.
///
/// The first sweep runs after the configured initial delay, every following
/// one `sweep_interval` after the previous sweep finished. The interval is
/// re-read each time a sweep is scheduled.
pub(crate) fn spawn_cache_worker(shared: Arc<CacheShared>) -> Result<CacheWorker> {
    let (sender, commands) = unbounded();

    let handle = thread::Builder::new()
        .name(format!("asset-cache-{}", shared.name()))
        .spawn(move || worker_loop(shared, commands))?;

    Ok(CacheWorker {
        sender,
        handle: Some(handle),
    })
}

fn worker_loop(shared: Arc<CacheShared>, commands: Receiver<Command>) {
    info!(cache = %shared.name(), "Cache worker started");
    let mut next_sweep = Instant::now() + shared.initial_sweep_delay();

    loop {
        // A busy queue never times out, so the deadline is checked first
        if Instant::now() >= next_sweep {
            run_periodic_sweep(&shared);
            next_sweep = Instant::now() + shared.sweep_interval();
        }

        match commands.recv_deadline(next_sweep) {
            Ok(Command::Shutdown) => break,
            Ok(command) => shared.apply(command),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    info!(cache = %shared.name(), "Cache worker stopped");
}

fn run_periodic_sweep(shared: &CacheShared) {
    let report = shared.sweep();
    if report.evicted == 0 {
        debug!(
            cache = %shared.name(),
            bytes = report.remaining_bytes,
            "Periodic sweep: nothing to evict"
        );
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use tempfile::TempDir;

    use crate::cache::DiskCache;
    use crate::config::CacheConfig;
    use crate::hash::CacheKey;
    use bytes::Bytes;

    fn config(dir: &TempDir) -> CacheConfig {
        CacheConfig::new("worker-test")
            .with_root_dir(dir.path())
            .with_size_limit(100)
            .with_trim_ratio(0.5)
    }

    #[test]
    fn test_periodic_sweep_runs_after_initial_delay() {
        let dir = TempDir::new().unwrap();
        let cache = DiskCache::new(
            config(&dir)
                .with_initial_sweep_delay(Duration::from_millis(300))
                .with_sweep_interval(Duration::from_millis(100)),
        )
        .unwrap();

        cache.put(Bytes::from(vec![0u8; 60]), &CacheKey::new("a").unwrap());
        cache.put(Bytes::from(vec![0u8; 60]), &CacheKey::new("b").unwrap());
        cache.flush();
        assert_eq!(cache.total_size(), 120);

        std::thread::sleep(Duration::from_millis(800));

        assert!(cache.total_size() <= 50);
        assert!(cache.stats().evictions >= 1);
    }

    #[test]
    fn test_no_periodic_sweep_before_delay() {
        let dir = TempDir::new().unwrap();
        let cache = DiskCache::new(
            config(&dir)
                .with_initial_sweep_delay(Duration::from_secs(3600))
                .with_sweep_interval(Duration::from_secs(3600)),
        )
        .unwrap();

        cache.put(Bytes::from(vec![0u8; 150]), &CacheKey::new("a").unwrap());
        cache.flush();
        std::thread::sleep(Duration::from_millis(100));

        assert_eq!(cache.total_size(), 150);
    }

    #[test]
    fn test_periodic_sweep_runs_while_queue_stays_busy() {
        let dir = TempDir::new().unwrap();
        let cache = DiskCache::new(
            CacheConfig::new("worker-test")
                .with_root_dir(dir.path())
                .with_size_limit(1000)
                .with_trim_ratio(0.5)
                .with_initial_sweep_delay(Duration::from_millis(20))
                .with_sweep_interval(Duration::from_millis(20)),
        )
        .unwrap();

        let started = Instant::now();
        let mut n = 0u64;
        while started.elapsed() < Duration::from_millis(500) {
            let key = CacheKey::new(&format!("entry-{}", n % 5000)).unwrap();
            cache.put(Bytes::from(vec![0u8; 100]), &key);
            n += 1;
        }
        cache.flush();

        assert!(cache.stats().evictions > 0);
        assert!(cache.total_size() < n.min(5000) * 100);
    }

    #[test]
    fn test_drop_drains_queue() {
        let dir = TempDir::new().unwrap();
        let key = CacheKey::new("a").unwrap();
        {
            let cache = DiskCache::new(config(&dir)).unwrap();
            cache.put(Bytes::from_static(b"payload"), &key);
        }

        let path = dir.path().join("worker-test").join(key.as_str());
        assert_eq!(std::fs::read(path).unwrap(), b"payload");
    }
}
