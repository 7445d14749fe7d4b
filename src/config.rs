//! Configuration Module
//!
//! Cache, loader and process configuration, loadable from environment variables.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};

/// Default cache size limit: 128 MiB.
pub const DEFAULT_SIZE_LIMIT: u64 = 128 * 1024 * 1024;
/// Default fraction of the size limit a sweep trims down to.
pub const DEFAULT_TRIM_RATIO: f64 = 0.7;
/// Default time between periodic sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);
/// Default delay before the first periodic sweep.
pub const DEFAULT_INITIAL_SWEEP_DELAY: Duration = Duration::from_secs(10);
/// Name used by the binary when none is configured.
pub const DEFAULT_CACHE_NAME: &str = "asset_cache.data";

// == Cache Config ==
/// Parameters of a single [`DiskCache`](crate::cache::DiskCache) instance.
///
/// Two caches must never be opened with the same `root_dir` and `name` at the
/// same time. This is not checked; both instances would corrupt each other's
/// index.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    /// Cache instance identity, used as the storage directory name
    pub name: String,
    /// Directory under which the named storage directory is created
    pub root_dir: PathBuf,
    /// Size limit in bytes
    pub size_limit: u64,
    /// Sweeps trim until occupancy is at most `size_limit * trim_ratio`
    pub trim_ratio: f64,
    /// Time between periodic sweeps
    pub sweep_interval: Duration,
    /// Time until the first periodic sweep
    pub initial_sweep_delay: Duration,
}

impl CacheConfig {
    /// Creates a config with default limits stored under the system temp dir.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            root_dir: env::temp_dir().join("asset_cache"),
            size_limit: DEFAULT_SIZE_LIMIT,
            trim_ratio: DEFAULT_TRIM_RATIO,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            initial_sweep_delay: DEFAULT_INITIAL_SWEEP_DELAY,
        }
    }

    pub fn with_root_dir(mut self, root_dir: impl Into<PathBuf>) -> Self {
        self.root_dir = root_dir.into();
        self
    }

    pub fn with_size_limit(mut self, size_limit: u64) -> Self {
        self.size_limit = size_limit;
        self
    }

    pub fn with_trim_ratio(mut self, trim_ratio: f64) -> Self {
        self.trim_ratio = trim_ratio;
        self
    }

    pub fn with_sweep_interval(mut self, sweep_interval: Duration) -> Self {
        self.sweep_interval = sweep_interval;
        self
    }

    pub fn with_initial_sweep_delay(mut self, delay: Duration) -> Self {
        self.initial_sweep_delay = delay;
        self
    }

    /// Directory holding this instance's payload files.
    pub fn storage_dir(&self) -> PathBuf {
        self.root_dir.join(&self.name)
    }

    /// Occupancy a sweep trims down to.
    pub fn trim_target(&self) -> u64 {
        (self.size_limit as f64 * self.trim_ratio) as u64
    }

    // == Validate ==
    /// Checks that the configuration can back a cache instance.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::InvalidConfig("cache name cannot be empty".to_string()));
        }
        if self.name.contains(|c: char| c == '/' || c == '\\') || self.name == "." || self.name == ".." {
            return Err(Error::InvalidConfig(format!(
                "cache name '{}' must be a single path component",
                self.name
            )));
        }
        if !(self.trim_ratio > 0.0 && self.trim_ratio <= 1.0) {
            return Err(Error::InvalidConfig(format!(
                "trim ratio {} must be in (0, 1]",
                self.trim_ratio
            )));
        }
        if self.sweep_interval.is_zero() {
            return Err(Error::InvalidConfig(
                "sweep interval must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

// == Loader Config ==
/// HTTP client parameters for the [`DataLoader`](crate::loader::DataLoader).
#[derive(Debug, Clone, PartialEq)]
pub struct LoaderConfig {
    /// Whole-request timeout; `None` lets long transfers run indefinitely
    pub request_timeout: Option<Duration>,
    /// Timeout for establishing the connection
    pub connect_timeout: Duration,
    /// User-Agent header sent with every request
    pub user_agent: String,
    /// Idle connections kept per host
    pub pool_max_idle_per_host: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            request_timeout: None,
            connect_timeout: Duration::from_secs(10),
            user_agent: format!("asset_cache/{}", env!("CARGO_PKG_VERSION")),
            pool_max_idle_per_host: 8,
        }
    }
}

// == Process Config ==
/// Full process configuration.
///
/// All values can be configured via environment variables with sensible defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub cache: CacheConfig,
    pub loader: LoaderConfig,
    /// When false the pipeline runs network-only
    pub cache_enabled: bool,
}

impl Config {
    /// Creates a new Config by loading values from environment variables.
    ///
    /// # Environment Variables
    /// - `ASSET_CACHE_NAME` - Cache instance name (default: asset_cache.data)
    /// - `ASSET_CACHE_DIR` - Root directory (default: <tmp>/asset_cache)
    /// - `ASSET_CACHE_SIZE_LIMIT` - Size limit in bytes (default: 134217728)
    /// - `ASSET_CACHE_TRIM_RATIO` - Trim ratio (default: 0.7)
    /// - `ASSET_CACHE_SWEEP_INTERVAL` - Seconds between sweeps (default: 30)
    /// - `ASSET_CACHE_INITIAL_SWEEP_DELAY` - Seconds before first sweep (default: 10)
    /// - `ASSET_CACHE_ENABLED` - Disable with `false` or `0` (default: true)
    /// - `ASSET_LOADER_TIMEOUT` - Request timeout in seconds (default: none)
    /// - `ASSET_LOADER_CONNECT_TIMEOUT` - Connect timeout in seconds (default: 10)
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let mut cache = CacheConfig::new(
            env::var("ASSET_CACHE_NAME").unwrap_or_else(|_| DEFAULT_CACHE_NAME.to_string()),
        );
        if let Ok(dir) = env::var("ASSET_CACHE_DIR") {
            cache.root_dir = PathBuf::from(dir);
        }
        cache.size_limit = env_parse("ASSET_CACHE_SIZE_LIMIT").unwrap_or(cache.size_limit);
        cache.trim_ratio = env_parse("ASSET_CACHE_TRIM_RATIO").unwrap_or(cache.trim_ratio);
        cache.sweep_interval = env_parse("ASSET_CACHE_SWEEP_INTERVAL")
            .map(Duration::from_secs)
            .unwrap_or(cache.sweep_interval);
        cache.initial_sweep_delay = env_parse("ASSET_CACHE_INITIAL_SWEEP_DELAY")
            .map(Duration::from_secs)
            .unwrap_or(cache.initial_sweep_delay);

        let cache_enabled = env::var("ASSET_CACHE_ENABLED")
            .map(|v| !matches!(v.trim().to_ascii_lowercase().as_str(), "0" | "false" | "no"))
            .unwrap_or(defaults.cache_enabled);

        let mut loader = defaults.loader;
        if let Some(secs) = env_parse::<u64>("ASSET_LOADER_TIMEOUT") {
            loader.request_timeout = Some(Duration::from_secs(secs));
        }
        loader.connect_timeout = env_parse("ASSET_LOADER_CONNECT_TIMEOUT")
            .map(Duration::from_secs)
            .unwrap_or(loader.connect_timeout);

        Self {
            cache,
            loader,
            cache_enabled,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache: CacheConfig::new(DEFAULT_CACHE_NAME),
            loader: LoaderConfig::default(),
            cache_enabled: true,
        }
    }
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|v| v.trim().parse().ok())
}
