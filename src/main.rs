//! Asset Cache - command line front end
//!
//! Resolves URLs through the cache-backed loader and reports cache state.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context};
use clap::Parser;
use futures::future::join_all;
use serde::Serialize;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use asset_cache::cache::{CacheEntry, EntryInfo};
use asset_cache::{Asset, ByteRange, CacheStats, Config, DiskCache, ResourceLoadCoordinator};

/// Resolve remote assets through a persistent LRU disk cache.
///
/// Configuration is read from `ASSET_CACHE_*` / `ASSET_LOADER_*` environment
/// variables; flags override it.
#[derive(Parser, Debug)]
#[command(name = "asset_cache", version, about)]
struct Cli {
    /// URLs to resolve
    urls: Vec<String>,

    /// Write each body into this directory
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Extra request header as "Name: value" (repeatable)
    #[arg(short = 'H', long = "header")]
    headers: Vec<String>,

    /// Only fetch this byte range, e.g. "0-1023" or "1024-"
    #[arg(short, long, value_parser = parse_range)]
    range: Option<ByteRange>,

    /// Cache root directory
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Cache size limit in bytes
    #[arg(long)]
    size_limit: Option<u64>,

    /// Bypass the disk cache entirely
    #[arg(long)]
    no_cache: bool,

    /// Remove every cached entry before resolving
    #[arg(long)]
    clear: bool,

    /// Run one eviction pass after resolving
    #[arg(long)]
    sweep: bool,

    /// Print cache statistics and entries as JSON before exiting
    #[arg(long)]
    stats: bool,
}

fn parse_range(value: &str) -> Result<ByteRange, String> {
    let (start, end) = value
        .split_once('-')
        .ok_or_else(|| format!("expected START-END or START-, got '{value}'"))?;
    let start: u64 = start.trim().parse().map_err(|e| format!("range start: {e}"))?;
    if end.trim().is_empty() {
        return Ok(ByteRange::starting_at(start));
    }
    let end: u64 = end.trim().parse().map_err(|e| format!("range end: {e}"))?;
    ByteRange::new(start, end).map_err(|e| e.to_string())
}

fn build_asset(url: &str, headers: &[String]) -> anyhow::Result<Asset> {
    let mut asset = Asset::new(url);
    for header in headers {
        let (name, value) = header
            .split_once(':')
            .ok_or_else(|| anyhow!("header '{header}' is not in 'Name: value' form"))?;
        asset = asset.with_header(name.trim(), value.trim())?;
    }
    Ok(asset)
}

/// File name for a downloaded body: the last URL path segment, or the cache key.
fn output_name(asset: &Asset) -> String {
    let segment = url::Url::parse(asset.url()).ok().and_then(|url| {
        url.path_segments()
            .and_then(|mut segments| segments.next_back().map(str::to_string))
            .filter(|s| !s.is_empty())
    });
    segment
        .or_else(|| asset.cache_key().map(|key| key.to_string()))
        .unwrap_or_else(|| "asset".to_string())
}

async fn resolve_one(
    coordinator: &ResourceLoadCoordinator,
    asset: &Asset,
    range: Option<ByteRange>,
    output: Option<&Path>,
) -> anyhow::Result<usize> {
    let body = match range {
        Some(range) => coordinator.fetch_range(asset, range).await,
        None => coordinator.fetch(asset).await,
    }
    .with_context(|| format!("failed to resolve {}", asset.url()))?;

    if let Some(dir) = output {
        let path = dir.join(output_name(asset));
        tokio::fs::write(&path, &body)
            .await
            .with_context(|| format!("failed to write {}", path.display()))?;
        info!(path = %path.display(), "Body written");
    }
    Ok(body.len())
}

/// JSON printed by `--stats`.
#[derive(Serialize)]
struct StatsReport {
    stats: CacheStats,
    /// Most recently used first
    entries: Vec<EntryInfo>,
}

impl StatsReport {
    fn collect(cache: &DiskCache) -> Self {
        Self {
            stats: cache.stats(),
            entries: cache.entries().iter().map(CacheEntry::info).collect(),
        }
    }
}

/// Waits for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, cancelling in-flight requests...");
        }
        _ = terminate => {
            info!("Received SIGTERM, cancelling in-flight requests...");
        }
    }
}

/// Runs a blocking cache operation off the async workers.
async fn on_cache<T, F>(cache: &Arc<DiskCache>, op: F) -> anyhow::Result<T>
where
    T: Send + 'static,
    F: FnOnce(&DiskCache) -> T + Send + 'static,
{
    let cache = Arc::clone(cache);
    tokio::task::spawn_blocking(move || op(&cache))
        .await
        .context("cache task panicked")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Defaults to "info" for this crate, can be overridden with RUST_LOG
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "asset_cache=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let mut config = Config::from_env();
    if let Some(dir) = &cli.cache_dir {
        config.cache.root_dir = dir.clone();
    }
    if let Some(limit) = cli.size_limit {
        config.cache.size_limit = limit;
    }
    if cli.no_cache {
        config.cache_enabled = false;
    }
    info!(
        "Configuration loaded: cache={} dir={} size_limit={} trim_ratio={} enabled={}",
        config.cache.name,
        config.cache.storage_dir().display(),
        config.cache.size_limit,
        config.cache.trim_ratio,
        config.cache_enabled
    );

    if let Some(dir) = &cli.output {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("failed to create {}", dir.display()))?;
    }

    let coordinator = ResourceLoadCoordinator::from_config(&config)?;
    let cache = coordinator.cache().cloned();

    if cli.clear {
        if let Some(cache) = &cache {
            cache.remove_all();
            on_cache(cache, DiskCache::flush).await?;
            info!("Cache cleared");
        }
    }

    let assets = cli
        .urls
        .iter()
        .map(|url| build_asset(url, &cli.headers))
        .collect::<anyhow::Result<Vec<_>>>()?;

    let resolve_all = join_all(
        assets
            .iter()
            .map(|asset| resolve_one(&coordinator, asset, cli.range, cli.output.as_deref())),
    );

    let mut failures = 0;
    tokio::select! {
        results = resolve_all => {
            for (asset, result) in assets.iter().zip(results) {
                match result {
                    Ok(bytes) => println!("{}\t{} bytes", asset.url(), bytes),
                    Err(e) => {
                        failures += 1;
                        eprintln!("{}\terror: {:#}", asset.url(), e);
                    }
                }
            }
        }
        _ = shutdown_signal() => {
            warn!("Interrupted; in-flight requests cancelled");
            failures = assets.len();
        }
    }

    if let Some(cache) = &cache {
        // Let queued writes land before reporting or exiting
        on_cache(cache, DiskCache::flush).await?;

        if cli.sweep {
            let report = on_cache(cache, DiskCache::sweep).await?;
            info!(
                evicted = report.evicted,
                freed = report.freed_bytes,
                remaining = report.remaining_bytes,
                "Sweep finished"
            );
        }
        if cli.stats {
            let report = StatsReport::collect(cache);
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    if failures > 0 {
        bail!("{failures} of {} requests failed", assets.len());
    }
    Ok(())
}
