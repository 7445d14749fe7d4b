//! Coordinator Module
//!
//! Answers "give me the bytes of resource R" for a host engine: serves
//! cached payloads directly, otherwise streams the resource from the network
//! while accumulating it, and commits complete payloads to the disk cache in
//! the background.

mod asset;
mod shared_fetch;

use std::collections::HashMap;
use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::debug;

use crate::cache::{DataCaching, DiskCache};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::hash::CacheKey;
use crate::loader::{
    ByteLoader, ByteRange, Cancellable, CompletionCallback, DataLoader, LoadHandle, LoadRequest,
    ResponseInfo, TracingObserver,
};

pub use asset::Asset;
pub use shared_fetch::ResolveSink;

use shared_fetch::{InFlight, SharedFetch, Subscriber};

// == Resolve Handle ==
/// Cancellation handle returned by [`ResourceLoadCoordinator::resolve`].
///
/// Cancelling a request that joined another caller's transfer only detaches
/// this caller; the transfer stops once nobody is left.
pub struct ResolveHandle {
    target: Target,
    cancelled: AtomicBool,
}

enum Target {
    /// Completed before `resolve` returned (cache hit or invalid request)
    Settled,
    Network(LoadHandle),
    Shared {
        fetch: Arc<SharedFetch>,
        subscriber: Arc<Subscriber>,
    },
}

impl ResolveHandle {
    fn new(target: Target) -> Self {
        Self {
            target,
            cancelled: AtomicBool::new(false),
        }
    }

    fn settled() -> Self {
        Self::new(Target::Settled)
    }

    /// True if the request completed before `resolve` returned.
    pub fn is_settled(&self) -> bool {
        matches!(self.target, Target::Settled)
    }
}

impl Cancellable for ResolveHandle {
    fn cancel(&self) {
        if self.is_settled() || self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        match &self.target {
            Target::Settled => {}
            Target::Network(handle) => handle.cancel(),
            Target::Shared { fetch, subscriber } => fetch.cancel_subscriber(subscriber),
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

impl fmt::Debug for ResolveHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let target = match &self.target {
            Target::Settled => "settled",
            Target::Network(_) => "network",
            Target::Shared { .. } => "shared",
        };
        f.debug_struct("ResolveHandle")
            .field("target", &target)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Cancels the wrapped handle unless disarmed.
struct CancelOnDrop(Option<ResolveHandle>);

impl CancelOnDrop {
    fn disarm(mut self) {
        self.0 = None;
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if let Some(handle) = self.0.take() {
            handle.cancel();
        }
    }
}

// == Coordinator ==
/// Bridges resource requests to a cache and the network.
///
/// Whole-resource requests for the same URL are coalesced onto one transfer.
/// Callbacks must not synchronously resolve the same resource again from
/// inside `on_data`.
pub struct ResourceLoadCoordinator<L: ByteLoader = DataLoader, S: DataCaching = DiskCache> {
    loader: L,
    cache: Option<Arc<S>>,
    in_flight: Arc<InFlight>,
}

impl ResourceLoadCoordinator<DataLoader> {
    /// Builds the HTTP loader and, when enabled, the disk cache from `config`.
    ///
    /// Must be called inside a tokio runtime.
    pub fn from_config(config: &Config) -> Result<Self> {
        let loader = DataLoader::new(&config.loader)?.with_observer(Arc::new(TracingObserver));
        if config.cache_enabled {
            let cache = DiskCache::new(config.cache.clone())?;
            Ok(Self::new(loader, Arc::new(cache)))
        } else {
            Ok(Self::without_cache(loader))
        }
    }
}

impl<L: ByteLoader> ResourceLoadCoordinator<L> {
    /// Network-only coordinator. Concurrent requests are still coalesced.
    pub fn without_cache(loader: L) -> Self {
        Self {
            loader,
            cache: None,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<L: ByteLoader, S: DataCaching + 'static> ResourceLoadCoordinator<L, S> {
    pub fn new(loader: L, cache: Arc<S>) -> Self {
        Self {
            loader,
            cache: Some(cache),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn loader(&self) -> &L {
        &self.loader
    }

    pub fn cache(&self) -> Option<&Arc<S>> {
        self.cache.as_ref()
    }

    /// Number of distinct resources currently being transferred.
    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().len()
    }

    // == Resolve ==
    /// Resolves the whole resource.
    ///
    /// On a cache hit the payload is delivered in one `on_data` call followed
    /// by `on_complete(Ok(()))`, both before this returns. On a miss chunks are
    /// streamed as they arrive and the payload is cached once the transfer
    /// succeeds. `on_complete` runs exactly once.
    pub fn resolve<D, C>(&self, asset: &Asset, on_data: D, on_complete: C) -> ResolveHandle
    where
        D: FnMut(Bytes) + Send + 'static,
        C: FnOnce(Result<()>) + Send + 'static,
    {
        let mut on_data = on_data;
        let key = asset.cache_key();

        if let Some(payload) = self.lookup(key.as_ref()) {
            debug!(url = asset.url(), bytes = payload.len(), "Cache hit");
            on_data(payload);
            on_complete(Ok(()));
            return ResolveHandle::settled();
        }

        let request = match asset.to_request() {
            Ok(request) => request,
            Err(error) => {
                on_complete(Err(error));
                return ResolveHandle::settled();
            }
        };

        match key {
            Some(key) => self.load_shared(key, request, Box::new(on_data), Box::new(on_complete)),
            None => self.load_direct(request, Box::new(on_data), Box::new(on_complete)),
        }
    }

    /// Resolves a byte range of the resource.
    ///
    /// A cached payload is sliced; a range starting past its end fails with
    /// `InvalidRequest`. On a miss a ranged request is sent on its own
    /// transfer and its bytes are never cached.
    pub fn resolve_range<D, C>(
        &self,
        asset: &Asset,
        range: ByteRange,
        on_data: D,
        on_complete: C,
    ) -> ResolveHandle
    where
        D: FnMut(Bytes) + Send + 'static,
        C: FnOnce(Result<()>) + Send + 'static,
    {
        let mut on_data = on_data;

        if let Some(payload) = self.lookup(asset.cache_key().as_ref()) {
            match range.clamp_to(payload.len() as u64) {
                Ok(bounds) => {
                    debug!(url = asset.url(), %range, "Serving range from cache");
                    on_data(payload.slice(bounds));
                    on_complete(Ok(()));
                }
                Err(error) => on_complete(Err(error)),
            }
            return ResolveHandle::settled();
        }

        match asset.to_request() {
            Ok(request) => self.load_direct(
                request.with_range(range),
                Box::new(on_data),
                Box::new(on_complete),
            ),
            Err(error) => {
                on_complete(Err(error));
                ResolveHandle::settled()
            }
        }
    }

    /// Resolves the whole resource and collects it into one buffer.
    ///
    /// Dropping the future cancels this caller's request.
    pub async fn fetch(&self, asset: &Asset) -> Result<Bytes> {
        collect(|on_data, on_complete| self.resolve(asset, on_data, on_complete)).await
    }

    /// Resolves a byte range and collects it into one buffer.
    pub async fn fetch_range(&self, asset: &Asset, range: ByteRange) -> Result<Bytes> {
        collect(|on_data, on_complete| self.resolve_range(asset, range, on_data, on_complete)).await
    }

    fn lookup(&self, key: Option<&CacheKey>) -> Option<Bytes> {
        match (&self.cache, key) {
            (Some(cache), Some(key)) => cache.get(key),
            _ => None,
        }
    }

    fn load_direct(
        &self,
        request: LoadRequest,
        mut on_data: ResolveSink,
        on_complete: CompletionCallback,
    ) -> ResolveHandle {
        debug!(url = %request.url, range = ?request.range, "Uncoalesced network load");
        let handle = self.loader.load_data(
            request,
            Box::new(move |chunk: Bytes, _: &ResponseInfo| on_data(chunk)),
            on_complete,
        );
        ResolveHandle::new(Target::Network(handle))
    }

    fn load_shared(
        &self,
        key: CacheKey,
        request: LoadRequest,
        on_data: ResolveSink,
        on_complete: CompletionCallback,
    ) -> ResolveHandle {
        let subscriber = Arc::new(Subscriber::new(on_data, on_complete));

        let mut in_flight = self.in_flight.lock();
        if let Some(fetch) = in_flight.get(&key).cloned() {
            if fetch.join(&subscriber) {
                drop(in_flight);
                debug!(url = %request.url, "Joining in-flight transfer");
                fetch.catch_up(&subscriber);
                return ResolveHandle::new(Target::Shared { fetch, subscriber });
            }
        }

        let cache = self
            .cache
            .as_ref()
            .map(|cache| Arc::clone(cache) as Arc<dyn DataCaching>);
        let fetch = SharedFetch::new(
            key.clone(),
            cache,
            Arc::downgrade(&self.in_flight),
            Arc::clone(&subscriber),
        );
        in_flight.insert(key, Arc::clone(&fetch));
        drop(in_flight);

        debug!(url = %request.url, "Cache miss; starting transfer");
        let on_chunk = Arc::clone(&fetch);
        let on_done = Arc::clone(&fetch);
        let handle = self.loader.load_data(
            request,
            Box::new(move |chunk: Bytes, _: &ResponseInfo| on_chunk.deliver(chunk)),
            Box::new(move |result| on_done.finish(result)),
        );
        fetch.attach(handle);

        ResolveHandle::new(Target::Shared { fetch, subscriber })
    }
}

/// Drives one resolve to completion, buffering every chunk.
async fn collect<F>(start: F) -> Result<Bytes>
where
    F: FnOnce(ResolveSink, CompletionCallback) -> ResolveHandle,
{
    let body = Arc::new(Mutex::new(BytesMut::new()));
    let sink = Arc::clone(&body);
    let (done, completed) = oneshot::channel();

    let handle = start(
        Box::new(move |chunk: Bytes| sink.lock().extend_from_slice(&chunk)),
        Box::new(move |result| {
            let _ = done.send(result);
        }),
    );
    let guard = CancelOnDrop(Some(handle));

    let result = completed.await.unwrap_or(Err(Error::Cancelled));
    guard.disarm();
    result?;

    let payload = mem::take(&mut *body.lock());
    Ok(payload.freeze())
}
