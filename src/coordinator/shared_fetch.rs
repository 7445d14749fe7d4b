//! Shared Fetch
//!
//! One network transfer fanned out to every caller resolving the same
//! resource. Chunks are forwarded to subscribers as they arrive and
//! accumulated; a complete payload is committed to the cache, a failed or
//! abandoned one is dropped.
//!
//! Lock order: `delivery`, then the in-flight registry, then `state`. A
//! callback running under `delivery` may cancel its subscriber, which takes
//! the registry. The registry must therefore never be held while waiting for
//! `delivery`: joiners release it before [`SharedFetch::catch_up`]. Callbacks
//! never run under `state` or the registry.

use std::collections::HashMap;
use std::mem;
use std::sync::{Arc, Weak};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tracing::debug;

use crate::cache::DataCaching;
use crate::error::{Error, Result};
use crate::hash::CacheKey;
use crate::loader::{Cancellable, CompletionCallback, CompletionSlot, LoadHandle};

/// Receives each chunk of a resolved resource.
pub type ResolveSink = Box<dyn FnMut(Bytes) + Send>;

pub(crate) type InFlight = Mutex<HashMap<CacheKey, Arc<SharedFetch>>>;

// == Subscriber ==
#[derive(Debug, Default)]
struct DeliveryStatus {
    delivering: bool,
    cancel_requested: bool,
}

/// One caller's callbacks.
///
/// Cancellation that arrives while a chunk is being delivered is completed
/// right after that chunk, so `on_data` never runs after `on_complete`.
pub(crate) struct Subscriber {
    sink: Mutex<ResolveSink>,
    completion: CompletionSlot,
    status: Mutex<DeliveryStatus>,
}

impl Subscriber {
    pub(crate) fn new(sink: ResolveSink, on_complete: CompletionCallback) -> Self {
        Self {
            sink: Mutex::new(sink),
            completion: CompletionSlot::new(on_complete),
            status: Mutex::new(DeliveryStatus::default()),
        }
    }

    fn deliver(&self, chunk: Bytes) {
        {
            let mut status = self.status.lock();
            if status.cancel_requested || self.completion.is_completed() {
                return;
            }
            status.delivering = true;
        }

        let mut sink = self.sink.lock();
        (&mut *sink)(chunk);
        drop(sink);

        let cancelled = {
            let mut status = self.status.lock();
            status.delivering = false;
            status.cancel_requested
        };
        if cancelled {
            self.completion.complete(Err(Error::Cancelled));
        }
    }

    fn cancel(&self) {
        let delivering = {
            let mut status = self.status.lock();
            status.cancel_requested = true;
            status.delivering
        };
        if !delivering {
            self.completion.complete(Err(Error::Cancelled));
        }
    }

    fn complete(&self, result: Result<()>) {
        self.completion.complete(result);
    }
}

struct Member {
    subscriber: Arc<Subscriber>,
    /// False until the joiner has been sent the bytes buffered before it joined
    caught_up: bool,
}

#[derive(Default)]
struct FetchState {
    buffer: BytesMut,
    members: Vec<Member>,
    handle: Option<LoadHandle>,
    finished: bool,
}

// == Shared Fetch ==
pub(crate) struct SharedFetch {
    key: CacheKey,
    cache: Option<Arc<dyn DataCaching>>,
    registry: Weak<InFlight>,
    delivery: Mutex<()>,
    state: Mutex<FetchState>,
}

impl SharedFetch {
    /// Creates a fetch whose first subscriber is `owner`.
    pub(crate) fn new(
        key: CacheKey,
        cache: Option<Arc<dyn DataCaching>>,
        registry: Weak<InFlight>,
        owner: Arc<Subscriber>,
    ) -> Arc<Self> {
        let state = FetchState {
            members: vec![Member {
                subscriber: owner,
                caught_up: true,
            }],
            ..FetchState::default()
        };
        Arc::new(Self {
            key,
            cache,
            registry,
            delivery: Mutex::new(()),
            state: Mutex::new(state),
        })
    }

    pub(crate) fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Adds a subscriber to a running fetch. Returns false once the fetch has
    /// finished or been abandoned.
    ///
    /// Must be followed by [`catch_up`](Self::catch_up) after the registry
    /// lock is released.
    pub(crate) fn join(&self, subscriber: &Arc<Subscriber>) -> bool {
        let mut state = self.state.lock();
        if state.finished {
            return false;
        }
        state.members.push(Member {
            subscriber: Arc::clone(subscriber),
            caught_up: false,
        });
        true
    }

    /// Replays the bytes received so far to a joined subscriber. Chunks that
    /// arrive afterwards are delivered to it in order.
    pub(crate) fn catch_up(&self, subscriber: &Arc<Subscriber>) {
        let _delivery = self.delivery.lock();
        let replay = {
            let mut state = self.state.lock();
            let Some(member) = state
                .members
                .iter_mut()
                .find(|m| Arc::ptr_eq(&m.subscriber, subscriber))
            else {
                // Finished or cancelled while waiting
                return;
            };
            member.caught_up = true;
            Bytes::copy_from_slice(&state.buffer)
        };
        if !replay.is_empty() {
            debug!(key = %self.key, bytes = replay.len(), "Replaying buffered bytes to joined caller");
            subscriber.deliver(replay);
        }
    }

    /// Stores the loader's handle, cancelling it at once if every subscriber
    /// already left.
    pub(crate) fn attach(&self, handle: LoadHandle) {
        let mut state = self.state.lock();
        if state.finished {
            let abandoned = state.members.is_empty();
            drop(state);
            if abandoned {
                handle.cancel();
            }
        } else {
            state.handle = Some(handle);
        }
    }

    /// Loader data callback: buffer the chunk and fan it out.
    pub(crate) fn deliver(&self, chunk: Bytes) {
        let _delivery = self.delivery.lock();
        let targets: Vec<Arc<Subscriber>> = {
            let mut state = self.state.lock();
            if state.finished {
                return;
            }
            state.buffer.extend_from_slice(&chunk);
            state
                .members
                .iter()
                .filter(|m| m.caught_up)
                .map(|m| Arc::clone(&m.subscriber))
                .collect()
        };
        for subscriber in targets {
            subscriber.deliver(chunk.clone());
        }
    }

    /// Loader completion callback.
    ///
    /// Commits the payload to the cache only when the transfer succeeded, then
    /// completes every subscriber with the transfer's result.
    pub(crate) fn finish(self: &Arc<Self>, result: Result<()>) {
        let (members, payload) = {
            let _delivery = self.delivery.lock();
            let (members, payload) = {
                let mut state = self.state.lock();
                if state.finished {
                    return;
                }
                state.finished = true;
                state.handle = None;
                (mem::take(&mut state.members), state.buffer.split().freeze())
            };
            for member in members.iter().filter(|m| !m.caught_up) {
                if !payload.is_empty() {
                    member.subscriber.deliver(payload.clone());
                }
            }
            (members, payload)
        };

        match (&result, &self.cache) {
            (Ok(()), Some(cache)) => {
                debug!(key = %self.key, bytes = payload.len(), "Committing payload to cache");
                cache.put(payload, &self.key);
            }
            (Err(error), _) if !payload.is_empty() => {
                debug!(key = %self.key, bytes = payload.len(), %error, "Discarding partial payload");
            }
            _ => {}
        }

        self.unregister();
        for member in members {
            member.subscriber.complete(result.clone());
        }
    }

    /// Detaches one subscriber, completing it with `Cancelled`.
    ///
    /// When the last subscriber leaves, the transfer is cancelled and nothing
    /// it received is cached.
    pub(crate) fn cancel_subscriber(self: &Arc<Self>, subscriber: &Arc<Subscriber>) {
        let registry = self.registry.upgrade();
        let mut in_flight = registry.as_ref().map(|r| r.lock());

        let abandoned = {
            let mut state = self.state.lock();
            let before = state.members.len();
            state
                .members
                .retain(|m| !Arc::ptr_eq(&m.subscriber, subscriber));
            let removed = state.members.len() != before;

            if removed && state.members.is_empty() && !state.finished {
                state.finished = true;
                state.buffer.clear();
                Some(state.handle.take())
            } else {
                None
            }
        };

        if abandoned.is_some() {
            if let Some(map) = in_flight.as_mut() {
                remove_if_current(map, self);
            }
        }
        drop(in_flight);

        subscriber.cancel();
        if let Some(handle) = abandoned {
            debug!(key = %self.key, "All callers cancelled; aborting transfer");
            if let Some(handle) = handle {
                handle.cancel();
            }
        }
    }

    fn unregister(self: &Arc<Self>) {
        if let Some(registry) = self.registry.upgrade() {
            remove_if_current(&mut registry.lock(), self);
        }
    }

    #[cfg(test)]
    pub(crate) fn subscriber_count(&self) -> usize {
        self.state.lock().members.len()
    }
}

/// Removes `fetch` from the registry unless a newer fetch replaced it.
fn remove_if_current(map: &mut HashMap<CacheKey, Arc<SharedFetch>>, fetch: &Arc<SharedFetch>) {
    if map
        .get(fetch.key())
        .is_some_and(|current| Arc::ptr_eq(current, fetch))
    {
        map.remove(fetch.key());
    }
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;

    type Log = Arc<Mutex<Vec<String>>>;

    fn recording_subscriber(log: &Log, name: &'static str) -> Arc<Subscriber> {
        let data_log = Arc::clone(log);
        let done_log = Arc::clone(log);
        Arc::new(Subscriber::new(
            Box::new(move |chunk| {
                data_log
                    .lock()
                    .push(format!("{name}:data:{}", String::from_utf8_lossy(&chunk)))
            }),
            Box::new(move |result| done_log.lock().push(format!("{name}:done:{result:?}"))),
        ))
    }

    fn new_fetch(owner: Arc<Subscriber>) -> (Arc<SharedFetch>, Arc<InFlight>) {
        let registry: Arc<InFlight> = Arc::new(Mutex::new(HashMap::new()));
        let key = CacheKey::new("https://cdn.example/a").unwrap();
        let fetch = SharedFetch::new(key.clone(), None, Arc::downgrade(&registry), owner);
        registry.lock().insert(key, Arc::clone(&fetch));
        (fetch, registry)
    }

    #[test]
    fn test_joiner_receives_buffered_bytes_first() {
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let owner = recording_subscriber(&log, "a");
        let (fetch, registry) = new_fetch(owner);

        fetch.deliver(Bytes::from_static(b"12"));
        let joiner = recording_subscriber(&log, "b");
        assert!(fetch.join(&joiner));
        fetch.catch_up(&joiner);
        fetch.deliver(Bytes::from_static(b"34"));
        fetch.finish(Ok(()));

        assert_eq!(
            *log.lock(),
            vec![
                "a:data:12",
                "b:data:12",
                "a:data:34",
                "b:data:34",
                "a:done:Ok(())",
                "b:done:Ok(())",
            ]
        );
        assert!(registry.lock().is_empty());
    }

    #[test]
    fn test_finish_catches_up_pending_joiner() {
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let (fetch, _registry) = new_fetch(recording_subscriber(&log, "a"));
        fetch.deliver(Bytes::from_static(b"xy"));

        let joiner = recording_subscriber(&log, "b");
        assert!(fetch.join(&joiner));
        fetch.finish(Ok(()));
        // Late catch-up after finish is a no-op
        fetch.catch_up(&joiner);

        let log = log.lock();
        assert!(log.contains(&"b:data:xy".to_string()));
        assert_eq!(log.last().unwrap(), "b:done:Ok(())");
        assert_eq!(log.iter().filter(|l| l.starts_with("b:")).count(), 2);
    }

    #[test]
    fn test_cancel_one_of_two_keeps_transfer() {
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let owner = recording_subscriber(&log, "a");
        let (fetch, registry) = new_fetch(Arc::clone(&owner));
        let joiner = recording_subscriber(&log, "b");
        assert!(fetch.join(&joiner));
        fetch.catch_up(&joiner);

        let handle = LoadHandle::new();
        fetch.attach(handle.clone());
        fetch.cancel_subscriber(&owner);

        assert!(!handle.is_cancelled());
        assert_eq!(fetch.subscriber_count(), 1);
        assert_eq!(registry.lock().len(), 1);

        fetch.deliver(Bytes::from_static(b"z"));
        fetch.finish(Ok(()));
        assert_eq!(
            *log.lock(),
            vec!["a:done:Err(Cancelled)", "b:data:z", "b:done:Ok(())"]
        );
    }

    #[test]
    fn test_last_cancel_aborts_transfer() {
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let owner = recording_subscriber(&log, "a");
        let (fetch, registry) = new_fetch(Arc::clone(&owner));
        let handle = LoadHandle::new();
        fetch.attach(handle.clone());

        fetch.deliver(Bytes::from_static(b"partial"));
        fetch.cancel_subscriber(&owner);

        assert!(handle.is_cancelled());
        assert!(registry.lock().is_empty());

        // The loader reports the cancellation afterwards; nothing else happens
        fetch.finish(Err(Error::Cancelled));
        assert_eq!(
            *log.lock(),
            vec!["a:data:partial", "a:done:Err(Cancelled)"]
        );
    }

    #[test]
    fn test_attach_after_abandon_cancels_handle() {
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let owner = recording_subscriber(&log, "a");
        let (fetch, _registry) = new_fetch(Arc::clone(&owner));

        fetch.cancel_subscriber(&owner);
        let handle = LoadHandle::new();
        fetch.attach(handle.clone());
        assert!(handle.is_cancelled());
    }

    #[test]
    fn test_cancel_from_inside_data_callback() {
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let slot: Arc<Mutex<Option<(Arc<SharedFetch>, Arc<Subscriber>)>>> =
            Arc::new(Mutex::new(None));

        let data_log = Arc::clone(&log);
        let done_log = Arc::clone(&log);
        let inner = Arc::clone(&slot);
        let subscriber = Arc::new(Subscriber::new(
            Box::new(move |chunk| {
                data_log.lock().push(format!("data:{}", chunk.len()));
                let target = inner.lock().take();
                if let Some((fetch, me)) = target {
                    fetch.cancel_subscriber(&me);
                }
            }),
            Box::new(move |result| done_log.lock().push(format!("done:{result:?}"))),
        ));
        let (fetch, _registry) = new_fetch(Arc::clone(&subscriber));
        *slot.lock() = Some((Arc::clone(&fetch), Arc::clone(&subscriber)));

        fetch.deliver(Bytes::from_static(b"abc"));
        fetch.deliver(Bytes::from_static(b"def"));
        fetch.finish(Ok(()));

        assert_eq!(*log.lock(), vec!["data:3", "done:Err(Cancelled)"]);
    }
}
