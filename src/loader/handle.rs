//! Cancellation Handles and Exactly-Once Completion
//!
//! Every request is identified by a [`TaskId`] and controlled through a
//! [`LoadHandle`]. Its completion callback lives in a [`CompletionSlot`],
//! which guarantees the callback runs at most once no matter how natural
//! completion and cancellation interleave.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use super::ResponseInfo;
use crate::error::Result;

/// Receives each chunk as it arrives together with the response metadata.
pub type DataSink = Box<dyn FnMut(Bytes, &ResponseInfo) + Send>;

/// Receives the terminal result of a request.
pub type CompletionCallback = Box<dyn FnOnce(Result<()>) + Send>;

// == Cancellable ==
/// A handle through which the caller can request early termination.
pub trait Cancellable {
    /// Requests cancellation. Safe to call any number of times.
    fn cancel(&self);

    fn is_cancelled(&self) -> bool;
}

// == Task Id ==
static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque per-request identifier. Never reused within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    pub fn next() -> Self {
        Self(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

// == Load Handle ==
/// Cancellation handle returned by [`ByteLoader::load_data`](super::ByteLoader::load_data).
///
/// Clones share the same cancellation state.
#[derive(Debug, Clone)]
pub struct LoadHandle {
    id: TaskId,
    token: CancellationToken,
}

impl LoadHandle {
    pub fn new() -> Self {
        Self {
            id: TaskId::next(),
            token: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Token the loader observes to stop the transfer.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Default for LoadHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl Cancellable for LoadHandle {
    fn cancel(&self) {
        self.token.cancel();
    }

    fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

// == Completion Slot ==
/// Holds a completion callback and delivers it exactly once.
///
/// The first call to [`complete`](Self::complete) wins; later calls are
/// ignored and return false.
pub struct CompletionSlot {
    completed: AtomicBool,
    callback: Mutex<Option<CompletionCallback>>,
}

impl CompletionSlot {
    pub fn new(callback: CompletionCallback) -> Self {
        Self {
            completed: AtomicBool::new(false),
            callback: Mutex::new(Some(callback)),
        }
    }

    /// Delivers `result` if nothing was delivered yet.
    ///
    /// The callback runs on the calling thread, outside any internal lock.
    pub fn complete(&self, result: Result<()>) -> bool {
        if self.completed.swap(true, Ordering::AcqRel) {
            return false;
        }
        let callback = self.callback.lock().take();
        if let Some(callback) = callback {
            callback(result);
        }
        true
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }
}

impl fmt::Debug for CompletionSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionSlot")
            .field("completed", &self.is_completed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{Arc, Barrier};
    use std::thread;

    fn counting_slot() -> (Arc<CompletionSlot>, Arc<Mutex<Vec<Result<()>>>>) {
        let results = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&results);
        let slot = CompletionSlot::new(Box::new(move |result| sink.lock().push(result)));
        (Arc::new(slot), results)
    }

    #[test]
    fn test_task_ids_are_unique() {
        let a = LoadHandle::new();
        let b = LoadHandle::new();
        assert_ne!(a.id(), b.id());
        assert!(a.id().to_string().starts_with("task-"));
    }

    #[test]
    fn test_handle_cancel_is_shared_by_clones() {
        let handle = LoadHandle::new();
        let clone = handle.clone();
        assert!(!handle.is_cancelled());

        clone.cancel();
        clone.cancel();
        assert!(handle.is_cancelled());
        assert!(handle.token().is_cancelled());
    }

    #[test]
    fn test_complete_then_cancel() {
        let (slot, results) = counting_slot();
        assert!(slot.complete(Ok(())));
        assert!(!slot.complete(Err(Error::Cancelled)));
        assert_eq!(*results.lock(), vec![Ok(())]);
    }

    #[test]
    fn test_cancel_then_complete() {
        let (slot, results) = counting_slot();
        assert!(slot.complete(Err(Error::Cancelled)));
        assert!(!slot.complete(Ok(())));
        assert_eq!(*results.lock(), vec![Err(Error::Cancelled)]);
        assert!(slot.is_completed());
    }

    #[test]
    fn test_racing_completions_deliver_once() {
        for _ in 0..200 {
            let calls = Arc::new(AtomicUsize::new(0));
            let counter = Arc::clone(&calls);
            let slot = Arc::new(CompletionSlot::new(Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })));
            let barrier = Arc::new(Barrier::new(4));

            let threads: Vec<_> = (0..4)
                .map(|i| {
                    let slot = Arc::clone(&slot);
                    let barrier = Arc::clone(&barrier);
                    thread::spawn(move || {
                        barrier.wait();
                        if i % 2 == 0 {
                            slot.complete(Ok(()))
                        } else {
                            slot.complete(Err(Error::Cancelled))
                        }
                    })
                })
                .collect();

            let winners = threads
                .into_iter()
                .map(|t| t.join().unwrap())
                .filter(|won| *won)
                .count();

            assert_eq!(winners, 1);
            assert_eq!(calls.load(Ordering::SeqCst), 1);
        }
    }
}
