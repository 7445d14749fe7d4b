//! Loader Module
//!
//! Network side of the pipeline: HTTP GET and range requests streamed to a
//! per-request sink, with response validation and cooperative cancellation.
//! Has no knowledge of the disk cache.

mod data_loader;
mod events;
mod handle;
mod request;
mod response;

// Re-export public types
pub use data_loader::DataLoader;
pub use events::{DataLoaderObserver, DataTaskEvent, TracingObserver};
pub use handle::{Cancellable, CompletionCallback, CompletionSlot, DataSink, LoadHandle, TaskId};
pub use request::{ByteRange, LoadRequest};
pub use response::{validate_status, ResponseInfo, ResponseValidator};

/// Anything that can stream bytes for a [`LoadRequest`].
///
/// Implementations must invoke `on_complete` exactly once per call, after
/// the last `on_data`, whether the request succeeds, fails or is cancelled
/// through the returned handle. Requests are independent: cancelling one
/// must not affect any other.
pub trait ByteLoader: Send + Sync {
    fn load_data(
        &self,
        request: LoadRequest,
        on_data: DataSink,
        on_complete: CompletionCallback,
    ) -> LoadHandle;
}
