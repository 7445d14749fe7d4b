//! Data Task Events
//!
//! Diagnostic lifecycle events emitted by the loader for each network task.

use tracing::{debug, trace};
use url::Url;

use super::TaskId;
use crate::error::Error;

/// One step in the life of a network task.
///
/// Every task emits `Started` first and `Completed` last; between them a
/// validated response emits `ResponseReceived` followed by zero or more
/// `DataReceived`.
#[derive(Debug, Clone, PartialEq)]
pub enum DataTaskEvent {
    Started { url: Url },
    ResponseReceived { status: u16, content_length: Option<u64> },
    DataReceived { bytes: usize },
    Completed { error: Option<Error> },
}

/// Receives [`DataTaskEvent`]s. Observers must not block; they run on the
/// task's own thread.
pub trait DataLoaderObserver: Send + Sync {
    fn on_event(&self, task: TaskId, event: &DataTaskEvent);
}

/// Logs every event through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl DataLoaderObserver for TracingObserver {
    fn on_event(&self, task: TaskId, event: &DataTaskEvent) {
        match event {
            DataTaskEvent::Started { url } => debug!(%task, %url, "Task started"),
            DataTaskEvent::ResponseReceived {
                status,
                content_length,
            } => debug!(%task, status, ?content_length, "Response received"),
            DataTaskEvent::DataReceived { bytes } => trace!(%task, bytes, "Data received"),
            DataTaskEvent::Completed { error: None } => debug!(%task, "Task completed"),
            DataTaskEvent::Completed { error: Some(error) } => {
                debug!(%task, %error, "Task failed")
            }
        }
    }
}
