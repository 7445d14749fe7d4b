//! HTTP Data Loader
//!
//! Streams response bodies through reqwest on a tokio runtime, one spawned
//! task per request, and tracks live tasks in a shared table so they can be
//! cancelled individually or all at once.

use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use parking_lot::Mutex;
use reqwest::header::RANGE;
use reqwest::Client;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::events::{DataLoaderObserver, DataTaskEvent};
use super::handle::{CompletionCallback, CompletionSlot, DataSink, LoadHandle, TaskId};
use super::request::LoadRequest;
use super::response::{ResponseInfo, ResponseValidator};
use super::ByteLoader;
use crate::config::LoaderConfig;
use crate::error::{Error, Result};

type TaskTable = Arc<Mutex<HashMap<TaskId, CancellationToken>>>;

// == Data Loader ==
/// Concurrent, cancellable HTTP loader.
///
/// Dropping the loader cancels every transfer still running; each of them
/// still completes exactly once, with [`Error::Cancelled`].
pub struct DataLoader {
    client: Client,
    runtime: Handle,
    tasks: TaskTable,
    validator: ResponseValidator,
    observer: Option<Arc<dyn DataLoaderObserver>>,
}

impl DataLoader {
    /// Creates a loader bound to the tokio runtime of the calling context.
    ///
    /// # Errors
    /// Returns `InvalidConfig` when called outside a tokio runtime or when
    /// the HTTP client cannot be built.
    pub fn new(config: &LoaderConfig) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|e| {
            Error::InvalidConfig(format!("DataLoader requires a tokio runtime: {e}"))
        })?;
        Self::with_runtime(config, runtime)
    }

    /// Creates a loader that spawns its transfers on `runtime`.
    pub fn with_runtime(config: &LoaderConfig, runtime: Handle) -> Result<Self> {
        let mut builder = Client::builder()
            .user_agent(config.user_agent.clone())
            .connect_timeout(config.connect_timeout)
            .pool_max_idle_per_host(config.pool_max_idle_per_host);
        if let Some(timeout) = config.request_timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder
            .build()
            .map_err(|e| Error::InvalidConfig(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            runtime,
            tasks: Arc::new(Mutex::new(HashMap::new())),
            validator: ResponseValidator::default(),
            observer: None,
        })
    }

    /// Replaces the default 2xx validator.
    pub fn with_validator(mut self, validator: ResponseValidator) -> Self {
        self.validator = validator;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn DataLoaderObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Number of transfers that have not completed yet.
    pub fn in_flight(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Requests cancellation of every running transfer.
    pub fn cancel_all(&self) {
        let tasks = self.tasks.lock();
        if !tasks.is_empty() {
            debug!(count = tasks.len(), "Cancelling all transfers");
        }
        for token in tasks.values() {
            token.cancel();
        }
    }
}

impl ByteLoader for DataLoader {
    fn load_data(
        &self,
        request: LoadRequest,
        on_data: DataSink,
        on_complete: CompletionCallback,
    ) -> LoadHandle {
        let handle = LoadHandle::new();
        let token = handle.token().clone();
        self.tasks.lock().insert(handle.id(), token.clone());

        // Built outside the future so an unpolled, dropped future still completes.
        let mut task = RunningTask {
            id: handle.id(),
            tasks: Arc::clone(&self.tasks),
            observer: self.observer.clone(),
            on_data,
            completion: CompletionSlot::new(on_complete),
            finished: false,
        };
        task.notify(DataTaskEvent::Started {
            url: request.url.clone(),
        });

        let client = self.client.clone();
        let validator = self.validator.clone();
        self.runtime.spawn(async move {
            let result = tokio::select! {
                biased;
                _ = token.cancelled() => Err(Error::Cancelled),
                result = transfer(&client, &request, &validator, &mut task) => result,
            };
            task.finish(result);
        });

        handle
    }
}

impl Drop for DataLoader {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

// == Running Task ==
/// Per-request state owned by the spawned transfer.
struct RunningTask {
    id: TaskId,
    tasks: TaskTable,
    observer: Option<Arc<dyn DataLoaderObserver>>,
    on_data: DataSink,
    completion: CompletionSlot,
    finished: bool,
}

impl RunningTask {
    fn notify(&self, event: DataTaskEvent) {
        if let Some(observer) = &self.observer {
            observer.on_event(self.id, &event);
        }
    }

    fn finish(&mut self, result: Result<()>) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.tasks.lock().remove(&self.id);

        match &result {
            Ok(()) => debug!(task = %self.id, "Transfer finished"),
            Err(Error::Cancelled) => debug!(task = %self.id, "Transfer cancelled"),
            Err(error) => debug!(task = %self.id, %error, "Transfer failed"),
        }
        self.notify(DataTaskEvent::Completed {
            error: result.as_ref().err().cloned(),
        });
        self.completion.complete(result);
    }
}

impl Drop for RunningTask {
    fn drop(&mut self) {
        // Reached when the runtime shuts down with the transfer still pending
        self.finish(Err(Error::Cancelled));
    }
}

async fn transfer(
    client: &Client,
    request: &LoadRequest,
    validator: &ResponseValidator,
    task: &mut RunningTask,
) -> Result<()> {
    let mut builder = client
        .get(request.url.clone())
        .headers(request.headers.clone());
    if let Some(range) = request.range {
        builder = builder.header(RANGE, range.to_header_value());
    }
    if let Some(timeout) = request.timeout {
        builder = builder.timeout(timeout);
    }

    let response = builder.send().await?;
    let info = ResponseInfo::from_response(&response);
    task.notify(DataTaskEvent::ResponseReceived {
        status: info.status,
        content_length: info.content_length,
    });

    if let Err(error) = validator.validate(&info) {
        warn!(task = %task.id, url = %info.url, status = info.status, "Response rejected");
        // Dropping the response aborts the body transfer
        return Err(error);
    }

    let mut body = response.bytes_stream();
    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        if chunk.is_empty() {
            continue;
        }
        task.notify(DataTaskEvent::DataReceived { bytes: chunk.len() });
        (task.on_data)(chunk, &info);
    }

    Ok(())
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use bytes::Bytes;
    use tokio::sync::oneshot;

    fn noop_sink() -> DataSink {
        Box::new(|_: Bytes, _: &ResponseInfo| {})
    }

    #[test]
    fn test_new_requires_runtime() {
        let result = DataLoader::new(&LoaderConfig::default());
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_unreachable_host_is_transport_error() {
        let loader = DataLoader::new(&LoaderConfig::default()).unwrap();
        // Port 9 on loopback is reserved (discard) and normally closed
        let request = LoadRequest::parse("http://127.0.0.1:9/asset").unwrap();
        let (tx, rx) = oneshot::channel();

        loader.load_data(
            request,
            noop_sink(),
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        );

        let result = rx.await.unwrap();
        assert!(matches!(result, Err(Error::Transport(_))));
        assert!(result.unwrap_err().is_retryable());
    }

    #[tokio::test]
    async fn test_drop_cancels_pending_transfers() {
        // A listener that never accepts keeps the request waiting for a response
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/asset", listener.local_addr().unwrap());

        let loader = DataLoader::new(&LoaderConfig::default()).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = oneshot::channel();

        let counter = Arc::clone(&calls);
        loader.load_data(
            LoadRequest::parse(&url).unwrap(),
            noop_sink(),
            Box::new(move |result| {
                counter.fetch_add(1, Ordering::SeqCst);
                let _ = tx.send(result);
            }),
        );
        assert_eq!(loader.in_flight(), 1);

        drop(loader);

        let result = tokio::time::timeout(std::time::Duration::from_secs(5), rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result, Err(Error::Cancelled));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        drop(listener);
    }
}
