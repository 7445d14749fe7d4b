//! Shared helpers for integration tests: an in-process HTTP server on an
//! ephemeral port that counts requests per path.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::{Path, Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;

/// Payload served by `/range`.
pub const RANGE_DATA: &[u8] = b"0123456789abcdef";

/// First chunk sent by `/stalled` before it stops sending.
pub const STALLED_CHUNK: &[u8] = b"first chunk";

/// Deterministic payload of `size` bytes.
pub fn payload(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i % 251) as u8).collect()
}

#[derive(Clone, Default)]
struct HitCounter(Arc<Mutex<HashMap<String, usize>>>);

pub struct TestServer {
    addr: SocketAddr,
    hits: HitCounter,
}

impl TestServer {
    /// Starts the server on the current tokio runtime.
    ///
    /// Routes:
    /// - `/asset/:size` - `size` bytes of [`payload`]
    /// - `/delayed/:size` - same payload, second half sent after 200 ms
    /// - `/stalled` - one chunk, then never finishes
    /// - `/forbidden` - 403
    /// - `/range` - honours `Range: bytes=a-b` over [`RANGE_DATA`]
    /// - `/echo-token` - returns the `X-Token` request header
    pub async fn start() -> Self {
        let hits = HitCounter::default();
        let app = Router::new()
            .route("/asset/:size", get(asset))
            .route("/delayed/:size", get(delayed))
            .route("/stalled", get(stalled))
            .route("/forbidden", get(forbidden))
            .route("/range", get(ranged))
            .route("/echo-token", get(echo_token))
            .layer(middleware::from_fn_with_state(hits.clone(), count_hits));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { addr, hits }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// Requests received for `path`.
    pub fn hits(&self, path: &str) -> usize {
        self.hits.0.lock().get(path).copied().unwrap_or(0)
    }
}

async fn count_hits(State(hits): State<HitCounter>, request: Request, next: Next) -> Response {
    *hits
        .0
        .lock()
        .entry(request.uri().path().to_string())
        .or_insert(0) += 1;
    next.run(request).await
}

async fn asset(Path(size): Path<usize>) -> Vec<u8> {
    payload(size)
}

async fn delayed(Path(size): Path<usize>) -> Body {
    let mut head = Bytes::from(payload(size));
    let tail = head.split_off(size / 2);
    let stream = futures::stream::iter([Ok::<_, std::io::Error>(head)]).chain(
        futures::stream::once(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(tail)
        }),
    );
    Body::from_stream(stream)
}

async fn stalled() -> Body {
    let stream = futures::stream::iter([Ok::<_, std::io::Error>(Bytes::from_static(STALLED_CHUNK))])
        .chain(futures::stream::pending());
    Body::from_stream(stream)
}

async fn forbidden() -> (StatusCode, &'static str) {
    (StatusCode::FORBIDDEN, "forbidden")
}

async fn ranged(headers: HeaderMap) -> Response {
    let requested = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("bytes="))
        .and_then(|v| v.split_once('-'));

    let Some((start, end)) = requested else {
        return RANGE_DATA.to_vec().into_response();
    };
    let start: usize = start.parse().unwrap_or(0);
    let end: usize = end
        .parse()
        .map(|e: usize| (e + 1).min(RANGE_DATA.len()))
        .unwrap_or(RANGE_DATA.len());

    (
        StatusCode::PARTIAL_CONTENT,
        [(
            header::CONTENT_RANGE,
            format!("bytes {}-{}/{}", start, end - 1, RANGE_DATA.len()),
        )],
        RANGE_DATA[start..end].to_vec(),
    )
        .into_response()
}

async fn echo_token(headers: HeaderMap) -> String {
    headers
        .get("x-token")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}
