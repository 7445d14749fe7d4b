//! Load Request
//!
//! Describes one network fetch: target URL, optional byte range, extra
//! headers and an optional per-request timeout.

use std::fmt;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use url::Url;

use crate::error::{Error, Result};

// == Byte Range ==
/// An HTTP byte range. `end` is inclusive; `None` means "to the end".
///
/// A bounded range never ends before it starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ByteRange {
    start: u64,
    end: Option<u64>,
}

impl ByteRange {
    /// Creates a bounded range covering `start..=end`.
    pub fn new(start: u64, end: u64) -> Result<Self> {
        if end < start {
            return Err(Error::InvalidRequest(format!(
                "range end {end} precedes start {start}"
            )));
        }
        Ok(Self {
            start,
            end: Some(end),
        })
    }

    /// Creates an open-ended range starting at `start`.
    pub fn starting_at(start: u64) -> Self {
        Self { start, end: None }
    }

    /// Creates the range for `length` bytes at `offset`.
    pub fn with_length(offset: u64, length: u64) -> Result<Self> {
        if length == 0 {
            return Err(Error::InvalidRequest("range length must be non-zero".to_string()));
        }
        let end = offset
            .checked_add(length - 1)
            .ok_or_else(|| Error::InvalidRequest("range overflows u64".to_string()))?;
        Self::new(offset, end)
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    /// Inclusive last byte, `None` for an open-ended range.
    pub fn end(&self) -> Option<u64> {
        self.end
    }

    /// Number of bytes requested, if bounded.
    pub fn length(&self) -> Option<u64> {
        self.end.map(|end| end - self.start + 1)
    }

    /// Renders the `Range` header value, e.g. `bytes=0-99` or `bytes=100-`.
    pub fn to_header_value(&self) -> String {
        match self.end {
            Some(end) => format!("bytes={}-{}", self.start, end),
            None => format!("bytes={}-", self.start),
        }
    }

    /// Resolves the range against a payload of `total` bytes.
    ///
    /// Returns the half-open `start..end` slice bounds, clamping the end to
    /// the payload. Fails if the range starts at or past the end.
    pub fn clamp_to(&self, total: u64) -> Result<std::ops::Range<usize>> {
        if self.start >= total {
            return Err(Error::InvalidRequest(format!(
                "range {self} starts beyond the {total}-byte payload"
            )));
        }
        let end = match self.end {
            Some(end) => end.saturating_add(1).min(total),
            None => total,
        };
        Ok(self.start as usize..end as usize)
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.end {
            Some(end) => write!(f, "{}-{}", self.start, end),
            None => write!(f, "{}-", self.start),
        }
    }
}

// == Load Request ==
/// A single GET request handed to a [`ByteLoader`](super::ByteLoader).
#[derive(Debug, Clone)]
pub struct LoadRequest {
    pub url: Url,
    pub range: Option<ByteRange>,
    pub headers: HeaderMap,
    /// Overrides the loader-wide request timeout
    pub timeout: Option<Duration>,
}

impl LoadRequest {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            range: None,
            headers: HeaderMap::new(),
            timeout: None,
        }
    }

    /// Parses `url` and builds a whole-resource request.
    ///
    /// Only `http` and `https` URLs are accepted.
    pub fn parse(url: &str) -> Result<Self> {
        if url.is_empty() {
            return Err(Error::InvalidRequest("empty URL".to_string()));
        }
        let parsed =
            Url::parse(url).map_err(|e| Error::InvalidRequest(format!("{url}: {e}")))?;
        match parsed.scheme() {
            "http" | "https" => Ok(Self::new(parsed)),
            scheme => Err(Error::InvalidRequest(format!(
                "unsupported scheme '{scheme}' in {url}"
            ))),
        }
    }

    pub fn with_range(mut self, range: ByteRange) -> Self {
        self.range = Some(range);
        self
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers.extend(headers);
        self
    }

    /// Adds a single header, validating name and value.
    pub fn with_header(mut self, name: &str, value: &str) -> Result<Self> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| Error::InvalidRequest(format!("header name '{name}': {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| Error::InvalidRequest(format!("header value for '{name}': {e}")))?;
        self.headers.insert(name, value);
        Ok(self)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}
