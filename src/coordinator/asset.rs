//! Asset Model
//!
//! A remote resource as the host engine names it: a URL plus the extra
//! headers its requests must carry.

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use url::Url;

use crate::error::{Error, Result};
use crate::hash::CacheKey;
use crate::loader::LoadRequest;

#[derive(Debug, Clone, Default)]
pub struct Asset {
    url: String,
    headers: HeaderMap,
}

impl Asset {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: HeaderMap::new(),
        }
    }

    /// Adds a request header. Headers never affect the cache key.
    pub fn with_header(mut self, name: &str, value: &str) -> Result<Self> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| Error::InvalidRequest(format!("header name '{name}': {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| Error::InvalidRequest(format!("header value for '{name}': {e}")))?;
        self.headers.insert(name, value);
        Ok(self)
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Cache key of the URL; `None` for an empty URL.
    pub fn cache_key(&self) -> Option<CacheKey> {
        CacheKey::new(&self.url)
    }

    /// Builds the whole-resource network request.
    pub fn to_request(&self) -> Result<LoadRequest> {
        Ok(LoadRequest::parse(&self.url)?.with_headers(self.headers.clone()))
    }
}

impl From<&str> for Asset {
    fn from(url: &str) -> Self {
        Self::new(url)
    }
}

impl From<String> for Asset {
    fn from(url: String) -> Self {
        Self::new(url)
    }
}

impl From<Url> for Asset {
    fn from(url: Url) -> Self {
        Self::new(String::from(url))
    }
}
