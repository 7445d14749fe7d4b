//! Response Metadata and Validation
//!
//! `ResponseInfo` is what a data sink sees alongside each chunk; the
//! `ResponseValidator` decides whether a response may deliver data at all.

use std::fmt;
use std::ops::RangeInclusive;
use std::sync::Arc;

use reqwest::header::HeaderMap;
use url::Url;

use crate::error::{Error, Result};

// == Response Info ==
/// Status line and headers of a received response.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseInfo {
    /// Final URL after redirects
    pub url: Url,
    pub status: u16,
    pub headers: HeaderMap,
    pub content_length: Option<u64>,
}

impl ResponseInfo {
    pub fn new(url: Url, status: u16) -> Self {
        Self {
            url,
            status,
            headers: HeaderMap::new(),
            content_length: None,
        }
    }

    pub(crate) fn from_response(response: &reqwest::Response) -> Self {
        Self {
            url: response.url().clone(),
            status: response.status().as_u16(),
            headers: response.headers().clone(),
            content_length: response.content_length(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

// == Validation ==
/// Default predicate: accept any 2xx status.
pub fn validate_status(info: &ResponseInfo) -> Result<()> {
    if info.is_success() {
        Ok(())
    } else {
        Err(Error::StatusUnacceptable(info.status))
    }
}

/// Pluggable predicate run on every response before any data is delivered.
///
/// A rejected response is aborted and its error becomes the request's
/// terminal result.
#[derive(Clone)]
pub struct ResponseValidator(Arc<dyn Fn(&ResponseInfo) -> Result<()> + Send + Sync>);

impl ResponseValidator {
    pub fn new<F>(predicate: F) -> Self
    where
        F: Fn(&ResponseInfo) -> Result<()> + Send + Sync + 'static,
    {
        Self(Arc::new(predicate))
    }

    /// Accepts only statuses inside `codes`.
    pub fn accepting(codes: RangeInclusive<u16>) -> Self {
        Self::new(move |info| {
            if codes.contains(&info.status) {
                Ok(())
            } else {
                Err(Error::StatusUnacceptable(info.status))
            }
        })
    }

    pub fn validate(&self, info: &ResponseInfo) -> Result<()> {
        (self.0)(info)
    }
}

impl Default for ResponseValidator {
    fn default() -> Self {
        Self::new(validate_status)
    }
}

impl fmt::Debug for ResponseValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ResponseValidator")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(status: u16) -> ResponseInfo {
        ResponseInfo::new(Url::parse("http://localhost/a").unwrap(), status)
    }

    #[test]
    fn test_default_accepts_2xx_only() {
        let validator = ResponseValidator::default();
        assert!(validator.validate(&info(200)).is_ok());
        assert!(validator.validate(&info(206)).is_ok());
        assert_eq!(
            validator.validate(&info(304)),
            Err(Error::StatusUnacceptable(304))
        );
        assert_eq!(
            validator.validate(&info(404)),
            Err(Error::StatusUnacceptable(404))
        );
    }

    #[test]
    fn test_custom_predicate() {
        let validator = ResponseValidator::new(|info| match info.status {
            403 => Err(Error::StatusUnacceptable(403)),
            _ => Ok(()),
        });
        assert!(validator.validate(&info(500)).is_ok());
        assert_eq!(
            validator.validate(&info(403)),
            Err(Error::StatusUnacceptable(403))
        );
    }

    #[test]
    fn test_accepting_range() {
        let validator = ResponseValidator::accepting(200..=206);
        assert!(validator.validate(&info(206)).is_ok());
        assert!(validator.validate(&info(207)).is_err());
    }
}
