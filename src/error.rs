//! Error types for the asset pipeline
//!
//! Provides unified error handling using thiserror.

use thiserror::Error;

// == Error Enum ==
/// Unified error type for the loader, the cache and the coordinator.
///
/// The type is `Clone` so a single terminal error can be delivered to every
/// caller that joined the same transfer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Network or connection failure reported by the HTTP transport
    #[error("Transport error: {0}")]
    Transport(String),

    /// The response was rejected by the validation predicate
    #[error("Response status code was unacceptable: {0}")]
    StatusUnacceptable(u16),

    /// The operation was explicitly cancelled
    #[error("Request cancelled")]
    Cancelled,

    /// Disk I/O failure inside the cache
    #[error("Storage error: {0}")]
    Storage(String),

    /// The request could not be built (bad URL, unsatisfiable range)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Invalid configuration values
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Error {
    /// Returns true for failures a caller may reasonably retry.
    ///
    /// Only transport failures qualify; nothing in this crate retries on its own.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transport(_))
    }

    /// Returns true if this error reports a cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// Gets the HTTP status code if the response was rejected.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Error::StatusUnacceptable(code) => Some(*code),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            Error::Transport(format!("timed out: {error}"))
        } else {
            Error::Transport(error.to_string())
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Error::Storage(error.to_string())
    }
}

// == Result Type Alias ==
/// Convenience Result type for the asset pipeline.
pub type Result<T> = std::result::Result<T, Error>;
