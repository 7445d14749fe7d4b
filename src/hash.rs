//! Cache Key Hashing
//!
//! Turns resource identifiers into stable, fixed-length cache keys.

use std::fmt;

use sha2::{Digest, Sha256};

/// Length in characters of every cache key (hex-encoded SHA-256).
pub const KEY_LENGTH: usize = 64;

// == Hash ==
/// Calculates SHA-256 of the identifier and returns its lowercase hex form.
///
/// Returns `None` for an empty identifier, which has no valid key.
pub fn hash(identifier: &str) -> Option<String> {
    if identifier.is_empty() {
        return None;
    }

    let digest = Sha256::digest(identifier.as_bytes());
    Some(hex::encode(digest))
}

// == Cache Key ==
/// A fixed-length key derived deterministically from a resource identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    /// Derives the key for an identifier, or `None` if the identifier is empty.
    pub fn new(identifier: &str) -> Option<Self> {
        hash(identifier).map(Self)
    }

    /// Rebuilds a key from an already hashed value, e.g. a file name in the
    /// cache directory. Anything that is not 64 lowercase hex digits is rejected.
    pub(crate) fn from_hashed(value: &str) -> Option<Self> {
        let valid = value.len() == KEY_LENGTH
            && value
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        valid.then(|| Self(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
