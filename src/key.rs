//! Shared, immutable cache key type.
//!
//! Cache keys are opaque strings chosen by the caller (for an HTTP cache,
//! typically the request URL plus vary information). A single logical entry
//! is referenced from several in-memory maps at once, so the key is backed
//! by a shared allocation and cloning is a pointer copy rather than a string
//! copy.

use std::borrow::Borrow;
use std::fmt;
use std::sync::Arc;

/// An immutable, cheaply cloneable cache key.
///
/// Two keys are equal iff their underlying strings are equal; ordering is
/// lexicographic and hashing delegates to the string, so `CacheKey` can be
/// used directly in maps and sets keyed by the logical entry.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CacheKey(Arc<str>);

impl CacheKey {
    /// Create a key from any string-like value.
    pub fn new(key: impl Into<Arc<str>>) -> Self {
        Self(key.into())
    }

    /// The underlying key string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Length of the key string in bytes.
    ///
    /// Used by the store as the variable part of an entry's on-disk
    /// byte-usage estimate.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the key is the empty string.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CacheKey").field(&self.as_str()).finish()
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for CacheKey {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for CacheKey {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl Borrow<str> for CacheKey {
    fn borrow(&self) -> &str {
        self.as_str()
    }
}
