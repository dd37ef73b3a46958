//! Core types used throughout the cache.

use async_trait::async_trait;
use bytes::Bytes;
use std::time::SystemTime;

/// An immutable view over a cached value.
///
/// `ByteView` is the unit of data the cache stores and returns. It is backed
/// by [`bytes::Bytes`], so cloning is cheap and the underlying buffer can
/// never be mutated through a view. Data crossing a loader or network
/// boundary is deep-copied into a fresh buffer before being wrapped.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ByteView {
    data: Bytes,
}

impl ByteView {
    /// Create a view by copying the given bytes into an owned buffer.
    pub fn copy_from_slice(data: &[u8]) -> Self {
        Self {
            data: Bytes::copy_from_slice(data),
        }
    }

    /// Size of the value in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the value is empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Borrow the underlying bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Copy the value out into a detached `Vec<u8>`.
    pub fn to_vec(&self) -> Vec<u8> {
        self.data.to_vec()
    }
}

impl From<Vec<u8>> for ByteView {
    fn from(data: Vec<u8>) -> Self {
        Self {
            data: Bytes::from(data),
        }
    }
}

impl From<&str> for ByteView {
    fn from(s: &str) -> Self {
        Self::copy_from_slice(s.as_bytes())
    }
}

impl AsRef<[u8]> for ByteView {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

/// Source of values for cache misses.
///
/// The loader runs outside every internal lock and may block arbitrarily.
/// The cache does not cancel loader invocations; callers with deadlines
/// must enforce them externally.
#[async_trait]
pub trait Loader: Send + Sync {
    /// Produce the value for `key`.
    ///
    /// Returns `None` when the key does not exist in the backing source.
    /// The optional [`SystemTime`] is an absolute expiration instant;
    /// `None` means the value never expires.
    async fn load(&self, key: &str) -> Option<(Vec<u8>, Option<SystemTime>)>;
}

/// Adapter turning a plain closure into a [`Loader`].
pub struct LoaderFn<F>(pub F);

#[async_trait]
impl<F> Loader for LoaderFn<F>
where
    F: Fn(&str) -> Option<(Vec<u8>, Option<SystemTime>)> + Send + Sync,
{
    async fn load(&self, key: &str) -> Option<(Vec<u8>, Option<SystemTime>)> {
        (self.0)(key)
    }
}

/// Check that `addr` looks like `host:port` with a non-empty host and a
/// numeric port. Addresses failing this check are rejected at construction.
pub fn validate_peer_addr(addr: &str) -> bool {
    match addr.rsplit_once(':') {
        Some((host, port)) => !host.is_empty() && !port.is_empty() && port.parse::<u16>().is_ok(),
        None => false,
    }
}

/// Truncate a key for logging so oversized keys do not flood the logs.
pub(crate) fn key_preview(key: &str) -> &str {
    const MAX: usize = 32;
    if key.len() <= MAX {
        return key;
    }
    let mut end = MAX;
    while !key.is_char_boundary(end) {
        end -= 1;
    }
    &key[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_view_copies_input() {
        let mut buf = b"hello".to_vec();
        let view = ByteView::copy_from_slice(&buf);
        buf[0] = b'X';
        assert_eq!(view.as_slice(), b"hello");
        assert_eq!(view.len(), 5);
    }

    #[test]
    fn test_byte_view_to_vec_detaches() {
        let view = ByteView::from("abc");
        let mut out = view.to_vec();
        out[0] = b'X';
        assert_eq!(view.as_slice(), b"abc");
    }

    #[test]
    fn test_validate_peer_addr() {
        assert!(validate_peer_addr("127.0.0.1:9999"));
        assert!(validate_peer_addr("localhost:1"));
        assert!(!validate_peer_addr("127.0.0.1"));
        assert!(!validate_peer_addr(":9999"));
        assert!(!validate_peer_addr("127.0.0.1:"));
        assert!(!validate_peer_addr("127.0.0.1:port"));
        assert!(!validate_peer_addr(""));
    }

    #[test]
    fn test_key_preview_truncates() {
        let long = "k".repeat(100);
        assert_eq!(key_preview(&long).len(), 32);
        assert_eq!(key_preview("short"), "short");
    }
}
