//! Error types for the cache.

use std::io;
use std::sync::Arc;
use thiserror::Error;

/// Result type alias for cache operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the cache.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// The caller passed an empty key.
    #[error("key is required")]
    EmptyKey,

    /// No group is registered under the requested name.
    #[error("group not found: {0}")]
    GroupNotFound(String),

    /// A group with this name already exists.
    #[error("group already exists: {0}")]
    GroupExists(String),

    /// The loader reported the key as absent and no peer produced a value.
    #[error("value not found")]
    NotFound,

    /// Network communication errors.
    #[error("network error: {0}")]
    Network(#[from] NetworkError),

    /// Service discovery errors.
    #[error("discovery error: {0}")]
    Discovery(#[from] DiscoveryError),

    /// A peer returned an error for a forwarded request.
    #[error("remote error: {0}")]
    Remote(String),

    /// Configuration errors.
    #[error("config error: {0}")]
    Config(String),

    /// The operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// Result observed by a waiter of a coalesced in-flight call.
    #[error("{0}")]
    Shared(Arc<Error>),

    /// Generic internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Peel the [`Error::Shared`] wrappers added by the request coalescer,
    /// yielding the error the executing call actually produced.
    pub fn unshared(&self) -> &Error {
        let mut err = self;
        while let Error::Shared(inner) = err {
            err = inner.as_ref();
        }
        err
    }

    /// Whether the error is the caller's fault rather than the cache's.
    /// Caller errors are not logged at error level.
    pub fn is_caller_error(&self) -> bool {
        matches!(self.unshared(), Error::EmptyKey | Error::GroupNotFound(_))
    }
}

/// Network communication errors.
#[derive(Error, Debug)]
pub enum NetworkError {
    /// Connection failed.
    #[error("connection failed to {addr}: {reason}")]
    ConnectionFailed { addr: String, reason: String },

    /// Connection was closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Deserialization error.
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// Frame exceeds the wire size limit.
    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Address failed `host:port` validation.
    #[error("invalid address: {0}")]
    InvalidAddress(String),
}

impl Clone for NetworkError {
    fn clone(&self) -> Self {
        match self {
            NetworkError::ConnectionFailed { addr, reason } => NetworkError::ConnectionFailed {
                addr: addr.clone(),
                reason: reason.clone(),
            },
            NetworkError::ConnectionClosed => NetworkError::ConnectionClosed,
            NetworkError::Serialization(msg) => NetworkError::Serialization(msg.clone()),
            NetworkError::Deserialization(msg) => NetworkError::Deserialization(msg.clone()),
            NetworkError::FrameTooLarge(len) => NetworkError::FrameTooLarge(*len),
            // io::Error is not Clone; rebuild it from kind and message.
            NetworkError::Io(e) => NetworkError::Io(io::Error::new(e.kind(), e.to_string())),
            NetworkError::InvalidAddress(addr) => NetworkError::InvalidAddress(addr.clone()),
        }
    }
}

/// Service discovery errors.
#[derive(Error, Debug, Clone)]
pub enum DiscoveryError {
    /// The discovery backend rejected or failed a request.
    #[error("backend error: {0}")]
    Backend(String),

    /// The membership watch stream ended.
    #[error("membership watch closed")]
    WatchClosed,

    /// The watch stream was already handed out.
    #[error("watch already taken")]
    WatchTaken,
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Network(NetworkError::Io(e))
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Network(NetworkError::Serialization(e.to_string()))
    }
}

impl From<redis::RedisError> for DiscoveryError {
    fn from(e: redis::RedisError) -> Self {
        DiscoveryError::Backend(e.to_string())
    }
}

impl From<redis::RedisError> for Error {
    fn from(e: redis::RedisError) -> Self {
        Error::Discovery(DiscoveryError::from(e))
    }
}
