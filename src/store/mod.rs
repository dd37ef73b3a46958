//! Local value storage.
//!
//! A [`Store`] holds the entries one node caches for a group. The only
//! shipped policy is the byte-bounded LRU in [`lru`]; the factory keeps the
//! policy selectable so alternatives can be added without touching callers.

pub mod lru;

pub use lru::LruStore;

use crate::types::ByteView;
use std::sync::Arc;
use std::time::Duration;

/// Callback invoked when an entry is removed by eviction or deletion.
///
/// The callback runs synchronously while the store lock is held; it must
/// not call back into the store.
pub type EvictionCallback = Box<dyn Fn(&str, &ByteView) + Send + Sync>;

/// Storage contract shared by all cache policies.
pub trait Store: Send + Sync {
    /// Look up a live entry. Expired entries are misses.
    fn get(&self, key: &str) -> Option<ByteView>;

    /// Insert or replace an entry with no expiration.
    fn set(&self, key: &str, value: ByteView);

    /// Insert or replace an entry that expires after `ttl`.
    /// A zero `ttl` means the entry never expires.
    fn set_with_expiration(&self, key: &str, value: ByteView, ttl: Duration);

    /// Remove an entry. Returns whether it existed.
    fn delete(&self, key: &str) -> bool;

    /// Remove every entry without running eviction callbacks.
    fn clear(&self);

    /// Number of entries currently indexed, including not-yet-swept
    /// expired ones.
    fn len(&self) -> usize;

    /// Whether the store holds no entries.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Cache eviction policy selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheType {
    Lru,
}

/// Construction options shared by store implementations.
pub struct Options {
    /// Byte budget; zero or negative means unbounded.
    pub max_bytes: i64,

    /// Interval between background sweeps of expired entries.
    pub cleanup_interval: Duration,

    /// Callback fired for every evicted or deleted entry.
    pub on_evicted: Option<EvictionCallback>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            max_bytes: 0,
            cleanup_interval: Duration::from_secs(60),
            on_evicted: None,
        }
    }
}

impl std::fmt::Debug for Options {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Options")
            .field("max_bytes", &self.max_bytes)
            .field("cleanup_interval", &self.cleanup_interval)
            .field("on_evicted", &self.on_evicted.is_some())
            .finish()
    }
}

impl Options {
    /// Set the byte budget.
    pub fn with_max_bytes(mut self, max_bytes: i64) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    /// Set the background sweep interval.
    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    /// Set the eviction callback.
    pub fn with_eviction_callback(
        mut self,
        callback: impl Fn(&str, &ByteView) + Send + Sync + 'static,
    ) -> Self {
        self.on_evicted = Some(Box::new(callback));
        self
    }
}

/// Create a store for the requested policy.
pub fn new_store(cache_type: CacheType, opts: Options) -> Arc<dyn Store> {
    match cache_type {
        CacheType::Lru => Arc::new(LruStore::new(opts)),
    }
}
