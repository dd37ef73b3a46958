//! Byte-bounded LRU store with per-entry TTL.
//!
//! Entries live in a slab-backed doubly linked recency list: the tail is the
//! most recently touched entry, the head the least. Capacity is accounted in
//! bytes (`key.len() + value.len()` per entry), and eviction walks from the
//! head until the store is back under budget.
//!
//! Expired entries are reclaimed on two paths: lazily, when a `get` observes
//! an expiry in the past and reports a miss, and periodically, by a
//! background sweeper that removes expired entries and then re-enforces the
//! byte budget.

use super::{EvictionCallback, Options, Store};
use crate::types::ByteView;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const NIL: usize = usize::MAX;

struct Slot {
    key: String,
    value: ByteView,
    prev: usize,
    next: usize,
}

struct Inner {
    /// key -> slot index.
    index: HashMap<String, usize>,
    /// Slab holding the linked recency list.
    slots: Vec<Option<Slot>>,
    free: Vec<usize>,
    /// Least recently used entry.
    head: usize,
    /// Most recently used entry.
    tail: usize,
    expires: HashMap<String, Instant>,
    max_bytes: i64,
    used_bytes: i64,
    on_evicted: Option<EvictionCallback>,
}

impl Inner {
    fn entry_size(key: &str, value: &ByteView) -> i64 {
        (key.len() + value.len()) as i64
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = {
            let slot = self.slots[idx].as_ref().expect("slot in list");
            (slot.prev, slot.next)
        };
        match prev {
            NIL => self.head = next,
            p => self.slots[p].as_mut().expect("linked slot").next = next,
        }
        match next {
            NIL => self.tail = prev,
            n => self.slots[n].as_mut().expect("linked slot").prev = prev,
        }
    }

    fn push_tail(&mut self, idx: usize) {
        let old_tail = self.tail;
        {
            let slot = self.slots[idx].as_mut().expect("slot in slab");
            slot.prev = old_tail;
            slot.next = NIL;
        }
        match old_tail {
            NIL => self.head = idx,
            t => self.slots[t].as_mut().expect("linked slot").next = idx,
        }
        self.tail = idx;
    }

    /// Move an entry to the most-recent end of the list.
    fn touch(&mut self, idx: usize) {
        if self.tail == idx {
            return;
        }
        self.unlink(idx);
        self.push_tail(idx);
    }

    /// Remove one entry from the index, recency list, and expiry map,
    /// adjust the byte count, and fire the eviction callback.
    fn remove_slot(&mut self, idx: usize) {
        self.unlink(idx);
        let slot = self.slots[idx].take().expect("slot in slab");
        self.free.push(idx);
        self.index.remove(&slot.key);
        self.expires.remove(&slot.key);
        self.used_bytes -= Self::entry_size(&slot.key, &slot.value);
        assert!(
            self.used_bytes >= 0,
            "lru byte accounting underflow for key {:?}",
            slot.key
        );
        if let Some(cb) = &self.on_evicted {
            cb(&slot.key, &slot.value);
        }
    }

    fn insert_slot(&mut self, key: String, value: ByteView) -> usize {
        let slot = Slot {
            key,
            value,
            prev: NIL,
            next: NIL,
        };
        match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Some(slot);
                idx
            }
            None => {
                self.slots.push(Some(slot));
                self.slots.len() - 1
            }
        }
    }

    /// Reclaim expired entries, then evict from the least-recent end until
    /// the store is within its byte budget.
    fn evict(&mut self, now: Instant) {
        let expired: Vec<String> = self
            .expires
            .iter()
            .filter(|(_, exp)| now >= **exp)
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            if let Some(&idx) = self.index.get(&key) {
                self.remove_slot(idx);
            }
        }

        while self.max_bytes > 0 && self.used_bytes > self.max_bytes {
            match self.head {
                NIL => break,
                idx => self.remove_slot(idx),
            }
        }
    }

    fn set_with_expiration(&mut self, key: &str, value: ByteView, ttl: Duration, now: Instant) {
        match self.index.get(key).copied() {
            Some(idx) => {
                let slot = self.slots[idx].as_mut().expect("indexed slot");
                self.used_bytes += value.len() as i64 - slot.value.len() as i64;
                slot.value = value;
                self.touch(idx);
            }
            None => {
                self.used_bytes += Self::entry_size(key, &value);
                let idx = self.insert_slot(key.to_string(), value);
                self.index.insert(key.to_string(), idx);
                self.push_tail(idx);
            }
        }

        if ttl.is_zero() {
            self.expires.remove(key);
        } else {
            self.expires.insert(key.to_string(), now + ttl);
        }

        self.evict(now);
    }
}

/// LRU cache with byte-based capacity accounting and per-entry TTL.
///
/// All operations, including `get`, take one exclusive section so the
/// recency move linearizes with mutations.
pub struct LruStore {
    inner: Arc<Mutex<Inner>>,
    sweeper: CancellationToken,
}

impl LruStore {
    /// Create a store and start its background sweeper.
    ///
    /// The sweeper needs a Tokio runtime; without one the store still works
    /// and relies on lazy expiry alone.
    pub fn new(opts: Options) -> Self {
        let cleanup_interval = if opts.cleanup_interval.is_zero() {
            Duration::from_secs(60)
        } else {
            opts.cleanup_interval
        };

        let inner = Arc::new(Mutex::new(Inner {
            index: HashMap::new(),
            slots: Vec::new(),
            free: Vec::new(),
            head: NIL,
            tail: NIL,
            expires: HashMap::new(),
            max_bytes: opts.max_bytes,
            used_bytes: 0,
            on_evicted: opts.on_evicted,
        }));

        let sweeper = CancellationToken::new();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(Self::sweep_loop(
                Arc::downgrade(&inner),
                cleanup_interval,
                sweeper.clone(),
            ));
        } else {
            debug!("no tokio runtime, lru sweeper disabled");
        }

        Self { inner, sweeper }
    }

    async fn sweep_loop(inner: Weak<Mutex<Inner>>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    match inner.upgrade() {
                        Some(inner) => inner.lock().evict(Instant::now()),
                        None => break,
                    }
                }
            }
        }
    }

    /// Bytes currently accounted to live and not-yet-swept entries.
    pub fn used_bytes(&self) -> i64 {
        self.inner.lock().used_bytes
    }
}

impl Store for LruStore {
    fn get(&self, key: &str) -> Option<ByteView> {
        let mut inner = self.inner.lock();
        let idx = inner.index.get(key).copied()?;
        if let Some(exp) = inner.expires.get(key) {
            // Expired entries are logically absent and do not touch recency.
            if Instant::now() >= *exp {
                return None;
            }
        }
        inner.touch(idx);
        Some(
            inner.slots[idx]
                .as_ref()
                .expect("indexed slot")
                .value
                .clone(),
        )
    }

    fn set(&self, key: &str, value: ByteView) {
        self.set_with_expiration(key, value, Duration::ZERO);
    }

    fn set_with_expiration(&self, key: &str, value: ByteView, ttl: Duration) {
        self.inner
            .lock()
            .set_with_expiration(key, value, ttl, Instant::now());
    }

    fn delete(&self, key: &str) -> bool {
        let mut inner = self.inner.lock();
        match inner.index.get(key).copied() {
            Some(idx) => {
                inner.remove_slot(idx);
                true
            }
            None => false,
        }
    }

    fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.index.clear();
        inner.slots.clear();
        inner.free.clear();
        inner.expires.clear();
        inner.head = NIL;
        inner.tail = NIL;
        inner.used_bytes = 0;
    }

    fn len(&self) -> usize {
        self.inner.lock().index.len()
    }
}

impl Drop for LruStore {
    fn drop(&mut self) {
        self.sweeper.cancel();
    }
}

impl std::fmt::Debug for LruStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("LruStore")
            .field("entries", &inner.index.len())
            .field("used_bytes", &inner.used_bytes)
            .field("max_bytes", &inner.max_bytes)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn store(max_bytes: i64) -> LruStore {
        LruStore::new(Options::default().with_max_bytes(max_bytes))
    }

    #[test]
    fn test_set_get() {
        let s = store(100);
        s.set("k1", ByteView::from("v1"));
        assert_eq!(s.get("k1"), Some(ByteView::from("v1")));
        assert_eq!(s.get("missing"), None);
        assert_eq!(s.len(), 1);
    }

    #[test]
    fn test_eviction_order() {
        let s = store(10);
        s.set("k1", ByteView::from("v1"));
        s.set("k2", ByteView::from("v2"));
        s.set("k3", ByteView::from("v3"));

        // 12 bytes total, so the least recent entry goes.
        assert_eq!(s.get("k1"), None);
        assert!(s.get("k2").is_some());

        // Touching k2 makes k3 the eviction victim for the next insert.
        s.get("k2");
        s.set("k4", ByteView::from("v4"));
        assert_eq!(s.get("k3"), None);
        assert!(s.get("k2").is_some());
    }

    #[test]
    fn test_set_updates_recency() {
        let s = store(8);
        s.set("k1", ByteView::from("v1"));
        s.set("k2", ByteView::from("v2"));
        // Re-setting k1 makes k2 least recent.
        s.set("k1", ByteView::from("x1"));
        s.set("k3", ByteView::from("v3"));
        assert_eq!(s.get("k2"), None);
        assert!(s.get("k1").is_some());
    }

    #[test]
    fn test_update_accounting() {
        let s = store(100);
        s.set("k1", ByteView::from("1"));
        assert_eq!(s.used_bytes(), 3);
        s.set("k1", ByteView::from("123"));
        assert_eq!(s.used_bytes(), 5);
        assert_eq!(s.get("k1"), Some(ByteView::from("123")));
        assert_eq!(s.len(), 1);
    }

    #[test]
    fn test_used_bytes_tracks_entries() {
        let s = store(0);
        s.set("a", ByteView::from("xx"));
        s.set("bb", ByteView::from("y"));
        assert_eq!(s.used_bytes(), 3 + 3);
        s.delete("a");
        assert_eq!(s.used_bytes(), 3);
        s.clear();
        assert_eq!(s.used_bytes(), 0);
        assert_eq!(s.len(), 0);
    }

    #[test]
    fn test_unbounded_never_evicts() {
        let s = store(0);
        for i in 0..100 {
            s.set(&format!("key-{i}"), ByteView::from("some value"));
        }
        assert_eq!(s.len(), 100);
    }

    #[test]
    fn test_delete() {
        let s = store(100);
        assert!(!s.delete("k1"));
        s.set("k1", ByteView::from("v1"));
        assert!(s.delete("k1"));
        assert_eq!(s.get("k1"), None);
        assert!(!s.delete("k1"));
    }

    #[test]
    fn test_lazy_expiry() {
        let s = store(100);
        s.set_with_expiration("k1", ByteView::from("v1"), Duration::from_millis(40));
        assert!(s.get("k1").is_some());
        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(s.get("k1"), None);
    }

    #[test]
    fn test_zero_ttl_never_expires() {
        let s = store(100);
        s.set_with_expiration("k1", ByteView::from("v1"), Duration::ZERO);
        std::thread::sleep(Duration::from_millis(30));
        assert!(s.get("k1").is_some());
    }

    #[test]
    fn test_set_clears_prior_expiry() {
        let s = store(100);
        s.set_with_expiration("k1", ByteView::from("v1"), Duration::from_millis(30));
        s.set("k1", ByteView::from("v2"));
        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(s.get("k1"), Some(ByteView::from("v2")));
    }

    #[test]
    fn test_expired_entry_can_be_replaced() {
        let s = store(100);
        s.set_with_expiration("k1", ByteView::from("v1"), Duration::from_millis(20));
        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(s.get("k1"), None);
        s.set_with_expiration("k1", ByteView::from("v2"), Duration::from_secs(60));
        assert_eq!(s.get("k1"), Some(ByteView::from("v2")));
        assert_eq!(s.used_bytes(), 4);
    }

    #[test]
    fn test_eviction_callback() {
        let evicted = Arc::new(Mutex::new(Vec::new()));
        let seen = evicted.clone();
        let s = LruStore::new(
            Options::default()
                .with_max_bytes(8)
                .with_eviction_callback(move |key, value| {
                    seen.lock().push((key.to_string(), value.clone()));
                }),
        );
        s.set("k1", ByteView::from("v1"));
        s.set("k2", ByteView::from("v2"));
        s.set("k3", ByteView::from("v3"));

        let evicted = evicted.lock();
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0], ("k1".to_string(), ByteView::from("v1")));
    }

    #[tokio::test]
    async fn test_sweeper_reclaims_expired_bytes() {
        let s = LruStore::new(
            Options::default()
                .with_max_bytes(100)
                .with_cleanup_interval(Duration::from_millis(25)),
        );
        s.set_with_expiration("k1", ByteView::from("v1"), Duration::from_millis(40));
        assert!(s.get("k1").is_some());

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(s.get("k1"), None);
        assert_eq!(s.used_bytes(), 0);
        assert_eq!(s.len(), 0);
    }

    #[tokio::test]
    async fn test_sweeper_keeps_live_entries() {
        let s = LruStore::new(
            Options::default()
                .with_max_bytes(100)
                .with_cleanup_interval(Duration::from_millis(20)),
        );
        s.set("forever", ByteView::from("v"));
        s.set_with_expiration("long", ByteView::from("v"), Duration::from_secs(60));

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(s.get("forever").is_some());
        assert!(s.get("long").is_some());
    }

    #[test]
    fn test_callback_fires_once_per_entry() {
        let count = Arc::new(AtomicUsize::new(0));
        let n = count.clone();
        let s = LruStore::new(
            Options::default()
                .with_max_bytes(4)
                .with_eviction_callback(move |_, _| {
                    n.fetch_add(1, Ordering::SeqCst);
                }),
        );
        s.set("a", ByteView::from("1"));
        s.set("b", ByteView::from("2"));
        s.set("c", ByteView::from("3"));
        // Budget fits two entries; each insert past the second evicts one.
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(s.len(), 2);
    }
}
