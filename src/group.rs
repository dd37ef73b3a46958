//! Named cache groups.
//!
//! A [`Group`] is one logical namespace: a loader, a local store, a
//! single-flight coalescer, and (once registered) a peer picker. Reads go
//! through the coalescer; the owner of a key serves it from its store or
//! its loader, every other node forwards.

use crate::error::{Error, Result};
use crate::peers::{Peer, PeerChoice, PeerPicker};
use crate::singleflight::FlightGroup;
use crate::store::{self, CacheType, Options, Store};
use crate::types::{key_preview, ByteView, Loader};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::{Arc, OnceLock};
use std::time::SystemTime;
use tracing::{debug, info, warn};

/// A named namespace pairing a loader with a local store and a router.
pub struct Group {
    name: String,
    loader: Box<dyn Loader>,
    store: Arc<dyn Store>,
    flight: FlightGroup,
    peers: OnceLock<Arc<dyn PeerPicker>>,
}

impl Group {
    fn new(name: &str, max_bytes: i64, loader: impl Loader + 'static) -> Self {
        Self {
            name: name.to_string(),
            loader: Box::new(loader),
            store: store::new_store(CacheType::Lru, Options::default().with_max_bytes(max_bytes)),
            flight: FlightGroup::new(),
            peers: OnceLock::new(),
        }
    }

    /// The group's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register the peer picker that routes keys to their owners.
    ///
    /// # Panics
    ///
    /// Panics when called a second time; wiring the router twice is a
    /// programming error.
    pub fn register_peers(&self, peers: Arc<dyn PeerPicker>) {
        if self.peers.set(peers).is_err() {
            panic!("register_peers called more than once for group {:?}", self.name);
        }
    }

    /// Fetch the value for `key`, loading or forwarding on a miss.
    ///
    /// Concurrent gets for the same key share one execution.
    pub async fn get(&self, key: &str) -> Result<ByteView> {
        if key.is_empty() {
            return Err(Error::EmptyKey);
        }
        self.flight.do_call(key, || self.load(key)).await
    }

    async fn load(&self, key: &str) -> Result<ByteView> {
        if let Some(picker) = self.peers.get() {
            match picker.pick_peer(key) {
                Some(PeerChoice::SelfOwner) => {
                    if let Some(value) = self.store.get(key) {
                        debug!(group = %self.name, key = key_preview(key), "cache hit");
                        return Ok(value);
                    }
                }
                Some(PeerChoice::Remote(peer)) => {
                    match self.get_from_peer(peer.as_ref(), key).await {
                        Ok(value) => return Ok(value),
                        Err(e) => {
                            warn!(
                                group = %self.name,
                                key = key_preview(key),
                                error = %e,
                                "peer get failed, falling back to local load"
                            );
                        }
                    }
                }
                None => {}
            }
        }
        self.load_locally(key).await
    }

    async fn get_from_peer(&self, peer: &dyn Peer, key: &str) -> Result<ByteView> {
        let bytes = peer.get(&self.name, key).await?;
        // Forwarded values are returned but not stored here: only the
        // owner holds the entry, which keeps a single owner per key under
        // membership changes.
        Ok(ByteView::copy_from_slice(&bytes))
    }

    async fn load_locally(&self, key: &str) -> Result<ByteView> {
        if let Some(value) = self.store.get(key) {
            debug!(group = %self.name, key = key_preview(key), "cache hit");
            return Ok(value);
        }

        let Some((bytes, expires_at)) = self.loader.load(key).await else {
            return Err(Error::NotFound);
        };
        let value = ByteView::copy_from_slice(&bytes);

        match expires_at {
            None => self.store.set(key, value.clone()),
            Some(at) => match at.duration_since(SystemTime::now()) {
                Ok(ttl) if !ttl.is_zero() => {
                    self.store.set_with_expiration(key, value.clone(), ttl)
                }
                // Already expired when loaded: serve it, cache nothing.
                _ => {}
            },
        }
        Ok(value)
    }

    /// Delete `key` from its owning node. Returns whether the key existed.
    pub async fn delete(&self, key: &str) -> Result<bool> {
        if key.is_empty() {
            return Err(Error::EmptyKey);
        }
        let Some(picker) = self.peers.get() else {
            return Ok(self.store.delete(key));
        };
        match picker.pick_peer(key) {
            None => Ok(false),
            Some(PeerChoice::SelfOwner) => Ok(self.store.delete(key)),
            Some(PeerChoice::Remote(peer)) => peer.delete(&self.name, key).await,
        }
    }
}

impl std::fmt::Debug for Group {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Group")
            .field("name", &self.name)
            .field("entries", &self.store.len())
            .field("has_peers", &self.peers.get().is_some())
            .finish()
    }
}

/// Name → group mapping with explicit duplicate rejection.
#[derive(Default)]
pub struct GroupRegistry {
    groups: DashMap<String, Arc<Group>>,
}

impl GroupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a group. Fails when the name is taken.
    pub fn create(
        &self,
        name: &str,
        max_bytes: i64,
        loader: impl Loader + 'static,
    ) -> Result<Arc<Group>> {
        match self.groups.entry(name.to_string()) {
            Entry::Occupied(_) => Err(Error::GroupExists(name.to_string())),
            Entry::Vacant(entry) => {
                let group = Arc::new(Group::new(name, max_bytes, loader));
                entry.insert(group.clone());
                info!(group = name, max_bytes, "created group");
                Ok(group)
            }
        }
    }

    /// Look up a group by name.
    pub fn get(&self, name: &str) -> Option<Arc<Group>> {
        self.groups.get(name).map(|entry| entry.value().clone())
    }

    /// Remove a group by name. Returns whether it existed.
    pub fn destroy(&self, name: &str) -> bool {
        let removed = self.groups.remove(name).is_some();
        if removed {
            info!(group = name, "destroyed group");
        }
        removed
    }
}

impl std::fmt::Debug for GroupRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupRegistry")
            .field("groups", &self.groups.len())
            .finish()
    }
}

/// The process-wide group registry used by the convenience functions and
/// the default server wiring.
pub fn global() -> Arc<GroupRegistry> {
    static GLOBAL: OnceLock<Arc<GroupRegistry>> = OnceLock::new();
    GLOBAL.get_or_init(|| Arc::new(GroupRegistry::new())).clone()
}

/// Create a group in the process-wide registry.
pub fn new_group(name: &str, max_bytes: i64, loader: impl Loader + 'static) -> Result<Arc<Group>> {
    global().create(name, max_bytes, loader)
}

/// Look up a group in the process-wide registry.
pub fn get_group(name: &str) -> Option<Arc<Group>> {
    global().get(name)
}

/// Remove a group from the process-wide registry.
pub fn destroy_group(name: &str) -> bool {
    global().destroy(name)
}
