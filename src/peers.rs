//! Peer selection and cluster membership.
//!
//! The [`PeerRouter`] owns the consistent hash ring and one transport
//! client per remote peer. Membership changes stream in from the service
//! registry and are applied by a single watcher task, so ring and client
//! table always change together.

use crate::config::RouterConfig;
use crate::error::{NetworkError, Result};
use crate::network::client::PeerClient;
use crate::registry::{MembershipEvent, ServiceRegistry};
use crate::ring::HashRing;
use crate::types::validate_peer_addr;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A remote node reachable over the peer transport.
#[async_trait]
pub trait Peer: Send + Sync {
    /// Fetch a value from the peer's copy of `group`.
    async fn get(&self, group: &str, key: &str) -> Result<Vec<u8>>;

    /// Delete a key from the peer's copy of `group`.
    async fn delete(&self, group: &str, key: &str) -> Result<bool>;

    /// Tear down the connection.
    async fn close(&self);
}

/// Outcome of routing a key to its owner.
pub enum PeerChoice {
    /// The local node owns the key.
    SelfOwner,
    /// A remote peer owns the key.
    Remote(Arc<dyn Peer>),
}

/// Decides, per key, whether to serve locally or forward to a peer.
pub trait PeerPicker: Send + Sync {
    /// Route `key` to its owner. `None` when the ring is empty or the
    /// owner has no live client.
    fn pick_peer(&self, key: &str) -> Option<PeerChoice>;
}

struct RouterState {
    ring: HashRing,
    clients: HashMap<String, Arc<PeerClient>>,
}

/// Membership-driven peer router.
///
/// The local address is part of the ring from startup, so this node owns
/// its share of the keyspace even before any peer is discovered. A `Pick`
/// during a membership change may briefly name a peer that is gone or does
/// not hold the key yet; the forwarded request then misses remotely and
/// falls through to the loader there.
pub struct PeerRouter {
    self_addr: String,
    config: RouterConfig,
    state: Arc<RwLock<RouterState>>,
    cancel: CancellationToken,
}

impl PeerRouter {
    /// Create a router for this node and start consuming membership events
    /// from the registry. Fails when the address is invalid, the
    /// configuration is inconsistent, or the registry watch cannot start.
    pub async fn new(
        self_addr: &str,
        config: RouterConfig,
        mut registry: Box<dyn ServiceRegistry>,
    ) -> Result<Arc<Self>> {
        if !validate_peer_addr(self_addr) {
            return Err(NetworkError::InvalidAddress(self_addr.to_string()).into());
        }
        config
            .validate()
            .map_err(crate::error::Error::Config)?;

        let mut ring = HashRing::new().with_replicas(config.replicas);
        ring.add([self_addr]);

        let state = Arc::new(RwLock::new(RouterState {
            ring,
            clients: HashMap::new(),
        }));

        let events = registry.watch().await?;

        let router = Arc::new(Self {
            self_addr: self_addr.to_string(),
            config,
            state,
            cancel: CancellationToken::new(),
        });

        tokio::spawn(Self::run_watch_loop(
            router.state.clone(),
            router.self_addr.clone(),
            router.config.clone(),
            events,
            registry,
            router.cancel.clone(),
        ));

        info!(self_addr = %router.self_addr, service = %router.config.service_name, "peer router started");
        Ok(router)
    }

    async fn run_watch_loop(
        state: Arc<RwLock<RouterState>>,
        self_addr: String,
        config: RouterConfig,
        mut events: mpsc::Receiver<MembershipEvent>,
        mut registry: Box<dyn ServiceRegistry>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(MembershipEvent::Added(addr)) => {
                        Self::apply_add(&state, &self_addr, &config, &addr).await;
                    }
                    Some(MembershipEvent::Removed(addr)) => {
                        Self::apply_remove(&state, &self_addr, &addr).await;
                    }
                    None => {
                        warn!(self_addr = %self_addr, "membership stream closed");
                        break;
                    }
                },
            }
        }
        if let Err(e) = registry.shutdown().await {
            warn!(error = %e, "registry shutdown failed");
        }
    }

    async fn apply_add(
        state: &Arc<RwLock<RouterState>>,
        self_addr: &str,
        config: &RouterConfig,
        addr: &str,
    ) {
        if addr == self_addr {
            return;
        }
        if state.read().clients.contains_key(addr) {
            return;
        }

        match PeerClient::connect(addr, config.dial_timeout, config.call_timeout).await {
            Ok(client) => {
                let mut st = state.write();
                st.ring.add([addr]);
                st.clients.insert(addr.to_string(), Arc::new(client));
                info!(peer = addr, "peer joined ring");
            }
            Err(e) => {
                // Nothing was added: a peer we cannot reach must not own
                // keys.
                warn!(peer = addr, error = %e, "failed to connect to discovered peer");
            }
        }
    }

    async fn apply_remove(state: &Arc<RwLock<RouterState>>, self_addr: &str, addr: &str) {
        if addr == self_addr {
            return;
        }
        let client = {
            let mut st = state.write();
            st.ring.remove(addr);
            st.clients.remove(addr)
        };
        if let Some(client) = client {
            client.close().await;
            info!(peer = addr, "peer left ring");
        }
    }

    /// This node's published address.
    pub fn self_addr(&self) -> &str {
        &self.self_addr
    }

    /// Number of connected remote peers.
    pub fn peer_count(&self) -> usize {
        self.state.read().clients.len()
    }

    /// Addresses of the connected remote peers.
    pub fn peer_addrs(&self) -> Vec<String> {
        self.state.read().clients.keys().cloned().collect()
    }

    /// Stop the membership watcher and close every peer connection.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let clients: Vec<Arc<PeerClient>> = {
            let mut st = self.state.write();
            st.clients.drain().map(|(_, client)| client).collect()
        };
        for client in clients {
            client.close().await;
        }
        info!(self_addr = %self.self_addr, "peer router shut down");
    }
}

impl PeerPicker for PeerRouter {
    fn pick_peer(&self, key: &str) -> Option<PeerChoice> {
        let st = self.state.read();
        let owner = st.ring.get(key)?;
        if owner == self.self_addr {
            return Some(PeerChoice::SelfOwner);
        }
        match st.clients.get(owner) {
            Some(client) => Some(PeerChoice::Remote(client.clone())),
            None => {
                debug!(owner, "ring owner has no client");
                None
            }
        }
    }
}

impl std::fmt::Debug for PeerRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerRouter")
            .field("self_addr", &self.self_addr)
            .field("peers", &self.peer_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::StaticRegistry;
    use std::time::Duration;

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        for _ in 0..100 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not met within 1s");
    }

    /// Listener that accepts and parks connections, enough for
    /// `PeerClient::connect` to succeed.
    async fn spawn_accepting_listener() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_invalid_self_addr_rejected() {
        let registry = Box::new(StaticRegistry::new(Vec::<String>::new()));
        let result = PeerRouter::new("not-an-addr", RouterConfig::default(), registry).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_self_only_ring_picks_self() {
        let registry = Box::new(StaticRegistry::new(Vec::<String>::new()));
        let router = PeerRouter::new("127.0.0.1:9000", RouterConfig::default(), registry)
            .await
            .unwrap();

        for key in ["a", "b", "user:42", "long-key-name"] {
            assert!(matches!(
                router.pick_peer(key),
                Some(PeerChoice::SelfOwner)
            ));
        }
        router.shutdown().await;
    }

    #[tokio::test]
    async fn test_peer_join_and_leave() {
        let peer_addr = spawn_accepting_listener().await;

        let registry = StaticRegistry::new([peer_addr.clone()]);
        let handle = registry.handle();
        let router = PeerRouter::new("127.0.0.1:9000", RouterConfig::default(), Box::new(registry))
            .await
            .unwrap();

        wait_for(|| router.peer_count() == 1).await;
        assert_eq!(router.peer_addrs(), vec![peer_addr.clone()]);

        // With two nodes on the ring, some keys route to the remote peer.
        let mut saw_remote = false;
        let mut saw_self = false;
        for i in 0..200 {
            match router.pick_peer(&format!("key-{i}")) {
                Some(PeerChoice::Remote(_)) => saw_remote = true,
                Some(PeerChoice::SelfOwner) => saw_self = true,
                None => panic!("ring must not be empty"),
            }
        }
        assert!(saw_remote && saw_self);

        handle.remove_peer(peer_addr.clone());
        wait_for(|| router.peer_count() == 0).await;
        for i in 0..50 {
            assert!(matches!(
                router.pick_peer(&format!("key-{i}")),
                Some(PeerChoice::SelfOwner)
            ));
        }
        router.shutdown().await;
    }

    #[tokio::test]
    async fn test_unreachable_peer_not_added() {
        // Nothing listens on port 1; the connect fails and the ring must
        // stay self-only.
        let config = RouterConfig::default().with_dial_timeout(Duration::from_millis(200));
        let registry = StaticRegistry::new(["127.0.0.1:1"]);
        let router = PeerRouter::new("127.0.0.1:9000", config, Box::new(registry))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(router.peer_count(), 0);
        assert!(matches!(
            router.pick_peer("any"),
            Some(PeerChoice::SelfOwner)
        ));
        router.shutdown().await;
    }

    #[tokio::test]
    async fn test_self_event_ignored() {
        let registry = StaticRegistry::new(["127.0.0.1:9000"]);
        let router = PeerRouter::new("127.0.0.1:9000", RouterConfig::default(), Box::new(registry))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(router.peer_count(), 0);
        router.shutdown().await;
    }
}
