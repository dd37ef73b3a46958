//! Service registry: publishing this node and watching membership.
//!
//! The registry abstracts the external service-discovery backend behind a
//! trait so different backends can drive the same peer router. The shipped
//! implementations are [`RedisRegistry`], which leases membership keys in
//! Redis, and [`StaticRegistry`], which serves a fixed peer list for tests
//! and static deployments.

pub mod redis;

pub use self::redis::RedisRegistry;

use crate::error::{DiscoveryError, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::info;

/// A membership change observed under the watched service name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipEvent {
    /// A node's address appeared.
    Added(String),
    /// A node's address disappeared.
    Removed(String),
}

/// Contract between the cache and its service-discovery backend.
///
/// `publish` announces this node under the service name with a lease that
/// is kept alive until `shutdown` retracts it. `watch` yields the current
/// membership as an initial burst of `Added` events followed by incremental
/// changes.
#[async_trait]
pub trait ServiceRegistry: Send + Sync {
    /// Publish `addr` under the service name and keep its lease alive.
    async fn publish(&mut self, addr: &str) -> Result<()>;

    /// Subscribe to membership changes. May be called once.
    async fn watch(&mut self) -> Result<mpsc::Receiver<MembershipEvent>>;

    /// Retract the published address and stop background tasks.
    async fn shutdown(&mut self) -> Result<()>;
}

/// Key a node's address is stored under: `<service>/<host:port>`.
pub fn service_key(service: &str, addr: &str) -> String {
    format!("{service}/{addr}")
}

/// Extract the node address from a membership key, if the key belongs to
/// the given service.
pub fn addr_from_key<'a>(key: &'a str, service: &str) -> Option<&'a str> {
    key.strip_prefix(service)?.strip_prefix('/')
}

/// Registry with a fixed membership list.
///
/// The initial peers are delivered as the watch snapshot; tests and
/// orchestration layers can push further changes through a
/// [`StaticRegistryHandle`].
pub struct StaticRegistry {
    peers: Vec<String>,
    tx: mpsc::Sender<MembershipEvent>,
    rx: Option<mpsc::Receiver<MembershipEvent>>,
}

/// Cloneable handle for feeding membership changes into a
/// [`StaticRegistry`] after it has been handed to a router.
#[derive(Clone)]
pub struct StaticRegistryHandle {
    tx: mpsc::Sender<MembershipEvent>,
}

impl StaticRegistryHandle {
    /// Announce a peer as joined.
    pub fn add_peer(&self, addr: impl Into<String>) {
        let _ = self.tx.try_send(MembershipEvent::Added(addr.into()));
    }

    /// Announce a peer as departed.
    pub fn remove_peer(&self, addr: impl Into<String>) {
        let _ = self.tx.try_send(MembershipEvent::Removed(addr.into()));
    }
}

impl StaticRegistry {
    /// Create a registry whose watch snapshot is `peers`.
    pub fn new(peers: impl IntoIterator<Item = impl Into<String>>) -> Self {
        let (tx, rx) = mpsc::channel(64);
        Self {
            peers: peers.into_iter().map(Into::into).collect(),
            tx,
            rx: Some(rx),
        }
    }

    /// Handle for injecting membership changes later.
    pub fn handle(&self) -> StaticRegistryHandle {
        StaticRegistryHandle {
            tx: self.tx.clone(),
        }
    }
}

#[async_trait]
impl ServiceRegistry for StaticRegistry {
    async fn publish(&mut self, addr: &str) -> Result<()> {
        info!(addr, "static registry publish (no backend)");
        Ok(())
    }

    async fn watch(&mut self) -> Result<mpsc::Receiver<MembershipEvent>> {
        let rx = self
            .rx
            .take()
            .ok_or(DiscoveryError::WatchTaken)?;
        for peer in &self.peers {
            let _ = self.tx.try_send(MembershipEvent::Added(peer.clone()));
        }
        Ok(rx)
    }

    async fn shutdown(&mut self) -> Result<()> {
        Ok(())
    }
}

impl std::fmt::Debug for StaticRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticRegistry")
            .field("peers", &self.peers)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_key_format() {
        assert_eq!(service_key("lcache", "10.0.0.1:9000"), "lcache/10.0.0.1:9000");
    }

    #[test]
    fn test_addr_from_key() {
        assert_eq!(
            addr_from_key("lcache/10.0.0.1:9000", "lcache"),
            Some("10.0.0.1:9000")
        );
        assert_eq!(addr_from_key("other/10.0.0.1:9000", "lcache"), None);
        assert_eq!(addr_from_key("lcache", "lcache"), None);
    }

    #[tokio::test]
    async fn test_static_registry_snapshot() {
        let mut registry = StaticRegistry::new(["127.0.0.1:9001", "127.0.0.1:9002"]);
        let mut rx = registry.watch().await.unwrap();

        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            seen.push(event);
        }
        assert_eq!(
            seen,
            vec![
                MembershipEvent::Added("127.0.0.1:9001".into()),
                MembershipEvent::Added("127.0.0.1:9002".into()),
            ]
        );
    }

    #[tokio::test]
    async fn test_static_registry_handle_events() {
        let mut registry = StaticRegistry::new(Vec::<String>::new());
        let handle = registry.handle();
        let mut rx = registry.watch().await.unwrap();

        handle.add_peer("127.0.0.1:9001");
        handle.remove_peer("127.0.0.1:9001");

        assert_eq!(
            rx.recv().await,
            Some(MembershipEvent::Added("127.0.0.1:9001".into()))
        );
        assert_eq!(
            rx.recv().await,
            Some(MembershipEvent::Removed("127.0.0.1:9001".into()))
        );
    }

    #[tokio::test]
    async fn test_watch_can_only_be_taken_once() {
        let mut registry = StaticRegistry::new(["127.0.0.1:9001"]);
        registry.watch().await.unwrap();
        assert!(registry.watch().await.is_err());
    }
}
