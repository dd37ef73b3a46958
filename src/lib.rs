//! Distributed in-memory key/value cache.
//!
//! A cluster of peer nodes shares one keyspace by consistent hashing; each
//! key has a unique owner. Reads go through any node, which serves from its
//! local store, forwards to the owning peer, or falls back to a
//! user-supplied loader. Loads for the same key coalesce into a single
//! execution, and each node bounds its store by bytes with per-entry TTL.
//!
//! # Example
//!
//! ```rust,no_run
//! use lcache::{new_group, CacheServer, LoaderFn, PeerRouter, RedisRegistry};
//! use lcache::config::{RegistryConfig, RouterConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let addr = "10.0.0.7:9999";
//!
//!     // The loader produces values on cache misses.
//!     let group = new_group(
//!         "scores",
//!         64 << 20,
//!         LoaderFn(|key: &str| Some((format!("score:{key}").into_bytes(), None))),
//!     )?;
//!
//!     // Membership comes from the shared registry; the router decides
//!     // per key whether to serve locally or forward.
//!     let registry = RedisRegistry::new(RegistryConfig::default())?;
//!     let router = PeerRouter::new(addr, RouterConfig::default(), Box::new(registry)).await?;
//!     group.register_peers(router);
//!
//!     // Serve peer traffic and publish this node.
//!     let publisher = RedisRegistry::new(RegistryConfig::default())?;
//!     let (server, _shutdown) = CacheServer::new(addr)?;
//!     tokio::spawn(server.with_registry(Box::new(publisher)).run());
//!
//!     let value = group.get("alice").await?;
//!     println!("{:?}", value.as_slice());
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────┐
//! │                Group (get/delete)          │
//! └────────────────────────────────────────────┘
//!        │ single-flight
//!        ▼
//! ┌──────────────┐  self  ┌─────────────────┐
//! │  PeerRouter  │───────►│  LruStore/Loader │
//! │  (hash ring) │        └─────────────────┘
//! └──────────────┘  remote
//!        │                ┌─────────────────┐
//!        └───────────────►│ PeerClient ──TCP│──► peer CacheServer
//!                         └─────────────────┘
//! ```
//!
//! Membership flows from a [`registry::ServiceRegistry`] into the router:
//! nodes publish their address under a leased key and watch the service
//! for peers joining and leaving.

pub mod config;
pub mod error;
pub mod group;
pub mod network;
pub mod peers;
pub mod registry;
pub mod ring;
pub mod singleflight;
pub mod store;
pub mod types;

pub use config::{RegistryConfig, RouterConfig, DEFAULT_SERVICE_NAME};
pub use error::{DiscoveryError, Error, NetworkError, Result};
pub use group::{destroy_group, get_group, new_group, Group, GroupRegistry};
pub use network::{CacheServer, PeerClient};
pub use peers::{Peer, PeerChoice, PeerPicker, PeerRouter};
pub use registry::{MembershipEvent, RedisRegistry, ServiceRegistry, StaticRegistry};
pub use ring::HashRing;
pub use singleflight::FlightGroup;
pub use store::{CacheType, LruStore, Options, Store};
pub use types::{ByteView, Loader, LoaderFn};
