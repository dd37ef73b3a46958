//! Redis-backed service registry.
//!
//! Each live node owns one key, `<service>/<host:port>`, written with an
//! expiry equal to the lease TTL. A keep-alive task refreshes the key at a
//! third of the lease, so a crashed node's key lapses on its own and the
//! watchers see it drop out. Watching is a poll: list the service's keys,
//! diff against the previously seen set, emit `Added`/`Removed`.

use super::{addr_from_key, service_key, MembershipEvent, ServiceRegistry};
use crate::config::RegistryConfig;
use crate::error::{DiscoveryError, Result};
use async_trait::async_trait;
use redis::AsyncCommands;
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Service registry backed by Redis key leases.
pub struct RedisRegistry {
    config: RegistryConfig,
    client: redis::Client,
    published: Option<String>,
    cancel: CancellationToken,
}

impl RedisRegistry {
    /// Create a registry for the configured endpoint. The connection is
    /// established on first use; a bad URL fails here.
    pub fn new(config: RegistryConfig) -> Result<Self> {
        let client = redis::Client::open(config.endpoint.as_str())
            .map_err(DiscoveryError::from)?;
        Ok(Self {
            config,
            client,
            published: None,
            cancel: CancellationToken::new(),
        })
    }

    fn lease_secs(&self) -> u64 {
        self.config.lease_ttl.as_secs().max(1)
    }
}

#[async_trait]
impl ServiceRegistry for RedisRegistry {
    async fn publish(&mut self, addr: &str) -> Result<()> {
        // A backend failure here is fatal: the node must not start while
        // invisible to its peers.
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(DiscoveryError::from)?;

        let key = service_key(&self.config.service_name, addr);
        let lease = self.lease_secs();
        conn.set_ex::<_, _, ()>(&key, addr, lease)
            .await
            .map_err(DiscoveryError::from)?;

        info!(
            service = %self.config.service_name,
            addr,
            lease_secs = lease,
            "published address to registry"
        );
        self.published = Some(addr.to_string());

        let cancel = self.cancel.clone();
        let owned_addr = addr.to_string();
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_secs((lease / 3).max(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        // A missed refresh is retried on the next tick; the
                        // lease only lapses after repeated failures.
                        if let Err(e) = conn.set_ex::<_, _, ()>(&key, &owned_addr, lease).await {
                            warn!(error = %e, key = %key, "lease keep-alive failed");
                        }
                    }
                }
            }
            debug!(key = %key, "keep-alive task stopped");
        });

        Ok(())
    }

    async fn watch(&mut self) -> Result<mpsc::Receiver<MembershipEvent>> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(DiscoveryError::from)?;

        let (tx, rx) = mpsc::channel(64);
        let service = self.config.service_name.clone();
        let pattern = format!("{service}/*");
        let poll = self.config.poll_interval;
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            let mut known: HashSet<String> = HashSet::new();
            let mut ticker = tokio::time::interval(poll);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let keys: Vec<String> = match conn.keys(&pattern).await {
                            Ok(keys) => keys,
                            Err(e) => {
                                warn!(error = %e, service = %service, "membership poll failed");
                                continue;
                            }
                        };
                        let live: HashSet<String> = keys
                            .iter()
                            .filter_map(|k| addr_from_key(k, &service))
                            .map(str::to_string)
                            .collect();

                        for addr in live.difference(&known) {
                            if tx.send(MembershipEvent::Added(addr.clone())).await.is_err() {
                                return;
                            }
                        }
                        for addr in known.difference(&live) {
                            if tx.send(MembershipEvent::Removed(addr.clone())).await.is_err() {
                                return;
                            }
                        }
                        known = live;
                    }
                }
            }
            debug!(service = %service, "membership watch stopped");
        });

        Ok(rx)
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.cancel.cancel();
        if let Some(addr) = self.published.take() {
            let mut conn = self
                .client
                .get_multiplexed_async_connection()
                .await
                .map_err(DiscoveryError::from)?;
            let key = service_key(&self.config.service_name, &addr);
            conn.del::<_, ()>(&key).await.map_err(DiscoveryError::from)?;
            info!(key = %key, "retracted address from registry");
        }
        Ok(())
    }
}

impl std::fmt::Debug for RedisRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisRegistry")
            .field("service", &self.config.service_name)
            .field("published", &self.published)
            .finish()
    }
}
