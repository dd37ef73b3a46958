//! Configuration types for the cache.

use crate::ring::DEFAULT_REPLICAS;
use std::time::Duration;

/// Service name nodes publish under when none is configured.
pub const DEFAULT_SERVICE_NAME: &str = "lcache";

/// Configuration for the peer router and its transport clients.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Service name whose members form the ring.
    pub service_name: String,

    /// Anchors each node contributes to the ring.
    pub replicas: usize,

    /// Timeout for establishing a peer connection.
    pub dial_timeout: Duration,

    /// Deadline for a single peer call.
    pub call_timeout: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            service_name: DEFAULT_SERVICE_NAME.to_string(),
            replicas: DEFAULT_REPLICAS,
            dial_timeout: Duration::from_secs(5),
            call_timeout: Duration::from_secs(3),
        }
    }
}

impl RouterConfig {
    /// Set the service name.
    pub fn with_service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = name.into();
        self
    }

    /// Set the number of ring anchors per node.
    pub fn with_replicas(mut self, replicas: usize) -> Self {
        self.replicas = replicas;
        self
    }

    /// Set the peer dial timeout.
    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    /// Set the per-call deadline.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.service_name.is_empty() {
            return Err("service name must not be empty".to_string());
        }
        if self.replicas == 0 {
            return Err("replicas must be at least 1".to_string());
        }
        if self.call_timeout.is_zero() {
            return Err("call timeout must be non-zero".to_string());
        }
        Ok(())
    }
}

/// Configuration for the Redis-backed service registry.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Redis endpoint URL.
    pub endpoint: String,

    /// Service name membership keys are stored under.
    pub service_name: String,

    /// Lease granted to a published address; the key expires this long
    /// after the last keep-alive refresh.
    pub lease_ttl: Duration,

    /// Interval between membership polls on the watch side.
    pub poll_interval: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            endpoint: "redis://127.0.0.1:6379".to_string(),
            service_name: DEFAULT_SERVICE_NAME.to_string(),
            lease_ttl: Duration::from_secs(3),
            poll_interval: Duration::from_secs(1),
        }
    }
}

impl RegistryConfig {
    /// Set the Redis endpoint URL.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// Set the service name.
    pub fn with_service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = name.into();
        self
    }

    /// Set the lease duration.
    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    /// Set the watch poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_router_config_defaults() {
        let config = RouterConfig::default();
        assert_eq!(config.service_name, "lcache");
        assert_eq!(config.replicas, DEFAULT_REPLICAS);
        assert_eq!(config.call_timeout, Duration::from_secs(3));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_router_config_validation() {
        assert!(RouterConfig::default()
            .with_replicas(0)
            .validate()
            .is_err());
        assert!(RouterConfig::default()
            .with_service_name("")
            .validate()
            .is_err());
    }

    #[test]
    fn test_registry_config_builder() {
        let config = RegistryConfig::default()
            .with_endpoint("redis://cache-redis:6379")
            .with_service_name("edge-cache")
            .with_lease_ttl(Duration::from_secs(5));
        assert_eq!(config.endpoint, "redis://cache-redis:6379");
        assert_eq!(config.service_name, "edge-cache");
        assert_eq!(config.lease_ttl, Duration::from_secs(5));
    }
}
