//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the layer.
//! All types derive Serde traits for deserialization from config files.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::lifecycle::startup::ComponentDescriptor;
use crate::net::manager::ConnectionLimits;
use crate::resilience::circuit_breaker::BreakerSettings;

/// Root configuration for the resilience layer.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct BulwarkConfig {
    /// Health/admin HTTP surface.
    pub server: ServerConfig,

    /// Circuit breaker defaults and per-dependency overrides.
    pub breaker: BreakerConfig,

    /// Connection admission quotas and liveness timers.
    pub connections: ConnectionConfig,

    /// Cross-boundary call timeouts.
    pub boundary: BoundaryConfig,

    /// Dependency graph initialized at startup.
    pub startup: StartupConfig,

    /// Admin API access.
    pub admin: AdminConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Health/admin server configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,

    /// Graceful shutdown deadline in seconds.
    pub shutdown_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            shutdown_timeout_secs: 10,
        }
    }
}

/// Circuit breaker settings for a single guarded name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct BreakerEntry {
    /// Consecutive failures in Closed before the circuit opens.
    pub failure_threshold: u32,

    /// Time the circuit stays open before a probe is allowed, in milliseconds.
    pub recovery_timeout_ms: u64,
}

impl Default for BreakerEntry {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            recovery_timeout_ms: 30_000,
        }
    }
}

impl BreakerEntry {
    pub fn to_settings(&self) -> BreakerSettings {
        BreakerSettings {
            failure_threshold: self.failure_threshold,
            recovery_timeout: Duration::from_millis(self.recovery_timeout_ms),
        }
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Settings applied to every breaker without an override.
    #[serde(flatten)]
    pub defaults: BreakerEntry,

    /// Per-name overrides (e.g., `[breaker.overrides.storage]`).
    pub overrides: BTreeMap<String, BreakerEntry>,
}

impl BreakerConfig {
    pub fn default_settings(&self) -> BreakerSettings {
        self.defaults.to_settings()
    }

    pub fn override_settings(&self) -> BTreeMap<String, BreakerSettings> {
        self.overrides
            .iter()
            .map(|(name, entry)| (name.clone(), entry.to_settings()))
            .collect()
    }
}

/// Connection manager configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Maximum live connections across all owners.
    pub max_total: usize,

    /// Maximum live connections sharing one owner key.
    pub max_per_owner: usize,

    /// Stale sweep interval in seconds.
    pub cleanup_interval_secs: u64,

    /// Heartbeat interval in seconds.
    pub heartbeat_interval_secs: u64,

    /// Per-probe heartbeat deadline in milliseconds.
    pub heartbeat_timeout_ms: u64,

    /// Idle time after which a connection is stale, in seconds.
    pub connection_timeout_secs: u64,

    /// Outbound buffer per connection (messages).
    pub outbound_buffer: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_total: 1000,
            max_per_owner: 5,
            cleanup_interval_secs: 60,
            heartbeat_interval_secs: 30,
            heartbeat_timeout_ms: 5000,
            connection_timeout_secs: 300,
            outbound_buffer: 64,
        }
    }
}

impl ConnectionConfig {
    pub fn to_limits(&self) -> ConnectionLimits {
        ConnectionLimits {
            max_total: self.max_total,
            max_per_owner: self.max_per_owner,
            cleanup_interval: Duration::from_secs(self.cleanup_interval_secs),
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval_secs),
            heartbeat_timeout: Duration::from_millis(self.heartbeat_timeout_ms),
            connection_timeout: Duration::from_secs(self.connection_timeout_secs),
            outbound_buffer: self.outbound_buffer,
        }
    }
}

/// Error boundary configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BoundaryConfig {
    /// Call timeout used when neither the call nor the channel sets one.
    pub default_timeout_ms: u64,

    /// Per-channel call timeouts in milliseconds.
    pub channel_timeouts_ms: BTreeMap<String, u64>,
}

impl Default for BoundaryConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 5000,
            channel_timeouts_ms: BTreeMap::new(),
        }
    }
}

/// Startup dependency graph.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct StartupConfig {
    pub components: Vec<ComponentConfig>,
}

/// One node of the startup graph.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ComponentConfig {
    /// Unique component name.
    pub name: String,

    /// Names of components that must be ready first.
    #[serde(default)]
    pub dependencies: BTreeSet<String>,

    /// A failing critical component fails the whole startup.
    #[serde(default = "default_critical")]
    pub critical: bool,

    /// Deadline for init plus the post-init health check, in seconds.
    #[serde(default = "default_init_timeout_secs")]
    pub init_timeout_secs: u64,

    /// TCP endpoint probed through the error boundary (e.g., "127.0.0.1:5432").
    #[serde(default)]
    pub endpoint: Option<String>,
}

fn default_critical() -> bool {
    true
}

fn default_init_timeout_secs() -> u64 {
    30
}

impl ComponentConfig {
    pub fn to_descriptor(&self) -> ComponentDescriptor {
        ComponentDescriptor {
            name: self.name.clone(),
            dependencies: self.dependencies.clone(),
            critical: self.critical,
            init_timeout: Duration::from_secs(self.init_timeout_secs),
        }
    }
}

/// Admin API configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Bearer token required on every `/admin` request.
    pub api_key: String,
}

pub const DEFAULT_ADMIN_KEY: &str = "CHANGE_ME_IN_PRODUCTION";

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            api_key: DEFAULT_ADMIN_KEY.to_string(),
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: true,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = BulwarkConfig::default();
        assert_eq!(config.breaker.defaults.failure_threshold, 3);
        assert_eq!(config.breaker.defaults.recovery_timeout_ms, 30_000);
        assert_eq!(config.connections.max_total, 1000);
        assert_eq!(config.connections.max_per_owner, 5);
        assert_eq!(config.connections.cleanup_interval_secs, 60);
        assert_eq!(config.connections.heartbeat_interval_secs, 30);
        assert_eq!(config.connections.connection_timeout_secs, 300);
        assert_eq!(config.boundary.default_timeout_ms, 5000);
        assert!(config.startup.components.is_empty());
        assert_eq!(config.admin.api_key, DEFAULT_ADMIN_KEY);
    }

    #[test]
    fn parses_overrides_and_components() {
        let raw = r#"
            [breaker]
            failure_threshold = 4

            [breaker.overrides.storage]
            failure_threshold = 2
            recovery_timeout_ms = 1000

            [boundary.channel_timeouts_ms]
            cache = 250

            [[startup.components]]
            name = "storage"
            endpoint = "127.0.0.1:5432"

            [[startup.components]]
            name = "cache"
            dependencies = ["storage"]
            critical = false
            init_timeout_secs = 5
        "#;

        let config: BulwarkConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.breaker.defaults.failure_threshold, 4);
        assert_eq!(config.breaker.defaults.recovery_timeout_ms, 30_000);

        let storage = config.breaker.override_settings()["storage"];
        assert_eq!(storage.failure_threshold, 2);
        assert_eq!(storage.recovery_timeout, Duration::from_secs(1));

        assert_eq!(config.boundary.channel_timeouts_ms["cache"], 250);

        let cache = config.startup.components[1].to_descriptor();
        assert!(!cache.critical);
        assert!(cache.dependencies.contains("storage"));
        assert_eq!(cache.init_timeout, Duration::from_secs(5));
        assert!(config.startup.components[0].critical);
    }
}
