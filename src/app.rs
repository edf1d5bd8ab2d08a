//! Assembly of the runtime services from configuration.
//!
//! # Responsibilities
//! - Build the breaker registry, error boundary and connection manager
//! - Declare and bind the configured startup graph
//! - Apply hot-reloaded settings to the running services

use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::config::schema::DEFAULT_ADMIN_KEY;
use crate::config::{BulwarkConfig, StartupConfig};
use crate::health::components::component_for;
use crate::http::server::AppState;
use crate::lifecycle::startup::{Readiness, StartupCoordinator};
use crate::net::manager::ConnectionManager;
use crate::resilience::boundary::ErrorBoundary;
use crate::resilience::registry::BreakerRegistry;

/// Shared handles to every long-lived service.
#[derive(Clone)]
pub struct Services {
    pub breakers: Arc<BreakerRegistry>,
    pub boundary: Arc<ErrorBoundary>,
    pub connections: Arc<ConnectionManager>,
    admin_key: Arc<ArcSwap<String>>,
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Services")
            .field("breakers", &self.breakers)
            .field("boundary", &self.boundary)
            .field("connections", &self.connections)
            .finish_non_exhaustive()
    }
}

impl Services {
    pub fn from_config(config: &BulwarkConfig) -> Self {
        let breakers = Arc::new(BreakerRegistry::from_config(&config.breaker));
        let boundary = Arc::new(ErrorBoundary::new(Arc::clone(&breakers), &config.boundary));
        let connections = ConnectionManager::new(config.connections.to_limits());
        warn_on_default_key(&config.admin.api_key);
        Self {
            breakers,
            boundary,
            connections,
            admin_key: Arc::new(ArcSwap::from_pointee(config.admin.api_key.clone())),
        }
    }

    /// Coordinator with every configured component declared and bound.
    pub fn coordinator(&self, config: &StartupConfig) -> StartupCoordinator {
        let mut coordinator = StartupCoordinator::new();
        for component in &config.components {
            coordinator.register(component.to_descriptor(), component_for(component, &self.boundary));
        }
        coordinator
    }

    pub fn app_state(&self, readiness: Readiness) -> AppState {
        AppState {
            breakers: Arc::clone(&self.breakers),
            boundary: Arc::clone(&self.boundary),
            connections: Arc::clone(&self.connections),
            readiness,
            admin_key: Arc::clone(&self.admin_key),
        }
    }

    /// Apply the live-reloadable parts of a new config.
    pub fn apply_reload(&self, config: &BulwarkConfig) {
        self.breakers.apply_config(&config.breaker);
        self.boundary.apply_config(&config.boundary);
        if **self.admin_key.load() != config.admin.api_key {
            warn_on_default_key(&config.admin.api_key);
            self.admin_key.store(Arc::new(config.admin.api_key.clone()));
            tracing::info!("Admin API key rotated");
        }
        tracing::info!(
            default_threshold = config.breaker.defaults.failure_threshold,
            overrides = config.breaker.overrides.len(),
            default_timeout_ms = config.boundary.default_timeout_ms,
            "Configuration reloaded"
        );
    }
}

fn warn_on_default_key(key: &str) {
    if key == DEFAULT_ADMIN_KEY {
        tracing::warn!("admin.api_key is the built-in default; set it before exposing the admin API");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;
    use crate::lifecycle::startup::StartupState;
    use crate::resilience::circuit_breaker::CircuitState;
    use std::time::Duration;

    #[tokio::test]
    async fn configured_graph_without_endpoints_is_ready() {
        let config = parse_config(
            r#"
            [[startup.components]]
            name = "storage"

            [[startup.components]]
            name = "api"
            dependencies = ["storage"]
            "#,
        )
        .unwrap();
        let services = Services::from_config(&config);
        let report = services.coordinator(&config.startup).run().await.unwrap();
        assert_eq!(report.overall_state, StartupState::Ready);
        assert_eq!(report.order, vec!["storage", "api"]);
    }

    #[test]
    fn reload_updates_breakers_and_timeouts() {
        let services = Services::from_config(&BulwarkConfig::default());
        services.breakers.record_failure("cache");

        let reloaded = parse_config(
            r#"
            [breaker]
            failure_threshold = 2

            [boundary]
            default_timeout_ms = 750
            "#,
        )
        .unwrap();
        services.apply_reload(&reloaded);

        services.breakers.record_failure("cache");
        assert_eq!(services.breakers.state("cache"), CircuitState::Open);
        assert_eq!(services.boundary.timeout_for("cache"), Duration::from_millis(750));
    }

    #[test]
    fn reload_rotates_admin_key() {
        let services = Services::from_config(&BulwarkConfig::default());
        let mut reloaded = BulwarkConfig::default();
        reloaded.admin.api_key = "rotated".into();
        services.apply_reload(&reloaded);
        assert_eq!(services.admin_key.load().as_str(), "rotated");
    }
}
