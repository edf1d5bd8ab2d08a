//! Startup components backed by real dependencies.
//!
//! # Responsibilities
//! - Probe a TCP endpoint through the error boundary for init and health check
//! - Stand in for subsystems that have nothing to probe

use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::TcpStream;

use crate::config::ComponentConfig;
use crate::lifecycle::startup::{Component, ComponentError};
use crate::resilience::boundary::{CallError, CallOptions, ErrorBoundary};

/// A dependency reachable at a TCP address.
///
/// Every probe runs on the boundary channel named after the component, so a
/// dependency that keeps failing opens its own breaker.
pub struct EndpointComponent {
    name: String,
    endpoint: String,
    boundary: Arc<ErrorBoundary>,
}

impl EndpointComponent {
    pub fn new(name: impl Into<String>, endpoint: impl Into<String>, boundary: Arc<ErrorBoundary>) -> Self {
        Self {
            name: name.into(),
            endpoint: endpoint.into(),
            boundary,
        }
    }

    async fn connect(&self) -> Result<(), ComponentError> {
        let endpoint = self.endpoint.clone();
        self.boundary
            .call(
                &self.name,
                |ctx| async move {
                    tracing::debug!(endpoint = %endpoint, correlation_id = %ctx.correlation_id, "Probing endpoint");
                    TcpStream::connect(&endpoint)
                        .await
                        .map(|_| ())
                        .map_err(CallError::from)
                },
                CallOptions::new(),
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Component for EndpointComponent {
    async fn init(&self) -> Result<(), ComponentError> {
        self.connect().await
    }

    async fn health_check(&self) -> Result<(), ComponentError> {
        self.connect().await
    }
}

/// An in-process subsystem with no external probe.
#[derive(Debug, Default, Clone, Copy)]
pub struct StaticComponent;

#[async_trait]
impl Component for StaticComponent {
    async fn init(&self) -> Result<(), ComponentError> {
        Ok(())
    }
}

/// Implementation for a configured component.
pub fn component_for(config: &ComponentConfig, boundary: &Arc<ErrorBoundary>) -> Arc<dyn Component> {
    match &config.endpoint {
        Some(endpoint) => Arc::new(EndpointComponent::new(
            config.name.clone(),
            endpoint.clone(),
            Arc::clone(boundary),
        )),
        None => Arc::new(StaticComponent),
    }
}
