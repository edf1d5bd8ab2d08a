//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Create Axum Router with all handlers
//! - Wire up middleware (tracing, request ID, admin auth)
//! - Serve until the shutdown broadcast fires

use std::sync::Arc;

use arc_swap::ArcSwap;
use axum::{routing::get, Router};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};

use crate::admin::setup_admin_router;
use crate::health::endpoints;
use crate::http::websocket;
use crate::lifecycle::shutdown;
use crate::lifecycle::startup::Readiness;
use crate::net::manager::ConnectionManager;
use crate::resilience::boundary::ErrorBoundary;
use crate::resilience::registry::BreakerRegistry;

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub breakers: Arc<BreakerRegistry>,
    pub boundary: Arc<ErrorBoundary>,
    pub connections: Arc<ConnectionManager>,
    pub readiness: Readiness,
    /// Bearer token for `/admin`, swapped on config reload.
    pub admin_key: Arc<ArcSwap<String>>,
}

/// HTTP server for health, admin and streaming endpoints.
pub struct HttpServer {
    router: Router,
}

impl HttpServer {
    pub fn new(state: AppState) -> Self {
        Self {
            router: Self::build_router(state),
        }
    }

    /// Build the Axum router with all middleware layers.
    fn build_router(state: AppState) -> Router {
        Router::new()
            .route("/health/live", get(endpoints::live))
            .route("/health/ready", get(endpoints::ready))
            .route("/stream", get(websocket::stream))
            .merge(setup_admin_router(&state))
            .with_state(state)
            .layer(PropagateRequestIdLayer::x_request_id())
            .layer(TraceLayer::new_for_http())
            .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
    }

    pub fn router(&self) -> Router {
        self.router.clone()
    }

    /// Run the server, accepting connections on the given listener.
    pub async fn run(
        self,
        listener: TcpListener,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "HTTP server starting");

        axum::serve(listener, self.router)
            .with_graceful_shutdown(shutdown::wait(shutdown_rx))
            .await?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }
}
