//! Bulwark: resilience and coordination layer.
//!
//! Circuit breakers, a resource-bounded connection manager, an error
//! boundary for cross-process calls and a dependency-ordered startup
//! coordinator, with the HTTP surface that exposes them.

pub mod admin;
pub mod app;
pub mod config;
pub mod health;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod resilience;

pub use app::Services;
pub use config::BulwarkConfig;
pub use http::HttpServer;
pub use lifecycle::{Shutdown, StartupCoordinator, StartupReport};
pub use net::ConnectionManager;
pub use resilience::{BreakerRegistry, ErrorBoundary};
