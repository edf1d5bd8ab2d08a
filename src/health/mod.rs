//! Health subsystem.
//!
//! # Data Flow
//! ```text
//! Startup:
//!     Configured component
//!     → components.rs (TCP probe through the error boundary)
//!     → StartupCoordinator records the outcome
//!
//! Probes from the orchestrator:
//!     GET /health/live  → endpoints.rs (always 200)
//!     GET /health/ready → endpoints.rs (startup report → 200 | 503)
//! ```

pub mod components;
pub mod endpoints;

pub use components::{component_for, EndpointComponent, StaticComponent};
