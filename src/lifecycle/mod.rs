//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (graph.rs + startup.rs):
//!     Declared components → Validate graph → Initialize in dependency order
//!     → StartupReport published to readiness probes
//!
//! Shutdown (shutdown.rs):
//!     Signal received → Broadcast to background tasks → Drain → Exit
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Trigger graceful shutdown
//! ```
//!
//! # Design Decisions
//! - Graph problems are fatal and detected before any component starts
//! - Independent branches of the graph start concurrently
//! - Shutdown has timeout: forced exit after deadline

pub mod graph;
pub mod shutdown;
pub mod signals;
pub mod startup;

pub use graph::{DependencyGraph, GraphError};
pub use shutdown::Shutdown;
pub use startup::{
    Component, ComponentDescriptor, ComponentError, ComponentOutcome, ComponentStatus, Readiness,
    StartupCoordinator, StartupError, StartupPhase, StartupReport, StartupState,
};
