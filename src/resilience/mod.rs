//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Call to a dependency:
//!     → boundary.rs (correlation id, deadline, classification, fallback)
//!     → registry.rs (breaker for the channel name)
//!     → circuit_breaker.rs (admit or reject, record outcome once)
//!     → timeouts.rs (deadline around the operation)
//! ```
//!
//! # Design Decisions
//! - Every external call has a deadline
//! - A rejected call never reaches the dependency
//! - Breakers are keyed by name and shared through one registry

pub mod boundary;
pub mod circuit_breaker;
pub mod registry;
pub mod timeouts;

pub use boundary::{
    BoundaryError, BoundaryErrorKind, CallContext, CallError, CallOptions, ChannelSnapshot,
    ErrorBoundary, Guarded,
};
pub use circuit_breaker::{
    BreakerSettings, BreakerSnapshot, BreakerTransition, CircuitBreaker, CircuitState, Permit,
    Rejected, TransitionReason,
};
pub use registry::BreakerRegistry;
pub use timeouts::{with_deadline, DeadlineExceeded};
