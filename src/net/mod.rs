//! Connection management subsystem.
//!
//! # Data Flow
//! ```text
//! Client asks for a streaming connection
//!     → manager.rs (quota checks, record table, background sweep/heartbeat)
//!     → connection.rs (record, id, outbound channel)
//!     → ConnectionHandle held by the transport until it closes
//!
//! Record lifecycle:
//!     Admitted → Active (touch/heartbeat) → Released
//!         (close | drop | stale | heartbeat failure | send failure)
//! ```
//!
//! # Design Decisions
//! - Bounded quotas prevent resource exhaustion
//! - Every record is released exactly once, whatever path gets there first

pub mod connection;
pub mod manager;

pub use connection::{ConnectionId, ConnectionMetadata, ConnectionRecord, Outbound, ReleaseReason};
pub use manager::{
    AdmissionError, BroadcastReport, CapacityScope, ChannelProbe, ConnectionEvent,
    ConnectionHandle, ConnectionLimits, ConnectionManager, ConnectionMetrics, HeartbeatReport,
    LivenessProbe, ProbeError, ProbeTarget,
};
