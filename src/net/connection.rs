//! Connection records and identity.
//!
//! # Responsibilities
//! - Generate unique connection IDs for tracing
//! - Hold per-connection bookkeeping (owner, timestamps, metadata)
//! - Carry the sending half of each connection's outbound channel

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize, Serializer};
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Global atomic counter for connection IDs.
/// Using relaxed ordering is sufficient since we only need uniqueness, not synchronization.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Bytes charged per record on top of its metadata estimate.
pub(crate) const RECORD_OVERHEAD_BYTES: usize = 256;

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

impl Serialize for ConnectionId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Caller-supplied description of a connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionMetadata {
    /// Estimated bytes this connection holds (buffers, session state).
    pub size_estimate: usize,
    pub tags: BTreeSet<String>,
}

impl ConnectionMetadata {
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }
}

/// Frame queued for delivery to a connection.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Payload(Arc<serde_json::Value>),
    /// Liveness ping from the heartbeat cycle.
    Ping,
}

/// Why a record left the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseReason {
    /// Explicit close by the owner of the handle.
    Closed,
    /// The handle was dropped without an explicit close.
    Dropped,
    /// Idle longer than the connection timeout.
    Stale,
    HeartbeatFailed,
    /// The client side of the outbound channel is gone.
    SendFailed,
}

impl ReleaseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReleaseReason::Closed => "closed",
            ReleaseReason::Dropped => "dropped",
            ReleaseReason::Stale => "stale",
            ReleaseReason::HeartbeatFailed => "heartbeat_failed",
            ReleaseReason::SendFailed => "send_failed",
        }
    }
}

impl std::fmt::Display for ReleaseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One admitted connection, as held in the manager's table.
#[derive(Debug)]
pub struct ConnectionRecord {
    id: ConnectionId,
    owner: String,
    created_at: Instant,
    last_activity_at: Instant,
    last_heartbeat_at: Option<Instant>,
    metadata: ConnectionMetadata,
    outbound: mpsc::Sender<Outbound>,
}

impl ConnectionRecord {
    pub(crate) fn new(
        owner: String,
        metadata: ConnectionMetadata,
        outbound: mpsc::Sender<Outbound>,
    ) -> Self {
        let now = Instant::now();
        Self {
            id: ConnectionId::new(),
            owner,
            created_at: now,
            last_activity_at: now,
            last_heartbeat_at: None,
            metadata,
            outbound,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn metadata(&self) -> &ConnectionMetadata {
        &self.metadata
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_activity_at(&self) -> Instant {
        self.last_activity_at
    }

    pub fn last_heartbeat_at(&self) -> Option<Instant> {
        self.last_heartbeat_at
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity_at)
    }

    /// Estimated footprint charged against the memory metric.
    pub fn estimated_bytes(&self) -> usize {
        RECORD_OVERHEAD_BYTES
            + self.owner.len()
            + self.metadata.size_estimate
            + self.metadata.tags.iter().map(String::len).sum::<usize>()
    }

    pub(crate) fn touch(&mut self, now: Instant) {
        self.last_activity_at = now;
    }

    pub(crate) fn mark_heartbeat(&mut self, now: Instant) {
        self.last_heartbeat_at = Some(now);
    }

    pub(crate) fn outbound(&self) -> &mpsc::Sender<Outbound> {
        &self.outbound
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_id_unique() {
        let id1 = ConnectionId::new();
        let id2 = ConnectionId::new();
        assert_ne!(id1, id2);
        assert_eq!(id1.to_string(), format!("conn-{}", id1.as_u64()));
    }

    #[tokio::test(start_paused = true)]
    async fn touch_moves_activity_but_not_heartbeat() {
        let (tx, _rx) = mpsc::channel(1);
        let mut record = ConnectionRecord::new(
            "alice".into(),
            ConnectionMetadata::default().with_tag("dashboard"),
            tx,
        );
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(record.idle_for(Instant::now()), Duration::from_secs(10));

        record.mark_heartbeat(Instant::now());
        assert_eq!(record.idle_for(Instant::now()), Duration::from_secs(10));

        record.touch(Instant::now());
        assert_eq!(record.idle_for(Instant::now()), Duration::ZERO);
        assert!(record.metadata().has_tag("dashboard"));
    }

    #[test]
    fn estimate_includes_owner_and_tags() {
        let (tx, _rx) = mpsc::channel(1);
        let metadata = ConnectionMetadata {
            size_estimate: 1000,
            tags: BTreeSet::from(["ab".to_string()]),
        };
        let record = ConnectionRecord::new("abc".into(), metadata, tx);
        assert_eq!(record.estimated_bytes(), RECORD_OVERHEAD_BYTES + 3 + 1000 + 2);
    }
}
