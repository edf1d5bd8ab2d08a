//! Resource-bounded connection manager.
//!
//! # Responsibilities
//! - Admit connections within a global and a per-owner quota
//! - Track activity and liveness of every admitted connection
//! - Release stale and dead connections from background tasks
//! - Deliver broadcast payloads to matching connections
//!
//! # Design Decisions
//! - The global quota is reserved with a compare-and-swap before the table
//!   lock is taken; a per-owner rejection rolls the reservation back
//! - One mutex guards the record table; probes and sends run outside it
//! - Release is idempotent, so handle drop, sweep and heartbeat may race
//!
//! # Data Flow
//! ```text
//! admit(owner, metadata)
//!     → reserve global slot (CAS)        full → CapacityExceeded(global)
//!     → lock table, check owner quota    full → rollback, CapacityExceeded(owner)
//!     → insert record, return handle
//!
//! sweep task (cleanup_interval):     lock → remove idle > connection_timeout
//! heartbeat task (heartbeat_interval): lock → snapshot → probe all (unlocked)
//!                                      → release failures, stamp survivors
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

use crate::net::connection::{
    ConnectionId, ConnectionMetadata, ConnectionRecord, Outbound, ReleaseReason,
};
use crate::observability::metrics;
use crate::resilience::timeouts::with_deadline;

const EVENT_CAPACITY: usize = 256;

/// Quotas and intervals for the manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionLimits {
    pub max_total: usize,
    pub max_per_owner: usize,
    pub cleanup_interval: Duration,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub connection_timeout: Duration,
    pub outbound_buffer: usize,
}

impl Default for ConnectionLimits {
    fn default() -> Self {
        Self {
            max_total: 1000,
            max_per_owner: 5,
            cleanup_interval: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(5),
            connection_timeout: Duration::from_secs(300),
            outbound_buffer: 64,
        }
    }
}

/// Which quota rejected an admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CapacityScope {
    Global,
    Owner,
}

impl CapacityScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            CapacityScope::Global => "global",
            CapacityScope::Owner => "owner",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdmissionError {
    #[error("capacity exceeded: {} limit of {limit} reached", .scope.as_str())]
    CapacityExceeded { scope: CapacityScope, limit: usize },
}

/// Lifecycle notifications published by the manager.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ConnectionEvent {
    Admitted {
        id: ConnectionId,
        owner: String,
    },
    Released {
        id: ConnectionId,
        owner: String,
        reason: ReleaseReason,
    },
    StaleRemoved {
        id: ConnectionId,
        owner: String,
        idle_ms: u64,
    },
    HeartbeatFailed {
        id: ConnectionId,
        owner: String,
        error: String,
    },
}

/// What a liveness probe gets to work with.
#[derive(Debug, Clone)]
pub struct ProbeTarget {
    pub id: ConnectionId,
    pub owner: String,
    pub outbound: mpsc::Sender<Outbound>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProbeError {
    #[error("outbound channel closed")]
    Closed,

    #[error("probe failed: {0}")]
    Failed(String),
}

/// Liveness check run by the heartbeat cycle.
#[async_trait]
pub trait LivenessProbe: Send + Sync {
    async fn probe(&self, target: &ProbeTarget) -> Result<(), ProbeError>;
}

/// Pings through the outbound channel. A full channel counts as alive.
#[derive(Debug, Default, Clone, Copy)]
pub struct ChannelProbe;

#[async_trait]
impl LivenessProbe for ChannelProbe {
    async fn probe(&self, target: &ProbeTarget) -> Result<(), ProbeError> {
        match target.outbound.try_send(Outbound::Ping) {
            Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => Ok(()),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(ProbeError::Closed),
        }
    }
}

/// Failure classifications tracked by the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailureKind {
    CapacityGlobal,
    CapacityOwner,
    HeartbeatFailed,
    HeartbeatTimeout,
    SendFailed,
    Backpressure,
}

impl FailureKind {
    const ALL: [FailureKind; 6] = [
        FailureKind::CapacityGlobal,
        FailureKind::CapacityOwner,
        FailureKind::HeartbeatFailed,
        FailureKind::HeartbeatTimeout,
        FailureKind::SendFailed,
        FailureKind::Backpressure,
    ];

    fn as_str(&self) -> &'static str {
        match self {
            FailureKind::CapacityGlobal => "capacity_global",
            FailureKind::CapacityOwner => "capacity_owner",
            FailureKind::HeartbeatFailed => "heartbeat_failed",
            FailureKind::HeartbeatTimeout => "heartbeat_timeout",
            FailureKind::SendFailed => "send_failed",
            FailureKind::Backpressure => "backpressure",
        }
    }
}

/// Point-in-time view of the manager's counters.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionMetrics {
    pub current: usize,
    pub peak: usize,
    pub estimated_memory_bytes: usize,
    pub cleanup_total: u64,
    pub failures: BTreeMap<String, u64>,
    pub owners: usize,
    pub max_total: usize,
    pub max_per_owner: usize,
}

/// Result of one `broadcast` call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BroadcastReport {
    pub matched: usize,
    pub delivered: usize,
    /// Closed channels; those records were released.
    pub failed: usize,
    /// Full channels; those records stay live.
    pub backpressure: usize,
}

/// Result of one heartbeat cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HeartbeatReport {
    pub probed: usize,
    pub alive: usize,
    pub released: usize,
}

#[derive(Debug, Default)]
struct Table {
    records: HashMap<ConnectionId, ConnectionRecord>,
    per_owner: HashMap<String, usize>,
}

impl Table {
    fn remove(&mut self, id: ConnectionId) -> Option<ConnectionRecord> {
        let record = self.records.remove(&id)?;
        if let Some(count) = self.per_owner.get_mut(record.owner()) {
            *count -= 1;
            if *count == 0 {
                self.per_owner.remove(record.owner());
            }
        }
        Some(record)
    }
}

pub struct ConnectionManager {
    limits: ConnectionLimits,
    /// Reserved slots; always >= the number of records.
    active: AtomicUsize,
    peak: AtomicUsize,
    estimated_bytes: AtomicUsize,
    cleanup_total: AtomicU64,
    failures: [AtomicU64; 6],
    table: Mutex<Table>,
    probe: Arc<dyn LivenessProbe>,
    events: broadcast::Sender<ConnectionEvent>,
    shutdown: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("limits", &self.limits)
            .field("active", &self.active.load(Ordering::Relaxed))
            .finish()
    }
}

impl ConnectionManager {
    pub fn new(limits: ConnectionLimits) -> Arc<Self> {
        Self::with_probe(limits, Arc::new(ChannelProbe))
    }

    pub fn with_probe(limits: ConnectionLimits, probe: Arc<dyn LivenessProbe>) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (shutdown, _) = broadcast::channel(1);
        Arc::new(Self {
            limits,
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            estimated_bytes: AtomicUsize::new(0),
            cleanup_total: AtomicU64::new(0),
            failures: Default::default(),
            table: Mutex::new(Table::default()),
            probe,
            events,
            shutdown,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn limits(&self) -> &ConnectionLimits {
        &self.limits
    }

    /// Admit a connection for `owner`.
    pub fn admit(
        self: &Arc<Self>,
        owner: &str,
        metadata: ConnectionMetadata,
    ) -> Result<ConnectionHandle, AdmissionError> {
        if !self.reserve_global_slot() {
            return Err(self.reject(owner, CapacityScope::Global, self.limits.max_total));
        }

        let (tx, rx) = mpsc::channel(self.limits.outbound_buffer.max(1));
        let record = ConnectionRecord::new(owner.to_string(), metadata, tx);
        let id = record.id();
        let bytes = record.estimated_bytes();

        let current = {
            let mut table = self.table.lock();
            let owned = table.per_owner.get(owner).copied().unwrap_or(0);
            if owned >= self.limits.max_per_owner {
                drop(table);
                self.active.fetch_sub(1, Ordering::AcqRel);
                return Err(self.reject(owner, CapacityScope::Owner, self.limits.max_per_owner));
            }
            *table.per_owner.entry(owner.to_string()).or_insert(0) += 1;
            table.records.insert(id, record);
            // reservations still pending an owner check are not counted
            let current = table.records.len();
            self.peak.fetch_max(current, Ordering::Relaxed);
            current
        };

        self.estimated_bytes.fetch_add(bytes, Ordering::Relaxed);
        metrics::record_connection_admitted();
        metrics::record_active_connections(current);
        tracing::debug!(connection_id = %id, owner = %owner, active = current, "Connection admitted");
        let _ = self.events.send(ConnectionEvent::Admitted {
            id,
            owner: owner.to_string(),
        });

        Ok(ConnectionHandle {
            id,
            owner: owner.to_string(),
            manager: Arc::clone(self),
            outbound: rx,
        })
    }

    fn reserve_global_slot(&self) -> bool {
        let mut current = self.active.load(Ordering::Acquire);
        loop {
            if current >= self.limits.max_total {
                return false;
            }
            match self.active.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    fn reject(&self, owner: &str, scope: CapacityScope, limit: usize) -> AdmissionError {
        let kind = match scope {
            CapacityScope::Global => FailureKind::CapacityGlobal,
            CapacityScope::Owner => FailureKind::CapacityOwner,
        };
        self.count_failure(kind);
        metrics::record_connection_rejected(scope.as_str());
        tracing::warn!(owner = %owner, scope = scope.as_str(), limit, "Connection rejected");
        AdmissionError::CapacityExceeded { scope, limit }
    }

    /// Record activity on a connection. False if it is no longer live.
    pub fn touch(&self, id: ConnectionId) -> bool {
        let mut table = self.table.lock();
        match table.records.get_mut(&id) {
            Some(record) => {
                record.touch(Instant::now());
                true
            }
            None => false,
        }
    }

    /// Remove a record. Returns false when it was already gone.
    pub fn release(&self, id: ConnectionId, reason: ReleaseReason) -> bool {
        let removed = self.table.lock().remove(id);
        match removed {
            Some(record) => {
                self.finish_release(record, reason);
                true
            }
            None => false,
        }
    }

    fn finish_release(&self, record: ConnectionRecord, reason: ReleaseReason) {
        self.estimated_bytes
            .fetch_sub(record.estimated_bytes(), Ordering::Relaxed);
        let remaining = self.active.fetch_sub(1, Ordering::AcqRel) - 1;
        metrics::record_connection_released(reason.as_str());
        metrics::record_active_connections(remaining);
        tracing::debug!(
            connection_id = %record.id(),
            owner = %record.owner(),
            reason = %reason,
            active = remaining,
            "Connection released"
        );
        let _ = self.events.send(ConnectionEvent::Released {
            id: record.id(),
            owner: record.owner().to_string(),
            reason,
        });
    }

    pub fn is_live(&self, id: ConnectionId) -> bool {
        self.table.lock().records.contains_key(&id)
    }

    pub fn active_count(&self) -> usize {
        self.table.lock().records.len()
    }

    pub fn owner_count(&self, owner: &str) -> usize {
        self.table.lock().per_owner.get(owner).copied().unwrap_or(0)
    }

    /// Send `payload` to every live connection matching `predicate`.
    pub fn broadcast<P>(&self, predicate: P, payload: serde_json::Value) -> BroadcastReport
    where
        P: Fn(&ConnectionRecord) -> bool,
    {
        let targets: Vec<(ConnectionId, mpsc::Sender<Outbound>)> = {
            let table = self.table.lock();
            table
                .records
                .values()
                .filter(|record| predicate(record))
                .map(|record| (record.id(), record.outbound().clone()))
                .collect()
        };

        let payload = Arc::new(payload);
        let mut report = BroadcastReport {
            matched: targets.len(),
            ..Default::default()
        };
        for (id, sender) in targets {
            match sender.try_send(Outbound::Payload(Arc::clone(&payload))) {
                Ok(()) => report.delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    report.backpressure += 1;
                    self.count_failure(FailureKind::Backpressure);
                    tracing::debug!(connection_id = %id, "Broadcast skipped, outbound buffer full");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    report.failed += 1;
                    self.count_failure(FailureKind::SendFailed);
                    self.release(id, ReleaseReason::SendFailed);
                }
            }
        }

        tracing::debug!(
            matched = report.matched,
            delivered = report.delivered,
            failed = report.failed,
            backpressure = report.backpressure,
            "Broadcast complete"
        );
        report
    }

    /// Release every record idle longer than the connection timeout.
    pub fn sweep_stale(&self) -> usize {
        let now = Instant::now();
        let timeout = self.limits.connection_timeout;
        let stale: Vec<(ConnectionRecord, Duration)> = {
            let mut table = self.table.lock();
            let ids: Vec<ConnectionId> = table
                .records
                .values()
                .filter(|record| record.idle_for(now) > timeout)
                .map(|record| record.id())
                .collect();
            ids.into_iter()
                .filter_map(|id| table.remove(id))
                .map(|record| {
                    let idle = record.idle_for(now);
                    (record, idle)
                })
                .collect()
        };

        let removed = stale.len();
        for (record, idle) in stale {
            self.cleanup_total.fetch_add(1, Ordering::Relaxed);
            let idle_ms = idle.as_millis() as u64;
            tracing::info!(
                connection_id = %record.id(),
                owner = %record.owner(),
                idle_ms,
                "Stale connection removed"
            );
            let _ = self.events.send(ConnectionEvent::StaleRemoved {
                id: record.id(),
                owner: record.owner().to_string(),
                idle_ms,
            });
            self.finish_release(record, ReleaseReason::Stale);
        }
        removed
    }

    /// Probe every live connection once, releasing the ones that fail.
    pub async fn heartbeat_once(&self) -> HeartbeatReport {
        let targets: Vec<ProbeTarget> = {
            let table = self.table.lock();
            table
                .records
                .values()
                .map(|record| ProbeTarget {
                    id: record.id(),
                    owner: record.owner().to_string(),
                    outbound: record.outbound().clone(),
                })
                .collect()
        };

        let timeout = self.limits.heartbeat_timeout;
        let results = join_all(targets.iter().map(|target| async move {
            let outcome = with_deadline(timeout, self.probe.probe(target)).await;
            (target, outcome)
        }))
        .await;

        let mut report = HeartbeatReport {
            probed: results.len(),
            ..Default::default()
        };
        let mut alive = Vec::new();
        for (target, outcome) in results {
            let (kind, error) = match outcome {
                Ok(Ok(())) => {
                    alive.push(target.id);
                    continue;
                }
                Ok(Err(e)) => (FailureKind::HeartbeatFailed, e.to_string()),
                Err(e) => (FailureKind::HeartbeatTimeout, e.to_string()),
            };
            self.count_failure(kind);
            tracing::warn!(
                connection_id = %target.id,
                owner = %target.owner,
                error = %error,
                "Heartbeat failed"
            );
            let _ = self.events.send(ConnectionEvent::HeartbeatFailed {
                id: target.id,
                owner: target.owner.clone(),
                error,
            });
            if self.release(target.id, ReleaseReason::HeartbeatFailed) {
                report.released += 1;
            }
        }

        let now = Instant::now();
        let mut table = self.table.lock();
        for id in alive {
            if let Some(record) = table.records.get_mut(&id) {
                record.mark_heartbeat(now);
                report.alive += 1;
            }
        }
        report
    }

    pub fn metrics_snapshot(&self) -> ConnectionMetrics {
        let (current, owners) = {
            let table = self.table.lock();
            (table.records.len(), table.per_owner.len())
        };
        ConnectionMetrics {
            current,
            peak: self.peak.load(Ordering::Relaxed),
            estimated_memory_bytes: self.estimated_bytes.load(Ordering::Relaxed),
            cleanup_total: self.cleanup_total.load(Ordering::Relaxed),
            failures: FailureKind::ALL
                .iter()
                .enumerate()
                .map(|(i, kind)| (kind.as_str().to_string(), self.failures[i].load(Ordering::Relaxed)))
                .collect(),
            owners,
            max_total: self.limits.max_total,
            max_per_owner: self.limits.max_per_owner,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    fn count_failure(&self, kind: FailureKind) {
        let index = FailureKind::ALL
            .iter()
            .position(|k| *k == kind)
            .unwrap_or(0);
        self.failures[index].fetch_add(1, Ordering::Relaxed);
        metrics::record_connection_failure(kind.as_str());
    }

    /// Spawn the sweep and heartbeat loops. They run until `shutdown`.
    pub fn start_background_tasks(self: &Arc<Self>) {
        let sweep = {
            let manager = Arc::clone(self);
            let shutdown = self.shutdown.subscribe();
            tokio::spawn(async move { manager.run_sweep(shutdown).await })
        };
        let heartbeat = {
            let manager = Arc::clone(self);
            let shutdown = self.shutdown.subscribe();
            tokio::spawn(async move { manager.run_heartbeat(shutdown).await })
        };
        self.tasks.lock().extend([sweep, heartbeat]);
    }

    async fn run_sweep(&self, mut shutdown: broadcast::Receiver<()>) {
        tracing::info!(
            interval_secs = self.limits.cleanup_interval.as_secs(),
            timeout_secs = self.limits.connection_timeout.as_secs(),
            "Connection sweep starting"
        );
        let period = self.limits.cleanup_interval;
        let mut ticker = time::interval_at(Instant::now() + period, period);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let removed = self.sweep_stale();
                    if removed > 0 {
                        tracing::info!(removed, "Sweep released stale connections");
                    }
                }
                _ = shutdown.recv() => {
                    tracing::info!("Connection sweep received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }

    async fn run_heartbeat(&self, mut shutdown: broadcast::Receiver<()>) {
        tracing::info!(
            interval_secs = self.limits.heartbeat_interval.as_secs(),
            "Heartbeat monitor starting"
        );
        let period = self.limits.heartbeat_interval;
        let mut ticker = time::interval_at(Instant::now() + period, period);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.heartbeat_once().await;
                    tracing::debug!(
                        probed = report.probed,
                        alive = report.alive,
                        released = report.released,
                        "Heartbeat cycle complete"
                    );
                }
                _ = shutdown.recv() => {
                    tracing::info!("Heartbeat monitor received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }

    /// Stop the background tasks and wait for them to exit.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(());
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
    }
}

/// An admitted connection. Dropping it releases the record.
#[derive(Debug)]
pub struct ConnectionHandle {
    id: ConnectionId,
    owner: String,
    manager: Arc<ConnectionManager>,
    outbound: mpsc::Receiver<Outbound>,
}

impl ConnectionHandle {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn touch(&self) -> bool {
        self.manager.touch(self.id)
    }

    /// False once the manager has released this connection.
    pub fn is_live(&self) -> bool {
        self.manager.is_live(self.id)
    }

    /// Next frame queued for this connection.
    pub async fn recv(&mut self) -> Option<Outbound> {
        self.outbound.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Outbound> {
        self.outbound.try_recv().ok()
    }

    /// Close explicitly.
    pub fn close(self) {
        self.manager.release(self.id, ReleaseReason::Closed);
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        self.manager.release(self.id, ReleaseReason::Dropped);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(max_total: usize, max_per_owner: usize) -> ConnectionLimits {
        ConnectionLimits {
            max_total,
            max_per_owner,
            ..ConnectionLimits::default()
        }
    }

    #[test]
    fn owner_quota_rolls_back_global_reservation() {
        let manager = ConnectionManager::new(limits(10, 2));
        let _a = manager.admit("alice", ConnectionMetadata::default()).unwrap();
        let _b = manager.admit("alice", ConnectionMetadata::default()).unwrap();

        let err = manager.admit("alice", ConnectionMetadata::default()).unwrap_err();
        assert_eq!(
            err,
            AdmissionError::CapacityExceeded {
                scope: CapacityScope::Owner,
                limit: 2
            }
        );
        assert_eq!(manager.active.load(Ordering::SeqCst), 2);
        assert!(manager.admit("bob", ConnectionMetadata::default()).is_ok());
    }

    #[test]
    fn peak_ignores_reservations_rolled_back_by_owner_quota() {
        for _ in 0..20 {
            let manager = ConnectionManager::new(limits(100, 1));
            let barrier = Arc::new(std::sync::Barrier::new(8));
            let threads: Vec<_> = (0..8)
                .map(|_| {
                    let manager = Arc::clone(&manager);
                    let barrier = Arc::clone(&barrier);
                    std::thread::spawn(move || {
                        barrier.wait();
                        manager.admit("alice", ConnectionMetadata::default()).ok()
                    })
                })
                .collect();
            let admitted: Vec<ConnectionHandle> =
                threads.into_iter().filter_map(|t| t.join().unwrap()).collect();

            assert_eq!(admitted.len(), 1);
            assert_eq!(manager.metrics_snapshot().peak, 1);
        }
    }

    #[test]
    fn global_quota_rejects_without_side_effects() {
        let manager = ConnectionManager::new(limits(2, 5));
        let _a = manager.admit("alice", ConnectionMetadata::default()).unwrap();
        let _b = manager.admit("bob", ConnectionMetadata::default()).unwrap();

        let err = manager.admit("carol", ConnectionMetadata::default()).unwrap_err();
        assert!(matches!(
            err,
            AdmissionError::CapacityExceeded {
                scope: CapacityScope::Global,
                ..
            }
        ));
        assert_eq!(manager.active_count(), 2);
        assert_eq!(manager.owner_count("carol"), 0);
        assert_eq!(manager.metrics_snapshot().failures["capacity_global"], 1);
    }

    #[test]
    fn release_is_idempotent_and_drop_releases() {
        let manager = ConnectionManager::new(limits(10, 5));
        let handle = manager.admit("alice", ConnectionMetadata::default()).unwrap();
        let id = handle.id();

        assert!(manager.release(id, ReleaseReason::Closed));
        assert!(!manager.release(id, ReleaseReason::Closed));
        drop(handle);
        assert_eq!(manager.active.load(Ordering::SeqCst), 0);

        let handle = manager.admit("alice", ConnectionMetadata::default()).unwrap();
        drop(handle);
        assert_eq!(manager.active_count(), 0);
        assert_eq!(manager.metrics_snapshot().peak, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_removes_only_connections_past_timeout() {
        let manager = ConnectionManager::new(ConnectionLimits {
            connection_timeout: Duration::from_secs(300),
            ..ConnectionLimits::default()
        });
        let idle = manager.admit("alice", ConnectionMetadata::default()).unwrap();
        let busy = manager.admit("bob", ConnectionMetadata::default()).unwrap();
        let mut events = manager.subscribe();

        time::advance(Duration::from_secs(200)).await;
        busy.touch();
        time::advance(Duration::from_secs(100)).await;
        assert_eq!(manager.sweep_stale(), 0);

        time::advance(Duration::from_millis(1)).await;
        assert_eq!(manager.sweep_stale(), 1);
        assert!(!idle.is_live());
        assert!(busy.is_live());

        let snapshot = manager.metrics_snapshot();
        assert_eq!(snapshot.cleanup_total, 1);
        assert_eq!(snapshot.current, 1);
        assert!(matches!(
            events.try_recv().unwrap(),
            ConnectionEvent::StaleRemoved { idle_ms: 300_001, .. }
        ));
    }

    struct RejectOwner(&'static str);

    #[async_trait]
    impl LivenessProbe for RejectOwner {
        async fn probe(&self, target: &ProbeTarget) -> Result<(), ProbeError> {
            if target.owner == self.0 {
                Err(ProbeError::Failed("no pong".into()))
            } else {
                Ok(())
            }
        }
    }

    struct Hang;

    #[async_trait]
    impl LivenessProbe for Hang {
        async fn probe(&self, _target: &ProbeTarget) -> Result<(), ProbeError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn heartbeat_releases_failed_probes() {
        let manager = ConnectionManager::with_probe(limits(10, 5), Arc::new(RejectOwner("bob")));
        let alive = manager.admit("alice", ConnectionMetadata::default()).unwrap();
        let dead = manager.admit("bob", ConnectionMetadata::default()).unwrap();

        let report = manager.heartbeat_once().await;
        assert_eq!(
            report,
            HeartbeatReport {
                probed: 2,
                alive: 1,
                released: 1
            }
        );
        assert!(alive.is_live());
        assert!(!dead.is_live());
        assert_eq!(manager.metrics_snapshot().failures["heartbeat_failed"], 1);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_timeout_releases() {
        let manager = ConnectionManager::with_probe(limits(10, 5), Arc::new(Hang));
        let handle = manager.admit("alice", ConnectionMetadata::default()).unwrap();

        let report = manager.heartbeat_once().await;
        assert_eq!(report.released, 1);
        assert!(!handle.is_live());
        assert_eq!(manager.metrics_snapshot().failures["heartbeat_timeout"], 1);
    }

    #[tokio::test]
    async fn channel_probe_pings_and_detects_closed_receivers() {
        let manager = ConnectionManager::new(limits(10, 5));
        let mut handle = manager.admit("alice", ConnectionMetadata::default()).unwrap();
        let report = manager.heartbeat_once().await;
        assert_eq!(report.alive, 1);
        assert_eq!(handle.try_recv(), Some(Outbound::Ping));

        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let target = ProbeTarget {
            id: ConnectionId::new(),
            owner: "bob".into(),
            outbound: tx,
        };
        assert_eq!(ChannelProbe.probe(&target).await, Err(ProbeError::Closed));
    }

    #[test]
    fn broadcast_filters_and_counts_backpressure() {
        let manager = ConnectionManager::new(ConnectionLimits {
            outbound_buffer: 1,
            ..ConnectionLimits::default()
        });
        let mut ops = manager
            .admit("alice", ConnectionMetadata::default().with_tag("ops"))
            .unwrap();
        let _other = manager.admit("bob", ConnectionMetadata::default()).unwrap();

        let payload = serde_json::json!({"alert": "disk"});
        let first = manager.broadcast(|r| r.metadata().has_tag("ops"), payload.clone());
        assert_eq!(first.matched, 1);
        assert_eq!(first.delivered, 1);

        let second = manager.broadcast(|r| r.metadata().has_tag("ops"), payload.clone());
        assert_eq!(second.backpressure, 1);
        assert!(ops.is_live());

        assert_eq!(ops.try_recv(), Some(Outbound::Payload(Arc::new(payload))));
    }

    #[test]
    fn memory_estimate_tracks_admissions() {
        let manager = ConnectionManager::new(limits(10, 5));
        let metadata = ConnectionMetadata {
            size_estimate: 4096,
            ..Default::default()
        };
        let handle = manager.admit("alice", metadata).unwrap();
        assert!(manager.metrics_snapshot().estimated_memory_bytes >= 4096);
        handle.close();
        assert_eq!(manager.metrics_snapshot().estimated_memory_bytes, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn background_tasks_sweep_and_stop_on_shutdown() {
        let manager = ConnectionManager::new(ConnectionLimits {
            cleanup_interval: Duration::from_secs(1),
            connection_timeout: Duration::from_secs(2),
            heartbeat_interval: Duration::from_secs(3600),
            ..ConnectionLimits::default()
        });
        let handle = manager.admit("alice", ConnectionMetadata::default()).unwrap();
        manager.start_background_tasks();

        time::sleep(Duration::from_millis(3500)).await;
        assert!(!handle.is_live());

        manager.shutdown().await;
        assert!(manager.tasks.lock().is_empty());
    }
}
