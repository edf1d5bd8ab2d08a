//! Cross-boundary call wrapper.
//!
//! # Data Flow
//! ```text
//! call(channel, operation, options)
//!     → breaker.try_acquire(channel)      Rejected → CIRCUIT_OPEN (no call)
//!     → correlation id + span
//!     → operation under timeout           elapsed  → TIMEOUT
//!     → classify error / validate value   → CONNECTION_FAILED | INVALID_RESPONSE | UNKNOWN
//!     → permit.record_success / record_failure (exactly once)
//!     → fallback applied unless opted out
//! ```
//!
//! # Design Decisions
//! - The operation future is driven inline; on timeout it is dropped, so a
//!   late completion can never reach the breaker a second time
//! - Panics inside the operation are caught and classified UNKNOWN
//! - CIRCUIT_OPEN never counts as a new failure

use std::collections::BTreeMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use futures_util::FutureExt;
use serde::Serialize;
use tokio::time::Instant;
use tracing::Instrument;
use uuid::Uuid;

use crate::config::BoundaryConfig;
use crate::observability::metrics;
use crate::resilience::registry::BreakerRegistry;
use crate::resilience::timeouts::with_deadline;

/// Classification of a failed boundary call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BoundaryErrorKind {
    Timeout,
    CircuitOpen,
    ConnectionFailed,
    InvalidResponse,
    Unknown,
}

impl BoundaryErrorKind {
    pub const ALL: [BoundaryErrorKind; 5] = [
        BoundaryErrorKind::Timeout,
        BoundaryErrorKind::CircuitOpen,
        BoundaryErrorKind::ConnectionFailed,
        BoundaryErrorKind::InvalidResponse,
        BoundaryErrorKind::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BoundaryErrorKind::Timeout => "TIMEOUT",
            BoundaryErrorKind::CircuitOpen => "CIRCUIT_OPEN",
            BoundaryErrorKind::ConnectionFailed => "CONNECTION_FAILED",
            BoundaryErrorKind::InvalidResponse => "INVALID_RESPONSE",
            BoundaryErrorKind::Unknown => "UNKNOWN",
        }
    }

    /// Whether this outcome is reported to the breaker as a failure.
    pub fn counts_as_failure(&self) -> bool {
        !matches!(self, BoundaryErrorKind::CircuitOpen)
    }

    fn index(&self) -> usize {
        match self {
            BoundaryErrorKind::Timeout => 0,
            BoundaryErrorKind::CircuitOpen => 1,
            BoundaryErrorKind::ConnectionFailed => 2,
            BoundaryErrorKind::InvalidResponse => 3,
            BoundaryErrorKind::Unknown => 4,
        }
    }
}

impl std::fmt::Display for BoundaryErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified failure of a boundary call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind} on channel {channel} [{correlation_id}]: {message}")]
pub struct BoundaryError {
    pub kind: BoundaryErrorKind,
    pub channel: String,
    pub correlation_id: Uuid,
    pub message: String,
}

/// Error an operation reports to the boundary.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CallError {
    /// The remote endpoint could not be reached.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// The call returned but the payload was unusable.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("{0}")]
    Other(String),
}

impl CallError {
    fn kind(&self) -> BoundaryErrorKind {
        match self {
            CallError::ConnectionFailed(_) => BoundaryErrorKind::ConnectionFailed,
            CallError::InvalidResponse(_) => BoundaryErrorKind::InvalidResponse,
            CallError::Other(_) => BoundaryErrorKind::Unknown,
        }
    }
}

impl From<std::io::Error> for CallError {
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match e.kind() {
            ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
            | ErrorKind::AddrNotAvailable
            | ErrorKind::BrokenPipe => CallError::ConnectionFailed(e.to_string()),
            ErrorKind::InvalidData | ErrorKind::UnexpectedEof => {
                CallError::InvalidResponse(e.to_string())
            }
            _ => CallError::Other(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for CallError {
    fn from(e: serde_json::Error) -> Self {
        CallError::InvalidResponse(e.to_string())
    }
}

/// Context handed to the wrapped operation.
#[derive(Debug, Clone)]
pub struct CallContext {
    pub channel: String,
    pub correlation_id: Uuid,
    pub timeout: Duration,
}

type Fallback<T> = Box<dyn FnOnce(&BoundaryError) -> T + Send>;
type Validator<T> = Box<dyn Fn(&T) -> Result<(), String> + Send + Sync>;

/// Per-call options.
pub struct CallOptions<T> {
    timeout: Option<Duration>,
    fallback: Option<Fallback<T>>,
    fallback_enabled: bool,
    validator: Option<Validator<T>>,
}

impl<T> CallOptions<T> {
    pub fn new() -> Self {
        Self {
            timeout: None,
            fallback: None,
            fallback_enabled: true,
            validator: None,
        }
    }

    /// Override the channel/default timeout for this call.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Value to return, marked degraded, when the call fails.
    pub fn fallback(mut self, fallback: impl FnOnce(&BoundaryError) -> T + Send + 'static) -> Self {
        self.fallback = Some(Box::new(fallback));
        self
    }

    /// Propagate errors even when a fallback is configured.
    pub fn without_fallback(mut self) -> Self {
        self.fallback_enabled = false;
        self
    }

    /// Reject otherwise successful results as INVALID_RESPONSE.
    pub fn validate(mut self, validator: impl Fn(&T) -> Result<(), String> + Send + Sync + 'static) -> Self {
        self.validator = Some(Box::new(validator));
        self
    }
}

impl<T> Default for CallOptions<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Successful boundary result.
#[derive(Debug, Clone, PartialEq)]
pub struct Guarded<T> {
    pub value: T,
    pub correlation_id: Uuid,
    /// Set when `value` came from the fallback.
    pub degraded: Option<BoundaryError>,
}

impl<T> Guarded<T> {
    pub fn is_degraded(&self) -> bool {
        self.degraded.is_some()
    }

    pub fn into_inner(self) -> T {
        self.value
    }
}

const LATENCY_BUCKETS_MS: [u64; 10] = [5, 10, 25, 50, 100, 250, 500, 1000, 2500, 5000];

#[derive(Debug, Default)]
struct ChannelStats {
    successes: AtomicU64,
    failures: [AtomicU64; 5],
    fallbacks: AtomicU64,
    latency_buckets: [AtomicU64; LATENCY_BUCKETS_MS.len() + 1],
    latency_total_us: AtomicU64,
    latency_count: AtomicU64,
}

impl ChannelStats {
    fn observe_latency(&self, elapsed: Duration) {
        let ms = elapsed.as_millis() as u64;
        let bucket = LATENCY_BUCKETS_MS
            .iter()
            .position(|bound| ms <= *bound)
            .unwrap_or(LATENCY_BUCKETS_MS.len());
        self.latency_buckets[bucket].fetch_add(1, Ordering::Relaxed);
        self.latency_total_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        self.latency_count.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self, channel: &str) -> ChannelSnapshot {
        let failures = BoundaryErrorKind::ALL
            .iter()
            .map(|kind| (kind.as_str().to_string(), self.failures[kind.index()].load(Ordering::Relaxed)))
            .collect();
        let mut latency_histogram: BTreeMap<String, u64> = LATENCY_BUCKETS_MS
            .iter()
            .enumerate()
            .map(|(i, bound)| (format!("le_{}ms", bound), self.latency_buckets[i].load(Ordering::Relaxed)))
            .collect();
        latency_histogram.insert(
            "le_inf".to_string(),
            self.latency_buckets[LATENCY_BUCKETS_MS.len()].load(Ordering::Relaxed),
        );
        let count = self.latency_count.load(Ordering::Relaxed);
        let mean_latency_ms = if count == 0 {
            0.0
        } else {
            self.latency_total_us.load(Ordering::Relaxed) as f64 / count as f64 / 1000.0
        };

        ChannelSnapshot {
            channel: channel.to_string(),
            successes: self.successes.load(Ordering::Relaxed),
            failures,
            fallbacks: self.fallbacks.load(Ordering::Relaxed),
            latency_histogram,
            mean_latency_ms,
        }
    }
}

/// Per-channel call statistics.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelSnapshot {
    pub channel: String,
    pub successes: u64,
    pub failures: BTreeMap<String, u64>,
    pub fallbacks: u64,
    /// Non-cumulative bucket counts.
    pub latency_histogram: BTreeMap<String, u64>,
    pub mean_latency_ms: f64,
}

impl ChannelSnapshot {
    pub fn failures_of(&self, kind: BoundaryErrorKind) -> u64 {
        self.failures.get(kind.as_str()).copied().unwrap_or(0)
    }
}

/// Call timeouts, swappable on config reload.
#[derive(Debug, Clone)]
struct TimeoutTable {
    default: Duration,
    per_channel: BTreeMap<String, Duration>,
}

impl TimeoutTable {
    fn from_config(config: &BoundaryConfig) -> Self {
        Self {
            default: Duration::from_millis(config.default_timeout_ms),
            per_channel: config
                .channel_timeouts_ms
                .iter()
                .map(|(channel, ms)| (channel.clone(), Duration::from_millis(*ms)))
                .collect(),
        }
    }
}

/// Wraps calls that cross a process or dependency boundary.
#[derive(Debug)]
pub struct ErrorBoundary {
    breakers: Arc<BreakerRegistry>,
    timeouts: ArcSwap<TimeoutTable>,
    stats: DashMap<String, Arc<ChannelStats>>,
}

impl ErrorBoundary {
    pub fn new(breakers: Arc<BreakerRegistry>, config: &BoundaryConfig) -> Self {
        Self {
            breakers,
            timeouts: ArcSwap::from_pointee(TimeoutTable::from_config(config)),
            stats: DashMap::new(),
        }
    }

    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    /// Swap call timeouts after a config reload.
    pub fn apply_config(&self, config: &BoundaryConfig) {
        self.timeouts.store(Arc::new(TimeoutTable::from_config(config)));
    }

    /// Timeout used for `channel` when the call sets none.
    pub fn timeout_for(&self, channel: &str) -> Duration {
        let table = self.timeouts.load();
        table
            .per_channel
            .get(channel)
            .copied()
            .unwrap_or(table.default)
    }

    /// Run `operation` behind the channel's breaker.
    pub async fn call<T, E, F, Fut>(
        &self,
        channel: &str,
        operation: F,
        options: CallOptions<T>,
    ) -> Result<Guarded<T>, BoundaryError>
    where
        F: FnOnce(CallContext) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<CallError>,
    {
        let correlation_id = Uuid::new_v4();
        let span = tracing::info_span!("boundary_call", channel = %channel, correlation_id = %correlation_id);
        let CallOptions {
            timeout,
            fallback,
            fallback_enabled,
            validator,
        } = options;
        let timeout = timeout.unwrap_or_else(|| self.timeout_for(channel));
        let stats = self.stats_for(channel);

        let outcome = async {
            let permit = match self.breakers.try_acquire(channel) {
                Ok(permit) => permit,
                Err(rejected) => {
                    tracing::debug!(state = %rejected.state, "Call short-circuited");
                    return Err((BoundaryErrorKind::CircuitOpen, rejected.to_string()));
                }
            };

            let context = CallContext {
                channel: channel.to_string(),
                correlation_id,
                timeout,
            };
            let started = Instant::now();
            let result = with_deadline(timeout, AssertUnwindSafe(operation(context)).catch_unwind()).await;
            let elapsed = started.elapsed();
            stats.observe_latency(elapsed);
            metrics::record_boundary_latency(channel, elapsed);

            let classified = match result {
                Err(_) => Err((
                    BoundaryErrorKind::Timeout,
                    format!("no response within {:?}", timeout),
                )),
                Ok(Err(_panic)) => Err((BoundaryErrorKind::Unknown, "operation panicked".to_string())),
                Ok(Ok(Err(e))) => {
                    let e: CallError = e.into();
                    Err((e.kind(), e.to_string()))
                }
                Ok(Ok(Ok(value))) => match validator.as_ref().map(|v| v(&value)) {
                    Some(Err(reason)) => Err((BoundaryErrorKind::InvalidResponse, reason)),
                    _ => Ok(value),
                },
            };

            match &classified {
                Ok(_) => {
                    permit.record_success();
                    tracing::debug!(elapsed_ms = elapsed.as_millis() as u64, "Call succeeded");
                }
                Err((kind, message)) => {
                    permit.record_failure();
                    tracing::warn!(
                        kind = %kind,
                        error = %message,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "Call failed"
                    );
                }
            }
            classified
        }
        .instrument(span.clone())
        .await;

        let (kind, message) = match outcome {
            Ok(value) => {
                stats.successes.fetch_add(1, Ordering::Relaxed);
                metrics::record_boundary_outcome(channel, "SUCCESS");
                return Ok(Guarded {
                    value,
                    correlation_id,
                    degraded: None,
                });
            }
            Err(failure) => failure,
        };

        stats.failures[kind.index()].fetch_add(1, Ordering::Relaxed);
        metrics::record_boundary_outcome(channel, kind.as_str());
        let error = BoundaryError {
            kind,
            channel: channel.to_string(),
            correlation_id,
            message,
        };

        match fallback {
            Some(fallback) if fallback_enabled => {
                stats.fallbacks.fetch_add(1, Ordering::Relaxed);
                metrics::record_boundary_fallback(channel);
                span.in_scope(|| tracing::info!(kind = %kind, "Serving fallback value"));
                let value = fallback(&error);
                Ok(Guarded {
                    value,
                    correlation_id,
                    degraded: Some(error),
                })
            }
            _ => Err(error),
        }
    }

    /// Statistics for one channel, if it has been called.
    pub fn channel_snapshot(&self, channel: &str) -> Option<ChannelSnapshot> {
        self.stats.get(channel).map(|s| s.snapshot(channel))
    }

    /// Statistics for every channel, sorted by name.
    pub fn snapshot(&self) -> Vec<ChannelSnapshot> {
        let mut all: Vec<_> = self
            .stats
            .iter()
            .map(|entry| entry.value().snapshot(entry.key()))
            .collect();
        all.sort_by(|a, b| a.channel.cmp(&b.channel));
        all
    }

    fn stats_for(&self, channel: &str) -> Arc<ChannelStats> {
        if let Some(stats) = self.stats.get(channel) {
            return Arc::clone(stats.value());
        }
        Arc::clone(self.stats.entry(channel.to_string()).or_default().value())
    }
}
