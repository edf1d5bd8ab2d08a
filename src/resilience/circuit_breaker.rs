//! Circuit breaker for dependency protection.
//!
//! # States
//! - Closed: normal operation, calls pass through
//! - Open: dependency assumed down, calls fail fast
//! - Half-Open: a single probe tests whether the dependency recovered
//!
//! # State Transitions
//! ```text
//! Closed → Open: consecutive_failures >= failure_threshold
//! Open → Half-Open: recovery_timeout elapsed since the last failure
//! Half-Open → Closed: probe succeeds
//! Half-Open → Open: probe fails
//! ```
//!
//! # Design Decisions
//! - One breaker per guarded name, no state shared across breakers
//! - All state lives behind one mutex, so the failure increment and the
//!   threshold check are a single step and transitions are totally ordered
//! - The probe slot is claimed with a compare-and-swap on `probe_in_flight`
//! - A probe permit dropped without an outcome frees the probe slot; a
//!   slow probe keeps it for as long as it runs
//! - The breaker never errors; it only classifies permission to proceed

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::observability::metrics;

/// Tunables for a single breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            recovery_timeout: Duration::from_secs(30),
        }
    }
}

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a transition happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionReason {
    FailureThreshold,
    RecoveryTimeout,
    ProbeSucceeded,
    ProbeFailed,
    Forced,
}

/// Event emitted on every state change.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerTransition {
    pub name: String,
    pub from: CircuitState,
    pub to: CircuitState,
    pub reason: TransitionReason,
    pub consecutive_failures: u32,
}

/// Returned instead of a permit when the call must not proceed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("circuit {name} is {state}")]
pub struct Rejected {
    pub name: String,
    pub state: CircuitState,
    /// Time until a probe may be issued, when known.
    pub retry_after: Option<Duration>,
}

/// Permission to run one guarded call.
///
/// Reporting through the permit consumes it, so one call can only be
/// counted once. Dropping it without reporting records nothing; a dropped
/// probe hands the Half-Open slot to the next caller.
#[derive(Debug)]
#[must_use = "a permit should be followed by a reported outcome"]
pub struct Permit {
    breaker: Arc<CircuitBreaker>,
    /// Generation of the probe slot this permit holds, if any.
    probe: Option<u64>,
    reported: bool,
}

impl Permit {
    /// Whether this is the single Half-Open probe.
    pub fn is_probe(&self) -> bool {
        self.probe.is_some()
    }

    pub fn name(&self) -> &str {
        self.breaker.name()
    }

    pub fn record_success(mut self) {
        self.reported = true;
        self.breaker.record_success();
    }

    pub fn record_failure(mut self) {
        self.reported = true;
        self.breaker.record_failure();
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        if let (Some(generation), false) = (self.probe, self.reported) {
            self.breaker.abandon_probe(generation);
        }
    }
}

#[derive(Debug)]
struct BreakerCore {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    /// Bumped every time a probe is issued.
    probe_generation: u64,
}

/// Serializable view of a breaker for admin surfaces.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub since_last_failure_ms: Option<u64>,
    pub probe_in_flight: bool,
    pub failure_threshold: u32,
    pub recovery_timeout_ms: u64,
}

/// Failure-tracking state machine for one guarded dependency.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    settings: ArcSwap<BreakerSettings>,
    core: Mutex<BreakerCore>,
    probe_in_flight: AtomicBool,
    events: broadcast::Sender<BreakerTransition>,
}

impl CircuitBreaker {
    /// Create a breaker with its own (unobserved) event channel.
    pub fn new(name: impl Into<String>, settings: BreakerSettings) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Self::with_events(name, settings, events)
    }

    /// Create a breaker that publishes transitions on a shared channel.
    pub fn with_events(
        name: impl Into<String>,
        settings: BreakerSettings,
        events: broadcast::Sender<BreakerTransition>,
    ) -> Arc<Self> {
        let name = name.into();
        tracing::debug!(
            breaker = %name,
            failure_threshold = settings.failure_threshold,
            recovery_timeout_ms = settings.recovery_timeout.as_millis() as u64,
            "Circuit breaker initialized"
        );
        metrics::record_breaker_state(&name, CircuitState::Closed);

        Arc::new(Self {
            name,
            settings: ArcSwap::from_pointee(settings),
            core: Mutex::new(BreakerCore {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                last_failure: None,
                probe_generation: 0,
            }),
            probe_in_flight: AtomicBool::new(false),
            events,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        self.core.lock().state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.core.lock().consecutive_failures
    }

    pub fn settings(&self) -> BreakerSettings {
        **self.settings.load()
    }

    /// Swap in new thresholds; current state and counters are kept.
    pub fn apply_settings(&self, settings: BreakerSettings) {
        self.settings.store(Arc::new(settings));
    }

    /// Ask permission to call the guarded dependency.
    pub fn try_acquire(self: &Arc<Self>) -> Result<Permit, Rejected> {
        let mut core = self.core.lock();
        match core.state {
            CircuitState::Closed => Ok(self.permit(None)),
            CircuitState::Open => {
                let recovery = self.settings.load().recovery_timeout;
                let elapsed = core
                    .last_failure
                    .map(|at| at.elapsed())
                    .unwrap_or(recovery);
                if elapsed < recovery {
                    return Err(self.rejected(CircuitState::Open, Some(recovery - elapsed)));
                }
                self.transition(&mut core, CircuitState::HalfOpen, TransitionReason::RecoveryTimeout);
                self.claim_probe(&mut core)
            }
            CircuitState::HalfOpen => self.claim_probe(&mut core),
        }
    }

    /// Report a successful call.
    pub fn record_success(&self) {
        let mut core = self.core.lock();
        core.consecutive_failures = 0;
        if core.state == CircuitState::HalfOpen {
            self.release_probe(&mut core);
            self.transition(&mut core, CircuitState::Closed, TransitionReason::ProbeSucceeded);
        }
    }

    /// Report a failed call.
    pub fn record_failure(&self) {
        let mut core = self.core.lock();
        core.consecutive_failures = core.consecutive_failures.saturating_add(1);
        core.last_failure = Some(Instant::now());

        match core.state {
            CircuitState::Closed => {
                let threshold = self.settings.load().failure_threshold;
                if core.consecutive_failures >= threshold {
                    self.transition(&mut core, CircuitState::Open, TransitionReason::FailureThreshold);
                }
            }
            CircuitState::HalfOpen => {
                self.release_probe(&mut core);
                self.transition(&mut core, CircuitState::Open, TransitionReason::ProbeFailed);
            }
            CircuitState::Open => {}
        }
    }

    /// Operator override: open the circuit now.
    pub fn force_open(&self) {
        let mut core = self.core.lock();
        if core.state == CircuitState::Open {
            return;
        }
        tracing::warn!(breaker = %self.name, "Circuit breaker forced open");
        core.last_failure = Some(Instant::now());
        self.release_probe(&mut core);
        self.transition(&mut core, CircuitState::Open, TransitionReason::Forced);
    }

    /// Operator override: close the circuit now, passing through Half-Open
    /// when currently Open.
    pub fn force_close(&self) {
        let mut core = self.core.lock();
        if core.state == CircuitState::Closed {
            return;
        }
        tracing::warn!(breaker = %self.name, "Circuit breaker forced closed");
        if core.state == CircuitState::Open {
            self.transition(&mut core, CircuitState::HalfOpen, TransitionReason::Forced);
        }
        core.consecutive_failures = 0;
        self.release_probe(&mut core);
        self.transition(&mut core, CircuitState::Closed, TransitionReason::Forced);
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let settings = self.settings();
        let core = self.core.lock();
        BreakerSnapshot {
            name: self.name.clone(),
            state: core.state,
            consecutive_failures: core.consecutive_failures,
            since_last_failure_ms: core.last_failure.map(|at| at.elapsed().as_millis() as u64),
            probe_in_flight: self.probe_in_flight.load(Ordering::Acquire),
            failure_threshold: settings.failure_threshold,
            recovery_timeout_ms: settings.recovery_timeout.as_millis() as u64,
        }
    }

    fn permit(self: &Arc<Self>, probe: Option<u64>) -> Permit {
        Permit {
            breaker: Arc::clone(self),
            probe,
            reported: false,
        }
    }

    fn rejected(&self, state: CircuitState, retry_after: Option<Duration>) -> Rejected {
        metrics::record_breaker_rejection(&self.name);
        Rejected {
            name: self.name.clone(),
            state,
            retry_after,
        }
    }

    fn claim_probe(self: &Arc<Self>, core: &mut BreakerCore) -> Result<Permit, Rejected> {
        if self
            .probe_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            core.probe_generation = core.probe_generation.wrapping_add(1);
            tracing::info!(breaker = %self.name, "Issuing half-open probe");
            return Ok(self.permit(Some(core.probe_generation)));
        }
        Err(self.rejected(CircuitState::HalfOpen, None))
    }

    fn release_probe(&self, core: &mut BreakerCore) {
        core.probe_generation = core.probe_generation.wrapping_add(1);
        self.probe_in_flight.store(false, Ordering::Release);
    }

    /// Free the slot held by a probe permit dropped without an outcome.
    /// Stale permits from an earlier generation are ignored.
    fn abandon_probe(&self, generation: u64) {
        let mut core = self.core.lock();
        if core.state == CircuitState::HalfOpen && core.probe_generation == generation {
            tracing::warn!(breaker = %self.name, "Half-open probe dropped without an outcome");
            self.release_probe(&mut core);
        }
    }

    fn transition(&self, core: &mut BreakerCore, to: CircuitState, reason: TransitionReason) {
        let from = core.state;
        core.state = to;

        match to {
            CircuitState::Open => tracing::warn!(
                breaker = %self.name,
                from = %from,
                reason = ?reason,
                consecutive_failures = core.consecutive_failures,
                "Circuit breaker opened"
            ),
            CircuitState::HalfOpen => tracing::info!(
                breaker = %self.name,
                reason = ?reason,
                "Circuit breaker half-open"
            ),
            CircuitState::Closed => tracing::info!(
                breaker = %self.name,
                reason = ?reason,
                "Circuit breaker closed"
            ),
        }
        metrics::record_breaker_transition(&self.name, from, to);

        // No subscribers is fine.
        let _ = self.events.send(BreakerTransition {
            name: self.name.clone(),
            from,
            to,
            reason,
            consecutive_failures: core.consecutive_failures,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;

    fn settings(threshold: u32, recovery_ms: u64) -> BreakerSettings {
        BreakerSettings {
            failure_threshold: threshold,
            recovery_timeout: Duration::from_millis(recovery_ms),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn opens_at_threshold_and_rejects_until_recovery() {
        let breaker = CircuitBreaker::new("storage", BreakerSettings::default());

        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_millis(10)).await;
        let rejected = breaker.try_acquire().unwrap_err();
        assert_eq!(rejected.state, CircuitState::Open);
        assert_eq!(rejected.retry_after, Some(Duration::from_millis(29_990)));

        tokio::time::advance(Duration::from_millis(29_980)).await;
        assert!(breaker.try_acquire().is_err());

        tokio::time::advance(Duration::from_millis(10)).await;
        let probe = breaker.try_acquire().unwrap();
        assert!(probe.is_probe());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(breaker.try_acquire().is_err());
        assert!(breaker.try_acquire().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_failure_count() {
        let breaker = CircuitBreaker::new("cache", settings(3, 100));
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        assert_eq!(breaker.consecutive_failures(), 0);
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn probe_success_closes() {
        let breaker = CircuitBreaker::new("cache", settings(1, 100));
        breaker.record_failure();
        tokio::time::advance(Duration::from_millis(100)).await;

        let probe = breaker.try_acquire().unwrap();
        probe.record_success();

        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.consecutive_failures(), 0);
        assert!(breaker.try_acquire().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn probe_failure_reopens_and_restarts_clock() {
        let breaker = CircuitBreaker::new("cache", settings(1, 100));
        breaker.record_failure();
        tokio::time::advance(Duration::from_millis(100)).await;

        breaker.try_acquire().unwrap().record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_millis(99)).await;
        assert!(breaker.try_acquire().is_err());
        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(breaker.try_acquire().unwrap().is_probe());
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_probe_frees_the_slot() {
        let breaker = CircuitBreaker::new("cache", settings(1, 100));
        breaker.record_failure();
        tokio::time::advance(Duration::from_millis(100)).await;

        let probe = breaker.try_acquire().unwrap();
        assert!(breaker.try_acquire().is_err());
        drop(probe);

        let reissued = breaker.try_acquire().unwrap();
        assert!(reissued.is_probe());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert_eq!(breaker.consecutive_failures(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_probe_keeps_the_slot_past_recovery_timeout() {
        let breaker = CircuitBreaker::new("cache", settings(1, 1000));
        breaker.record_failure();
        tokio::time::advance(Duration::from_secs(1)).await;

        let probe = breaker.try_acquire().unwrap();
        tokio::time::advance(Duration::from_secs(5)).await;
        let second = breaker.try_acquire().unwrap_err();
        assert_eq!(second.state, CircuitState::HalfOpen);

        probe.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_probe_drop_leaves_newer_probe_alone() {
        let breaker = CircuitBreaker::new("cache", settings(1, 100));
        breaker.record_failure();
        tokio::time::advance(Duration::from_millis(100)).await;

        let stale = breaker.try_acquire().unwrap();
        breaker.force_open();
        tokio::time::advance(Duration::from_millis(100)).await;
        let current = breaker.try_acquire().unwrap();
        drop(stale);

        assert!(breaker.try_acquire().is_err());
        current.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn exactly_one_probe_among_concurrent_callers() {
        for callers in [2usize, 8, 32] {
            let breaker = CircuitBreaker::new("remote", settings(1, 200));
            breaker.record_failure();
            assert_eq!(breaker.state(), CircuitState::Open);
            std::thread::sleep(Duration::from_millis(200));

            let barrier = Arc::new(Barrier::new(callers));
            let handles: Vec<_> = (0..callers)
                .map(|_| {
                    let breaker = Arc::clone(&breaker);
                    let barrier = Arc::clone(&barrier);
                    std::thread::spawn(move || {
                        barrier.wait();
                        breaker.try_acquire().ok()
                    })
                })
                .collect();

            // Permits are held until every caller has tried.
            let granted: Vec<Permit> = handles
                .into_iter()
                .filter_map(|h| h.join().unwrap())
                .collect();
            assert_eq!(granted.len(), 1, "callers = {}", callers);
            assert!(granted[0].is_probe());
        }
    }

    #[test]
    fn every_transition_is_published() {
        let (events, mut rx) = broadcast::channel(16);
        let breaker = CircuitBreaker::with_events("db", settings(1, 0), events);

        breaker.record_failure();
        breaker.try_acquire().unwrap().record_success();
        breaker.force_open();
        breaker.force_close();

        let seen: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|t| (t.from, t.to))
            .collect();
        assert_eq!(
            seen,
            vec![
                (CircuitState::Closed, CircuitState::Open),
                (CircuitState::Open, CircuitState::HalfOpen),
                (CircuitState::HalfOpen, CircuitState::Closed),
                (CircuitState::Closed, CircuitState::Open),
                (CircuitState::Open, CircuitState::HalfOpen),
                (CircuitState::HalfOpen, CircuitState::Closed),
            ]
        );
    }

    #[test]
    fn settings_can_be_swapped_live() {
        let breaker = CircuitBreaker::new("db", settings(5, 1000));
        breaker.record_failure();
        breaker.apply_settings(settings(2, 1000));
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.snapshot().failure_threshold, 2);
    }
}
