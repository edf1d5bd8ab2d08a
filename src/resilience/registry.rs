//! Named circuit breaker registry.
//!
//! # Responsibilities
//! - Own one breaker per guarded name, created lazily on first use
//! - Resolve per-name settings (defaults merged with overrides)
//! - Fan transition events from every breaker into one broadcast channel
//! - Apply reloaded settings to breakers that already exist
//!
//! # Design Decisions
//! - Passed around as `Arc<BreakerRegistry>`; there is no process-wide instance
//! - Breakers are never removed while the registry lives

use std::collections::BTreeMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::config::BreakerConfig;
use crate::resilience::circuit_breaker::{
    BreakerSettings, BreakerSnapshot, BreakerTransition, CircuitBreaker, CircuitState, Permit,
    Rejected,
};

const EVENT_CAPACITY: usize = 256;

#[derive(Debug)]
pub struct BreakerRegistry {
    defaults: ArcSwap<BreakerSettings>,
    overrides: ArcSwap<BTreeMap<String, BreakerSettings>>,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    events: broadcast::Sender<BreakerTransition>,
}

impl BreakerRegistry {
    pub fn new(defaults: BreakerSettings, overrides: BTreeMap<String, BreakerSettings>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            defaults: ArcSwap::from_pointee(defaults),
            overrides: ArcSwap::from_pointee(overrides),
            breakers: DashMap::new(),
            events,
        }
    }

    pub fn from_config(config: &BreakerConfig) -> Self {
        Self::new(config.default_settings(), config.override_settings())
    }

    /// Settings a breaker with this name uses.
    pub fn settings_for(&self, name: &str) -> BreakerSettings {
        self.overrides
            .load()
            .get(name)
            .copied()
            .unwrap_or_else(|| **self.defaults.load())
    }

    /// Get or create the breaker guarding `name`.
    pub fn breaker(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(name) {
            return Arc::clone(existing.value());
        }
        let entry = self.breakers.entry(name.to_string()).or_insert_with(|| {
            CircuitBreaker::with_events(name, self.settings_for(name), self.events.clone())
        });
        Arc::clone(entry.value())
    }

    /// Existing breaker, without creating one.
    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(name).map(|b| Arc::clone(b.value()))
    }

    /// Existing breaker, or a new one when `name` has configured overrides.
    /// Arbitrary names are never materialized.
    pub fn known(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.get(name).or_else(|| {
            self.overrides
                .load()
                .contains_key(name)
                .then(|| self.breaker(name))
        })
    }

    pub fn try_acquire(&self, name: &str) -> Result<Permit, Rejected> {
        self.breaker(name).try_acquire()
    }

    pub fn record_success(&self, name: &str) {
        self.breaker(name).record_success();
    }

    pub fn record_failure(&self, name: &str) {
        self.breaker(name).record_failure();
    }

    /// Current state, `Closed` for names never used.
    pub fn state(&self, name: &str) -> CircuitState {
        self.get(name)
            .map(|b| b.state())
            .unwrap_or(CircuitState::Closed)
    }

    /// Subscribe to transitions from every breaker in the registry.
    pub fn subscribe(&self) -> broadcast::Receiver<BreakerTransition> {
        self.events.subscribe()
    }

    /// Snapshots sorted by name.
    pub fn snapshot(&self) -> Vec<BreakerSnapshot> {
        let mut snapshots: Vec<_> = self.breakers.iter().map(|b| b.value().snapshot()).collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }

    /// Replace defaults and overrides, updating existing breakers in place.
    pub fn apply_settings(
        &self,
        defaults: BreakerSettings,
        overrides: BTreeMap<String, BreakerSettings>,
    ) {
        self.defaults.store(Arc::new(defaults));
        self.overrides.store(Arc::new(overrides));
        for entry in self.breakers.iter() {
            let settings = self.settings_for(entry.key());
            entry.value().apply_settings(settings);
        }
        tracing::info!(breakers = self.breakers.len(), "Circuit breaker settings reloaded");
    }

    pub fn apply_config(&self, config: &BreakerConfig) {
        self.apply_settings(config.default_settings(), config.override_settings());
    }
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::new(BreakerSettings::default(), BTreeMap::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn settings(threshold: u32) -> BreakerSettings {
        BreakerSettings {
            failure_threshold: threshold,
            recovery_timeout: Duration::from_secs(30),
        }
    }

    #[test]
    fn breakers_are_isolated_per_name() {
        let registry = BreakerRegistry::default();
        for _ in 0..3 {
            registry.record_failure("storage");
        }
        assert_eq!(registry.state("storage"), CircuitState::Open);
        assert_eq!(registry.state("cache"), CircuitState::Closed);
        assert!(registry.try_acquire("storage").is_err());
        assert!(registry.try_acquire("cache").is_ok());
    }

    #[test]
    fn same_name_returns_same_breaker() {
        let registry = BreakerRegistry::default();
        assert!(Arc::ptr_eq(&registry.breaker("a"), &registry.breaker("a")));
        assert!(registry.get("b").is_none());
    }

    #[test]
    fn overrides_apply_per_name() {
        let registry =
            BreakerRegistry::new(settings(3), BTreeMap::from([("cache".to_string(), settings(1))]));
        registry.record_failure("cache");
        registry.record_failure("storage");
        assert_eq!(registry.state("cache"), CircuitState::Open);
        assert_eq!(registry.state("storage"), CircuitState::Closed);
    }

    #[test]
    fn reload_updates_existing_breakers() {
        let registry = BreakerRegistry::default();
        registry.record_failure("storage");
        registry.apply_settings(settings(2), BTreeMap::new());
        registry.record_failure("storage");
        assert_eq!(registry.state("storage"), CircuitState::Open);
    }

    #[test]
    fn transitions_from_all_breakers_reach_subscribers() {
        let registry = BreakerRegistry::new(settings(1), BTreeMap::new());
        let mut rx = registry.subscribe();
        registry.record_failure("a");
        registry.record_failure("b");

        let names: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|t| t.name)
            .collect();
        assert_eq!(names, vec!["a", "b"]);
        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].state, CircuitState::Open);
    }

    #[test]
    fn only_used_or_configured_names_are_known() {
        let mut overrides = BTreeMap::new();
        overrides.insert("payments".to_string(), BreakerSettings::default());
        let registry = BreakerRegistry::new(BreakerSettings::default(), overrides);
        registry.record_failure("cache");

        assert!(registry.known("cache").is_some());
        assert!(registry.known("payments").is_some());
        assert!(registry.known("typo").is_none());
        assert_eq!(registry.snapshot().len(), 2);
    }
}
