//! Startup orchestration.
//!
//! # Responsibilities
//! - Validate the declared component graph before any work starts
//! - Initialize components in dependency order, independent branches concurrently
//! - Bound each component's init and health check by its own timeout
//! - Produce the `StartupReport` that readiness probes serve verbatim
//!
//! # Design Decisions
//! - A component starts only once every dependency passed its health check
//! - Critical failure aborts everything still pending or running
//! - Non-critical failure skips its transitive dependents and degrades
//! - Each component's status is written once, by the task that ran it

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::FutureExt;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::lifecycle::graph::{DependencyGraph, GraphError};
use crate::observability::metrics;
use crate::resilience::timeouts::with_deadline;

/// Error returned by component init and health checks.
pub type ComponentError = Box<dyn std::error::Error + Send + Sync>;

/// A subsystem initialized by the coordinator.
#[async_trait]
pub trait Component: Send + Sync {
    /// Bring the component up.
    async fn init(&self) -> Result<(), ComponentError>;

    /// Post-init health check; dependents start only after this passes.
    async fn health_check(&self) -> Result<(), ComponentError> {
        Ok(())
    }
}

/// Node of the startup graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentDescriptor {
    pub name: String,
    pub dependencies: BTreeSet<String>,
    pub critical: bool,
    pub init_timeout: Duration,
}

/// Overall startup state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StartupState {
    Initializing,
    Ready,
    Degraded,
    Failed,
}

impl StartupState {
    /// `Degraded` still serves traffic; `Failed` and `Initializing` do not.
    pub fn accepts_traffic(&self) -> bool {
        matches!(self, StartupState::Ready | StartupState::Degraded)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StartupState::Initializing => "INITIALIZING",
            StartupState::Ready => "READY",
            StartupState::Degraded => "DEGRADED",
            StartupState::Failed => "FAILED",
        }
    }
}

/// How a single component's startup ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentOutcome {
    Ready,
    Failed,
    TimedOut,
    /// Not attempted because a dependency failed.
    Skipped,
    /// Not attempted, or interrupted, because a critical component failed.
    Cancelled,
}

impl ComponentOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComponentOutcome::Ready => "ready",
            ComponentOutcome::Failed => "failed",
            ComponentOutcome::TimedOut => "timed_out",
            ComponentOutcome::Skipped => "skipped",
            ComponentOutcome::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ComponentStatus {
    pub ok: bool,
    pub outcome: ComponentOutcome,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ComponentStatus {
    fn ready(duration: Duration) -> Self {
        Self {
            ok: true,
            outcome: ComponentOutcome::Ready,
            duration_ms: duration.as_millis() as u64,
            error: None,
        }
    }

    fn not_ok(outcome: ComponentOutcome, duration: Duration, error: String) -> Self {
        Self {
            ok: false,
            outcome,
            duration_ms: duration.as_millis() as u64,
            error: Some(error),
        }
    }
}

/// Result of one startup attempt. Immutable once published.
#[derive(Debug, Clone, Serialize)]
pub struct StartupReport {
    pub overall_state: StartupState,
    pub component_statuses: BTreeMap<String, ComponentStatus>,
    /// Planned topological order.
    pub order: Vec<String>,
    pub duration_ms: u64,
}

impl StartupReport {
    pub fn accepts_traffic(&self) -> bool {
        self.overall_state.accepts_traffic()
    }
}

/// Configuration problems that stop startup before any component runs.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("invalid component graph: {0}")]
    Graph(#[from] GraphError),

    #[error("component {0} is declared but has no implementation")]
    Unbound(String),

    #[error("implementation registered for undeclared component {0}")]
    UnknownBinding(String),
}

/// Phase published to readiness probes.
#[derive(Debug, Clone)]
pub enum StartupPhase {
    Initializing,
    Complete(Arc<StartupReport>),
}

impl StartupPhase {
    pub fn state(&self) -> StartupState {
        match self {
            StartupPhase::Initializing => StartupState::Initializing,
            StartupPhase::Complete(report) => report.overall_state,
        }
    }
}

/// Read side of the coordinator's phase, shared with the HTTP surface.
#[derive(Debug, Clone)]
pub struct Readiness {
    rx: watch::Receiver<StartupPhase>,
}

impl Readiness {
    pub fn current(&self) -> StartupPhase {
        self.rx.borrow().clone()
    }

    /// Wait until the coordinator publishes a report.
    pub async fn wait_complete(&mut self) -> Option<Arc<StartupReport>> {
        let phase = self
            .rx
            .wait_for(|phase| matches!(phase, StartupPhase::Complete(_)))
            .await
            .ok()?;
        match &*phase {
            StartupPhase::Complete(report) => Some(Arc::clone(report)),
            StartupPhase::Initializing => None,
        }
    }
}

/// Dependency-ordered initializer for the service's subsystems.
pub struct StartupCoordinator {
    descriptors: Vec<ComponentDescriptor>,
    components: HashMap<String, Arc<dyn Component>>,
    phase_tx: watch::Sender<StartupPhase>,
}

impl StartupCoordinator {
    pub fn new() -> Self {
        let (phase_tx, _) = watch::channel(StartupPhase::Initializing);
        Self {
            descriptors: Vec::new(),
            components: HashMap::new(),
            phase_tx,
        }
    }

    /// Declare a component and its implementation together.
    pub fn register(&mut self, descriptor: ComponentDescriptor, component: Arc<dyn Component>) {
        self.components.insert(descriptor.name.clone(), component);
        self.descriptors.push(descriptor);
    }

    /// Declare a component whose implementation is bound separately.
    pub fn declare(&mut self, descriptor: ComponentDescriptor) {
        self.descriptors.push(descriptor);
    }

    /// Bind an implementation to a declared component name.
    pub fn bind(&mut self, name: impl Into<String>, component: Arc<dyn Component>) {
        self.components.insert(name.into(), component);
    }

    pub fn readiness(&self) -> Readiness {
        Readiness {
            rx: self.phase_tx.subscribe(),
        }
    }

    /// Run the startup graph to a terminal state.
    ///
    /// Returns `Err` only for configuration problems, which are detected
    /// before any component's init is invoked.
    pub async fn run(self) -> Result<StartupReport, StartupError> {
        let graph = Arc::new(DependencyGraph::build(self.descriptors)?);
        for descriptor in graph.descriptors() {
            if !self.components.contains_key(&descriptor.name) {
                return Err(StartupError::Unbound(descriptor.name.clone()));
            }
        }
        if let Some(name) = self
            .components
            .keys()
            .find(|name| graph.descriptor(name).is_none())
        {
            return Err(StartupError::UnknownBinding(name.clone()));
        }

        tracing::info!(
            components = graph.len(),
            order = ?graph.topological_order(),
            "Starting component graph"
        );
        metrics::record_startup_state(StartupState::Initializing);

        let run = StartupRun::new(Arc::clone(&graph), self.components);
        let report = run.execute().await;

        match report.overall_state {
            StartupState::Ready => {
                tracing::info!(duration_ms = report.duration_ms, "Startup complete: READY")
            }
            StartupState::Degraded => tracing::warn!(
                duration_ms = report.duration_ms,
                failed = ?failed_names(&report),
                "Startup complete: DEGRADED"
            ),
            _ => tracing::error!(
                duration_ms = report.duration_ms,
                failed = ?failed_names(&report),
                "Startup complete: FAILED"
            ),
        }
        metrics::record_startup_state(report.overall_state);

        self.phase_tx
            .send_replace(StartupPhase::Complete(Arc::new(report.clone())));
        Ok(report)
    }
}

impl Default for StartupCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

fn failed_names(report: &StartupReport) -> Vec<&str> {
    report
        .component_statuses
        .iter()
        .filter(|(_, s)| !s.ok)
        .map(|(n, _)| n.as_str())
        .collect()
}

/// Mutable bookkeeping for one execution of the graph.
struct StartupRun {
    graph: Arc<DependencyGraph>,
    components: HashMap<String, Arc<dyn Component>>,
    statuses: BTreeMap<String, ComponentStatus>,
    waiting_on: HashMap<String, usize>,
    running: HashMap<String, Instant>,
    tasks: JoinSet<(String, ComponentStatus)>,
    critical_failure: bool,
}

impl StartupRun {
    fn new(graph: Arc<DependencyGraph>, components: HashMap<String, Arc<dyn Component>>) -> Self {
        let waiting_on = graph
            .descriptors()
            .map(|d| (d.name.clone(), d.dependencies.len()))
            .collect();
        Self {
            graph,
            components,
            statuses: BTreeMap::new(),
            waiting_on,
            running: HashMap::new(),
            tasks: JoinSet::new(),
            critical_failure: false,
        }
    }

    async fn execute(mut self) -> StartupReport {
        let started = Instant::now();

        let roots: Vec<String> = self
            .waiting_on
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(name, _)| name.clone())
            .collect();
        for name in roots {
            self.spawn(&name);
        }

        while let Some(joined) = self.tasks.join_next().await {
            let (name, status) = match joined {
                Ok(result) => result,
                Err(e) => {
                    // Panics are caught inside the task, so this is only reachable on abort.
                    tracing::error!(error = %e, "Component task ended unexpectedly");
                    continue;
                }
            };
            self.running.remove(&name);
            self.complete(name, status);
            if self.critical_failure {
                self.cancel_remaining();
                break;
            }
        }

        let overall_state = if self.critical_failure {
            StartupState::Failed
        } else if self.statuses.values().all(|s| s.ok) {
            StartupState::Ready
        } else {
            StartupState::Degraded
        };

        StartupReport {
            overall_state,
            component_statuses: self.statuses,
            order: self.graph.topological_order().to_vec(),
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }

    fn spawn(&mut self, name: &str) {
        let (Some(descriptor), Some(component)) =
            (self.graph.descriptor(name), self.components.get(name))
        else {
            return;
        };
        let descriptor = descriptor.clone();
        let component = Arc::clone(component);

        tracing::debug!(component = %name, "Initializing component");
        self.running.insert(name.to_string(), Instant::now());
        self.tasks.spawn(async move {
            let status = run_component(&descriptor, component).await;
            (descriptor.name, status)
        });
    }

    fn complete(&mut self, name: String, status: ComponentStatus) {
        let critical = self
            .graph
            .descriptor(&name)
            .map(|d| d.critical)
            .unwrap_or(true);
        metrics::record_component_init(&name, status.outcome, status.duration_ms);

        if status.ok {
            tracing::info!(component = %name, duration_ms = status.duration_ms, "Component ready");
            self.statuses.insert(name.clone(), status);
            let dependents: Vec<String> = self.graph.dependents(&name).cloned().collect();
            for dependent in dependents {
                let ready = match self.waiting_on.get_mut(&dependent) {
                    Some(count) => {
                        *count -= 1;
                        *count == 0
                    }
                    None => false,
                };
                if ready && !self.statuses.contains_key(&dependent) {
                    self.spawn(&dependent);
                }
            }
            return;
        }

        let error = status.error.clone().unwrap_or_default();
        self.statuses.insert(name.clone(), status);

        if critical {
            tracing::error!(component = %name, error = %error, "Critical component failed, aborting startup");
            self.critical_failure = true;
            return;
        }

        tracing::warn!(component = %name, error = %error, "Non-critical component failed, skipping dependents");
        for dependent in self.graph.transitive_dependents(&name) {
            if self.statuses.contains_key(&dependent) {
                continue;
            }
            let dependent_critical = self
                .graph
                .descriptor(&dependent)
                .map(|d| d.critical)
                .unwrap_or(true);
            if dependent_critical {
                tracing::error!(
                    component = %dependent,
                    dependency = %name,
                    "Critical component cannot start, aborting startup"
                );
                self.critical_failure = true;
            }
            metrics::record_component_init(&dependent, ComponentOutcome::Skipped, 0);
            self.statuses.insert(
                dependent,
                ComponentStatus::not_ok(
                    ComponentOutcome::Skipped,
                    Duration::ZERO,
                    format!("dependency {} failed", name),
                ),
            );
        }
    }

    fn cancel_remaining(&mut self) {
        self.tasks.abort_all();
        let pending: Vec<String> = self
            .graph
            .topological_order()
            .iter()
            .filter(|name| !self.statuses.contains_key(*name))
            .cloned()
            .collect();
        for name in pending {
            let elapsed = self
                .running
                .remove(&name)
                .map(|started| started.elapsed())
                .unwrap_or(Duration::ZERO);
            self.statuses.insert(
                name,
                ComponentStatus::not_ok(
                    ComponentOutcome::Cancelled,
                    elapsed,
                    "startup aborted by critical failure".to_string(),
                ),
            );
        }
    }
}

async fn run_component(
    descriptor: &ComponentDescriptor,
    component: Arc<dyn Component>,
) -> ComponentStatus {
    let started = Instant::now();
    let work = async {
        component
            .init()
            .await
            .map_err(|e| format!("init failed: {}", e))?;
        component
            .health_check()
            .await
            .map_err(|e| format!("health check failed: {}", e))
    };

    match with_deadline(descriptor.init_timeout, AssertUnwindSafe(work).catch_unwind()).await {
        Ok(Ok(Ok(()))) => ComponentStatus::ready(started.elapsed()),
        Ok(Ok(Err(message))) => {
            ComponentStatus::not_ok(ComponentOutcome::Failed, started.elapsed(), message)
        }
        Ok(Err(_panic)) => ComponentStatus::not_ok(
            ComponentOutcome::Failed,
            started.elapsed(),
            "init panicked".to_string(),
        ),
        Err(_) => ComponentStatus::not_ok(
            ComponentOutcome::TimedOut,
            started.elapsed(),
            format!("init timed out after {:?}", descriptor.init_timeout),
        ),
    }
}
