//! [`Orchestrator`] – dependency-ordered lifecycle of every managed service.
//!
//! # Start
//!
//! [`plan_start_order`] sorts the dependency graph with Kahn's algorithm,
//! breaking ties by declaration order.  A cycle or an unknown dependency is
//! reported before anything is launched.  [`Orchestrator::start_all`] then
//! launches services one by one and waits, up to each service's startup
//! timeout, for the health monitor to see it ready before moving on.  A
//! service that fails to come up blocks its dependents.
//!
//! # Failures
//!
//! Every failure (crash, missed heartbeats, startup timeout) goes through the
//! service's [`RestartPolicy`] and [`CircuitBreaker`]:
//!
//! | Breaker | Reaction |
//! |---|---|
//! | closed | restart after `base × 2^failures` (+ jitter) |
//! | open | no restarts; a single probe once the cooldown elapses |
//! | half-open | the probe's outcome closes or reopens the breaker |
//!
//! A non-critical service whose restarts are suspended moves the system to
//! `DEGRADED`; a critical one moves it to `ERROR`.  A critical service that
//! still has restarts left only degrades the system, and once every service
//! is healthy again the system returns to `RUNNING`, from `ERROR` too.
//! [`Orchestrator::hold_error`] pins `ERROR` for faults outside the service
//! set.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use fieldos_types::{Alert, AlertKind, CircuitState, FieldError, Severity, SystemState};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::circuit_breaker::CircuitBreaker;
use crate::descriptor::ServiceDescriptor;
use crate::health::{HealthEvent, HealthMonitor, HealthRecord};
use crate::launcher::ServiceLauncher;
use crate::registry::ServiceRegistry;
use crate::restart::{ExitKind, RestartPolicy};
use crate::state_machine::StateMachine;

// ────────────────────────────────────────────────────────────────────────────
// Start order
// ────────────────────────────────────────────────────────────────────────────

/// Topologically sort `descriptors` so every service follows its
/// dependencies.  Ties keep declaration order.
pub fn plan_start_order(descriptors: &[ServiceDescriptor]) -> Result<Vec<String>, FieldError> {
    let mut index: HashMap<&str, usize> = HashMap::new();
    for (i, d) in descriptors.iter().enumerate() {
        if index.insert(d.service_id.as_str(), i).is_some() {
            return Err(FieldError::ConfigValidation(format!(
                "service '{}' is declared twice",
                d.service_id
            )));
        }
    }

    let n = descriptors.len();
    let mut in_degree = vec![0usize; n];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
    for (i, d) in descriptors.iter().enumerate() {
        let deps: BTreeSet<&str> = d.dependencies.iter().map(String::as_str).collect();
        for dep in deps {
            let Some(&j) = index.get(dep) else {
                return Err(FieldError::ConfigValidation(format!(
                    "service '{}' depends on unknown service '{dep}'",
                    d.service_id
                )));
            };
            in_degree[i] += 1;
            dependents[j].push(i);
        }
    }

    let mut ready: BTreeSet<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(n);
    while let Some(i) = ready.pop_first() {
        order.push(descriptors[i].service_id.clone());
        for &j in &dependents[i] {
            in_degree[j] -= 1;
            if in_degree[j] == 0 {
                ready.insert(j);
            }
        }
    }

    if order.len() < n {
        return Err(FieldError::DependencyCycle(find_cycle(descriptors, &in_degree, &index)));
    }
    Ok(order)
}

/// Walk unresolved dependencies until a service repeats.
fn find_cycle(descriptors: &[ServiceDescriptor], in_degree: &[usize], index: &HashMap<&str, usize>) -> Vec<String> {
    let Some(start) = (0..descriptors.len()).find(|&i| in_degree[i] > 0) else {
        return Vec::new();
    };
    let mut path = vec![start];
    let mut seen = HashMap::from([(start, 0usize)]);
    let mut current = start;
    loop {
        let next = descriptors[current]
            .dependencies
            .iter()
            .filter_map(|d| index.get(d.as_str()).copied())
            .find(|&j| in_degree[j] > 0);
        let Some(next) = next else {
            return path.iter().map(|&i| descriptors[i].service_id.clone()).collect();
        };
        if let Some(&pos) = seen.get(&next) {
            let mut cycle: Vec<String> = path[pos..].iter().map(|&i| descriptors[i].service_id.clone()).collect();
            cycle.push(descriptors[next].service_id.clone());
            return cycle;
        }
        seen.insert(next, path.len());
        path.push(next);
        current = next;
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Per-service bookkeeping
// ────────────────────────────────────────────────────────────────────────────

/// Where the orchestrator is with a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServicePhase {
    /// Not launched yet.
    Pending,
    /// Waiting for dependencies to become ready.
    Blocked,
    Starting,
    Running,
    RestartPending,
    /// Circuit open; restarts suspended.
    Suspended,
    /// Failed under a policy that does not restart.
    Exhausted,
    /// Exited cleanly under a policy that does not restart.
    Completed,
    Stopped,
    Disabled,
}

impl ServicePhase {
    /// Failed with no automatic recovery in sight.
    pub fn is_down(self) -> bool {
        matches!(self, ServicePhase::Suspended | ServicePhase::Exhausted)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ServicePhase::Pending => "pending",
            ServicePhase::Blocked => "blocked",
            ServicePhase::Starting => "starting",
            ServicePhase::Running => "running",
            ServicePhase::RestartPending => "restart_pending",
            ServicePhase::Suspended => "suspended",
            ServicePhase::Exhausted => "exhausted",
            ServicePhase::Completed => "completed",
            ServicePhase::Stopped => "stopped",
            ServicePhase::Disabled => "disabled",
        }
    }
}

struct ServiceSlot {
    descriptor: ServiceDescriptor,
    policy: RestartPolicy,
    breaker: CircuitBreaker,
    phase: ServicePhase,
    generation: u64,
    started_at: Option<Instant>,
    restart_at: Option<Instant>,
}

impl ServiceSlot {
    fn new(descriptor: ServiceDescriptor) -> Self {
        Self {
            policy: descriptor.policy(),
            breaker: descriptor.breaker(),
            phase: if descriptor.enabled {
                ServicePhase::Pending
            } else {
                ServicePhase::Disabled
            },
            descriptor,
            generation: 0,
            started_at: None,
            restart_at: None,
        }
    }
}

/// Read-only view of one service for status output.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceView {
    pub service_id: String,
    pub critical: bool,
    pub enabled: bool,
    pub dependencies: Vec<String>,
    pub phase: ServicePhase,
    pub circuit_state: CircuitState,
    pub health: Option<HealthRecord>,
}

/// Outcome of [`Orchestrator::start_all`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StartReport {
    pub order: Vec<String>,
    pub started: Vec<String>,
    pub failed: Vec<String>,
    pub blocked: Vec<String>,
    pub disabled: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OrchestratorConfig {
    /// Interval of the supervision loop.
    pub tick_interval: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
        }
    }
}

/// Down for good, or waiting on a dependency that is.
fn stranded(slots: &BTreeMap<String, ServiceSlot>, id: &str) -> bool {
    let mut seen = HashSet::new();
    let mut stack = vec![id];
    while let Some(current) = stack.pop() {
        if !seen.insert(current) {
            continue;
        }
        let Some(slot) = slots.get(current) else { continue };
        if slot.phase.is_down() {
            return true;
        }
        if matches!(slot.phase, ServicePhase::Blocked | ServicePhase::Pending) {
            stack.extend(slot.descriptor.dependencies.iter().map(String::as_str));
        }
    }
    false
}

struct ExitNotice {
    service_id: String,
    generation: u64,
    kind: ExitKind,
}

// ────────────────────────────────────────────────────────────────────────────
// Orchestrator
// ────────────────────────────────────────────────────────────────────────────

pub struct Orchestrator {
    config: OrchestratorConfig,
    slots: Mutex<BTreeMap<String, ServiceSlot>>,
    order: Mutex<Vec<String>>,
    launcher: Arc<dyn ServiceLauncher>,
    registry: Arc<ServiceRegistry>,
    health: Arc<HealthMonitor>,
    state: Arc<StateMachine>,
    exits_tx: mpsc::UnboundedSender<ExitNotice>,
    exits_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<ExitNotice>>,
    /// Serialises lifecycle operations.
    ops: tokio::sync::Mutex<()>,
    /// Reason `ERROR` was pinned by [`Orchestrator::hold_error`].
    held_error: Mutex<Option<String>>,
}

impl Orchestrator {
    /// Build an orchestrator for `descriptors`.  Fails on a dependency cycle.
    pub fn new(
        config: OrchestratorConfig,
        descriptors: Vec<ServiceDescriptor>,
        launcher: Arc<dyn ServiceLauncher>,
        registry: Arc<ServiceRegistry>,
        health: Arc<HealthMonitor>,
        state: Arc<StateMachine>,
    ) -> Result<Self, FieldError> {
        let order = plan_start_order(&descriptors)?;
        let mut slots = BTreeMap::new();
        for d in descriptors {
            health.track(&d.service_id, d.critical);
            registry.expect(&d.service_id, d.heartbeat_interval);
            slots.insert(d.service_id.clone(), ServiceSlot::new(d));
        }
        let (exits_tx, exits_rx) = mpsc::unbounded_channel();
        Ok(Self {
            config,
            slots: Mutex::new(slots),
            order: Mutex::new(order),
            launcher,
            registry,
            health,
            state,
            exits_tx,
            exits_rx: tokio::sync::Mutex::new(exits_rx),
            ops: tokio::sync::Mutex::new(()),
            held_error: Mutex::new(None),
        })
    }

    fn slots(&self) -> MutexGuard<'_, BTreeMap<String, ServiceSlot>> {
        self.slots.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn start_order(&self) -> Vec<String> {
        self.order.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    pub fn state_machine(&self) -> &Arc<StateMachine> {
        &self.state
    }

    pub fn phase(&self, service_id: &str) -> Option<ServicePhase> {
        self.slots().get(service_id).map(|s| s.phase)
    }

    pub fn circuit_state(&self, service_id: &str) -> Option<CircuitState> {
        self.slots().get(service_id).map(|s| s.breaker.state())
    }

    pub fn services(&self) -> Vec<ServiceView> {
        let slots = self.slots();
        self.start_order()
            .iter()
            .filter_map(|id| slots.get(id))
            .map(|s| ServiceView {
                service_id: s.descriptor.service_id.clone(),
                critical: s.descriptor.critical,
                enabled: s.descriptor.enabled,
                dependencies: s.descriptor.dependencies.clone(),
                phase: s.phase,
                circuit_state: s.breaker.state(),
                health: self.health.record(&s.descriptor.service_id),
            })
            .collect()
    }

    // -----------------------------------------------------------------------
    // Start / stop
    // -----------------------------------------------------------------------

    /// Start every enabled service in dependency order.
    pub async fn start_all(&self) -> Result<StartReport, FieldError> {
        let _ops = self.ops.lock().await;

        let current = self.state.current();
        if current == SystemState::EmergencyStop {
            return Err(FieldError::CriticalSafetyFailure(
                "emergency stop active; manual reset required".into(),
            ));
        }
        if current == SystemState::Initializing {
            self.state
                .transition(SystemState::Starting, "starting services", json!({}))
                .await?;
        }

        let order = self.start_order();
        let mut report = StartReport {
            order: order.clone(),
            ..StartReport::default()
        };
        let mut up: HashSet<String> = HashSet::new();

        for id in &order {
            let Some(descriptor) = self.slots().get(id).map(|s| s.descriptor.clone()) else {
                continue;
            };
            if !descriptor.enabled {
                report.disabled.push(id.clone());
                continue;
            }
            if let Some(dep) = descriptor.dependencies.iter().find(|d| !up.contains(*d)) {
                warn!(service = %id, dependency = %dep, "dependency not ready, not starting");
                self.set_phase(id, ServicePhase::Blocked);
                report.blocked.push(id.clone());
                continue;
            }

            // A resumed start (after a manual reset) keeps healthy instances.
            match self.phase(id) {
                Some(ServicePhase::Running) if self.health.state_of(id).is_ready() => {
                    up.insert(id.clone());
                    report.started.push(id.clone());
                    continue;
                }
                Some(ServicePhase::Pending) | None => {}
                Some(_) => self.stop_instance(id, ServicePhase::Stopped).await,
            }

            info!(service = %id, "starting service");
            if self.launch(id).await && self.await_ready(id, descriptor.startup_timeout).await {
                up.insert(id.clone());
                report.started.push(id.clone());
            } else {
                report.failed.push(id.clone());
            }
        }

        self.finish_start(&report).await?;
        Ok(report)
    }

    async fn finish_start(&self, report: &StartReport) -> Result<(), FieldError> {
        if self.state.current() != SystemState::Starting {
            return Ok(());
        }
        // A critical failure with restarts left is not final yet.
        let critical_down: Vec<String> = {
            let slots = self.slots();
            report
                .failed
                .iter()
                .chain(&report.blocked)
                .filter(|id| slots.get(*id).is_some_and(|s| s.descriptor.critical) && stranded(&slots, id))
                .cloned()
                .collect()
        };
        let (to, reason) = if !critical_down.is_empty() {
            (SystemState::Error, format!("critical services failed to start: {}", critical_down.join(", ")))
        } else if !report.failed.is_empty() || !report.blocked.is_empty() {
            (SystemState::Degraded, "some services failed to start".to_string())
        } else {
            (SystemState::Running, "all services healthy".to_string())
        };
        self.state.transition(to, &reason, json!(report)).await?;
        Ok(())
    }

    /// Wait until `id` is ready, handling any other health events meanwhile.
    async fn await_ready(&self, id: &str, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            self.drain_exits().await;
            let events = self.health.evaluate(&self.registry);
            self.apply_health_events(events).await;

            match self.phase(id) {
                Some(ServicePhase::Running) => return true,
                Some(ServicePhase::Starting) => {}
                _ => return false,
            }
            let now = Instant::now();
            if now >= deadline {
                self.fail(id, &format!("not healthy within {}s", timeout.as_secs()), AlertKind::StartupFailed)
                    .await;
                return false;
            }
            let slice = (deadline - now).min(Duration::from_millis(250));
            self.registry.wait_ready(id, slice).await;
        }
    }

    /// Stop every service in reverse start order.
    pub async fn stop_all(&self) -> Result<(), FieldError> {
        let _ops = self.ops.lock().await;
        let current = self.state.current();
        if current.can_transition_to(SystemState::ShuttingDown) {
            self.state
                .transition(SystemState::ShuttingDown, "stopping services", json!({}))
                .await?;
        }
        for id in self.start_order().iter().rev() {
            self.stop_instance(id, ServicePhase::Stopped).await;
        }
        if self.state.current() == SystemState::ShuttingDown {
            self.state
                .transition(SystemState::Stopped, "all services stopped", json!({}))
                .await?;
        }
        Ok(())
    }

    /// Stop one service without touching its restart history.
    pub async fn stop_service(&self, service_id: &str) -> Result<(), FieldError> {
        let _ops = self.ops.lock().await;
        if !self.slots().contains_key(service_id) {
            return Err(FieldError::UnknownService(service_id.to_string()));
        }
        self.stop_instance(service_id, ServicePhase::Stopped).await;
        Ok(())
    }

    async fn stop_instance(&self, id: &str, phase: ServicePhase) {
        let grace = {
            let mut slots = self.slots();
            let Some(slot) = slots.get_mut(id) else { return };
            slot.generation += 1;
            slot.phase = phase;
            slot.restart_at = None;
            slot.started_at = None;
            slot.descriptor.stop_grace
        };
        if let Err(e) = self.launcher.stop(id, grace).await {
            warn!(service = %id, error = %e, "stop failed");
        }
        self.health.mark_stopped(id);
    }

    // -----------------------------------------------------------------------
    // Launching and failures
    // -----------------------------------------------------------------------

    /// Launch the current descriptor of `id`.  Returns `false` if the launch
    /// itself failed (the failure is already handled).
    async fn launch(&self, id: &str) -> bool {
        let (descriptor, generation) = {
            let mut slots = self.slots();
            let Some(slot) = slots.get_mut(id) else { return false };
            slot.generation += 1;
            slot.phase = ServicePhase::Starting;
            slot.started_at = Some(Instant::now());
            slot.restart_at = None;
            (slot.descriptor.clone(), slot.generation)
        };
        self.health.mark_starting(id);

        match self.launcher.launch(&descriptor).await {
            Ok(launched) => {
                let tx = self.exits_tx.clone();
                let service_id = id.to_string();
                tokio::spawn(async move {
                    let kind = launched
                        .exit
                        .await
                        .unwrap_or_else(|_| ExitKind::Failure("launcher dropped the instance".into()));
                    let _ = tx.send(ExitNotice {
                        service_id,
                        generation,
                        kind,
                    });
                });
                true
            }
            Err(e) => {
                error!(service = %id, error = %e, "launch failed");
                self.fail(id, &format!("launch failed: {e}"), AlertKind::StartupFailed).await;
                false
            }
        }
    }

    /// Record a failure the health monitor has not seen yet, then react.
    async fn fail(&self, id: &str, reason: &str, kind: AlertKind) {
        let consecutive = self.health.record_failure(id, reason);
        let critical = self.slots().get(id).is_some_and(|s| s.descriptor.critical);
        self.health.raise(
            Alert::new(
                if critical { Severity::Critical } else { Severity::Warning },
                kind,
                id,
                reason,
            )
            .with_data(json!({ "consecutive_failures": consecutive })),
        );
        self.after_failure(id, consecutive, reason).await;
    }

    /// Apply restart policy and breaker after a recorded failure.
    async fn after_failure(&self, id: &str, consecutive: u32, reason: &str) {
        let now = Instant::now();
        let (stop_grace, circuit, critical) = {
            let mut slots = self.slots();
            let Some(slot) = slots.get_mut(id) else { return };
            // Whatever is left of the old instance no longer counts.
            slot.generation += 1;
            slot.started_at = None;

            let exit = ExitKind::Failure(reason.to_string());
            let circuit = if !slot.policy.restarts_on(&exit) {
                slot.phase = ServicePhase::Exhausted;
                None
            } else {
                let circuit = slot.breaker.record_failure(now);
                if circuit == CircuitState::Open {
                    slot.phase = ServicePhase::Suspended;
                    slot.restart_at = None;
                } else {
                    let delay = slot.policy.delay(consecutive);
                    slot.phase = ServicePhase::RestartPending;
                    slot.restart_at = Some(now + delay);
                    info!(service = %id, ?delay, consecutive, "restart scheduled");
                }
                Some(circuit)
            };
            (slot.descriptor.stop_grace, circuit, slot.descriptor.critical)
        };

        if let Some(circuit) = circuit {
            self.health.set_circuit(id, circuit);
            if circuit == CircuitState::Open {
                error!(service = %id, "circuit open, restarts suspended");
                self.health.raise(
                    Alert::new(
                        if critical { Severity::Critical } else { Severity::Warning },
                        AlertKind::CircuitOpen,
                        id,
                        format!("restarts suspended after repeated failures: {reason}"),
                    )
                    .with_data(json!({ "critical": critical })),
                );
            }
        } else {
            warn!(service = %id, "restart policy forbids restart");
        }

        if let Err(e) = self.launcher.stop(id, stop_grace).await {
            warn!(service = %id, error = %e, "stopping failed instance");
        }
    }

    async fn drain_exits(&self) {
        let notices: Vec<ExitNotice> = {
            let mut rx = self.exits_rx.lock().await;
            std::iter::from_fn(|| rx.try_recv().ok()).collect()
        };
        for notice in notices {
            let current = self
                .slots()
                .get(&notice.service_id)
                .is_some_and(|s| s.generation == notice.generation);
            if !current {
                debug!(service = %notice.service_id, "ignoring exit of a replaced instance");
                continue;
            }
            match notice.kind {
                ExitKind::Failure(reason) => {
                    self.fail(&notice.service_id, &format!("exited: {reason}"), AlertKind::ServiceFailed)
                        .await;
                }
                ExitKind::Clean => self.on_clean_exit(&notice.service_id),
            }
        }
    }

    fn on_clean_exit(&self, id: &str) {
        let mut slots = self.slots();
        let Some(slot) = slots.get_mut(id) else { return };
        slot.generation += 1;
        slot.started_at = None;
        if slot.policy.restarts_on(&ExitKind::Clean) {
            info!(service = %id, "service exited cleanly, restarting");
            slot.phase = ServicePhase::RestartPending;
            slot.restart_at = Some(Instant::now() + slot.policy.base_delay);
        } else {
            info!(service = %id, "service completed");
            slot.phase = ServicePhase::Completed;
            drop(slots);
            self.health.mark_stopped(id);
        }
    }

    async fn apply_health_events(&self, events: Vec<HealthEvent>) {
        for event in events {
            match event {
                HealthEvent::Ready { service_id } => {
                    let circuit = {
                        let mut slots = self.slots();
                        let Some(slot) = slots.get_mut(&service_id) else { continue };
                        slot.phase = ServicePhase::Running;
                        slot.breaker.record_success()
                    };
                    self.health.set_circuit(&service_id, circuit);
                }
                HealthEvent::Failed { service_id, reason } => {
                    let consecutive = self
                        .health
                        .record(&service_id)
                        .map(|r| r.consecutive_failures)
                        .unwrap_or(1);
                    self.after_failure(&service_id, consecutive, &reason).await;
                }
                HealthEvent::EmergencyStop { reason } => {
                    if let Err(e) = self.state.emergency_stop(&reason).await {
                        error!(error = %e, "emergency stop failed");
                    }
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Supervision loop
    // -----------------------------------------------------------------------

    /// One supervision pass.
    pub async fn tick(&self) {
        let _ops = self.ops.lock().await;
        self.drain_exits().await;
        let events = self.health.evaluate(&self.registry);
        self.apply_health_events(events).await;

        let system = self.state.current();
        if matches!(
            system,
            SystemState::EmergencyStop | SystemState::ShuttingDown | SystemState::Stopped | SystemState::Initializing
        ) {
            return;
        }

        let now = Instant::now();
        let mut timed_out = Vec::new();
        let mut due = Vec::new();
        let mut probes = Vec::new();
        let mut unblock = Vec::new();
        {
            let mut slots = self.slots();
            let ready: HashSet<String> = slots
                .keys()
                .filter(|id| self.health.state_of(id).is_ready())
                .cloned()
                .collect();
            for (id, slot) in slots.iter_mut() {
                match slot.phase {
                    ServicePhase::Starting => {
                        if slot
                            .started_at
                            .is_some_and(|t| now.saturating_duration_since(t) > slot.descriptor.startup_timeout)
                        {
                            timed_out.push((id.clone(), slot.descriptor.startup_timeout));
                        }
                    }
                    ServicePhase::RestartPending => {
                        if slot.restart_at.is_some_and(|t| t <= now) {
                            due.push(id.clone());
                        }
                    }
                    ServicePhase::Suspended => {
                        if slot.breaker.allow_restart(now) {
                            probes.push(id.clone());
                        }
                    }
                    ServicePhase::Blocked | ServicePhase::Pending => {
                        if slot.descriptor.dependencies.iter().all(|d| ready.contains(d)) {
                            unblock.push(id.clone());
                        }
                    }
                    _ => {}
                }
            }
        }

        for (id, timeout) in timed_out {
            self.fail(&id, &format!("not healthy within {}s", timeout.as_secs()), AlertKind::StartupFailed)
                .await;
        }
        for id in due {
            info!(service = %id, "restarting service");
            self.launch(&id).await;
        }
        for id in probes {
            info!(service = %id, "circuit half-open, probing with one restart");
            self.health.set_circuit(&id, CircuitState::HalfOpen);
            self.launch(&id).await;
        }
        // Pending services are only launched here once start_all has run.
        if system != SystemState::Starting {
            for id in unblock {
                info!(service = %id, "dependencies ready, starting service");
                self.launch(&id).await;
            }
        }

        self.reconcile_system_state().await;
        self.health.publish_summary();
    }

    /// Drive [`Orchestrator::tick`] until `shutdown`.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.tick_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => self.tick().await,
            }
        }
    }

    /// Move between `RUNNING`, `DEGRADED` and `ERROR` according to the
    /// services that are down.
    pub async fn reconcile_system_state(&self) {
        let current = self.state.current();
        let recovering = current == SystemState::Error && self.held_error().is_none();
        if !(current.is_operational() || recovering) {
            return;
        }
        let (critical_down, down, all_ready) = {
            let slots = self.slots();
            let mut critical_down = Vec::new();
            let mut down = Vec::new();
            let mut all_ready = true;
            for (id, slot) in slots.iter() {
                if matches!(slot.phase, ServicePhase::Disabled | ServicePhase::Completed) {
                    continue;
                }
                if stranded(&slots, id) {
                    if slot.descriptor.critical {
                        critical_down.push(id.clone());
                    } else {
                        down.push(id.clone());
                    }
                }
                if !(slot.phase == ServicePhase::Running && self.health.state_of(id).is_ready()) {
                    all_ready = false;
                }
            }
            (critical_down, down, all_ready)
        };

        let target = if !critical_down.is_empty() {
            Some((
                SystemState::Error,
                format!("critical services down: {}", critical_down.join(", ")),
                json!({ "services": critical_down }),
            ))
        } else if !down.is_empty() {
            Some((
                SystemState::Degraded,
                format!("services down: {}", down.join(", ")),
                json!({ "services": down }),
            ))
        } else if all_ready {
            Some((SystemState::Running, "all services healthy".to_string(), json!({})))
        } else {
            None
        };
        if let Some((to, reason, data)) = target {
            if to != current {
                if let Err(e) = self.state.transition(to, &reason, data).await {
                    warn!(error = %e, "system state reconcile failed");
                }
            }
        }
    }

    /// Enter `ERROR` for a fault the service set cannot heal, such as the
    /// broker giving up.  Reconciliation keeps the system there.
    pub async fn hold_error(&self, reason: &str, data: Value) -> Result<(), FieldError> {
        *self.held_error.lock().unwrap_or_else(|p| p.into_inner()) = Some(reason.to_string());
        if self.state.current().can_transition_to(SystemState::Error) {
            self.state.transition(SystemState::Error, reason, data).await?;
        }
        Ok(())
    }

    pub fn held_error(&self) -> Option<String> {
        self.held_error.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    // -----------------------------------------------------------------------
    // Operator actions
    // -----------------------------------------------------------------------

    /// Restart `service_id` now.  Refused while its circuit is open.
    pub async fn restart(&self, service_id: &str) -> Result<(), FieldError> {
        let _ops = self.ops.lock().await;
        {
            let slots = self.slots();
            let slot = slots
                .get(service_id)
                .ok_or_else(|| FieldError::UnknownService(service_id.to_string()))?;
            if let Some(left) = slot.breaker.cooldown_remaining(Instant::now()) {
                return Err(FieldError::CircuitOpen(format!(
                    "{service_id}, retry in {}s",
                    left.as_secs()
                )));
            }
            if !slot.descriptor.enabled {
                return Err(FieldError::ServiceFailure {
                    service: service_id.to_string(),
                    reason: "service is disabled".into(),
                });
            }
        }
        if self.state.current() == SystemState::EmergencyStop {
            return Err(FieldError::CriticalSafetyFailure("emergency stop active".into()));
        }
        self.stop_instance(service_id, ServicePhase::Stopped).await;
        if self.launch(service_id).await {
            Ok(())
        } else {
            Err(FieldError::ServiceFailure {
                service: service_id.to_string(),
                reason: "launch failed".into(),
            })
        }
    }

    /// Close the breaker of `service_id` and schedule an immediate restart
    /// if it was suspended.
    pub async fn reset_circuit(&self, service_id: &str) -> Result<(), FieldError> {
        let _ops = self.ops.lock().await;
        {
            let mut slots = self.slots();
            let slot = slots
                .get_mut(service_id)
                .ok_or_else(|| FieldError::UnknownService(service_id.to_string()))?;
            slot.breaker.reset();
            if slot.phase == ServicePhase::Suspended {
                slot.phase = ServicePhase::RestartPending;
                slot.restart_at = Some(Instant::now());
            }
        }
        self.health.set_circuit(service_id, CircuitState::Closed);
        info!(service = %service_id, "circuit reset by operator");
        Ok(())
    }

    /// Request an emergency stop and suspend automatic restarts.
    pub async fn emergency_stop(&self, reason: &str) -> Result<bool, FieldError> {
        let entered = self.state.emergency_stop(reason).await?;
        if entered {
            for slot in self.slots().values_mut() {
                if slot.phase == ServicePhase::RestartPending {
                    slot.phase = ServicePhase::Stopped;
                    slot.restart_at = None;
                }
            }
        }
        Ok(entered)
    }

    // -----------------------------------------------------------------------
    // Reconfiguration
    // -----------------------------------------------------------------------

    /// Replace the service set after a configuration reload.
    ///
    /// Removed services are stopped and retired, disabled ones stopped, and
    /// new or re-enabled ones started once their dependencies are ready.  A
    /// dependency problem rejects the whole change.
    pub async fn apply_descriptors(&self, descriptors: Vec<ServiceDescriptor>) -> Result<(), FieldError> {
        let order = plan_start_order(&descriptors)?;
        let _ops = self.ops.lock().await;

        let incoming: BTreeMap<String, ServiceDescriptor> = descriptors
            .into_iter()
            .map(|d| (d.service_id.clone(), d))
            .collect();
        let existing: Vec<String> = self.slots().keys().cloned().collect();

        for id in existing.iter().filter(|id| !incoming.contains_key(*id)) {
            info!(service = %id, "service removed from configuration, retiring");
            self.stop_instance(id, ServicePhase::Stopped).await;
            self.slots().remove(id);
            self.health.retire(id);
            self.registry.deregister(id);
        }

        for (id, descriptor) in incoming {
            self.health.track(&id, descriptor.critical);
            self.registry.expect(&id, descriptor.heartbeat_interval);
            let was_enabled = self.slots().get(&id).map(|s| s.descriptor.enabled);
            match was_enabled {
                None => {
                    info!(service = %id, "service added");
                    let mut slot = ServiceSlot::new(descriptor);
                    if slot.phase == ServicePhase::Pending {
                        slot.phase = ServicePhase::Blocked;
                    }
                    self.slots().insert(id, slot);
                }
                Some(true) if !descriptor.enabled => {
                    info!(service = %id, "service disabled");
                    self.stop_instance(&id, ServicePhase::Disabled).await;
                    self.replace_descriptor(&id, descriptor);
                }
                Some(false) if descriptor.enabled => {
                    info!(service = %id, "service enabled");
                    self.replace_descriptor(&id, descriptor);
                    self.set_phase(&id, ServicePhase::Blocked);
                }
                Some(_) => self.replace_descriptor(&id, descriptor),
            }
        }

        *self.order.lock().unwrap_or_else(|p| p.into_inner()) = order;
        Ok(())
    }

    fn replace_descriptor(&self, id: &str, descriptor: ServiceDescriptor) {
        if let Some(slot) = self.slots().get_mut(id) {
            slot.policy = descriptor.policy();
            slot.breaker.reconfigure(
                descriptor.breaker_threshold(),
                descriptor.restart_window,
                descriptor.circuit_cooldown,
            );
            slot.descriptor = descriptor;
        }
    }

    fn set_phase(&self, id: &str, phase: ServicePhase) {
        if let Some(slot) = self.slots().get_mut(id) {
            slot.phase = phase;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::HealthConfig;
    use crate::launcher::LaunchedService;
    use crate::registry::RegistryConfig;
    use crate::state_machine::STATE_FILE;
    use async_trait::async_trait;
    use chrono::Utc;
    use fieldos_types::{ServiceState, ServiceStatus};
    use tokio::sync::oneshot;

    fn ids(order: &[String]) -> Vec<&str> {
        order.iter().map(String::as_str).collect()
    }

    #[test]
    fn start_order_respects_dependencies_and_declaration() -> Result<(), FieldError> {
        let descriptors = vec![
            ServiceDescriptor::new("safety").depends_on(["hardware"]),
            ServiceDescriptor::new("comm"),
            ServiceDescriptor::new("hardware").depends_on(["comm"]),
            ServiceDescriptor::new("data"),
        ];
        let order = plan_start_order(&descriptors)?;
        assert_eq!(ids(&order), vec!["comm", "hardware", "safety", "data"]);
        Ok(())
    }

    #[test]
    fn cycle_is_reported_with_its_path() {
        let descriptors = vec![
            ServiceDescriptor::new("web"),
            ServiceDescriptor::new("a").depends_on(["b"]),
            ServiceDescriptor::new("b").depends_on(["c"]),
            ServiceDescriptor::new("c").depends_on(["a"]),
        ];
        match plan_start_order(&descriptors) {
            Err(FieldError::DependencyCycle(path)) => {
                assert_eq!(path.first(), path.last());
                assert_eq!(path.len(), 4);
            }
            other => panic!("expected a cycle, got {other:?}"),
        }
    }

    #[test]
    fn unknown_dependency_and_duplicates_are_rejected() {
        let unknown = vec![ServiceDescriptor::new("nav").depends_on(["gps"])];
        assert!(matches!(plan_start_order(&unknown), Err(FieldError::ConfigValidation(_))));

        let dup = vec![ServiceDescriptor::new("nav"), ServiceDescriptor::new("nav")];
        assert!(matches!(plan_start_order(&dup), Err(FieldError::ConfigValidation(_))));

        let own = vec![ServiceDescriptor::new("loop").depends_on(["loop"])];
        assert!(matches!(plan_start_order(&own), Err(FieldError::DependencyCycle(_))));
    }

    /// Launcher whose services report straight into the registry.
    struct DirectLauncher {
        registry: Arc<ServiceRegistry>,
        crashing: Mutex<HashSet<String>>,
        launches: Mutex<Vec<String>>,
        exits: Mutex<HashMap<String, oneshot::Sender<ExitKind>>>,
    }

    impl DirectLauncher {
        fn new(registry: Arc<ServiceRegistry>, crashing: &[&str]) -> Self {
            Self {
                registry,
                crashing: Mutex::new(crashing.iter().map(|s| s.to_string()).collect()),
                launches: Mutex::new(Vec::new()),
                exits: Mutex::new(HashMap::new()),
            }
        }

        fn launches(&self) -> Vec<String> {
            self.launches.lock().map(|l| l.clone()).unwrap_or_default()
        }

        fn launch_count(&self, id: &str) -> usize {
            self.launches().iter().filter(|s| *s == id).count()
        }

        /// Later launches of `id` come up healthy.
        fn heal(&self, id: &str) {
            if let Ok(mut crashing) = self.crashing.lock() {
                crashing.remove(id);
            }
        }
    }

    #[async_trait]
    impl ServiceLauncher for DirectLauncher {
        async fn launch(&self, d: &ServiceDescriptor) -> Result<LaunchedService, FieldError> {
            if let Ok(mut l) = self.launches.lock() {
                l.push(d.service_id.clone());
            }
            let (tx, rx) = oneshot::channel();
            let crashing = self.crashing.lock().map(|c| c.contains(&d.service_id)).unwrap_or(false);
            if crashing {
                let _ = tx.send(ExitKind::Failure("exit status: 1".into()));
            } else {
                self.registry
                    .record_heartbeat(&ServiceStatus::new(d.service_id.clone(), ServiceState::Healthy), Utc::now());
                if let Ok(mut exits) = self.exits.lock() {
                    exits.insert(d.service_id.clone(), tx);
                }
            }
            Ok(LaunchedService { pid: None, exit: rx })
        }

        async fn stop(&self, service_id: &str, _grace: Duration) -> Result<(), FieldError> {
            if let Ok(mut exits) = self.exits.lock() {
                if let Some(tx) = exits.remove(service_id) {
                    let _ = tx.send(ExitKind::Clean);
                }
            }
            Ok(())
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        launcher: Arc<DirectLauncher>,
        orchestrator: Orchestrator,
    }

    fn fixture(descriptors: Vec<ServiceDescriptor>, crashing: &[&str]) -> Result<Fixture, Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let registry = Arc::new(ServiceRegistry::new(RegistryConfig::default()));
        let health = Arc::new(HealthMonitor::new(HealthConfig::default(), None));
        let state = Arc::new(StateMachine::open(dir.path().join(STATE_FILE), None, None)?);
        let launcher = Arc::new(DirectLauncher::new(Arc::clone(&registry), crashing));
        let orchestrator = Orchestrator::new(
            OrchestratorConfig::default(),
            descriptors,
            launcher.clone(),
            registry,
            health,
            state,
        )?;
        Ok(Fixture {
            _dir: dir,
            launcher,
            orchestrator,
        })
    }

    fn fast(id: &str) -> ServiceDescriptor {
        let mut d = ServiceDescriptor::new(id).with_max_restarts(3);
        d.restart_delay_base = Duration::from_millis(100);
        d.startup_timeout = Duration::from_secs(2);
        d.circuit_cooldown = Duration::from_secs(30);
        d
    }

    #[tokio::test(start_paused = true)]
    async fn start_all_reaches_running() -> Result<(), Box<dyn std::error::Error>> {
        let f = fixture(vec![fast("comm"), fast("nav").depends_on(["comm"])], &[])?;
        let report = f.orchestrator.start_all().await?;
        assert_eq!(report.started, vec!["comm", "nav"]);
        assert_eq!(f.orchestrator.state_machine().current(), SystemState::Running);
        assert_eq!(f.launcher.launches(), vec!["comm", "nav"]);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn failed_dependency_blocks_chain_and_escalates() -> Result<(), Box<dyn std::error::Error>> {
        let f = fixture(
            vec![fast("comm").critical(true), fast("nav").depends_on(["comm"]), fast("web")],
            &["comm"],
        )?;
        let report = f.orchestrator.start_all().await?;
        assert_eq!(report.failed, vec!["comm"]);
        assert_eq!(report.blocked, vec!["nav"]);
        assert_eq!(report.started, vec!["web"]);
        // comm still has restarts left.
        assert_eq!(f.orchestrator.state_machine().current(), SystemState::Degraded);

        for _ in 0..20 {
            tokio::time::sleep(Duration::from_millis(500)).await;
            f.orchestrator.tick().await;
        }
        assert_eq!(f.orchestrator.phase("comm"), Some(ServicePhase::Suspended));
        assert_eq!(f.orchestrator.phase("nav"), Some(ServicePhase::Blocked));
        assert_eq!(f.orchestrator.state_machine().current(), SystemState::Error);
        assert!(!f.launcher.launches().contains(&"nav".to_string()));
        Ok(())
    }

    async fn tick_for(orchestrator: &Orchestrator, ticks: usize) {
        for _ in 0..ticks {
            tokio::time::sleep(Duration::from_millis(500)).await;
            orchestrator.tick().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn critical_service_recovering_after_a_failed_start_runs() -> Result<(), Box<dyn std::error::Error>> {
        let f = fixture(
            vec![fast("comm"), fast("safety").critical(true).depends_on(["comm"])],
            &["safety"],
        )?;
        let report = f.orchestrator.start_all().await?;
        assert_eq!(report.failed, vec!["safety"]);
        assert_eq!(f.orchestrator.phase("safety"), Some(ServicePhase::RestartPending));
        assert_eq!(f.orchestrator.state_machine().current(), SystemState::Degraded);

        f.launcher.heal("safety");
        tick_for(&f.orchestrator, 20).await;
        assert_eq!(f.launcher.launch_count("safety"), 2);
        assert_eq!(f.orchestrator.phase("safety"), Some(ServicePhase::Running));
        assert_eq!(f.orchestrator.circuit_state("safety"), Some(CircuitState::Closed));
        assert_eq!(f.orchestrator.state_machine().current(), SystemState::Running);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn reset_circuit_lifts_error_once_critical_service_recovers() -> Result<(), Box<dyn std::error::Error>> {
        let f = fixture(vec![fast("comm"), fast("safety").critical(true)], &["safety"])?;
        f.orchestrator.start_all().await?;
        tick_for(&f.orchestrator, 20).await;
        assert_eq!(f.orchestrator.phase("safety"), Some(ServicePhase::Suspended));
        assert_eq!(f.orchestrator.state_machine().current(), SystemState::Error);

        f.launcher.heal("safety");
        f.orchestrator.reset_circuit("safety").await?;
        tick_for(&f.orchestrator, 4).await;
        assert_eq!(f.orchestrator.phase("safety"), Some(ServicePhase::Running));
        let record = f.orchestrator.state_machine().record().await;
        assert_eq!(record.current_state, SystemState::Running);
        assert_eq!(record.previous_state, Some(SystemState::Error));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn held_error_survives_healthy_services() -> Result<(), Box<dyn std::error::Error>> {
        let f = fixture(vec![fast("comm")], &[])?;
        f.orchestrator.start_all().await?;
        f.orchestrator.hold_error("broker gave up", json!({ "source": "broker" })).await?;
        tick_for(&f.orchestrator, 4).await;
        assert_eq!(f.orchestrator.state_machine().current(), SystemState::Error);
        assert_eq!(f.orchestrator.held_error().as_deref(), Some("broker gave up"));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn restart_delay_doubles_with_each_consecutive_failure() -> Result<(), Box<dyn std::error::Error>> {
        let mut vision = ServiceDescriptor::new("vision").with_max_restarts(5);
        vision.restart_delay_base = Duration::from_secs(1);
        vision.startup_timeout = Duration::from_secs(60);
        let f = fixture(vec![vision], &["vision"])?;
        let scheduled = |o: &Orchestrator| {
            o.slots()
                .get("vision")
                .and_then(|s| s.restart_at)
                .map(|t| t.saturating_duration_since(Instant::now()))
        };

        f.orchestrator.start_all().await?;
        for failures in 1..=3u32 {
            let delay = scheduled(&f.orchestrator).ok_or("no restart scheduled")?;
            let base = Duration::from_secs(1) * 2u32.pow(failures);
            // Well above base × 2^(n-1) even if the clock moved on since scheduling.
            assert!(delay > base.mul_f64(0.75), "after {failures} failures: {delay:?} < {base:?}");
            assert!(delay <= base + base.mul_f64(0.1), "after {failures} failures: {delay:?}");

            // Relaunch when due, then let the crash come back.
            tokio::time::sleep(delay).await;
            f.orchestrator.tick().await;
            tokio::time::sleep(Duration::from_millis(10)).await;
            f.orchestrator.tick().await;
        }
        assert_eq!(f.launcher.launch_count("vision"), 4);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn crash_loop_opens_circuit_and_degrades() -> Result<(), Box<dyn std::error::Error>> {
        let f = fixture(vec![fast("comm"), fast("vision")], &["vision"])?;
        f.orchestrator.start_all().await?;
        assert_eq!(f.orchestrator.state_machine().current(), SystemState::Degraded);

        for _ in 0..20 {
            tokio::time::sleep(Duration::from_millis(500)).await;
            f.orchestrator.tick().await;
        }
        assert_eq!(f.orchestrator.circuit_state("vision"), Some(CircuitState::Open));
        assert_eq!(f.orchestrator.phase("vision"), Some(ServicePhase::Suspended));
        assert_eq!(f.launcher.launch_count("vision"), 3);
        assert_eq!(f.orchestrator.state_machine().current(), SystemState::Degraded);
        assert_eq!(f.orchestrator.phase("comm"), Some(ServicePhase::Running));

        // Cooldown elapses: exactly one probe, which fails again.
        tokio::time::sleep(Duration::from_secs(31)).await;
        f.orchestrator.tick().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        f.orchestrator.tick().await;
        assert_eq!(f.launcher.launch_count("vision"), 4);
        assert_eq!(f.orchestrator.circuit_state("vision"), Some(CircuitState::Open));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn operator_restart_refused_while_open_then_reset() -> Result<(), Box<dyn std::error::Error>> {
        let f = fixture(vec![fast("vision")], &["vision"])?;
        f.orchestrator.start_all().await?;
        for _ in 0..20 {
            tokio::time::sleep(Duration::from_millis(500)).await;
            f.orchestrator.tick().await;
        }
        assert!(matches!(
            f.orchestrator.restart("vision").await,
            Err(FieldError::CircuitOpen(_))
        ));
        f.orchestrator.reset_circuit("vision").await?;
        assert_eq!(f.orchestrator.phase("vision"), Some(ServicePhase::RestartPending));
        assert!(matches!(
            f.orchestrator.restart("ghost").await,
            Err(FieldError::UnknownService(_))
        ));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn stop_all_goes_through_shutting_down() -> Result<(), Box<dyn std::error::Error>> {
        let f = fixture(vec![fast("comm"), fast("nav").depends_on(["comm"])], &[])?;
        f.orchestrator.start_all().await?;
        f.orchestrator.stop_all().await?;
        let record = f.orchestrator.state_machine().record().await;
        assert_eq!(record.current_state, SystemState::Stopped);
        assert_eq!(record.previous_state, Some(SystemState::ShuttingDown));
        assert_eq!(f.orchestrator.phase("comm"), Some(ServicePhase::Stopped));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn reload_retires_removed_and_starts_added() -> Result<(), Box<dyn std::error::Error>> {
        let f = fixture(vec![fast("comm"), fast("weather")], &[])?;
        f.orchestrator.start_all().await?;

        f.orchestrator
            .apply_descriptors(vec![fast("comm"), fast("power").depends_on(["comm"])])
            .await?;
        assert_eq!(f.orchestrator.phase("weather"), None);
        assert!(f.orchestrator.health().record("weather").is_none());

        f.orchestrator.tick().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        f.orchestrator.tick().await;
        assert_eq!(f.orchestrator.phase("power"), Some(ServicePhase::Running));

        let cyclic = vec![fast("comm").depends_on(["power"]), fast("power").depends_on(["comm"])];
        assert!(f.orchestrator.apply_descriptors(cyclic).await.is_err());
        assert_eq!(f.orchestrator.services().len(), 2);
        Ok(())
    }
}
