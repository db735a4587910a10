//! [`HealthMonitor`] – owner of the service health table.
//!
//! The monitor is the only writer of [`HealthRecord`]s.  The orchestrator
//! reports lifecycle facts (launched, stopped, circuit changed) through the
//! monitor's methods and reads the table back through [`HealthMonitor::snapshot`].
//!
//! Each [`HealthMonitor::evaluate`] pass compares the records with what the
//! [`ServiceRegistry`] has heard and yields [`HealthEvent`]s:
//!
//! - a starting service that heartbeats `healthy`/`degraded` becomes ready;
//! - a running service silent for longer than its heartbeat timeout fails;
//! - resource readings over a threshold raise alerts, and a temperature over
//!   the emergency limit requests an emergency stop.
//!
//! Repeats of the same `(service, kind)` alert are suppressed for
//! `alert_cooldown`.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use fieldos_middleware::{MessagingClient, topics};
use fieldos_types::{
    Alert, AlertKind, CircuitState, Payload, ResourceUsage, ServiceState, ServiceStatus, Severity,
    SystemEvent,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::registry::ServiceRegistry;

// ────────────────────────────────────────────────────────────────────────────
// Configuration
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceThresholds {
    pub cpu_percent: Option<f64>,
    pub memory_mb: Option<f64>,
    pub temperature_c: Option<f64>,
    /// Above this temperature the monitor requests an emergency stop.
    pub emergency_temperature_c: Option<f64>,
}

impl Default for ResourceThresholds {
    fn default() -> Self {
        Self {
            cpu_percent: Some(90.0),
            memory_mb: None,
            temperature_c: Some(80.0),
            emergency_temperature_c: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HealthConfig {
    pub alert_cooldown: Duration,
    pub thresholds: ResourceThresholds,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            alert_cooldown: Duration::from_secs(60),
            thresholds: ResourceThresholds::default(),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Records
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthRecord {
    pub service_id: String,
    pub critical: bool,
    pub state: ServiceState,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub circuit_state: CircuitState,
    pub last_error: Option<String>,
    pub restarts: u32,
    pub resources: Option<ResourceUsage>,
    /// When the current instance was launched.
    #[serde(skip)]
    pub started_at: Option<Instant>,
}

impl HealthRecord {
    fn new(service_id: &str, critical: bool) -> Self {
        Self {
            service_id: service_id.to_string(),
            critical,
            state: ServiceState::Unknown,
            last_heartbeat: None,
            consecutive_failures: 0,
            circuit_state: CircuitState::Closed,
            last_error: None,
            restarts: 0,
            resources: None,
            started_at: None,
        }
    }
}

/// Outcome of an evaluation pass that needs a reaction.
#[derive(Debug, Clone, PartialEq)]
pub enum HealthEvent {
    /// A starting service reported ready.
    Ready { service_id: String },
    /// A service stopped heartbeating or reported itself failed.
    Failed { service_id: String, reason: String },
    /// A safety-relevant condition requires stopping everything.
    EmergencyStop { reason: String },
}

/// Aggregate published on `system/health`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthSummary {
    pub overall: String,
    pub total: usize,
    pub healthy: usize,
    pub degraded: usize,
    pub starting: usize,
    pub failed: usize,
    pub stopped: usize,
    pub open_circuits: Vec<String>,
}

// ────────────────────────────────────────────────────────────────────────────
// Monitor
// ────────────────────────────────────────────────────────────────────────────

pub struct HealthMonitor {
    config: HealthConfig,
    records: RwLock<BTreeMap<String, HealthRecord>>,
    last_alert: Mutex<HashMap<(String, AlertKind), Instant>>,
    alerts: broadcast::Sender<Alert>,
    publisher: Option<MessagingClient>,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig, publisher: Option<MessagingClient>) -> Self {
        let (alerts, _) = broadcast::channel(256);
        Self {
            config,
            records: RwLock::new(BTreeMap::new()),
            last_alert: Mutex::new(HashMap::new()),
            alerts,
            publisher,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, HealthRecord>> {
        self.records.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, HealthRecord>> {
        self.records.write().unwrap_or_else(|p| p.into_inner())
    }

    fn update<R>(&self, service_id: &str, f: impl FnOnce(&mut HealthRecord) -> R) -> Option<R> {
        self.write().get_mut(service_id).map(f)
    }

    pub fn alerts(&self) -> broadcast::Receiver<Alert> {
        self.alerts.subscribe()
    }

    // -----------------------------------------------------------------------
    // Lifecycle facts reported by the orchestrator
    // -----------------------------------------------------------------------

    /// Start tracking `service_id`, or update its criticality.
    pub fn track(&self, service_id: &str, critical: bool) {
        self.write()
            .entry(service_id.to_string())
            .and_modify(|r| r.critical = critical)
            .or_insert_with(|| HealthRecord::new(service_id, critical));
    }

    /// Remove a permanently retired service.
    pub fn retire(&self, service_id: &str) -> bool {
        self.write().remove(service_id).is_some()
    }

    pub fn mark_starting(&self, service_id: &str) {
        self.update(service_id, |r| {
            if r.started_at.is_some() {
                r.restarts += 1;
            }
            r.state = ServiceState::Starting;
            r.started_at = Some(Instant::now());
        });
    }

    pub fn mark_stopped(&self, service_id: &str) {
        self.update(service_id, |r| {
            r.state = ServiceState::Stopped;
        });
    }

    /// Record a failure; returns the new consecutive-failure count.
    pub fn record_failure(&self, service_id: &str, reason: &str) -> u32 {
        self.update(service_id, |r| {
            r.state = ServiceState::Failed;
            r.consecutive_failures += 1;
            r.last_error = Some(reason.to_string());
            r.consecutive_failures
        })
        .unwrap_or(0)
    }

    pub fn set_circuit(&self, service_id: &str, state: CircuitState) {
        self.update(service_id, |r| r.circuit_state = state);
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    pub fn record(&self, service_id: &str) -> Option<HealthRecord> {
        self.read().get(service_id).cloned()
    }

    pub fn state_of(&self, service_id: &str) -> ServiceState {
        self.read()
            .get(service_id)
            .map(|r| r.state)
            .unwrap_or(ServiceState::Unknown)
    }

    pub fn snapshot(&self) -> Vec<HealthRecord> {
        self.read().values().cloned().collect()
    }

    pub fn summary(&self) -> HealthSummary {
        let records = self.read();
        let mut s = HealthSummary {
            total: records.len(),
            ..HealthSummary::default()
        };
        for r in records.values() {
            match r.state {
                ServiceState::Healthy => s.healthy += 1,
                ServiceState::Degraded => s.degraded += 1,
                ServiceState::Starting => s.starting += 1,
                ServiceState::Failed => s.failed += 1,
                ServiceState::Stopped => s.stopped += 1,
                ServiceState::Unknown => {}
            }
            if r.circuit_state != CircuitState::Closed {
                s.open_circuits.push(r.service_id.clone());
            }
        }
        s.overall = if records.values().any(|r| r.critical && r.state == ServiceState::Failed) {
            "critical"
        } else if s.failed > 0 || s.degraded > 0 || !s.open_circuits.is_empty() {
            "degraded"
        } else {
            "healthy"
        }
        .to_string();
        s
    }

    // -----------------------------------------------------------------------
    // Evaluation
    // -----------------------------------------------------------------------

    /// Reconcile the table with the registry.
    pub fn evaluate(&self, registry: &ServiceRegistry) -> Vec<HealthEvent> {
        let now = Instant::now();
        let mut events = Vec::new();
        let mut alerts = Vec::new();

        {
            let mut records = self.write();
            for record in records.values_mut() {
                let entry = registry
                    .lookup(&record.service_id)
                    .filter(|e| record.started_at.is_none_or(|t| e.last_seen >= t));
                if let Some(entry) = &entry {
                    record.last_heartbeat = Some(entry.last_heartbeat_at);
                    record.resources = entry.resources;
                }
                let timeout = registry.heartbeat_timeout(&record.service_id);

                match record.state {
                    ServiceState::Starting => {
                        let Some(entry) = entry else { continue };
                        if entry.reported_state.is_ready() {
                            info!(service = %record.service_id, state = %entry.reported_state, "service ready");
                            record.state = entry.reported_state;
                            record.consecutive_failures = 0;
                            record.last_error = None;
                            events.push(HealthEvent::Ready {
                                service_id: record.service_id.clone(),
                            });
                        }
                    }
                    ServiceState::Healthy | ServiceState::Degraded => {
                        let silent_for = entry
                            .as_ref()
                            .map(|e| now.saturating_duration_since(e.last_seen))
                            .or_else(|| record.started_at.map(|t| now.saturating_duration_since(t)));
                        let reason = match (&entry, silent_for) {
                            (_, Some(silent)) if silent > timeout => {
                                Some(format!("no heartbeat for {}s", silent.as_secs()))
                            }
                            (Some(e), _) if e.reported_state == ServiceState::Failed => {
                                Some("service reported failed".to_string())
                            }
                            (None, None) => Some("service vanished from registry".to_string()),
                            _ => None,
                        };
                        if let Some(reason) = reason {
                            warn!(service = %record.service_id, %reason, "service failed");
                            record.state = ServiceState::Failed;
                            record.consecutive_failures += 1;
                            record.last_error = Some(reason.clone());
                            let severity = if record.critical { Severity::Critical } else { Severity::Warning };
                            alerts.push(
                                Alert::new(severity, AlertKind::ServiceFailed, record.service_id.clone(), reason.clone())
                                    .with_data(json!({ "critical": record.critical })),
                            );
                            events.push(HealthEvent::Failed {
                                service_id: record.service_id.clone(),
                                reason,
                            });
                            continue;
                        }
                        if let Some(e) = &entry {
                            if e.reported_state.is_ready() && e.reported_state != record.state {
                                debug!(service = %record.service_id, state = %e.reported_state, "service state changed");
                                record.state = e.reported_state;
                            }
                        }
                        if let Some(usage) = record.resources {
                            self.check_resources(record, usage, &mut alerts, &mut events);
                        }
                    }
                    ServiceState::Unknown | ServiceState::Failed | ServiceState::Stopped => {}
                }
            }
        }

        for alert in alerts {
            self.raise(alert);
        }
        events
    }

    fn check_resources(
        &self,
        record: &HealthRecord,
        usage: ResourceUsage,
        alerts: &mut Vec<Alert>,
        events: &mut Vec<HealthEvent>,
    ) {
        let t = self.config.thresholds;
        let over = |value: Option<f64>, limit: Option<f64>| match (value, limit) {
            (Some(v), Some(l)) if v > l => Some((v, l)),
            _ => None,
        };
        let checks = [
            ("cpu_percent", over(usage.cpu_percent, t.cpu_percent)),
            ("memory_mb", over(usage.memory_mb, t.memory_mb)),
            ("temperature_c", over(usage.temperature_c, t.temperature_c)),
        ];
        for (metric, hit) in checks {
            if let Some((value, limit)) = hit {
                alerts.push(
                    Alert::new(
                        Severity::Warning,
                        AlertKind::ResourceThreshold,
                        record.service_id.clone(),
                        format!("{metric} {value:.1} exceeds {limit:.1}"),
                    )
                    .with_data(json!({ "metric": metric, "value": value, "limit": limit })),
                );
            }
        }
        if let Some((value, limit)) = over(usage.temperature_c, t.emergency_temperature_c) {
            events.push(HealthEvent::EmergencyStop {
                reason: format!(
                    "{} temperature {value:.1}°C above emergency limit {limit:.1}°C",
                    record.service_id
                ),
            });
        }
    }

    /// React to an alert seen on `safety/alerts/+`.
    pub fn handle_safety_alert(&self, alert: &Alert) -> Option<HealthEvent> {
        match alert.severity {
            Severity::Emergency => {
                error!(source = %alert.source, message = %alert.message, "emergency safety alert");
                Some(HealthEvent::EmergencyStop {
                    reason: format!("{}: {}", alert.source, alert.message),
                })
            }
            Severity::Critical => {
                warn!(source = %alert.source, message = %alert.message, "critical safety alert");
                None
            }
            _ => None,
        }
    }

    /// Emit `alert` unless the same `(source, kind)` fired within the
    /// cooldown.  Returns whether it was emitted.
    pub fn raise(&self, alert: Alert) -> bool {
        let now = Instant::now();
        {
            let mut last = self.last_alert.lock().unwrap_or_else(|p| p.into_inner());
            let key = (alert.source.clone(), alert.kind);
            if let Some(at) = last.get(&key) {
                if now.saturating_duration_since(*at) < self.config.alert_cooldown {
                    debug!(source = %alert.source, kind = alert.kind.as_str(), "alert suppressed");
                    return false;
                }
            }
            last.insert(key, now);
        }
        if let Some(client) = &self.publisher {
            let topic = topics::system_event(alert.kind.as_str());
            if let Err(e) = client.publish(&topic, Payload::Alert(alert.clone()), None) {
                warn!(error = %e, "alert publish failed");
            }
        }
        let _ = self.alerts.send(alert);
        true
    }

    /// Publish per-service status and the aggregate summary.
    pub fn publish_summary(&self) {
        let Some(client) = &self.publisher else {
            return;
        };
        for record in self.snapshot() {
            let mut status = ServiceStatus::new(record.service_id.clone(), record.state);
            status.resources = record.resources;
            status.metadata.insert("circuit_state".into(), record.circuit_state.to_string());
            status
                .metadata
                .insert("consecutive_failures".into(), record.consecutive_failures.to_string());
            status.metadata.insert("restarts".into(), record.restarts.to_string());
            if let Some(err) = &record.last_error {
                status.metadata.insert("last_error".into(), err.clone());
            }
            let _ = client.publish(&topics::service_status(&record.service_id), Payload::Status(status), None);
        }
        let summary = self.summary();
        let event = SystemEvent {
            event_type: "health_summary".into(),
            message: format!("{} ({}/{} healthy)", summary.overall, summary.healthy, summary.total),
            data: serde_json::to_value(&summary).unwrap_or_default(),
        };
        let _ = client.publish(topics::SYSTEM_HEALTH, Payload::Event(event), None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::RegistryConfig;

    fn heartbeat(registry: &ServiceRegistry, id: &str, state: ServiceState, resources: Option<ResourceUsage>) {
        let mut s = ServiceStatus::new(id, state);
        s.resources = resources;
        registry.record_heartbeat(&s, Utc::now());
    }

    fn setup() -> (ServiceRegistry, HealthMonitor) {
        let registry = ServiceRegistry::new(RegistryConfig::default());
        let monitor = HealthMonitor::new(HealthConfig::default(), None);
        (registry, monitor)
    }

    #[tokio::test(start_paused = true)]
    async fn starting_service_becomes_ready_on_fresh_heartbeat() {
        let (registry, monitor) = setup();
        monitor.track("comm", false);
        heartbeat(&registry, "comm", ServiceState::Healthy, None);
        tokio::time::advance(Duration::from_millis(10)).await;

        // A heartbeat from before the launch does not count.
        monitor.mark_starting("comm");
        assert!(monitor.evaluate(&registry).is_empty());

        heartbeat(&registry, "comm", ServiceState::Healthy, None);
        assert_eq!(
            monitor.evaluate(&registry),
            vec![HealthEvent::Ready { service_id: "comm".into() }]
        );
        assert_eq!(monitor.state_of("comm"), ServiceState::Healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn ninety_seconds_of_silence_fails_the_service() {
        let (registry, monitor) = setup();
        let mut alerts = monitor.alerts();
        monitor.track("safety", true);
        monitor.mark_starting("safety");
        heartbeat(&registry, "safety", ServiceState::Healthy, None);
        monitor.evaluate(&registry);

        tokio::time::advance(Duration::from_secs(89)).await;
        assert!(monitor.evaluate(&registry).is_empty());

        tokio::time::advance(Duration::from_secs(2)).await;
        let events = monitor.evaluate(&registry);
        assert!(matches!(&events[..], [HealthEvent::Failed { service_id, .. }] if service_id == "safety"));

        let record = monitor.record("safety");
        assert_eq!(record.map(|r| (r.state, r.consecutive_failures)), Some((ServiceState::Failed, 1)));
        let alert = alerts.try_recv().ok();
        assert_eq!(alert.map(|a| (a.kind, a.severity)), Some((AlertKind::ServiceFailed, Severity::Critical)));
    }

    #[tokio::test(start_paused = true)]
    async fn resource_alerts_respect_cooldown() {
        let (registry, monitor) = setup();
        let mut alerts = monitor.alerts();
        monitor.track("vision", false);
        monitor.mark_starting("vision");
        let hot = Some(ResourceUsage {
            cpu_percent: Some(97.0),
            memory_mb: None,
            temperature_c: None,
        });
        heartbeat(&registry, "vision", ServiceState::Healthy, hot);
        monitor.evaluate(&registry);

        monitor.evaluate(&registry);
        monitor.evaluate(&registry);
        assert!(alerts.try_recv().is_ok());
        assert!(alerts.try_recv().is_err());

        tokio::time::advance(Duration::from_secs(61)).await;
        heartbeat(&registry, "vision", ServiceState::Healthy, hot);
        monitor.evaluate(&registry);
        assert!(alerts.try_recv().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn emergency_temperature_requests_stop() {
        let registry = ServiceRegistry::new(RegistryConfig::default());
        let monitor = HealthMonitor::new(
            HealthConfig {
                thresholds: ResourceThresholds {
                    emergency_temperature_c: Some(95.0),
                    ..ResourceThresholds::default()
                },
                ..HealthConfig::default()
            },
            None,
        );
        monitor.track("power", true);
        monitor.mark_starting("power");
        heartbeat(&registry, "power", ServiceState::Healthy, None);
        monitor.evaluate(&registry);

        heartbeat(
            &registry,
            "power",
            ServiceState::Healthy,
            Some(ResourceUsage {
                cpu_percent: None,
                memory_mb: None,
                temperature_c: Some(101.0),
            }),
        );
        let events = monitor.evaluate(&registry);
        assert!(events.iter().any(|e| matches!(e, HealthEvent::EmergencyStop { .. })));
    }

    #[test]
    fn emergency_safety_alert_maps_to_stop() {
        let (_, monitor) = setup();
        let alert = Alert::new(Severity::Emergency, AlertKind::SafetyFault, "bumper", "collision");
        assert!(matches!(
            monitor.handle_safety_alert(&alert),
            Some(HealthEvent::EmergencyStop { .. })
        ));
        let warning = Alert::new(Severity::Warning, AlertKind::SafetyFault, "bumper", "dusty");
        assert!(monitor.handle_safety_alert(&warning).is_none());
    }

    #[test]
    fn summary_flags_critical_failure() {
        let (_, monitor) = setup();
        monitor.track("safety", true);
        monitor.track("vision", false);
        monitor.record_failure("safety", "crashed");
        let summary = monitor.summary();
        assert_eq!(summary.overall, "critical");
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.total, 2);
    }
}
