//! End-to-end behaviour of a FieldOS instance over the in-memory bus.
//!
//! Services are simulated by [`Fleet`]: launching one spawns a task that
//! feeds heartbeats into the registry until the instance is stopped, the
//! service is frozen, or (for crashing services) exits immediately.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use fieldos_config::{FieldOsConfig, ServiceConfig};
use fieldos_kernel::{ExitKind, LaunchedService, ServiceDescriptor, ServiceLauncher, ServicePhase, ServiceRegistry};
use fieldos_middleware::{
    Backoff, ClientConfig, MemoryTransport, MessageBus, MessagingClient, TopicDefinition, TopicRegistry,
};
use fieldos_runtime::{FieldRuntime, OperatorAction, send_command};
use fieldos_types::{
    Alert, AlertKind, CircuitState, Command, FieldError, MessagePriority, Payload, QoS, SensorData, ServiceState,
    ServiceStatus, Severity, SystemState,
};
use serde_json::json;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

type TestResult = Result<(), Box<dyn std::error::Error>>;

// ────────────────────────────────────────────────────────────────────────────
// Simulated services
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
enum Behaviour {
    /// Heartbeats once `boot` has elapsed.
    Healthy { boot: Duration },
    /// Exits with a failure right after launch.
    Crashing,
}

struct Instance {
    stop: CancellationToken,
    exit: oneshot::Sender<ExitKind>,
}

#[derive(Default)]
struct Fleet {
    registry: OnceLock<Arc<ServiceRegistry>>,
    behaviour: HashMap<String, Behaviour>,
    frozen: Arc<Mutex<HashSet<String>>>,
    launches: Mutex<Vec<String>>,
    instances: Mutex<HashMap<String, Instance>>,
}

impl Fleet {
    fn new(behaviour: &[(&str, Behaviour)]) -> Self {
        Self {
            behaviour: behaviour.iter().map(|(id, b)| (id.to_string(), *b)).collect(),
            ..Self::default()
        }
    }

    fn attach(&self, runtime: &FieldRuntime) {
        let _ = self.registry.set(Arc::clone(runtime.orchestrator().registry()));
    }

    /// The service keeps running but stops sending heartbeats.
    fn freeze(&self, service_id: &str) {
        if let Ok(mut frozen) = self.frozen.lock() {
            frozen.insert(service_id.to_string());
        }
    }

    fn launches(&self) -> Vec<String> {
        self.launches.lock().map(|l| l.clone()).unwrap_or_default()
    }

    fn launch_count(&self, service_id: &str) -> usize {
        self.launches().iter().filter(|id| *id == service_id).count()
    }
}

#[async_trait]
impl ServiceLauncher for Fleet {
    async fn launch(&self, d: &ServiceDescriptor) -> Result<LaunchedService, FieldError> {
        let id = d.service_id.clone();
        if let Ok(mut l) = self.launches.lock() {
            l.push(id.clone());
        }
        let (tx, rx) = oneshot::channel();
        let behaviour = self
            .behaviour
            .get(&id)
            .copied()
            .unwrap_or(Behaviour::Healthy { boot: Duration::ZERO });

        match behaviour {
            Behaviour::Crashing => {
                let _ = tx.send(ExitKind::Failure("exit status: 1".into()));
            }
            Behaviour::Healthy { boot } => {
                let registry = self
                    .registry
                    .get()
                    .cloned()
                    .ok_or_else(|| FieldError::Connection("fleet not attached".into()))?;
                let stop = CancellationToken::new();
                let frozen = Arc::clone(&self.frozen);
                let interval = d.heartbeat_interval;
                let token = stop.clone();
                let service_id = id.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = token.cancelled() => return,
                        _ = tokio::time::sleep(boot) => {}
                    }
                    loop {
                        let silent = frozen.lock().map(|f| f.contains(&service_id)).unwrap_or(false);
                        if !silent {
                            registry.record_heartbeat(
                                &ServiceStatus::new(service_id.clone(), ServiceState::Healthy),
                                Utc::now(),
                            );
                        }
                        tokio::select! {
                            _ = token.cancelled() => break,
                            _ = tokio::time::sleep(interval) => {}
                        }
                    }
                });
                if let Ok(mut instances) = self.instances.lock() {
                    instances.insert(id, Instance { stop, exit: tx });
                }
            }
        }
        Ok(LaunchedService { pid: None, exit: rx })
    }

    async fn stop(&self, service_id: &str, _grace: Duration) -> Result<(), FieldError> {
        let instance = self.instances.lock().ok().and_then(|mut i| i.remove(service_id));
        if let Some(instance) = instance {
            instance.stop.cancel();
            let _ = instance.exit.send(ExitKind::Clean);
        }
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Harness
// ────────────────────────────────────────────────────────────────────────────

fn base_config(dir: &Path) -> FieldOsConfig {
    let mut cfg = FieldOsConfig::default();
    cfg.system.state_dir = dir.join("state");
    cfg.system.log_dir = dir.join("log");
    cfg.system.reset_token = Some("field-reset".into());
    cfg.monitoring.check_interval_ms = 500;
    cfg
}

fn service(depends_on: &[&str]) -> ServiceConfig {
    ServiceConfig {
        depends_on: depends_on.iter().map(|s| s.to_string()).collect(),
        ..ServiceConfig::default()
    }
}

fn fast_backoff() -> Backoff {
    Backoff {
        first: Duration::from_millis(10),
        max: Duration::from_millis(50),
        factor: 2.0,
        jitter: 0.0,
    }
}

struct Harness {
    _dir: tempfile::TempDir,
    bus: Arc<MessageBus>,
    fleet: Arc<Fleet>,
    runtime: Arc<FieldRuntime>,
}

impl Harness {
    async fn new(
        dir: tempfile::TempDir,
        cfg: FieldOsConfig,
        fleet: Fleet,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let bus = Arc::new(MessageBus::default());
        let mut client_config = cfg.client_config("fieldos");
        client_config.reconnect = fast_backoff();
        let client = MessagingClient::new(
            client_config,
            Arc::new(TopicRegistry::with_defaults()),
            Arc::new(MemoryTransport::new(Arc::clone(&bus))),
        );
        client.connect().await?;

        let fleet = Arc::new(fleet);
        let runtime = FieldRuntime::new(cfg, client, fleet.clone())?;
        fleet.attach(&runtime);
        runtime.spawn_background()?;
        Ok(Self {
            _dir: dir,
            bus,
            fleet,
            runtime,
        })
    }

    async fn operator(&self) -> Result<MessagingClient, FieldError> {
        let mut config = ClientConfig::new("operator");
        config.reconnect = fast_backoff();
        let client = MessagingClient::new(
            config,
            Arc::new(TopicRegistry::with_defaults()),
            Arc::new(MemoryTransport::new(Arc::clone(&self.bus))),
        );
        client.connect().await?;
        Ok(client)
    }

    fn phase(&self, id: &str) -> Option<ServicePhase> {
        self.runtime.orchestrator().phase(id)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Startup ordering
// ────────────────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn dependency_chain_starts_in_order_and_runs_once_all_are_healthy() -> TestResult {
    let dir = tempfile::tempdir()?;
    let mut cfg = base_config(dir.path());
    cfg.services.insert("comm".into(), service(&[]));
    cfg.services.insert("data".into(), service(&[]));
    cfg.services.insert("hardware".into(), service(&["comm"]));
    cfg.services.insert("safety".into(), service(&["hardware"]));
    let fleet = Fleet::new(&[(
        "hardware",
        Behaviour::Healthy {
            boot: Duration::from_secs(5),
        },
    )]);
    let h = Harness::new(dir, cfg, fleet).await?;

    let starter = {
        let runtime = Arc::clone(&h.runtime);
        tokio::spawn(async move { runtime.start().await })
    };

    // Hardware is still booting: safety waits, the system is not running.
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(h.runtime.system_state(), SystemState::Starting);
    assert_eq!(h.phase("hardware"), Some(ServicePhase::Starting));
    assert!(!h.fleet.launches().contains(&"safety".to_string()));

    let report = starter.await??;
    assert!(report.failed.is_empty() && report.blocked.is_empty());

    let launches = h.fleet.launches();
    assert_eq!(launches.len(), 4);
    assert_eq!(launches[0], "comm");
    assert_eq!(launches[3], "safety");
    let middle: HashSet<&str> = launches[1..3].iter().map(String::as_str).collect();
    assert_eq!(middle, HashSet::from(["data", "hardware"]));

    assert_eq!(h.runtime.system_state(), SystemState::Running);
    for id in ["comm", "data", "hardware", "safety"] {
        assert_eq!(h.phase(id), Some(ServicePhase::Running), "{id}");
    }
    h.runtime.stop().await?;
    Ok(())
}

// ────────────────────────────────────────────────────────────────────────────
// Failure handling
// ────────────────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn crash_looping_optional_service_degrades_without_error() -> TestResult {
    let dir = tempfile::tempdir()?;
    let mut cfg = base_config(dir.path());
    cfg.services.insert("comm".into(), service(&[]));
    cfg.services.insert("navigation".into(), service(&["comm"]));
    cfg.services.insert(
        "vision".into(),
        ServiceConfig {
            max_restarts: 5,
            restart_delay: 0.5,
            restart_delay_max: 4.0,
            ..service(&[])
        },
    );
    let h = Harness::new(dir, cfg, Fleet::new(&[("vision", Behaviour::Crashing)])).await?;

    let report = h.runtime.start().await?;
    assert_eq!(report.failed, vec!["vision"]);
    assert_eq!(h.runtime.system_state(), SystemState::Degraded);

    // Backoff 0.5 + 1 + 2 + 4 seconds, well inside the circuit cooldown.
    tokio::time::sleep(Duration::from_secs(30)).await;
    let orchestrator = h.runtime.orchestrator();
    assert_eq!(orchestrator.circuit_state("vision"), Some(CircuitState::Open));
    assert_eq!(h.phase("vision"), Some(ServicePhase::Suspended));
    assert_eq!(h.fleet.launch_count("vision"), 5);

    assert_eq!(h.runtime.system_state(), SystemState::Degraded);
    assert_eq!(h.phase("comm"), Some(ServicePhase::Running));
    assert_eq!(h.phase("navigation"), Some(ServicePhase::Running));

    let snapshot = h.runtime.snapshot(None).await;
    let open: Vec<&str> = snapshot.open_circuits().map(|s| s.service_id.as_str()).collect();
    assert_eq!(open, vec!["vision"]);
    h.runtime.stop().await?;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn silent_critical_service_is_restarted_then_errors() -> TestResult {
    let dir = tempfile::tempdir()?;
    let mut cfg = base_config(dir.path());
    cfg.services.insert("comm".into(), service(&[]));
    cfg.services.insert(
        "safety".into(),
        ServiceConfig {
            critical: true,
            max_restarts: 2,
            restart_delay: 1.0,
            startup_timeout_secs: 10,
            ..service(&[])
        },
    );
    let h = Harness::new(dir, cfg, Fleet::new(&[])).await?;
    h.runtime.start().await?;
    assert_eq!(h.runtime.system_state(), SystemState::Running);

    h.fleet.freeze("safety");

    // Heartbeat every 30s, failed after three silent intervals.
    tokio::time::sleep(Duration::from_secs(80)).await;
    assert_eq!(h.phase("safety"), Some(ServicePhase::Running));
    assert_eq!(h.runtime.system_state(), SystemState::Running);

    tokio::time::sleep(Duration::from_secs(15)).await;
    assert_eq!(h.fleet.launch_count("safety"), 2, "one restart attempt after the timeout");
    let record = h
        .runtime
        .orchestrator()
        .health()
        .record("safety")
        .ok_or("safety not tracked")?;
    assert!(record.last_error.is_some_and(|e| e.contains("no heartbeat")));

    // The restarted instance never reports healthy; the circuit opens.
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(h.phase("safety"), Some(ServicePhase::Suspended));
    assert_eq!(h.runtime.system_state(), SystemState::Error);
    assert_eq!(h.phase("comm"), Some(ServicePhase::Running));
    h.runtime.stop().await?;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn broker_loss_keeps_the_system_in_error() -> TestResult {
    let dir = tempfile::tempdir()?;
    let mut cfg = base_config(dir.path());
    cfg.services.insert("comm".into(), service(&[]));
    let h = Harness::new(dir, cfg, Fleet::new(&[])).await?;
    h.runtime.start().await?;
    assert_eq!(h.runtime.system_state(), SystemState::Running);

    h.runtime
        .on_broker_unavailable(Alert::new(
            Severity::Critical,
            AlertKind::BrokerUnavailable,
            "broker",
            "broker exited 3 times, giving up",
        ))
        .await;
    // Services stay healthy, but nothing heals a lost broker.
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(h.phase("comm"), Some(ServicePhase::Running));
    assert_eq!(h.runtime.system_state(), SystemState::Error);
    h.runtime.stop().await?;
    Ok(())
}

// ────────────────────────────────────────────────────────────────────────────
// Operator commands
// ────────────────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn emergency_stop_needs_the_reset_token() -> TestResult {
    let dir = tempfile::tempdir()?;
    let mut cfg = base_config(dir.path());
    cfg.services.insert("comm".into(), service(&[]));
    cfg.services.insert("hardware".into(), service(&["comm"]));
    let h = Harness::new(dir, cfg, Fleet::new(&[])).await?;
    h.runtime.start().await?;
    let ops = h.operator().await?;
    let timeout = Duration::from_secs(5);

    let reply = send_command(
        &ops,
        OperatorAction::EmergencyStop {
            reason: "obstacle in work zone".into(),
        },
        timeout,
    )
    .await?;
    assert!(reply.success, "{}", reply.message);
    assert_eq!(reply.data["entered"], true);
    assert_eq!(h.runtime.system_state(), SystemState::EmergencyStop);

    let reply = send_command(&ops, OperatorAction::ManualReset { token: "guess".into() }, timeout).await?;
    assert!(!reply.success);
    assert_eq!(reply.data["error"], "unauthorized");
    assert_eq!(h.runtime.system_state(), SystemState::EmergencyStop);

    let reply = send_command(
        &ops,
        OperatorAction::ManualReset {
            token: "field-reset".into(),
        },
        timeout,
    )
    .await?;
    assert!(reply.success, "{}", reply.message);

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(h.runtime.system_state(), SystemState::Running);
    // Healthy instances survived the stop and were kept.
    assert_eq!(h.fleet.launch_count("comm"), 1);
    assert_eq!(h.fleet.launch_count("hardware"), 1);
    h.runtime.stop().await?;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn disabling_a_service_persists_and_stops_it() -> TestResult {
    let dir = tempfile::tempdir()?;
    let mut cfg = base_config(dir.path());
    let state_dir = cfg.system.state_dir.clone();
    cfg.services.insert("comm".into(), service(&[]));
    cfg.services.insert("weather".into(), service(&[]));
    let h = Harness::new(dir, cfg, Fleet::new(&[])).await?;
    h.runtime.start().await?;
    let ops = h.operator().await?;

    let disable = OperatorAction::SetEnabled {
        service: "weather".into(),
        enabled: false,
    };
    let reply = send_command(&ops, disable.clone(), Duration::from_secs(5)).await?;
    assert!(reply.success, "{}", reply.message);
    assert_eq!(reply.data["changed"], true);
    assert_eq!(h.phase("weather"), Some(ServicePhase::Disabled));
    assert!(!fieldos_config::ServiceOverrides::load(&state_dir)?.is_enabled("weather", true));

    let reply = send_command(&ops, disable, Duration::from_secs(5)).await?;
    assert_eq!(reply.data["changed"], false);

    let unknown = send_command(
        &ops,
        OperatorAction::RestartService {
            service: "ghost".into(),
        },
        Duration::from_secs(5),
    )
    .await?;
    assert!(!unknown.success);
    h.runtime.stop().await?;
    Ok(())
}

// ────────────────────────────────────────────────────────────────────────────
// Offline publishing
// ────────────────────────────────────────────────────────────────────────────

fn reading(n: u64) -> Payload {
    Payload::SensorData(SensorData {
        sensor_id: "lidar".into(),
        sensor_type: "lidar".into(),
        values: json!({ "n": n }),
    })
}

#[tokio::test]
async fn offline_overflow_drops_only_oldest_telemetry() -> TestResult {
    let bus = Arc::new(MessageBus::default());
    let rover_link = Arc::new(MemoryTransport::new(Arc::clone(&bus)));
    rover_link.sever();

    // Ground station listening on the same broker.
    let mut ground_config = ClientConfig::new("ground");
    ground_config.subscription_capacity = 2048;
    let ground = MessagingClient::new(
        ground_config,
        Arc::new(TopicRegistry::with_defaults()),
        Arc::new(MemoryTransport::new(Arc::clone(&bus))),
    );
    ground.connect().await?;
    let mut telemetry = ground.subscribe("sensors/+/data")?;
    let mut commands = ground.subscribe("commands/+")?;
    let mut events = ground.subscribe("system/events/+")?;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut topics = TopicRegistry::empty();
    topics.register(TopicDefinition::new("sensors/+/data", QoS::AtLeastOnce, false).with_priority(MessagePriority::Telemetry))?;
    topics.register(TopicDefinition::new("commands/+", QoS::ExactlyOnce, false).with_priority(MessagePriority::Command))?;
    let mut config = ClientConfig::new("rover").with_queue_capacity(1000);
    config.reconnect = fast_backoff();
    let rover = MessagingClient::new(config, Arc::new(topics), rover_link.clone());
    rover.start();

    for n in 0..1400 {
        rover.publish("sensors/lidar/data", reading(n), None)?;
    }
    for n in 0..100 {
        rover.publish(
            "commands/arm",
            Payload::Command(Command::new("move").with_args(json!({ "step": n }))),
            None,
        )?;
    }
    let stats = rover.get_stats();
    assert_eq!(stats.dropped, 500);
    assert_eq!(stats.dropped_critical, 0);
    assert_eq!(stats.queued, 1000);

    rover_link.restore();
    let wait = Duration::from_secs(5);

    for n in 0..100 {
        let env = tokio::time::timeout(wait, commands.recv()).await?.ok_or("commands closed")?;
        match env.payload {
            Payload::Command(c) => assert_eq!(c.args["step"], n),
            other => panic!("unexpected payload {other:?}"),
        }
    }
    // The oldest readings were the ones dropped.
    let first = tokio::time::timeout(wait, telemetry.recv()).await?.ok_or("telemetry closed")?;
    match first.payload {
        Payload::SensorData(s) => assert_eq!(s.values["n"], 500),
        other => panic!("unexpected payload {other:?}"),
    }

    let summary = tokio::time::timeout(wait, events.recv()).await?.ok_or("events closed")?;
    assert_eq!(summary.topic, "system/events/queue_overflow");
    match summary.payload {
        Payload::Alert(alert) => {
            assert_eq!(alert.kind, AlertKind::QueueOverflow);
            assert_eq!(alert.source, "rover");
            assert_eq!(alert.data["dropped"], 500);
        }
        other => panic!("unexpected payload {other:?}"),
    }
    rover.close().await;
    ground.close().await;
    Ok(())
}
