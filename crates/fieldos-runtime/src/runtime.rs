//! [`FieldRuntime`] – one supervised FieldOS instance.
//!
//! Builds the kernel components from a [`FieldOsConfig`] around a messaging
//! client and a launcher, then runs the background tasks that feed them:
//!
//! ```text
//!  system/heartbeat/+ ──► ServiceRegistry ──┐
//!  safety/alerts/+ ─────► HealthMonitor ────┼──► Orchestrator ──► StateMachine
//!  safety/emergency_stop ───────────────────┤
//!  commands/orchestrator ──► OperatorAction ┘
//! ```
//!
//! The runtime does not own the broker or the process; the daemon does.
//! Tests drive it over an in-memory bus with simulated services.

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use fieldos_config::{FieldOsConfig, ServiceOverrides};
use fieldos_kernel::state_machine::STATE_FILE;
use fieldos_kernel::{
    HealthEvent, HealthMonitor, Orchestrator, ServiceDescriptor, ServiceLauncher, ServiceRegistry, StartReport,
    StateMachine,
};
use fieldos_middleware::{BrokerStatus, MessagingClient, topics};
use fieldos_types::{Alert, Command, Envelope, FieldError, Payload, Response, SystemState};
use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::commands::{self, OperatorAction};
use crate::status::{ServiceLine, StatusSnapshot};

pub struct FieldRuntime {
    config: RwLock<FieldOsConfig>,
    client: MessagingClient,
    orchestrator: Arc<Orchestrator>,
    shutdown: CancellationToken,
    /// Retained safety messages older than this belong to an earlier run.
    started_at: DateTime<Utc>,
}

impl FieldRuntime {
    /// Assemble registry, health monitor, state machine and orchestrator.
    ///
    /// Operator overrides from the state directory are applied to the
    /// configured services.  Fails on a dependency cycle or an unreadable
    /// state directory.
    pub fn new(
        config: FieldOsConfig,
        client: MessagingClient,
        launcher: Arc<dyn ServiceLauncher>,
    ) -> Result<Arc<Self>, FieldError> {
        let state_dir = config.system.state_dir.clone();
        std::fs::create_dir_all(&state_dir)?;

        let descriptors = descriptors_for(&config)?;
        let registry = Arc::new(ServiceRegistry::new(config.registry_config()));
        let health = Arc::new(HealthMonitor::new(config.health_config(), Some(client.clone())));
        let state = Arc::new(StateMachine::open(
            state_dir.join(STATE_FILE),
            Some(client.clone()),
            config.system.reset_token.clone(),
        )?);
        let orchestrator = Arc::new(Orchestrator::new(
            config.orchestrator_config(),
            descriptors,
            launcher,
            registry,
            health,
            state,
        )?);

        Ok(Arc::new(Self {
            config: RwLock::new(config),
            client,
            orchestrator,
            shutdown: CancellationToken::new(),
            started_at: Utc::now(),
        }))
    }

    fn config(&self) -> RwLockReadGuard<'_, FieldOsConfig> {
        self.config.read().unwrap_or_else(|p| p.into_inner())
    }

    fn config_mut(&self) -> RwLockWriteGuard<'_, FieldOsConfig> {
        self.config.write().unwrap_or_else(|p| p.into_inner())
    }

    pub fn current_config(&self) -> FieldOsConfig {
        self.config().clone()
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    pub fn client(&self) -> &MessagingClient {
        &self.client
    }

    pub fn system_state(&self) -> SystemState {
        self.orchestrator.state_machine().current()
    }

    /// Cancelled when a shutdown was requested (operator command or signal).
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn request_shutdown(&self) {
        self.shutdown.cancel();
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Start the heartbeat listener, the safety and command listeners and
    /// the supervision loop.  They all end when shutdown is requested.
    pub fn spawn_background(self: &Arc<Self>) -> Result<Vec<JoinHandle<()>>, FieldError> {
        let sweep = Duration::from_millis(self.config().monitoring.check_interval_ms);
        let mut handles = vec![self
            .orchestrator
            .registry()
            .spawn_listener(&self.client, sweep, self.shutdown.clone())?];
        handles.push(self.spawn_safety_listener()?);
        handles.push(self.spawn_command_listener()?);
        handles.push(tokio::spawn(
            Arc::clone(&self.orchestrator).run(self.shutdown.clone()),
        ));
        Ok(handles)
    }

    /// Start every enabled service in dependency order.
    pub async fn start(&self) -> Result<StartReport, FieldError> {
        let report = self.orchestrator.start_all().await?;
        info!(
            started = report.started.len(),
            failed = report.failed.len(),
            blocked = report.blocked.len(),
            state = %self.system_state(),
            "start sequence finished"
        );
        Ok(report)
    }

    /// Stop every service and end the background tasks.
    pub async fn stop(&self) -> Result<(), FieldError> {
        self.shutdown.cancel();
        self.orchestrator.stop_all().await
    }

    // -----------------------------------------------------------------------
    // Reconfiguration
    // -----------------------------------------------------------------------

    /// Adopt a reloaded configuration.
    ///
    /// The service set is reconciled live.  Monitoring, messaging and broker
    /// settings only take effect after a daemon restart.
    pub async fn apply_config(&self, config: FieldOsConfig) -> Result<(), FieldError> {
        let descriptors = descriptors_for(&config)?;
        {
            let current = self.config();
            if current.monitoring != config.monitoring
                || current.messaging != config.messaging
                || current.broker != config.broker
            {
                warn!("monitoring, messaging and broker changes apply after a restart");
            }
        }
        self.orchestrator.apply_descriptors(descriptors).await?;
        *self.config_mut() = config;
        info!("configuration applied");
        Ok(())
    }

    /// Persist an operator enable/disable decision and apply it.
    /// Returns whether anything changed.
    pub async fn set_enabled(&self, service_id: &str, enabled: bool) -> Result<bool, FieldError> {
        let config = self.current_config();
        if !config.services.contains_key(service_id) {
            return Err(FieldError::UnknownService(service_id.to_string()));
        }
        let state_dir = &config.system.state_dir;
        let mut overrides = ServiceOverrides::load(state_dir)?;
        if !overrides.set_enabled(service_id, enabled) {
            return Ok(false);
        }
        overrides.save(state_dir)?;
        self.orchestrator.apply_descriptors(descriptors_for(&config)?).await?;
        Ok(true)
    }

    // -----------------------------------------------------------------------
    // Operator commands
    // -----------------------------------------------------------------------

    /// Execute `command` and build the reply.
    pub async fn handle_command(&self, command: &Command) -> Response {
        let action = match OperatorAction::parse(command) {
            Ok(action) => action,
            Err(e) => {
                warn!(action = %command.action, error = %e, "rejected operator command");
                return commands::failure(command, &e);
            }
        };
        info!(action = %command.action, "operator command");
        match self.execute(action).await {
            Ok((message, data)) => commands::success(command, message, data),
            Err(e) => {
                warn!(action = %command.action, error = %e, "operator command failed");
                commands::failure(command, &e)
            }
        }
    }

    pub async fn execute(&self, action: OperatorAction) -> Result<(String, Value), FieldError> {
        let state = self.orchestrator.state_machine();
        match action {
            OperatorAction::RestartService { service } => {
                self.orchestrator.restart(&service).await?;
                Ok((format!("{service} restarted"), Value::Null))
            }
            OperatorAction::ResetCircuit { service } => {
                self.orchestrator.reset_circuit(&service).await?;
                Ok((format!("circuit of {service} reset"), Value::Null))
            }
            OperatorAction::EnterMaintenance { reason } => {
                state
                    .transition(SystemState::Maintenance, &reason, json!({ "reason": reason }))
                    .await?;
                Ok(("maintenance mode entered".into(), Value::Null))
            }
            OperatorAction::ExitMaintenance => {
                let current = state.current();
                if current != SystemState::Maintenance {
                    return Err(FieldError::InvalidTransition {
                        from: current.to_string(),
                        to: SystemState::Running.to_string(),
                    });
                }
                state
                    .transition(SystemState::Running, "maintenance finished", json!({}))
                    .await?;
                self.orchestrator.reconcile_system_state().await;
                Ok(("maintenance mode left".into(), json!({ "state": state.current() })))
            }
            OperatorAction::EmergencyStop { reason } => {
                let entered = self.orchestrator.emergency_stop(&reason).await?;
                let message = if entered {
                    "emergency stop engaged"
                } else {
                    "emergency stop already active"
                };
                Ok((message.into(), json!({ "entered": entered })))
            }
            OperatorAction::ManualReset { token } => {
                state.manual_reset(&token).await?;
                // Resume in the background; the reply must not wait for startup.
                let orchestrator = Arc::clone(&self.orchestrator);
                tokio::spawn(async move {
                    if let Err(e) = orchestrator.start_all().await {
                        error!(error = %e, "restart after manual reset failed");
                    }
                });
                Ok(("manual reset accepted, restarting services".into(), Value::Null))
            }
            OperatorAction::SetEnabled { service, enabled } => {
                let changed = self.set_enabled(&service, enabled).await?;
                let verb = if enabled { "enabled" } else { "disabled" };
                let message = if changed {
                    format!("{service} {verb}")
                } else {
                    format!("{service} already {verb}")
                };
                Ok((message, json!({ "changed": changed })))
            }
            OperatorAction::Shutdown => {
                self.shutdown.cancel();
                Ok(("shutting down".into(), Value::Null))
            }
        }
    }

    // -----------------------------------------------------------------------
    // Status
    // -----------------------------------------------------------------------

    pub async fn snapshot(&self, broker: Option<BrokerStatus>) -> StatusSnapshot {
        let record = self.orchestrator.state_machine().record().await;
        StatusSnapshot {
            written_at: Utc::now(),
            pid: std::process::id(),
            system_state: record.current_state,
            previous_state: record.previous_state,
            summary: self.orchestrator.health().summary(),
            services: self.orchestrator.services().iter().map(ServiceLine::from).collect(),
            broker,
        }
    }

    // -----------------------------------------------------------------------
    // Listeners
    // -----------------------------------------------------------------------

    fn spawn_command_listener(self: &Arc<Self>) -> Result<JoinHandle<()>, FieldError> {
        let mut commands = self.client.subscribe(topics::ORCHESTRATOR_COMMANDS)?;
        let runtime = Arc::clone(self);
        Ok(tokio::spawn(async move {
            loop {
                let envelope = tokio::select! {
                    _ = runtime.shutdown.cancelled() => break,
                    msg = commands.recv() => match msg {
                        Some(envelope) => envelope,
                        None => break,
                    },
                };
                let Payload::Command(command) = envelope.payload else {
                    continue;
                };
                let reply = runtime.handle_command(&command).await;
                let topic = command
                    .reply_to
                    .as_deref()
                    .unwrap_or(topics::ORCHESTRATOR_RESPONSES);
                if let Err(e) = runtime.client.publish(topic, Payload::Response(reply), None) {
                    warn!(error = %e, "could not publish command reply");
                }
            }
        }))
    }

    fn spawn_safety_listener(self: &Arc<Self>) -> Result<JoinHandle<()>, FieldError> {
        let mut alerts = self.client.subscribe(topics::SAFETY_ALERTS_FILTER)?;
        let mut estop = self.client.subscribe(topics::EMERGENCY_STOP)?;
        let runtime = Arc::clone(self);
        Ok(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = runtime.shutdown.cancelled() => break,
                    msg = alerts.recv() => match msg {
                        Some(envelope) => runtime.on_safety_alert(envelope).await,
                        None => break,
                    },
                    msg = estop.recv() => match msg {
                        Some(envelope) => runtime.on_emergency_stop(envelope).await,
                        None => break,
                    },
                }
            }
        }))
    }

    /// The broker supervisor gave up: nothing can talk any more.
    pub async fn on_broker_unavailable(&self, alert: Alert) {
        error!(message = %alert.message, "broker unavailable");
        let reason = alert.message.clone();
        self.orchestrator.health().raise(alert);
        if let Err(e) = self
            .orchestrator
            .hold_error(&reason, json!({ "source": "broker" }))
            .await
        {
            warn!(error = %e, "could not enter ERROR after broker loss");
        }
    }

    fn is_stale(&self, envelope: &Envelope) -> bool {
        envelope.timestamp < self.started_at
    }

    async fn on_safety_alert(&self, envelope: Envelope) {
        if self.is_stale(&envelope) {
            return;
        }
        let Payload::Alert(alert) = envelope.payload else {
            return;
        };
        if let Some(HealthEvent::EmergencyStop { reason }) = self.orchestrator.health().handle_safety_alert(&alert) {
            if let Err(e) = self.orchestrator.emergency_stop(&reason).await {
                error!(error = %e, "emergency stop failed");
            }
        }
    }

    async fn on_emergency_stop(&self, envelope: Envelope) {
        // Our own broadcast of an emergency stop we already entered.
        if envelope.sender == self.client.client_id() || self.is_stale(&envelope) {
            return;
        }
        let reason = match &envelope.payload {
            Payload::Alert(alert) => format!("{}: {}", alert.source, alert.message),
            _ => format!("emergency stop requested by {}", envelope.sender),
        };
        if let Err(e) = self.orchestrator.emergency_stop(&reason).await {
            error!(error = %e, "emergency stop failed");
        }
    }
}

/// Descriptors of `config` with the operator overrides applied.
pub fn descriptors_for(config: &FieldOsConfig) -> Result<Vec<ServiceDescriptor>, FieldError> {
    let overrides = ServiceOverrides::load(&config.system.state_dir)?;
    let mut descriptors = config.service_descriptors();
    overrides.apply(&mut descriptors);
    Ok(descriptors)
}
