//! Typed schema of the main `fieldos` namespace.
//!
//! ```toml
//! [system]
//! name = "rover-7"
//! log_level = "info"
//!
//! [services.comm]
//! critical = true
//! command = { program = "/opt/rover/bin/comm" }
//!
//! [services.hardware]
//! depends_on = ["comm"]
//! restart_policy = "on_failure"
//! max_restarts = 5
//! restart_delay = 2.0
//!
//! [monitoring.alert_thresholds]
//! temperature_c = 75.0
//! ```
//!
//! Every field has a default, so an empty document is a valid configuration.
//! Durations are whole seconds unless the field name says otherwise.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use fieldos_kernel::health::ResourceThresholds;
use fieldos_kernel::{
    HealthConfig, OrchestratorConfig, RegistryConfig, ServiceCommand, ServiceDescriptor, plan_start_order,
};
use fieldos_middleware::{Backoff, BrokerConfig, BrokerFlavor, ClientConfig};
use fieldos_types::RestartPolicyKind;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Name of the main namespace (`<config_dir>/fieldos.toml`).
pub const MAIN_NAMESPACE: &str = "fieldos";

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

// ────────────────────────────────────────────────────────────────────────────
// Document
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(default, deny_unknown_fields)]
pub struct FieldOsConfig {
    pub system: SystemSection,
    /// Managed services keyed by service id.
    pub services: BTreeMap<String, ServiceConfig>,
    pub monitoring: MonitoringSection,
    pub broker: BrokerConfig,
    pub messaging: MessagingSection,
}

#[derive(Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default, deny_unknown_fields)]
pub struct SystemSection {
    pub name: String,
    pub version: String,
    /// `trace`, `debug`, `info`, `warn` or `error`.
    pub log_level: String,
    /// Persisted state, status snapshot, pid file and overrides.
    pub state_dir: PathBuf,
    /// Daemon and per-service log files.
    pub log_dir: PathBuf,
    /// Token required by `system reset` to leave `EMERGENCY_STOP`.
    pub reset_token: Option<String>,
    pub resource_limits: ResourceLimits,
}

impl fmt::Debug for SystemSection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SystemSection")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("log_level", &self.log_level)
            .field("state_dir", &self.state_dir)
            .field("log_dir", &self.log_dir)
            .field(
                "reset_token",
                if self.reset_token.is_some() { &"<redacted>" } else { &"<not set>" },
            )
            .field("resource_limits", &self.resource_limits)
            .finish()
    }
}

impl Default for SystemSection {
    fn default() -> Self {
        Self {
            name: "fieldos".into(),
            version: env!("CARGO_PKG_VERSION").into(),
            log_level: "info".into(),
            state_dir: PathBuf::from("/var/lib/fieldos"),
            log_dir: PathBuf::from("/var/log/fieldos"),
            reset_token: None,
            resource_limits: ResourceLimits::default(),
        }
    }
}

/// Hard limits applying to every managed service.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(default, deny_unknown_fields)]
pub struct ResourceLimits {
    /// A service reporting a temperature above this triggers an emergency stop.
    pub max_temperature_c: Option<f64>,
    /// Memory alert threshold used when `monitoring.alert_thresholds` sets none.
    pub max_memory_mb: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default, deny_unknown_fields)]
pub struct ServiceConfig {
    pub enabled: bool,
    pub critical: bool,
    pub service_type: Option<String>,
    pub depends_on: Vec<String>,
    pub restart_policy: RestartPolicyKind,
    pub max_restarts: u32,
    /// Base restart delay in seconds; doubles on every consecutive failure.
    pub restart_delay: f64,
    pub restart_delay_max: f64,
    /// Sliding window in which failures count towards the circuit breaker.
    pub restart_window_secs: u64,
    /// Defaults to `max_restarts`.
    pub circuit_breaker_threshold: Option<u32>,
    pub circuit_cooldown_secs: u64,
    pub startup_timeout_secs: u64,
    pub stop_grace_secs: u64,
    /// Defaults to `monitoring.heartbeat_interval_secs`.
    pub heartbeat_interval_secs: Option<u64>,
    pub command: Option<CommandConfig>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            critical: false,
            service_type: None,
            depends_on: Vec::new(),
            restart_policy: RestartPolicyKind::OnFailure,
            max_restarts: 3,
            restart_delay: 1.0,
            restart_delay_max: 60.0,
            restart_window_secs: 300,
            circuit_breaker_threshold: None,
            circuit_cooldown_secs: 60,
            startup_timeout_secs: 30,
            stop_grace_secs: 10,
            heartbeat_interval_secs: None,
            command: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct CommandConfig {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

impl From<&CommandConfig> for ServiceCommand {
    fn from(c: &CommandConfig) -> Self {
        ServiceCommand {
            program: c.program.clone(),
            args: c.args.clone(),
            env: c.env.clone(),
            working_dir: c.working_dir.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default, deny_unknown_fields)]
pub struct MonitoringSection {
    /// Orchestrator and health monitor polling interval, in milliseconds.
    pub check_interval_ms: u64,
    pub heartbeat_interval_secs: u64,
    /// Heartbeat intervals of silence before a service counts as failed.
    pub heartbeat_timeout_factor: u32,
    /// How long a silent service stays discoverable after going stale.
    pub stale_grace_secs: u64,
    pub alert_cooldown_secs: u64,
    pub alert_thresholds: AlertThresholds,
}

impl Default for MonitoringSection {
    fn default() -> Self {
        Self {
            check_interval_ms: 1000,
            heartbeat_interval_secs: 30,
            heartbeat_timeout_factor: 3,
            stale_grace_secs: 60,
            alert_cooldown_secs: 60,
            alert_thresholds: AlertThresholds::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default, deny_unknown_fields)]
pub struct AlertThresholds {
    pub cpu_percent: Option<f64>,
    pub memory_mb: Option<f64>,
    pub temperature_c: Option<f64>,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            cpu_percent: Some(90.0),
            memory_mb: None,
            temperature_c: Some(80.0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default, deny_unknown_fields)]
pub struct MessagingSection {
    /// Outbound messages buffered while disconnected.
    pub queue_capacity: usize,
    /// Payloads larger than this many bytes are gzip-compressed.
    pub compression_threshold: usize,
    /// Low-priority queued messages older than this are discarded.
    pub message_ttl_secs: u64,
    pub reconnect_initial_ms: u64,
    pub reconnect_max_secs: u64,
    pub connect_timeout_secs: u64,
}

impl Default for MessagingSection {
    fn default() -> Self {
        Self {
            queue_capacity: 1000,
            compression_threshold: fieldos_middleware::codec::DEFAULT_COMPRESSION_THRESHOLD,
            message_ttl_secs: 300,
            reconnect_initial_ms: 500,
            reconnect_max_secs: 30,
            connect_timeout_secs: 10,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Validation
// ────────────────────────────────────────────────────────────────────────────

impl FieldOsConfig {
    /// Structural checks: values in range, valid service ids, known and
    /// acyclic dependencies, a consistent broker section.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: String| {
            Err(ConfigError::Invalid {
                namespace: MAIN_NAMESPACE.into(),
                reason,
            })
        };

        if !LOG_LEVELS.contains(&self.system.log_level.as_str()) {
            return invalid(format!(
                "system.log_level '{}' is not one of {}",
                self.system.log_level,
                LOG_LEVELS.join(", ")
            ));
        }
        if self.monitoring.check_interval_ms == 0 {
            return invalid("monitoring.check_interval_ms must be positive".into());
        }
        if self.monitoring.heartbeat_interval_secs == 0 || self.monitoring.heartbeat_timeout_factor == 0 {
            return invalid("monitoring heartbeat interval and timeout factor must be positive".into());
        }
        if self.messaging.queue_capacity == 0 {
            return invalid("messaging.queue_capacity must be positive".into());
        }

        for (id, svc) in &self.services {
            if let Err(reason) = validate_service_id(id) {
                return invalid(format!("service id '{id}': {reason}"));
            }
            if !svc.restart_delay.is_finite() || svc.restart_delay < 0.0 {
                return invalid(format!("services.{id}.restart_delay must be a non-negative number"));
            }
            if !svc.restart_delay_max.is_finite() || svc.restart_delay_max < svc.restart_delay {
                return invalid(format!("services.{id}.restart_delay_max must be at least restart_delay"));
            }
            if svc.heartbeat_interval_secs == Some(0) || svc.startup_timeout_secs == 0 {
                return invalid(format!("services.{id}: heartbeat interval and startup timeout must be positive"));
            }
            if svc.circuit_breaker_threshold == Some(0) {
                return invalid(format!("services.{id}.circuit_breaker_threshold must be positive"));
            }
            if svc.command.as_ref().is_some_and(|c| c.program.trim().is_empty()) {
                return invalid(format!("services.{id}.command.program is empty"));
            }
        }

        plan_start_order(&self.service_descriptors()).map_err(|e| ConfigError::Invalid {
            namespace: MAIN_NAMESPACE.into(),
            reason: e.to_string(),
        })?;
        self.broker.validate()?;
        Ok(())
    }

    /// [`validate`](Self::validate) plus what the daemon itself needs: the
    /// native broker flavour and a command for every enabled service.
    pub fn validate_for_daemon(&self) -> Result<(), ConfigError> {
        self.validate()?;
        let invalid = |reason: String| {
            Err(ConfigError::Invalid {
                namespace: MAIN_NAMESPACE.into(),
                reason,
            })
        };
        if self.broker.flavor != BrokerFlavor::Native {
            return invalid("the daemon requires broker.flavor = \"native\"".into());
        }
        if let Some((id, _)) = self
            .services
            .iter()
            .find(|(_, s)| s.enabled && s.command.is_none())
        {
            return invalid(format!("services.{id} is enabled but has no command"));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Component configuration
    // -----------------------------------------------------------------------

    /// One descriptor per configured service, in id order.
    pub fn service_descriptors(&self) -> Vec<ServiceDescriptor> {
        self.services
            .iter()
            .map(|(id, svc)| {
                let mut d = ServiceDescriptor::new(id.clone()).depends_on(svc.depends_on.iter().cloned());
                d.service_type = svc.service_type.clone();
                d.critical = svc.critical;
                d.enabled = svc.enabled;
                d.restart_policy = svc.restart_policy;
                d.max_restarts = svc.max_restarts;
                d.restart_delay_base = secs_f64(svc.restart_delay);
                d.restart_delay_max = secs_f64(svc.restart_delay_max);
                d.restart_window = Duration::from_secs(svc.restart_window_secs);
                d.circuit_breaker_threshold = svc.circuit_breaker_threshold.unwrap_or(svc.max_restarts);
                d.circuit_cooldown = Duration::from_secs(svc.circuit_cooldown_secs);
                d.startup_timeout = Duration::from_secs(svc.startup_timeout_secs);
                d.stop_grace = Duration::from_secs(svc.stop_grace_secs);
                d.heartbeat_interval = Duration::from_secs(
                    svc.heartbeat_interval_secs
                        .unwrap_or(self.monitoring.heartbeat_interval_secs),
                );
                d.command = svc.command.as_ref().map(ServiceCommand::from);
                d
            })
            .collect()
    }

    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            heartbeat_interval: Duration::from_secs(self.monitoring.heartbeat_interval_secs),
            timeout_factor: self.monitoring.heartbeat_timeout_factor,
            stale_grace: Duration::from_secs(self.monitoring.stale_grace_secs),
        }
    }

    pub fn health_config(&self) -> HealthConfig {
        let t = self.monitoring.alert_thresholds;
        HealthConfig {
            alert_cooldown: Duration::from_secs(self.monitoring.alert_cooldown_secs),
            thresholds: ResourceThresholds {
                cpu_percent: t.cpu_percent,
                memory_mb: t.memory_mb.or(self.system.resource_limits.max_memory_mb),
                temperature_c: t.temperature_c,
                emergency_temperature_c: self.system.resource_limits.max_temperature_c,
            },
        }
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            tick_interval: Duration::from_millis(self.monitoring.check_interval_ms),
        }
    }

    /// Messaging client settings for a client named `client_id`.
    pub fn client_config(&self, client_id: &str) -> ClientConfig {
        let m = &self.messaging;
        let mut config = ClientConfig::new(client_id).with_queue_capacity(m.queue_capacity);
        config.compression_threshold = m.compression_threshold;
        config.message_ttl = Duration::from_secs(m.message_ttl_secs);
        config.connect_timeout = Duration::from_secs(m.connect_timeout_secs);
        config.reconnect = Backoff {
            first: Duration::from_millis(m.reconnect_initial_ms),
            max: Duration::from_secs(m.reconnect_max_secs),
            ..Backoff::default()
        };
        config
    }
}

fn secs_f64(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs).unwrap_or_default()
}

/// Service ids become topic segments and file names.
fn validate_service_id(id: &str) -> Result<(), &'static str> {
    if id.is_empty() {
        return Err("empty");
    }
    if id.len() > 64 {
        return Err("longer than 64 characters");
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-'))
    {
        return Err("only ASCII letters, digits, '_' and '-' are allowed");
    }
    Ok(())
}

/// Apply `FIELDOS_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `FIELDOS_LOG_LEVEL` | `system.log_level` |
/// | `FIELDOS_BROKER_PORT` | `broker.port` |
/// | `FIELDOS_STATE_DIR` | `system.state_dir` |
pub fn apply_env_overrides(cfg: &mut FieldOsConfig) {
    if let Ok(v) = std::env::var("FIELDOS_LOG_LEVEL") {
        cfg.system.log_level = v.to_lowercase();
    }
    if let Ok(v) = std::env::var("FIELDOS_BROKER_PORT")
        && let Ok(port) = v.parse::<u16>()
    {
        cfg.broker.port = port;
    }
    if let Ok(v) = std::env::var("FIELDOS_STATE_DIR")
        && !v.is_empty()
    {
        cfg.system.state_dir = PathBuf::from(v);
    }
}

/// JSON Schema of the main namespace.
pub fn json_schema() -> serde_json::Value {
    serde_json::to_value(schemars::schema_for!(FieldOsConfig)).unwrap_or_default()
}
