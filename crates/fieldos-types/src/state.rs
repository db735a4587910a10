//! Service, circuit breaker and global system states.
//!
//! [`SystemState`] encodes the global operating mode together with the table
//! of allowed transitions:
//!
//! ```text
//! INITIALIZING → STARTING → RUNNING ⇄ DEGRADED
//! RUNNING | DEGRADED | STARTING → MAINTENANCE → RUNNING
//! * → ERROR            (except from EMERGENCY_STOP / STOPPED)
//! ERROR → RUNNING | DEGRADED         (critical services recovered)
//! * → EMERGENCY_STOP   (pre-empts everything)
//! RUNNING | DEGRADED | ERROR | MAINTENANCE → SHUTTING_DOWN → STOPPED
//! STOPPED → INITIALIZING             (next run)
//! EMERGENCY_STOP → INITIALIZING      (manual reset only)
//! ```

use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Health of a single managed service as seen by the health monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    #[default]
    Unknown,
    Starting,
    Healthy,
    Degraded,
    Failed,
    Stopped,
}

impl ServiceState {
    /// States in which dependents may rely on the service.
    pub fn is_ready(self) -> bool {
        matches!(self, ServiceState::Healthy | ServiceState::Degraded)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ServiceState::Unknown => "unknown",
            ServiceState::Starting => "starting",
            ServiceState::Healthy => "healthy",
            ServiceState::Degraded => "degraded",
            ServiceState::Failed => "failed",
            ServiceState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-service restart circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation; failures are counted.
    #[default]
    Closed,
    /// Restarts suspended until the cooldown elapses or an operator resets.
    Open,
    /// A single trial restart is permitted.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        })
    }
}

/// When a stopped service should be started again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum RestartPolicyKind {
    /// Restart after any exit, including a clean one.
    Always,
    /// Restart only after a crash or a missed heartbeat.
    #[default]
    OnFailure,
    Never,
}

/// Global operating mode of the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SystemState {
    #[default]
    Initializing,
    Starting,
    Running,
    Degraded,
    Maintenance,
    Error,
    EmergencyStop,
    ShuttingDown,
    Stopped,
}

impl SystemState {
    /// Returns `true` when `self → next` is an allowed transition.
    ///
    /// Self-transitions are never allowed; callers treat them as no-ops.
    pub fn can_transition_to(self, next: SystemState) -> bool {
        use SystemState::*;

        if self == next {
            return false;
        }
        match next {
            EmergencyStop => true,
            Error => !matches!(self, EmergencyStop | Stopped),
            Starting => self == Initializing,
            Running => matches!(self, Starting | Degraded | Maintenance | Error),
            Degraded => matches!(self, Starting | Running | Error),
            Maintenance => matches!(self, Starting | Running | Degraded),
            ShuttingDown => matches!(
                self,
                Initializing | Starting | Running | Degraded | Error | Maintenance
            ),
            Stopped => self == ShuttingDown,
            Initializing => matches!(self, Stopped | EmergencyStop),
        }
    }

    /// States the machine may be operating in.
    pub fn is_operational(self) -> bool {
        matches!(self, SystemState::Running | SystemState::Degraded)
    }

    /// States that survive a restart of the daemon as-is.
    ///
    /// Every other state is transient and resolves to `INITIALIZING` on load.
    pub fn is_sticky(self) -> bool {
        matches!(self, SystemState::EmergencyStop | SystemState::Maintenance)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SystemState::Initializing => "INITIALIZING",
            SystemState::Starting => "STARTING",
            SystemState::Running => "RUNNING",
            SystemState::Degraded => "DEGRADED",
            SystemState::Maintenance => "MAINTENANCE",
            SystemState::Error => "ERROR",
            SystemState::EmergencyStop => "EMERGENCY_STOP",
            SystemState::ShuttingDown => "SHUTTING_DOWN",
            SystemState::Stopped => "STOPPED",
        }
    }
}

impl fmt::Display for SystemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
