//! Operator commands carried on `commands/orchestrator`.
//!
//! The CLI (or any other client) publishes a [`Command`] whose `action` names
//! an [`OperatorAction`]; the daemon replies on `responses/orchestrator`
//! with the same `correlation_id`.
//!
//! | Action | Arguments |
//! |---|---|
//! | `restart_service` | `service` |
//! | `reset_circuit` | `service` |
//! | `enter_maintenance` | `reason` (optional) |
//! | `exit_maintenance` | |
//! | `emergency_stop` | `reason` (optional) |
//! | `manual_reset` | reset token in `auth_token` |
//! | `set_enabled` | `service`, `enabled` |
//! | `shutdown` | |

use std::time::Duration;

use fieldos_middleware::{MessagingClient, topics};
use fieldos_types::{Command, FieldError, Payload, Response};
use serde_json::{Value, json};
use tracing::debug;

pub const RESTART_SERVICE: &str = "restart_service";
pub const RESET_CIRCUIT: &str = "reset_circuit";
pub const ENTER_MAINTENANCE: &str = "enter_maintenance";
pub const EXIT_MAINTENANCE: &str = "exit_maintenance";
pub const EMERGENCY_STOP: &str = "emergency_stop";
pub const MANUAL_RESET: &str = "manual_reset";
pub const SET_ENABLED: &str = "set_enabled";
pub const SHUTDOWN: &str = "shutdown";

/// A parsed operator command.
#[derive(Debug, Clone, PartialEq)]
pub enum OperatorAction {
    RestartService { service: String },
    ResetCircuit { service: String },
    EnterMaintenance { reason: String },
    ExitMaintenance,
    EmergencyStop { reason: String },
    ManualReset { token: String },
    SetEnabled { service: String, enabled: bool },
    Shutdown,
}

impl OperatorAction {
    pub fn parse(command: &Command) -> Result<Self, FieldError> {
        let service = || {
            command
                .arg_str("service")
                .map(str::to_string)
                .ok_or_else(|| FieldError::SchemaValidation(format!("{} requires a 'service' argument", command.action)))
        };
        let reason = |default: &str| command.arg_str("reason").unwrap_or(default).to_string();

        Ok(match command.action.as_str() {
            RESTART_SERVICE => Self::RestartService { service: service()? },
            RESET_CIRCUIT => Self::ResetCircuit { service: service()? },
            ENTER_MAINTENANCE => Self::EnterMaintenance {
                reason: reason("operator request"),
            },
            EXIT_MAINTENANCE => Self::ExitMaintenance,
            EMERGENCY_STOP => Self::EmergencyStop {
                reason: reason("operator emergency stop"),
            },
            MANUAL_RESET => Self::ManualReset {
                token: command
                    .auth_token
                    .clone()
                    .ok_or_else(|| FieldError::Unauthorized("manual_reset requires a reset token".into()))?,
            },
            SET_ENABLED => Self::SetEnabled {
                service: service()?,
                enabled: command
                    .args
                    .get("enabled")
                    .and_then(Value::as_bool)
                    .ok_or_else(|| FieldError::SchemaValidation("set_enabled requires a boolean 'enabled'".into()))?,
            },
            SHUTDOWN => Self::Shutdown,
            other => return Err(FieldError::SchemaValidation(format!("unknown action '{other}'"))),
        })
    }

    pub fn into_command(self) -> Command {
        match self {
            Self::RestartService { service } => Command::new(RESTART_SERVICE).with_args(json!({ "service": service })),
            Self::ResetCircuit { service } => Command::new(RESET_CIRCUIT).with_args(json!({ "service": service })),
            Self::EnterMaintenance { reason } => Command::new(ENTER_MAINTENANCE).with_args(json!({ "reason": reason })),
            Self::ExitMaintenance => Command::new(EXIT_MAINTENANCE),
            Self::EmergencyStop { reason } => Command::new(EMERGENCY_STOP).with_args(json!({ "reason": reason })),
            Self::ManualReset { token } => {
                let mut cmd = Command::new(MANUAL_RESET);
                cmd.auth_token = Some(token);
                cmd
            }
            Self::SetEnabled { service, enabled } => {
                Command::new(SET_ENABLED).with_args(json!({ "service": service, "enabled": enabled }))
            }
            Self::Shutdown => Command::new(SHUTDOWN),
        }
    }
}

pub fn success(command: &Command, message: impl Into<String>, data: Value) -> Response {
    Response {
        correlation_id: command.correlation_id.clone(),
        success: true,
        message: message.into(),
        data,
    }
}

pub fn failure(command: &Command, error: &FieldError) -> Response {
    Response {
        correlation_id: command.correlation_id.clone(),
        success: false,
        message: error.to_string(),
        data: json!({ "error": error.as_label() }),
    }
}

/// Send `action` to the daemon and wait for its reply.
///
/// `client` must be started; the reply subscription is set up before the
/// command is queued so a fast reply is not missed.
pub async fn send_command(
    client: &MessagingClient,
    action: OperatorAction,
    timeout: Duration,
) -> Result<Response, FieldError> {
    let mut replies = client.subscribe(topics::ORCHESTRATOR_RESPONSES)?;
    let correlation_id = uuid::Uuid::new_v4().to_string();
    let mut command = action.into_command();
    command.correlation_id = Some(correlation_id.clone());
    command.reply_to = Some(topics::ORCHESTRATOR_RESPONSES.to_string());
    let action_name = command.action.clone();
    client.publish(topics::ORCHESTRATOR_COMMANDS, Payload::Command(command), None)?;

    let wait = async {
        while let Some(envelope) = replies.recv().await {
            match envelope.payload {
                Payload::Response(r) if r.correlation_id.as_deref() == Some(correlation_id.as_str()) => {
                    return Ok(r);
                }
                _ => debug!(topic = %envelope.topic, "ignoring unrelated reply"),
            }
        }
        Err(FieldError::Closed)
    };
    tokio::time::timeout(timeout, wait)
        .await
        .map_err(|_| FieldError::Timeout(format!("no reply to {action_name} within {}s", timeout.as_secs())))?
}
