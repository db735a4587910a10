use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error taxonomy shared by every FieldOS component.
///
/// Only [`FieldError::CriticalSafetyFailure`] is fatal to current operation;
/// every other variant is handled locally by retrying, restarting or
/// rejecting and keeping the previous value.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Schema validation failed: {0}")]
    SchemaValidation(String),

    #[error("Service failure in {service}: {reason}")]
    ServiceFailure { service: String, reason: String },

    #[error("Circuit open for {0}: restarts suspended")]
    CircuitOpen(String),

    #[error("Resource exhausted: {0}")]
    ResourceExhaustion(String),

    #[error("Configuration rejected: {0}")]
    ConfigValidation(String),

    #[error("Critical safety failure: {0}")]
    CriticalSafetyFailure(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid topic '{topic}': {reason}")]
    InvalidTopic { topic: String, reason: String },

    #[error("Transition {from} -> {to} is not allowed")]
    InvalidTransition { from: String, to: String },

    #[error("Dependency cycle between services: {}", .0.join(" -> "))]
    DependencyCycle(Vec<String>),

    #[error("Unknown service: {0}")]
    UnknownService(String),

    #[error("Broker unavailable: {0}")]
    BrokerUnavailable(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Closed")]
    Closed,
}

impl FieldError {
    /// Stable snake_case label for logs, alerts and the status snapshot.
    pub fn as_label(&self) -> &'static str {
        match self {
            FieldError::Connection(_) => "connection_error",
            FieldError::SchemaValidation(_) => "schema_validation_error",
            FieldError::ServiceFailure { .. } => "service_failure",
            FieldError::CircuitOpen(_) => "circuit_open",
            FieldError::ResourceExhaustion(_) => "resource_exhaustion",
            FieldError::ConfigValidation(_) => "config_validation_error",
            FieldError::CriticalSafetyFailure(_) => "critical_safety_failure",
            FieldError::Io(_) => "io_error",
            FieldError::Serialization(_) => "serialization_error",
            FieldError::InvalidTopic { .. } => "invalid_topic",
            FieldError::InvalidTransition { .. } => "invalid_transition",
            FieldError::DependencyCycle(_) => "dependency_cycle",
            FieldError::UnknownService(_) => "unknown_service",
            FieldError::BrokerUnavailable(_) => "broker_unavailable",
            FieldError::Unauthorized(_) => "unauthorized",
            FieldError::Timeout(_) => "timeout",
            FieldError::Closed => "closed",
        }
    }

    /// `true` only for conditions that must force a global state transition.
    pub fn is_fatal(&self) -> bool {
        matches!(self, FieldError::CriticalSafetyFailure(_))
    }
}

impl From<std::io::Error> for FieldError {
    fn from(err: std::io::Error) -> Self {
        FieldError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for FieldError {
    fn from(err: serde_json::Error) -> Self {
        FieldError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_safety_failures_are_fatal() {
        assert!(FieldError::CriticalSafetyFailure("estop".into()).is_fatal());
        assert!(!FieldError::CircuitOpen("vision".into()).is_fatal());
        assert!(!FieldError::Connection("refused".into()).is_fatal());
    }

    #[test]
    fn display_and_labels() {
        let err = FieldError::DependencyCycle(vec!["a".into(), "b".into(), "a".into()]);
        assert_eq!(err.to_string(), "Dependency cycle between services: a -> b -> a");
        assert_eq!(err.as_label(), "dependency_cycle");

        let err = FieldError::ServiceFailure {
            service: "safety".into(),
            reason: "missed heartbeat".into(),
        };
        assert!(err.to_string().contains("safety"));
        assert_eq!(err.as_label(), "service_failure");
    }

    #[test]
    fn io_errors_convert() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: FieldError = io.into();
        assert!(matches!(err, FieldError::Io(ref m) if m.contains("gone")));
    }
}
