//! `fieldos-types` – shared data model for the FieldOS substrate.
//!
//! Every crate in the workspace speaks in these types: the message
//! [`Envelope`] and its closed set of [`Payload`] kinds, the service and
//! system state enums, operator-facing [`Alert`]s and the [`FieldError`]
//! taxonomy.
//!
//! # Modules
//!
//! - [`envelope`] – wire envelope, payload kinds, QoS levels and message
//!   priority classes.
//! - [`state`] – service health, circuit breaker and global system states,
//!   including the allowed system transition table.
//! - [`error`] – the error taxonomy shared by every component.

pub mod envelope;
pub mod error;
pub mod state;

pub use envelope::{
    Alert, AlertKind, Command, Envelope, MessagePriority, Payload, QoS, ResourceUsage, Response,
    SCHEMA_VERSION, SensorData, ServiceStatus, Severity, SystemEvent,
};
pub use error::FieldError;
pub use state::{CircuitState, RestartPolicyKind, ServiceState, SystemState};
