//! `fieldos-kernel` – Orchestration & Health
//!
//! Decides which services run, in what order, and what happens when they
//! fail.  It never looks inside a message; it only watches heartbeats and
//! process exits.
//!
//! # Modules
//!
//! - [`registry`] – [`ServiceRegistry`][registry::ServiceRegistry]: live
//!   service instances discovered from heartbeats, aged out when silent.
//! - [`health`] – [`HealthMonitor`][health::HealthMonitor]: per-service
//!   health table, resource thresholds and rate-limited alerts.
//! - [`circuit_breaker`] – [`CircuitBreaker`][circuit_breaker::CircuitBreaker]:
//!   suspends restarts of a service that keeps failing.
//! - [`restart`] – [`RestartPolicy`][restart::RestartPolicy]: whether and
//!   when a stopped service comes back.
//! - [`state_machine`] – [`StateMachine`][state_machine::StateMachine]: the
//!   persisted global system state and its transition table.
//! - [`descriptor`] – static description of a managed service.
//! - [`launcher`] – [`ServiceLauncher`][launcher::ServiceLauncher]: turns a
//!   descriptor into a running process.
//! - [`orchestrator`] – [`Orchestrator`][orchestrator::Orchestrator]:
//!   dependency-ordered start, supervision loop and operator actions.

pub mod circuit_breaker;
pub mod descriptor;
pub mod health;
pub mod launcher;
pub mod orchestrator;
pub mod registry;
pub mod restart;
pub mod state_machine;

pub use circuit_breaker::CircuitBreaker;
pub use descriptor::{ServiceCommand, ServiceDescriptor};
pub use health::{HealthConfig, HealthEvent, HealthMonitor, HealthRecord, HealthSummary, ResourceThresholds};
pub use launcher::{LaunchedService, ProcessLauncher, ServiceLauncher};
pub use orchestrator::{
    Orchestrator, OrchestratorConfig, ServicePhase, ServiceView, StartReport, plan_start_order,
};
pub use registry::{RegistryConfig, ServiceEntry, ServiceRegistry};
pub use restart::{ExitKind, RestartPolicy};
pub use state_machine::{StateMachine, StateRecord};
