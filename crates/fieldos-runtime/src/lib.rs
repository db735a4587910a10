//! `fieldos-runtime` – Daemon Wiring
//!
//! Assembles the middleware, kernel and configuration crates into one
//! supervised FieldOS instance.
//!
//! # Modules
//!
//! - [`runtime`] – [`FieldRuntime`]: kernel components around one messaging
//!   client, the heartbeat/safety/command listeners and operator actions.
//! - [`daemon`] – the long-running process: broker supervision, hot reload,
//!   signals and the status snapshot loop.
//! - [`commands`] – [`OperatorAction`] and the request/reply helper used by
//!   the CLI.
//! - [`status`] – [`StatusSnapshot`] and the pid file.
//! - [`telemetry`] – `tracing` subscriber and optional OTLP export.

pub mod commands;
pub mod daemon;
pub mod runtime;
pub mod status;
pub mod telemetry;

pub use commands::{OperatorAction, send_command};
pub use daemon::{DaemonOptions, load_config};
pub use runtime::FieldRuntime;
pub use status::{PidFile, ServiceLine, StatusSnapshot};
pub use telemetry::{TracerProviderGuard, init_tracing};
