//! `fieldos-config` – Configuration
//!
//! Typed, validated configuration for every FieldOS component.
//!
//! # Modules
//!
//! - [`schema`] – [`FieldOsConfig`]: the main namespace's schema, its
//!   validation and conversion into component settings.
//! - [`manager`] – [`ConfigManager`]: per-namespace documents with
//!   environment overlays, hot reload, backups and rollback.
//! - [`overrides`] – [`ServiceOverrides`]: operator enable/disable state.
//! - [`error`] – [`ConfigError`].

pub mod error;
pub mod manager;
pub mod overrides;
pub mod schema;

pub use error::ConfigError;
pub use manager::{ConfigManager, ConfigurationDocument, HotReload, ReloadOutcome};
pub use overrides::ServiceOverrides;
pub use schema::{FieldOsConfig, MAIN_NAMESPACE, ServiceConfig, apply_env_overrides, json_schema};
