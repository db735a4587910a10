use std::path::PathBuf;

use fieldos_types::FieldError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Unknown configuration namespace: {0}")]
    UnknownNamespace(String),

    #[error("Failed to parse {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Invalid configuration for {namespace}: {reason}")]
    Invalid { namespace: String, reason: String },

    #[error("Version {version} of {namespace} is not in the rollback history")]
    UnknownVersion { namespace: String, version: u64 },

    #[error("File watch failed: {0}")]
    Watch(String),

    #[error(transparent)]
    Field(#[from] FieldError),
}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Field(FieldError::from(e))
    }
}

impl From<notify::Error> for ConfigError {
    fn from(e: notify::Error) -> Self {
        ConfigError::Watch(e.to_string())
    }
}

impl From<ConfigError> for FieldError {
    fn from(e: ConfigError) -> Self {
        match e {
            ConfigError::Field(inner) => inner,
            other => FieldError::ConfigValidation(other.to_string()),
        }
    }
}
