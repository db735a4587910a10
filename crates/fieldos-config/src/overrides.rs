//! Operator enable/disable state, kept apart from the configuration files.
//!
//! `fieldos system enable|disable <service>` edits
//! `<state_dir>/overrides.toml`; the daemon applies it on top of the
//! configured `enabled` flags every time it builds descriptors.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use fieldos_kernel::ServiceDescriptor;
use fieldos_kernel::state_machine::write_atomic;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::ConfigError;

pub const OVERRIDES_FILE: &str = "overrides.toml";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceOverrides {
    /// Services disabled by an operator.
    pub disabled: BTreeSet<String>,
    /// Services an operator re-enabled although the configuration disables them.
    pub enabled: BTreeSet<String>,
}

impl ServiceOverrides {
    pub fn path(state_dir: &Path) -> PathBuf {
        state_dir.join(OVERRIDES_FILE)
    }

    /// Missing file means no overrides.
    pub fn load(state_dir: &Path) -> Result<Self, ConfigError> {
        let path = Self::path(state_dir);
        match std::fs::read_to_string(&path) {
            Ok(raw) => toml::from_str(&raw).map_err(|e| ConfigError::Parse {
                path,
                message: e.to_string(),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self, state_dir: &Path) -> Result<(), ConfigError> {
        std::fs::create_dir_all(state_dir)?;
        let body = toml::to_string_pretty(self).map_err(|e| ConfigError::Parse {
            path: Self::path(state_dir),
            message: e.to_string(),
        })?;
        write_atomic(&Self::path(state_dir), body.as_bytes())?;
        Ok(())
    }

    /// Record an operator decision.  Returns `true` if anything changed.
    pub fn set_enabled(&mut self, service_id: &str, enabled: bool) -> bool {
        let (add, remove) = if enabled {
            (&mut self.enabled, &mut self.disabled)
        } else {
            (&mut self.disabled, &mut self.enabled)
        };
        let removed = remove.remove(service_id);
        let added = add.insert(service_id.to_string());
        if removed || added {
            info!(service = %service_id, enabled, "service override recorded");
        }
        removed || added
    }

    /// Effective flag for a service configured with `configured`.
    pub fn is_enabled(&self, service_id: &str, configured: bool) -> bool {
        if self.disabled.contains(service_id) {
            false
        } else if self.enabled.contains(service_id) {
            true
        } else {
            configured
        }
    }

    pub fn apply(&self, descriptors: &mut [ServiceDescriptor]) {
        for d in descriptors {
            d.enabled = self.is_enabled(&d.service_id, d.enabled);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_the_state_dir() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        assert_eq!(ServiceOverrides::load(dir.path())?, ServiceOverrides::default());

        let mut overrides = ServiceOverrides::default();
        assert!(overrides.set_enabled("vision", false));
        assert!(!overrides.set_enabled("vision", false));
        overrides.save(dir.path())?;

        let loaded = ServiceOverrides::load(dir.path())?;
        assert!(!loaded.is_enabled("vision", true));
        assert!(loaded.is_enabled("nav", true));
        Ok(())
    }

    #[test]
    fn enabling_clears_a_disable() {
        let mut overrides = ServiceOverrides::default();
        overrides.set_enabled("weather", false);
        overrides.set_enabled("weather", true);
        assert!(overrides.disabled.is_empty());
        assert!(overrides.is_enabled("weather", false));
    }

    #[test]
    fn apply_rewrites_descriptor_flags() {
        let mut overrides = ServiceOverrides::default();
        overrides.set_enabled("vision", false);
        let mut descriptors = vec![ServiceDescriptor::new("vision"), ServiceDescriptor::new("nav")];
        overrides.apply(&mut descriptors);
        assert!(!descriptors[0].enabled);
        assert!(descriptors[1].enabled);
    }
}
