//! Files the daemon leaves in the state directory for the CLI.
//!
//! | File | Content |
//! |---|---|
//! | `status.json` | [`StatusSnapshot`], rewritten atomically every tick |
//! | `fieldos.pid` | pid of the running daemon ([`PidFile`]) |
//! | `system_state.json` | the persisted state record (kernel) |
//! | `overrides.toml` | operator enable/disable state (config) |

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use fieldos_kernel::state_machine::write_atomic;
use fieldos_kernel::{HealthSummary, ServicePhase, ServiceView};
use fieldos_middleware::BrokerStatus;
use fieldos_types::{CircuitState, FieldError, ServiceState, SystemState};
use nix::sys::signal;
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub const STATUS_FILE: &str = "status.json";
pub const PID_FILE: &str = "fieldos.pid";
/// Daemon log inside the log directory.
pub const DAEMON_LOG: &str = "fieldos.log";

// ────────────────────────────────────────────────────────────────────────────
// Snapshot
// ────────────────────────────────────────────────────────────────────────────

/// One service line of `fieldos system status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceLine {
    pub service_id: String,
    pub critical: bool,
    pub enabled: bool,
    pub phase: ServicePhase,
    pub state: ServiceState,
    pub circuit_state: CircuitState,
    pub consecutive_failures: u32,
    pub restarts: u32,
    pub last_error: Option<String>,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

impl From<&ServiceView> for ServiceLine {
    fn from(view: &ServiceView) -> Self {
        let health = view.health.as_ref();
        Self {
            service_id: view.service_id.clone(),
            critical: view.critical,
            enabled: view.enabled,
            phase: view.phase,
            state: health.map(|h| h.state).unwrap_or(ServiceState::Unknown),
            circuit_state: view.circuit_state,
            consecutive_failures: health.map(|h| h.consecutive_failures).unwrap_or(0),
            restarts: health.map(|h| h.restarts).unwrap_or(0),
            last_error: health.and_then(|h| h.last_error.clone()),
            last_heartbeat: health.and_then(|h| h.last_heartbeat),
        }
    }
}

/// Everything `fieldos system status` shows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub written_at: DateTime<Utc>,
    pub pid: u32,
    pub system_state: SystemState,
    pub previous_state: Option<SystemState>,
    pub summary: HealthSummary,
    pub services: Vec<ServiceLine>,
    pub broker: Option<BrokerStatus>,
}

impl StatusSnapshot {
    pub fn path(state_dir: &Path) -> PathBuf {
        state_dir.join(STATUS_FILE)
    }

    pub fn write(&self, state_dir: &Path) -> Result<(), FieldError> {
        write_atomic(&Self::path(state_dir), &serde_json::to_vec_pretty(self)?)
    }

    /// `Ok(None)` when no daemon has written a snapshot yet.
    pub fn read(state_dir: &Path) -> Result<Option<Self>, FieldError> {
        match std::fs::read(Self::path(state_dir)) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Services whose circuit is not closed.
    pub fn open_circuits(&self) -> impl Iterator<Item = &ServiceLine> {
        self.services
            .iter()
            .filter(|s| s.circuit_state != CircuitState::Closed)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Pid file
// ────────────────────────────────────────────────────────────────────────────

/// Whether a process with `pid` exists.
pub fn process_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match signal::kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        // Exists but belongs to someone else.
        Err(nix::errno::Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Pid of the daemon recorded in `state_dir`, if it is still alive.
pub fn running_daemon(state_dir: &Path) -> Option<u32> {
    let raw = std::fs::read_to_string(state_dir.join(PID_FILE)).ok()?;
    let pid = raw.trim().parse::<u32>().ok()?;
    process_alive(pid).then_some(pid)
}

/// Held by the running daemon; removes the file on drop.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Claim `state_dir` for this process.  Fails while another live daemon
    /// holds it; a stale file is replaced.
    pub fn acquire(state_dir: &Path) -> Result<Self, FieldError> {
        if let Some(pid) = running_daemon(state_dir) {
            if pid != std::process::id() {
                return Err(FieldError::ServiceFailure {
                    service: "fieldos".into(),
                    reason: format!("daemon already running with pid {pid}"),
                });
            }
        }
        let path = state_dir.join(PID_FILE);
        write_atomic(&path, format!("{}\n", std::process::id()).as_bytes())?;
        debug!(path = %path.display(), "pid file written");
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "could not remove pid file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> StatusSnapshot {
        StatusSnapshot {
            written_at: Utc::now(),
            pid: 42,
            system_state: SystemState::Degraded,
            previous_state: Some(SystemState::Running),
            summary: HealthSummary::default(),
            services: vec![ServiceLine {
                service_id: "vision".into(),
                critical: false,
                enabled: true,
                phase: ServicePhase::Suspended,
                state: ServiceState::Failed,
                circuit_state: CircuitState::Open,
                consecutive_failures: 5,
                restarts: 4,
                last_error: Some("exited with status 1".into()),
                last_heartbeat: None,
            }],
            broker: None,
        }
    }

    #[test]
    fn snapshot_survives_the_state_dir() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        assert!(StatusSnapshot::read(dir.path())?.is_none());

        let written = snapshot();
        written.write(dir.path())?;
        let read = StatusSnapshot::read(dir.path())?.ok_or("snapshot missing")?;
        assert_eq!(read, written);
        assert_eq!(read.open_circuits().count(), 1);
        Ok(())
    }

    #[test]
    fn pid_file_is_exclusive_and_removed_on_drop() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let held = PidFile::acquire(dir.path())?;
        assert_eq!(running_daemon(dir.path()), Some(std::process::id()));
        drop(held);
        assert!(!dir.path().join(PID_FILE).exists());
        Ok(())
    }

    #[test]
    fn stale_pid_is_ignored() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        std::fs::write(dir.path().join(PID_FILE), "4194304\n")?;
        assert_eq!(running_daemon(dir.path()), None);
        let _held = PidFile::acquire(dir.path())?;
        Ok(())
    }
}
