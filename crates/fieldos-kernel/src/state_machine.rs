//! [`StateMachine`] – the persisted global operating mode.
//!
//! Every transition is written to disk in two steps before it counts as
//! entered: first the *intent* (`pending`), then the completed record.  Both
//! writes go through a temp file, `fsync` and `rename`, so the file on disk
//! is always a complete document.
//!
//! On load the record resolves to a safe state:
//!
//! | On disk | Resolves to |
//! |---|---|
//! | pending transition into a sticky state | that state |
//! | `EMERGENCY_STOP` or `MAINTENANCE` | unchanged |
//! | anything else | `INITIALIZING` |
//!
//! Entering `EMERGENCY_STOP` publishes on `safety/emergency_stop` before the
//! ordinary `system/state` event, and triggering it again is a no-op.  The
//! only way out is [`StateMachine::manual_reset`] with the reset token.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use fieldos_middleware::{MessagingClient, topics};
use fieldos_types::{Alert, AlertKind, FieldError, Payload, Severity, SystemEvent, SystemState};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::{Mutex, watch};
use tracing::{error, info, warn};

pub const STATE_FILE: &str = "system_state.json";

/// Transitions kept in `recent_history`.
pub const HISTORY_LIMIT: usize = 50;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: SystemState,
    pub to: SystemState,
    pub timestamp: DateTime<Utc>,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingTransition {
    pub to: SystemState,
    pub reason: String,
    pub since: DateTime<Utc>,
}

/// The persisted system state document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateRecord {
    pub current_state: SystemState,
    pub previous_state: Option<SystemState>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub state_data: Value,
    #[serde(default)]
    pub recent_history: Vec<TransitionRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending: Option<PendingTransition>,
}

impl Default for StateRecord {
    fn default() -> Self {
        Self {
            current_state: SystemState::Initializing,
            previous_state: None,
            timestamp: Utc::now(),
            state_data: Value::Null,
            recent_history: Vec::new(),
            pending: None,
        }
    }
}

impl StateRecord {
    fn apply(&mut self, to: SystemState, reason: &str, data: Value) {
        let now = Utc::now();
        self.recent_history.push(TransitionRecord {
            from: self.current_state,
            to,
            timestamp: now,
            reason: reason.to_string(),
        });
        if self.recent_history.len() > HISTORY_LIMIT {
            let excess = self.recent_history.len() - HISTORY_LIMIT;
            self.recent_history.drain(..excess);
        }
        self.previous_state = Some(self.current_state);
        self.current_state = to;
        self.timestamp = now;
        self.state_data = data;
        self.pending = None;
    }

    /// The state this record resumes in after a restart.
    pub fn resolve_on_load(&self) -> SystemState {
        if let Some(pending) = &self.pending {
            if pending.to.is_sticky() {
                return pending.to;
            }
        }
        if self.current_state.is_sticky() {
            self.current_state
        } else {
            SystemState::Initializing
        }
    }
}

/// Read a persisted record, if any.
pub fn read_record(path: &Path) -> Result<Option<StateRecord>, FieldError> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Write `bytes` to `path` atomically.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), FieldError> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    let tmp = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    if let Some(dir) = path.parent() {
        // Directory fsync is best effort; not every platform allows it.
        if let Ok(d) = File::open(dir) {
            let _ = d.sync_all();
        }
    }
    Ok(())
}

pub struct StateMachine {
    path: PathBuf,
    record: Mutex<StateRecord>,
    watch: watch::Sender<SystemState>,
    publisher: Option<MessagingClient>,
    reset_token: Option<String>,
}

impl StateMachine {
    /// Load (or create) the record at `path` and resolve it to a safe state.
    pub fn open(
        path: impl Into<PathBuf>,
        publisher: Option<MessagingClient>,
        reset_token: Option<String>,
    ) -> Result<Self, FieldError> {
        let path = path.into();
        let mut record = match read_record(&path) {
            Ok(Some(record)) => record,
            Ok(None) => StateRecord::default(),
            Err(e) => {
                error!(path = %path.display(), error = %e, "state file unreadable, starting fresh");
                StateRecord::default()
            }
        };

        let resolved = record.resolve_on_load();
        if resolved != record.current_state || record.pending.is_some() {
            warn!(
                on_disk = %record.current_state,
                pending = ?record.pending.as_ref().map(|p| p.to),
                resolved = %resolved,
                "resolving persisted state"
            );
            let data = record.state_data.clone();
            record.apply(resolved, "resolved at startup", data);
        }
        write_atomic(&path, &serde_json::to_vec_pretty(&record)?)?;
        info!(state = %record.current_state, path = %path.display(), "system state loaded");

        let (watch, _) = watch::channel(record.current_state);
        Ok(Self {
            path,
            record: Mutex::new(record),
            watch,
            publisher,
            reset_token: reset_token.filter(|t| !t.is_empty()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn current(&self) -> SystemState {
        *self.watch.borrow()
    }

    pub async fn record(&self) -> StateRecord {
        self.record.lock().await.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SystemState> {
        self.watch.subscribe()
    }

    /// Move to `to`.  Returns `Ok(false)` when already there.
    pub async fn transition(&self, to: SystemState, reason: &str, data: Value) -> Result<bool, FieldError> {
        let mut record = self.record.lock().await;
        let from = record.current_state;
        if from == to {
            return Ok(false);
        }
        if from == SystemState::EmergencyStop || !from.can_transition_to(to) {
            return Err(FieldError::InvalidTransition {
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        self.commit(&mut record, to, reason, data)?;
        Ok(true)
    }

    /// Enter `EMERGENCY_STOP`.  Repeated triggers are no-ops.
    pub async fn emergency_stop(&self, reason: &str) -> Result<bool, FieldError> {
        self.transition(SystemState::EmergencyStop, reason, json!({ "reason": reason }))
            .await
    }

    /// Leave `EMERGENCY_STOP` for `INITIALIZING` with the reset token.
    pub async fn manual_reset(&self, token: &str) -> Result<(), FieldError> {
        let mut record = self.record.lock().await;
        if record.current_state != SystemState::EmergencyStop {
            return Err(FieldError::InvalidTransition {
                from: record.current_state.to_string(),
                to: SystemState::Initializing.to_string(),
            });
        }
        match &self.reset_token {
            Some(expected) if expected == token => {}
            Some(_) => return Err(FieldError::Unauthorized("reset token mismatch".into())),
            None => return Err(FieldError::Unauthorized("no reset token configured".into())),
        }
        self.commit(&mut record, SystemState::Initializing, "manual reset", Value::Null)
    }

    fn commit(
        &self,
        record: &mut StateRecord,
        to: SystemState,
        reason: &str,
        data: Value,
    ) -> Result<(), FieldError> {
        let from = record.current_state;

        record.pending = Some(PendingTransition {
            to,
            reason: reason.to_string(),
            since: Utc::now(),
        });
        write_atomic(&self.path, &serde_json::to_vec_pretty(&*record)?)?;

        let mut next = record.clone();
        next.apply(to, reason, data);
        write_atomic(&self.path, &serde_json::to_vec_pretty(&next)?)?;
        *record = next;

        if to == SystemState::EmergencyStop {
            error!(from = %from, reason, "EMERGENCY STOP");
        } else {
            info!(from = %from, to = %to, reason, "system state transition");
        }
        self.watch.send_replace(to);
        self.broadcast(from, record);
        Ok(())
    }

    fn broadcast(&self, from: SystemState, record: &StateRecord) {
        let Some(client) = &self.publisher else {
            return;
        };
        let to = record.current_state;
        let reason = record
            .recent_history
            .last()
            .map(|t| t.reason.clone())
            .unwrap_or_default();

        if to == SystemState::EmergencyStop {
            let alert = Alert::new(Severity::Emergency, AlertKind::EmergencyStop, "state_machine", reason.clone())
                .with_data(json!({ "from": from }));
            if let Err(e) = client.publish(topics::EMERGENCY_STOP, Payload::Alert(alert), None) {
                error!(error = %e, "emergency stop broadcast failed");
            }
        }

        let event = SystemEvent {
            event_type: "state_transition".into(),
            message: format!("{from} -> {to}: {reason}"),
            data: json!({
                "from": from,
                "to": to,
                "reason": reason,
                "state_data": record.state_data,
            }),
        };
        if let Err(e) = client.publish(topics::SYSTEM_STATE, Payload::Event(event), None) {
            warn!(error = %e, "state broadcast failed");
        }
    }
}
