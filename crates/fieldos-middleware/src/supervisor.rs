//! Broker process lifecycle.
//!
//! [`BrokerSupervisor`] renders a broker configuration file from a
//! structured [`BrokerConfig`], launches the broker as a child process and
//! watches it.  Two flavours are supported:
//!
//! | Flavour | Process | Config file |
//! |---|---|---|
//! | [`BrokerFlavor::Native`] | `fieldos broker serve --config <file>` | `broker.toml` |
//! | [`BrokerFlavor::Mosquitto`] | `mosquitto -c <file>` | `mosquitto.conf` |
//!
//! If the broker exits unexpectedly the supervisor restarts it immediately,
//! up to `max_restarts` times.  After that it raises a critical
//! `broker_unavailable` alert and stops trying; without a broker no two
//! services can talk, so recovery is left to an operator.

use std::fmt;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use fieldos_types::{Alert, AlertKind, FieldError, Severity};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::process::{Child, Command};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::ws_server::BrokerServerConfig;

/// Placeholder replaced by the rendered config path in broker arguments.
pub const CONFIG_PLACEHOLDER: &str = "{config}";

// ────────────────────────────────────────────────────────────────────────────
// Configuration
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum BrokerFlavor {
    /// The FieldOS WebSocket broker.
    #[default]
    Native,
    /// An external Mosquitto broker.
    Mosquitto,
}

#[derive(Clone, PartialEq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(default)]
pub struct BrokerAuth {
    pub enabled: bool,
    /// Shared token required by the native broker.
    pub token: Option<String>,
    /// Mosquitto password file.
    pub password_file: Option<PathBuf>,
}

impl fmt::Debug for BrokerAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerAuth")
            .field("enabled", &self.enabled)
            .field("token", if self.token.is_some() { &"<redacted>" } else { &"<not set>" })
            .field("password_file", &self.password_file)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(default)]
pub struct BrokerTls {
    pub enabled: bool,
    pub ca_file: Option<PathBuf>,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
}

/// Structured broker configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct BrokerConfig {
    pub flavor: BrokerFlavor,
    pub bind: String,
    pub port: u16,
    /// Second listener for browser clients (a websocket bridge).
    pub websocket_port: Option<u16>,
    pub persistence: bool,
    pub persistence_path: PathBuf,
    pub auth: BrokerAuth,
    pub tls: BrokerTls,
    /// Overrides the broker program.
    pub executable: Option<PathBuf>,
    /// Overrides the broker arguments; `{config}` becomes the config path.
    pub args: Vec<String>,
    /// Where the rendered config and the broker log are written.
    pub config_dir: PathBuf,
    pub max_restarts: u32,
    /// Pause before each immediate restart.
    pub restart_delay_ms: u64,
    /// Grace period between SIGTERM and SIGKILL on stop.
    pub stop_grace_secs: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            flavor: BrokerFlavor::Native,
            bind: "127.0.0.1".into(),
            port: 1883,
            websocket_port: None,
            persistence: true,
            persistence_path: PathBuf::from("/var/lib/fieldos/broker"),
            auth: BrokerAuth::default(),
            tls: BrokerTls::default(),
            executable: None,
            args: Vec::new(),
            config_dir: PathBuf::from("/var/lib/fieldos/broker"),
            max_restarts: 3,
            restart_delay_ms: 200,
            stop_grace_secs: 5,
        }
    }
}

/// A rendered broker configuration file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedConfig {
    pub file_name: &'static str,
    pub contents: String,
}

impl BrokerConfig {
    /// Structural checks shared by both flavours.
    pub fn validate(&self) -> Result<(), FieldError> {
        let invalid = |msg: String| Err(FieldError::ConfigValidation(format!("broker: {msg}")));
        if self.port == 0 {
            return invalid("port must be non-zero".into());
        }
        if self.websocket_port == Some(self.port) {
            return invalid("websocket_port must differ from port".into());
        }
        match self.flavor {
            BrokerFlavor::Native => {
                if self.tls.enabled {
                    return invalid("TLS is only available with the mosquitto flavour".into());
                }
                if self.auth.enabled && self.auth.token.as_deref().is_none_or(str::is_empty) {
                    return invalid("auth.enabled requires auth.token".into());
                }
            }
            BrokerFlavor::Mosquitto => {
                if self.auth.enabled && self.auth.password_file.is_none() {
                    return invalid("auth.enabled requires auth.password_file".into());
                }
                if self.tls.enabled && (self.tls.cert_file.is_none() || self.tls.key_file.is_none()) {
                    return invalid("tls.enabled requires tls.cert_file and tls.key_file".into());
                }
            }
        }
        Ok(())
    }

    /// Address clients should dial.
    pub fn connect_host(&self) -> &str {
        match self.bind.as_str() {
            "0.0.0.0" | "::" | "" => "127.0.0.1",
            other => other,
        }
    }

    /// WebSocket URL of the native broker.
    pub fn client_url(&self) -> String {
        format!("ws://{}:{}", self.connect_host(), self.port)
    }

    /// Human-readable listener list.
    pub fn listeners(&self) -> Vec<String> {
        let primary = match self.flavor {
            BrokerFlavor::Native => "ws",
            BrokerFlavor::Mosquitto if self.tls.enabled => "mqtts",
            BrokerFlavor::Mosquitto => "mqtt",
        };
        let mut out = vec![format!("{primary}://{}:{}", self.bind, self.port)];
        if let Some(ws) = self.websocket_port {
            out.push(format!("ws://{}:{ws}", self.bind));
        }
        out
    }

    /// Render the flavour-specific config file.
    pub fn render(&self) -> Result<RenderedConfig, FieldError> {
        self.validate()?;
        match self.flavor {
            BrokerFlavor::Native => self.render_native(),
            BrokerFlavor::Mosquitto => Ok(self.render_mosquitto()),
        }
    }

    fn render_native(&self) -> Result<RenderedConfig, FieldError> {
        let mut listeners = vec![format!("{}:{}", self.bind, self.port)];
        if let Some(ws) = self.websocket_port {
            listeners.push(format!("{}:{ws}", self.bind));
        }
        let server = BrokerServerConfig {
            listeners,
            persistence_file: self
                .persistence
                .then(|| self.persistence_path.join("retained.json")),
            auth_token: if self.auth.enabled { self.auth.token.clone() } else { None },
            session_capacity: 4096,
        };
        let body = toml::to_string(&server).map_err(|e| FieldError::Serialization(e.to_string()))?;
        Ok(RenderedConfig {
            file_name: "broker.toml",
            contents: format!("# Generated by FieldOS; edits are overwritten.\n{body}"),
        })
    }

    fn render_mosquitto(&self) -> RenderedConfig {
        let mut conf = String::from("# Generated by FieldOS; edits are overwritten.\n");
        conf.push_str("per_listener_settings false\n\n");

        conf.push_str(&format!("listener {} {}\nprotocol mqtt\n", self.port, self.bind));
        if self.tls.enabled {
            if let Some(ca) = &self.tls.ca_file {
                conf.push_str(&format!("cafile {}\n", ca.display()));
            }
            if let Some(cert) = &self.tls.cert_file {
                conf.push_str(&format!("certfile {}\n", cert.display()));
            }
            if let Some(key) = &self.tls.key_file {
                conf.push_str(&format!("keyfile {}\n", key.display()));
            }
        }
        if let Some(ws) = self.websocket_port {
            conf.push_str(&format!("\nlistener {ws} {}\nprotocol websockets\n", self.bind));
        }

        conf.push('\n');
        if self.persistence {
            conf.push_str("persistence true\n");
            conf.push_str(&format!("persistence_location {}/\n", self.persistence_path.display()));
        } else {
            conf.push_str("persistence false\n");
        }

        conf.push('\n');
        if self.auth.enabled {
            conf.push_str("allow_anonymous false\n");
            if let Some(pw) = &self.auth.password_file {
                conf.push_str(&format!("password_file {}\n", pw.display()));
            }
        } else {
            conf.push_str("allow_anonymous true\n");
        }

        RenderedConfig {
            file_name: "mosquitto.conf",
            contents: conf,
        }
    }

    /// Program and arguments used to launch the broker with `config_path`.
    pub fn command_line(&self, config_path: &Path) -> Result<(PathBuf, Vec<String>), FieldError> {
        let (program, args) = match (&self.executable, self.flavor) {
            (Some(exe), _) => (exe.clone(), self.args.clone()),
            (None, BrokerFlavor::Native) => (
                std::env::current_exe()?,
                vec!["broker".into(), "serve".into(), "--config".into(), CONFIG_PLACEHOLDER.into()],
            ),
            (None, BrokerFlavor::Mosquitto) => (
                PathBuf::from("mosquitto"),
                vec!["-c".into(), CONFIG_PLACEHOLDER.into()],
            ),
        };
        let config = config_path.to_string_lossy();
        let args = args
            .into_iter()
            .map(|a| a.replace(CONFIG_PLACEHOLDER, &config))
            .collect();
        Ok((program, args))
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Child processes
// ────────────────────────────────────────────────────────────────────────────

/// Ask `child` to stop with SIGTERM and kill it if it is still alive after
/// `grace`.
pub async fn terminate_gracefully(child: &mut Child, grace: Duration) {
    let Some(pid) = child.id() else {
        // Already reaped.
        return;
    };
    if let Err(e) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        warn!(pid, error = %e, "SIGTERM failed");
    }
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(_) => {}
        Err(_) => {
            warn!(pid, ?grace, "process ignored SIGTERM, killing");
            if let Err(e) = child.kill().await {
                warn!(pid, error = %e, "kill failed");
            }
        }
    }
}

#[derive(Debug, Clone)]
struct Launch {
    program: PathBuf,
    args: Vec<String>,
    log_path: PathBuf,
}

impl Launch {
    fn spawn(&self) -> Result<Child, FieldError> {
        let log = OpenOptions::new().create(true).append(true).open(&self.log_path)?;
        let log_err = log.try_clone()?;
        Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .spawn()
            .map_err(|e| {
                FieldError::BrokerUnavailable(format!("spawn {}: {e}", self.program.display()))
            })
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Supervisor
// ────────────────────────────────────────────────────────────────────────────

/// Snapshot returned by [`BrokerSupervisor::get_status`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BrokerStatus {
    pub running: bool,
    pub pid: Option<u32>,
    pub uptime_secs: Option<u64>,
    pub listeners: Vec<String>,
    pub restarts: u32,
    /// The primary listener accepted a TCP connection just now.
    pub accepting_connections: bool,
    /// Restart budget exhausted; manual intervention required.
    pub gave_up: bool,
    pub last_exit: Option<String>,
}

#[derive(Default)]
struct SupervisorState {
    pid: Option<u32>,
    started_at: Option<Instant>,
    restarts: u32,
    gave_up: bool,
    last_exit: Option<String>,
}

struct RunHandle {
    config: BrokerConfig,
    stop: CancellationToken,
    monitor: JoinHandle<()>,
}

pub struct BrokerSupervisor {
    state: Arc<Mutex<SupervisorState>>,
    run: Mutex<Option<RunHandle>>,
    alerts: broadcast::Sender<Alert>,
}

impl Default for BrokerSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

impl BrokerSupervisor {
    pub fn new() -> Self {
        let (alerts, _) = broadcast::channel(16);
        Self {
            state: Arc::new(Mutex::new(SupervisorState::default())),
            run: Mutex::new(None),
            alerts,
        }
    }

    /// `broker_unavailable` alerts.
    pub fn alerts(&self) -> broadcast::Receiver<Alert> {
        self.alerts.subscribe()
    }

    /// Render the config, launch the broker and start watching it.
    pub async fn start(&self, config: BrokerConfig) -> Result<(), FieldError> {
        if lock(&self.run).as_ref().is_some_and(|r| !r.monitor.is_finished()) {
            return Err(FieldError::BrokerUnavailable("broker already running".into()));
        }

        let rendered = config.render()?;
        tokio::fs::create_dir_all(&config.config_dir).await?;
        if config.persistence {
            tokio::fs::create_dir_all(&config.persistence_path).await?;
        }
        let config_path = config.config_dir.join(rendered.file_name);
        tokio::fs::write(&config_path, rendered.contents.as_bytes()).await?;

        let (program, args) = config.command_line(&config_path)?;
        let launch = Launch {
            program,
            args,
            log_path: config.config_dir.join("broker.log"),
        };
        let child = launch.spawn()?;
        let pid = child.id();
        info!(pid = ?pid, program = %launch.program.display(), config = %config_path.display(), "broker started");

        {
            let mut state = lock(&self.state);
            *state = SupervisorState {
                pid,
                started_at: Some(Instant::now()),
                ..SupervisorState::default()
            };
        }

        let stop = CancellationToken::new();
        let monitor = tokio::spawn(monitor(
            child,
            launch,
            MonitorPolicy {
                max_restarts: config.max_restarts,
                restart_delay: Duration::from_millis(config.restart_delay_ms),
                grace: Duration::from_secs(config.stop_grace_secs),
            },
            Arc::clone(&self.state),
            self.alerts.clone(),
            stop.clone(),
        ));
        *lock(&self.run) = Some(RunHandle {
            config,
            stop,
            monitor,
        });
        Ok(())
    }

    /// Stop the broker: SIGTERM, then SIGKILL after the grace period.
    pub async fn stop(&self) {
        let handle = lock(&self.run).take();
        if let Some(handle) = handle {
            handle.stop.cancel();
            let _ = handle.monitor.await;
            info!("broker stopped");
        }
    }

    pub async fn get_status(&self) -> BrokerStatus {
        let (listeners, probe_addr) = match lock(&self.run).as_ref() {
            Some(run) => (
                run.config.listeners(),
                Some(format!("{}:{}", run.config.connect_host(), run.config.port)),
            ),
            None => (Vec::new(), None),
        };
        let mut status = {
            let state = lock(&self.state);
            BrokerStatus {
                running: state.pid.is_some(),
                pid: state.pid,
                uptime_secs: state.started_at.map(|t| t.elapsed().as_secs()),
                listeners,
                restarts: state.restarts,
                accepting_connections: false,
                gave_up: state.gave_up,
                last_exit: state.last_exit.clone(),
            }
        };
        if let (true, Some(addr)) = (status.running, probe_addr) {
            status.accepting_connections = matches!(
                tokio::time::timeout(
                    Duration::from_millis(500),
                    tokio::net::TcpStream::connect(addr.as_str())
                )
                .await,
                Ok(Ok(_))
            );
        }
        status
    }
}

struct MonitorPolicy {
    max_restarts: u32,
    restart_delay: Duration,
    grace: Duration,
}

async fn monitor(
    mut child: Child,
    launch: Launch,
    policy: MonitorPolicy,
    state: Arc<Mutex<SupervisorState>>,
    alerts: broadcast::Sender<Alert>,
    stop: CancellationToken,
) {
    loop {
        let exit = tokio::select! {
            status = child.wait() => match status {
                Ok(status) => status.to_string(),
                Err(e) => e.to_string(),
            },
            _ = stop.cancelled() => {
                terminate_gracefully(&mut child, policy.grace).await;
                let mut st = lock(&state);
                st.pid = None;
                st.started_at = None;
                return;
            }
        };
        warn!(status = %exit, "broker exited unexpectedly");
        {
            let mut st = lock(&state);
            st.pid = None;
            st.started_at = None;
            st.last_exit = Some(exit.clone());
        }

        // Immediate restarts, bounded.
        loop {
            let attempt = {
                let mut st = lock(&state);
                if st.restarts >= policy.max_restarts {
                    st.gave_up = true;
                    None
                } else {
                    st.restarts += 1;
                    Some(st.restarts)
                }
            };
            let Some(attempt) = attempt else {
                error!(restarts = policy.max_restarts, "broker restart budget exhausted");
                let alert = Alert::new(
                    Severity::Critical,
                    AlertKind::BrokerUnavailable,
                    "broker_supervisor",
                    format!(
                        "broker exited {} times; manual intervention required",
                        policy.max_restarts + 1
                    ),
                )
                .with_data(json!({ "last_exit": exit, "restarts": policy.max_restarts }));
                let _ = alerts.send(alert);
                return;
            };

            tokio::select! {
                _ = tokio::time::sleep(policy.restart_delay) => {}
                _ = stop.cancelled() => return,
            }
            match launch.spawn() {
                Ok(new_child) => {
                    info!(attempt, pid = ?new_child.id(), "broker restarted");
                    let mut st = lock(&state);
                    st.pid = new_child.id();
                    st.started_at = Some(Instant::now());
                    child = new_child;
                    break;
                }
                Err(e) => warn!(attempt, error = %e, "broker restart failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn native() -> BrokerConfig {
        BrokerConfig {
            persistence_path: PathBuf::from("/data/broker"),
            websocket_port: Some(9001),
            ..BrokerConfig::default()
        }
    }

    #[test]
    fn native_render_is_loadable() -> Result<(), Box<dyn std::error::Error>> {
        let mut config = native();
        config.auth.enabled = true;
        config.auth.token = Some("t0ken".into());
        let rendered = config.render()?;
        assert_eq!(rendered.file_name, "broker.toml");

        let parsed: BrokerServerConfig = toml::from_str(&rendered.contents)?;
        assert_eq!(parsed.listeners, vec!["127.0.0.1:1883", "127.0.0.1:9001"]);
        assert_eq!(parsed.persistence_file, Some(PathBuf::from("/data/broker/retained.json")));
        assert_eq!(parsed.auth_token.as_deref(), Some("t0ken"));
        Ok(())
    }

    #[test]
    fn native_rejects_tls_and_tokenless_auth() {
        let mut config = native();
        config.tls.enabled = true;
        assert!(matches!(config.render(), Err(FieldError::ConfigValidation(_))));

        let mut config = native();
        config.auth.enabled = true;
        assert!(config.render().is_err());
    }

    #[test]
    fn mosquitto_render_has_every_toggle() -> Result<(), Box<dyn std::error::Error>> {
        let mut config = native();
        config.flavor = BrokerFlavor::Mosquitto;
        config.auth = BrokerAuth {
            enabled: true,
            token: None,
            password_file: Some("/etc/fieldos/passwd".into()),
        };
        config.tls = BrokerTls {
            enabled: true,
            ca_file: Some("/etc/fieldos/ca.pem".into()),
            cert_file: Some("/etc/fieldos/cert.pem".into()),
            key_file: Some("/etc/fieldos/key.pem".into()),
        };
        let conf = config.render()?.contents;
        assert!(conf.contains("listener 1883 127.0.0.1\nprotocol mqtt"));
        assert!(conf.contains("listener 9001 127.0.0.1\nprotocol websockets"));
        assert!(conf.contains("persistence_location /data/broker/"));
        assert!(conf.contains("allow_anonymous false"));
        assert!(conf.contains("password_file /etc/fieldos/passwd"));
        assert!(conf.contains("certfile /etc/fieldos/cert.pem"));
        assert_eq!(config.listeners()[0], "mqtts://127.0.0.1:1883");
        Ok(())
    }

    #[test]
    fn config_placeholder_is_substituted() -> Result<(), Box<dyn std::error::Error>> {
        let config = BrokerConfig {
            flavor: BrokerFlavor::Mosquitto,
            ..BrokerConfig::default()
        };
        let (program, args) = config.command_line(Path::new("/tmp/m.conf"))?;
        assert_eq!(program, PathBuf::from("mosquitto"));
        assert_eq!(args, vec!["-c", "/tmp/m.conf"]);
        Ok(())
    }

    #[test]
    fn auth_token_is_not_debug_printed() {
        let auth = BrokerAuth {
            enabled: true,
            token: Some("hunter2".into()),
            password_file: None,
        };
        assert!(!format!("{auth:?}").contains("hunter2"));
    }

    fn scripted(dir: &Path, program: &str, args: &[&str]) -> BrokerConfig {
        BrokerConfig {
            executable: Some(PathBuf::from(program)),
            args: args.iter().map(|s| s.to_string()).collect(),
            config_dir: dir.to_path_buf(),
            persistence: false,
            port: 1,
            max_restarts: 2,
            restart_delay_ms: 10,
            stop_grace_secs: 1,
            ..BrokerConfig::default()
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn crashing_broker_exhausts_restarts_and_alerts() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let supervisor = BrokerSupervisor::new();
        let mut alerts = supervisor.alerts();

        supervisor.start(scripted(dir.path(), "sh", &["-c", "exit 1"])).await?;
        let alert = tokio::time::timeout(Duration::from_secs(5), alerts.recv()).await??;
        assert_eq!(alert.kind, AlertKind::BrokerUnavailable);
        assert_eq!(alert.severity, Severity::Critical);

        let status = supervisor.get_status().await;
        assert!(!status.running);
        assert!(status.gave_up);
        assert_eq!(status.restarts, 2);
        assert!(dir.path().join("broker.toml").exists());
        Ok(())
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stop_terminates_running_broker() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let supervisor = BrokerSupervisor::new();
        supervisor.start(scripted(dir.path(), "sleep", &["30"])).await?;

        let status = supervisor.get_status().await;
        assert!(status.running);
        assert!(status.pid.is_some());
        assert!(supervisor.start(scripted(dir.path(), "sleep", &["30"])).await.is_err());

        supervisor.stop().await;
        let status = supervisor.get_status().await;
        assert!(!status.running);
        assert_eq!(status.restarts, 0);
        Ok(())
    }
}
