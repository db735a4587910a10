//! How the orchestrator turns a descriptor into a running instance.
//!
//! [`ServiceLauncher`] is the seam between orchestration policy and process
//! management.  [`ProcessLauncher`] runs each service as a child process with
//! its output appended to `<log_dir>/<service>.log`; tests plug in launchers
//! that simulate services on an in-memory bus.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use fieldos_middleware::supervisor::terminate_gracefully;
use fieldos_types::FieldError;
use tokio::process::Command;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::descriptor::ServiceDescriptor;
use crate::restart::ExitKind;

/// Environment variable carrying the service id into the child.
pub const ENV_SERVICE_ID: &str = "FIELDOS_SERVICE_ID";
/// Environment variable carrying the broker URL into the child.
pub const ENV_BROKER_URL: &str = "FIELDOS_BROKER_URL";

/// A launched instance.
pub struct LaunchedService {
    pub pid: Option<u32>,
    /// Resolves when the instance exits on its own or after a stop.
    pub exit: oneshot::Receiver<ExitKind>,
}

#[async_trait]
pub trait ServiceLauncher: Send + Sync {
    async fn launch(&self, descriptor: &ServiceDescriptor) -> Result<LaunchedService, FieldError>;

    /// Stop the running instance of `service_id`, if any.  Sends a graceful
    /// stop signal and forces termination after `grace`.
    async fn stop(&self, service_id: &str, grace: Duration) -> Result<(), FieldError>;
}

struct Running {
    stop: oneshot::Sender<Duration>,
    watcher: JoinHandle<()>,
}

pub struct ProcessLauncher {
    log_dir: PathBuf,
    broker_url: Option<String>,
    running: Mutex<HashMap<String, Running>>,
}

impl ProcessLauncher {
    pub fn new(log_dir: impl Into<PathBuf>, broker_url: Option<String>) -> Self {
        Self {
            log_dir: log_dir.into(),
            broker_url,
            running: Mutex::new(HashMap::new()),
        }
    }

    pub fn log_path(&self, service_id: &str) -> PathBuf {
        service_log_path(&self.log_dir, service_id)
    }

    fn running(&self) -> std::sync::MutexGuard<'_, HashMap<String, Running>> {
        self.running.lock().unwrap_or_else(|p| p.into_inner())
    }
}

pub fn service_log_path(log_dir: &Path, service_id: &str) -> PathBuf {
    log_dir.join(format!("{service_id}.log"))
}

#[async_trait]
impl ServiceLauncher for ProcessLauncher {
    async fn launch(&self, descriptor: &ServiceDescriptor) -> Result<LaunchedService, FieldError> {
        let id = &descriptor.service_id;
        let Some(command) = &descriptor.command else {
            return Err(FieldError::ConfigValidation(format!("service '{id}' has no command")));
        };
        {
            let mut running = self.running();
            running.retain(|_, r| !r.watcher.is_finished());
            if running.contains_key(id) {
                return Err(FieldError::ServiceFailure {
                    service: id.clone(),
                    reason: "already running".into(),
                });
            }
        }

        std::fs::create_dir_all(&self.log_dir)?;
        let log = OpenOptions::new().create(true).append(true).open(self.log_path(id))?;
        let log_err = log.try_clone()?;

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .envs(&command.env)
            .env(ENV_SERVICE_ID, id)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .kill_on_drop(true);
        if let Some(url) = &self.broker_url {
            cmd.env(ENV_BROKER_URL, url);
        }
        if let Some(dir) = &command.working_dir {
            cmd.current_dir(dir);
        }
        let mut child = cmd.spawn().map_err(|e| FieldError::ServiceFailure {
            service: id.clone(),
            reason: format!("spawn {}: {e}", command.program),
        })?;
        let pid = child.id();
        info!(service = %id, pid = ?pid, program = %command.program, "service launched");

        let (exit_tx, exit_rx) = oneshot::channel();
        let (stop_tx, stop_rx) = oneshot::channel::<Duration>();
        let service = id.clone();
        let watcher = tokio::spawn(async move {
            let kind = tokio::select! {
                status = child.wait() => match status {
                    Ok(s) if s.success() => ExitKind::Clean,
                    Ok(s) => ExitKind::Failure(s.to_string()),
                    Err(e) => ExitKind::Failure(e.to_string()),
                },
                grace = stop_rx => {
                    terminate_gracefully(&mut child, grace.unwrap_or(Duration::ZERO)).await;
                    ExitKind::Clean
                }
            };
            if let ExitKind::Failure(reason) = &kind {
                warn!(service = %service, %reason, "service exited");
            }
            let _ = exit_tx.send(kind);
        });

        self.running().insert(id.clone(), Running { stop: stop_tx, watcher });
        Ok(LaunchedService { pid, exit: exit_rx })
    }

    async fn stop(&self, service_id: &str, grace: Duration) -> Result<(), FieldError> {
        let entry = self.running().remove(service_id);
        if let Some(Running { stop, watcher }) = entry {
            let _ = stop.send(grace);
            let _ = watcher.await;
            info!(service = %service_id, "service stopped");
        }
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::descriptor::ServiceCommand;

    #[tokio::test]
    async fn crash_is_reported_and_logged() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let launcher = ProcessLauncher::new(dir.path(), Some("ws://127.0.0.1:1883".into()));
        let desc = ServiceDescriptor::new("weather").with_command(
            ServiceCommand::new("sh").with_args(["-c", "echo \"$FIELDOS_SERVICE_ID $FIELDOS_BROKER_URL\"; exit 3"]),
        );

        let launched = launcher.launch(&desc).await?;
        let kind = tokio::time::timeout(Duration::from_secs(5), launched.exit).await??;
        assert!(matches!(kind, ExitKind::Failure(_)));

        let log = std::fs::read_to_string(launcher.log_path("weather"))?;
        assert_eq!(log.trim(), "weather ws://127.0.0.1:1883");
        Ok(())
    }

    #[tokio::test]
    async fn stop_terminates_and_allows_relaunch() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let launcher = ProcessLauncher::new(dir.path(), None);
        let desc = ServiceDescriptor::new("nav").with_command(ServiceCommand::new("sleep").with_args(["30"]));

        let first = launcher.launch(&desc).await?;
        assert!(first.pid.is_some());
        assert!(launcher.launch(&desc).await.is_err());

        launcher.stop("nav", Duration::from_secs(2)).await?;
        assert_eq!(first.exit.await?, ExitKind::Clean);

        let second = launcher.launch(&desc).await?;
        launcher.stop("nav", Duration::from_secs(2)).await?;
        assert_eq!(second.exit.await?, ExitKind::Clean);
        Ok(())
    }

    #[tokio::test]
    async fn missing_command_is_a_config_error() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let launcher = ProcessLauncher::new(dir.path(), None);
        let result = launcher.launch(&ServiceDescriptor::new("ghost")).await;
        assert!(matches!(result, Err(FieldError::ConfigValidation(_))));
        Ok(())
    }
}
