//! The FieldOS daemon: broker, messaging, orchestration and hot reload in
//! one process.
//!
//! Startup order:
//!
//! 1. load and validate the configuration (the daemon additionally needs the
//!    native broker flavour and a command per enabled service);
//! 2. claim the state directory with the pid file;
//! 3. start the broker supervisor and connect the daemon's own client;
//! 4. build the [`FieldRuntime`], start its background tasks and watch the
//!    main configuration namespace;
//! 5. start the services in dependency order.
//!
//! The daemon then rewrites `status.json` every tick until SIGTERM, SIGINT
//! or a `shutdown` command, and stops services before the broker.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use fieldos_config::{ConfigManager, ConfigurationDocument, FieldOsConfig, MAIN_NAMESPACE, apply_env_overrides};
use fieldos_kernel::ProcessLauncher;
use fieldos_middleware::{BrokerSupervisor, MessagingClient, TopicRegistry, WsTransport, topics};
use fieldos_types::{Alert, FieldError, Payload};
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::runtime::FieldRuntime;
use crate::status::{DAEMON_LOG, PidFile};

/// Client id of the daemon on the bus.
pub const DAEMON_CLIENT_ID: &str = "fieldos";

#[derive(Debug, Clone)]
pub struct DaemonOptions {
    pub config_dir: PathBuf,
    /// How often `status.json` is rewritten.
    pub status_interval: Duration,
    /// Quiet period before a changed configuration file is reloaded.
    pub reload_debounce: Duration,
    /// Upper bound on stopping background tasks during shutdown.
    pub shutdown_timeout: Duration,
}

impl DaemonOptions {
    pub fn new(config_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
            status_interval: Duration::from_secs(1),
            reload_debounce: Duration::from_millis(500),
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

/// Where the daemon writes its own log.
pub fn daemon_log_path(config: &FieldOsConfig) -> PathBuf {
    config.system.log_dir.join(DAEMON_LOG)
}

/// Load `config_dir` with the daemon's validation rules.
pub fn load_config(config_dir: &Path) -> Result<(Arc<ConfigManager>, FieldOsConfig), FieldError> {
    let manager = Arc::new(ConfigManager::from_env(config_dir));
    manager.register_validator(MAIN_NAMESPACE, |doc: &ConfigurationDocument| {
        let cfg: FieldOsConfig = doc.parse().map_err(|e| e.to_string())?;
        cfg.validate_for_daemon().map_err(|e| e.to_string())
    });
    manager.load_all()?;
    let config = manager.fieldos_config()?;
    Ok((manager, config))
}

/// Run the daemon until shutdown.
pub async fn run(manager: Arc<ConfigManager>, config: FieldOsConfig, options: DaemonOptions) -> Result<(), FieldError> {
    let state_dir = config.system.state_dir.clone();
    let _pid = PidFile::acquire(&state_dir)?;
    info!(
        pid = std::process::id(),
        config_dir = %options.config_dir.display(),
        state_dir = %state_dir.display(),
        "fieldos daemon starting"
    );

    // ── Broker ────────────────────────────────────────────────────────────
    let broker = Arc::new(BrokerSupervisor::new());
    broker.start(config.broker.clone()).await?;

    let broker_url = config.broker.client_url();
    let token = if config.broker.auth.enabled {
        config.broker.auth.token.clone()
    } else {
        None
    };
    let transport = Arc::new(WsTransport::new(broker_url.clone()).with_token(token));
    let client = MessagingClient::new(
        config.client_config(DAEMON_CLIENT_ID),
        Arc::new(TopicRegistry::with_defaults()),
        transport,
    );
    if let Err(e) = client.connect().await {
        // The client keeps retrying; messages queue meanwhile.
        warn!(error = %e, "broker not reachable yet");
    }

    // ── Runtime ───────────────────────────────────────────────────────────
    let launcher = Arc::new(ProcessLauncher::new(config.system.log_dir.clone(), Some(broker_url)));
    let runtime = FieldRuntime::new(config, client.clone(), launcher)?;
    let mut background = runtime.spawn_background()?;
    background.push(forward_alerts(manager.alerts(), client.clone(), runtime.shutdown_token()));
    background.push(watch_broker(broker.alerts(), Arc::clone(&runtime)));

    let reloads = tokio::runtime::Handle::current();
    {
        let runtime = Arc::clone(&runtime);
        manager.register_change_callback(MAIN_NAMESPACE, move |doc: &ConfigurationDocument| {
            let mut cfg: FieldOsConfig = match doc.parse() {
                Ok(cfg) => cfg,
                Err(e) => {
                    error!(error = %e, "reloaded configuration unreadable");
                    return;
                }
            };
            apply_env_overrides(&mut cfg);
            let runtime = Arc::clone(&runtime);
            reloads.spawn(async move {
                if let Err(e) = runtime.apply_config(cfg).await {
                    error!(error = %e, "reloaded configuration not applied");
                }
            });
        });
    }
    let _hot_reload = match manager.start_hot_reload(MAIN_NAMESPACE, options.reload_debounce) {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!(error = %e, "hot reload unavailable");
            None
        }
    };

    // ── Services ──────────────────────────────────────────────────────────
    let starter = {
        let runtime = Arc::clone(&runtime);
        tokio::spawn(async move {
            if let Err(e) = runtime.start().await {
                error!(error = %e, "services not started");
            }
        })
    };

    // ── Main loop ─────────────────────────────────────────────────────────
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut status_tick = tokio::time::interval(options.status_interval);
    status_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let shutdown = runtime.shutdown_token();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("shutdown requested by command");
                break;
            }
            _ = sigterm.recv() => {
                info!("SIGTERM received");
                break;
            }
            _ = sigint.recv() => {
                info!("SIGINT received");
                break;
            }
            _ = status_tick.tick() => {
                let snapshot = runtime.snapshot(Some(broker.get_status().await)).await;
                if let Err(e) = snapshot.write(&state_dir) {
                    warn!(error = %e, "status snapshot not written");
                }
            }
        }
    }

    // ── Shutdown: services, then our client, then the broker ──────────────
    starter.abort();
    if let Err(e) = runtime.stop().await {
        warn!(error = %e, "stopping services failed");
    }
    let snapshot = runtime.snapshot(Some(broker.get_status().await)).await;
    if let Err(e) = snapshot.write(&state_dir) {
        warn!(error = %e, "final status snapshot not written");
    }
    for handle in background {
        if tokio::time::timeout(options.shutdown_timeout, handle).await.is_err() {
            warn!("background task did not stop in time");
        }
    }
    client.close().await;
    broker.stop().await;
    info!("fieldos daemon stopped");
    Ok(())
}

/// Publish local alerts (e.g. rejected configuration) on `system/events/*`.
fn forward_alerts(
    mut alerts: broadcast::Receiver<Alert>,
    client: MessagingClient,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let msg = tokio::select! {
                _ = shutdown.cancelled() => break,
                msg = alerts.recv() => msg,
            };
            match msg {
                Ok(alert) => {
                    let topic = topics::system_event(alert.kind.as_str());
                    if let Err(e) = client.publish(&topic, Payload::Alert(alert), None) {
                        warn!(error = %e, "alert not forwarded");
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => warn!(skipped = n, "alert forwarder lagged"),
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

fn watch_broker(mut alerts: broadcast::Receiver<Alert>, runtime: Arc<FieldRuntime>) -> tokio::task::JoinHandle<()> {
    let shutdown = runtime.shutdown_token();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                msg = alerts.recv() => match msg {
                    Ok(alert) => runtime.on_broker_unavailable(alert).await,
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn daemon_rejects_services_without_commands() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        std::fs::write(
            dir.path().join("fieldos.toml"),
            "[services.nav]\ncritical = true\n",
        )?;
        let err = load_config(dir.path()).err().ok_or("config without commands was accepted")?;
        assert!(err.to_string().contains("no command"), "{err}");
        Ok(())
    }

    #[test]
    fn daemon_accepts_a_complete_configuration() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        std::fs::write(
            dir.path().join("fieldos.toml"),
            r#"
[system]
log_dir = "/tmp/fieldos-logs"

[services.nav]
command = { program = "/usr/bin/nav" }
"#,
        )?;
        let (manager, config) = load_config(dir.path())?;
        assert!(manager.get(MAIN_NAMESPACE).is_some());
        assert_eq!(daemon_log_path(&config), PathBuf::from("/tmp/fieldos-logs/fieldos.log"));
        Ok(())
    }
}
