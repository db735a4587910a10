//! `fieldos system …`
//!
//! Lifecycle commands act on the daemon process (spawn detached, SIGTERM);
//! service commands go over the bus to the running daemon.  Enabling and
//! disabling also work while the daemon is down by editing the overrides
//! file directly.

use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom};
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Child, ExitCode, Stdio};
use std::sync::Arc;
use std::time::Duration;

use colored::Colorize;
use fieldos_config::{FieldOsConfig, ServiceOverrides};
use fieldos_middleware::{MessagingClient, TopicRegistry, WsTransport};
use fieldos_runtime::daemon::{self, daemon_log_path};
use fieldos_runtime::status::{process_alive, running_daemon};
use fieldos_runtime::{OperatorAction, StatusSnapshot, init_tracing, send_command};
use fieldos_types::{FieldError, Response, SystemState};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;

use crate::render;
use crate::{SystemCommand, block_on};

const REPLY_TIMEOUT: Duration = Duration::from_secs(10);
const POLL: Duration = Duration::from_millis(250);

pub fn run(config_dir: &Path, command: SystemCommand) -> Result<ExitCode, FieldError> {
    if let SystemCommand::Start {
        foreground: true, ..
    } = command
    {
        return crate::run_daemon(config_dir.to_path_buf(), true);
    }
    let _guard = init_tracing("fieldos-cli", "warn", None);
    let (_, config) = daemon::load_config(config_dir)?;
    let state_dir = config.system.state_dir.clone();

    match command {
        SystemCommand::Start { wait, .. } => start(config_dir, &config, Duration::from_secs(wait)),
        SystemCommand::Stop { timeout } => stop(&state_dir, Duration::from_secs(timeout)),
        SystemCommand::Restart { service: Some(service) } => {
            ensure_service(&config, &service)?;
            operator(&config, OperatorAction::RestartService { service })
        }
        SystemCommand::Restart { service: None } => {
            stop(&state_dir, Duration::from_secs(30))?;
            start(config_dir, &config, Duration::from_secs(60))
        }
        SystemCommand::Status { json } => status(&state_dir, json),
        SystemCommand::Logs {
            service,
            lines,
            follow,
        } => {
            let path = match &service {
                Some(service) => {
                    ensure_service(&config, service)?;
                    config.system.log_dir.join(format!("{service}.log"))
                }
                None => daemon_log_path(&config),
            };
            logs(&path, lines, follow)
        }
        SystemCommand::Enable { service } => set_enabled(&config, service, true),
        SystemCommand::Disable { service } => set_enabled(&config, service, false),
        SystemCommand::Estop { reason } => operator(&config, OperatorAction::EmergencyStop { reason }),
        SystemCommand::Reset { token } => operator(&config, OperatorAction::ManualReset { token }),
        SystemCommand::ResetCircuit { service } => {
            ensure_service(&config, &service)?;
            operator(&config, OperatorAction::ResetCircuit { service })
        }
        SystemCommand::Maintenance { exit: true, .. } => operator(&config, OperatorAction::ExitMaintenance),
        SystemCommand::Maintenance { exit: false, reason } => {
            operator(&config, OperatorAction::EnterMaintenance { reason })
        }
    }
}

fn ensure_service(config: &FieldOsConfig, service: &str) -> Result<(), FieldError> {
    if config.services.contains_key(service) {
        Ok(())
    } else {
        Err(FieldError::UnknownService(service.to_string()))
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Daemon lifecycle
// ────────────────────────────────────────────────────────────────────────────

fn start(config_dir: &Path, config: &FieldOsConfig, wait: Duration) -> Result<ExitCode, FieldError> {
    let state_dir = &config.system.state_dir;
    if let Some(pid) = running_daemon(state_dir) {
        println!("  FieldOS is already running (pid {pid})");
        return status(state_dir, false);
    }

    let exe = std::env::current_exe()?;
    let mut child = std::process::Command::new(exe)
        .arg("--config-dir")
        .arg(config_dir)
        .arg("daemon")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .process_group(0)
        .spawn()?;
    let pid = child.id();
    println!("  Starting FieldOS (pid {pid}) …");

    match wait_settled(state_dir, &mut child, wait) {
        Startup::Settled(snapshot) => {
            render::print_status(&snapshot, Some(pid));
            Ok(exit_for(snapshot.system_state))
        }
        Startup::Pending => {
            println!(
                "  {} services not settled after {}s; see `fieldos system status`",
                "⚠".yellow().bold(),
                wait.as_secs()
            );
            Ok(ExitCode::FAILURE)
        }
        Startup::Exited => {
            println!(
                "  {} daemon exited during startup; see {}",
                "✗".red().bold(),
                daemon_log_path(config).display()
            );
            Ok(ExitCode::FAILURE)
        }
    }
}

enum Startup {
    Settled(StatusSnapshot),
    Pending,
    Exited,
}

/// Poll the status snapshot of the spawned daemon until startup is over.
fn wait_settled(state_dir: &Path, child: &mut Child, wait: Duration) -> Startup {
    let deadline = std::time::Instant::now() + wait;
    while std::time::Instant::now() < deadline {
        if !matches!(child.try_wait(), Ok(None)) {
            return Startup::Exited;
        }
        if let Ok(Some(snapshot)) = StatusSnapshot::read(state_dir) {
            let settled = !matches!(
                snapshot.system_state,
                SystemState::Initializing | SystemState::Starting
            );
            if snapshot.pid == child.id() && settled {
                return Startup::Settled(snapshot);
            }
        }
        std::thread::sleep(POLL);
    }
    Startup::Pending
}

fn stop(state_dir: &Path, timeout: Duration) -> Result<ExitCode, FieldError> {
    let Some(pid) = running_daemon(state_dir) else {
        println!("  FieldOS is not running");
        return Ok(ExitCode::SUCCESS);
    };
    let raw = i32::try_from(pid).map_err(|_| FieldError::Io(format!("invalid pid {pid}")))?;
    signal::kill(Pid::from_raw(raw), Signal::SIGTERM)
        .map_err(|e| FieldError::Io(format!("signal pid {pid}: {e}")))?;
    println!("  Stopping FieldOS (pid {pid}) …");

    let deadline = std::time::Instant::now() + timeout;
    while process_alive(pid) {
        if std::time::Instant::now() >= deadline {
            println!(
                "  {} daemon still running after {}s",
                "✗".red().bold(),
                timeout.as_secs()
            );
            return Ok(ExitCode::FAILURE);
        }
        std::thread::sleep(POLL);
    }
    println!("  {} FieldOS stopped", "✓".green().bold());
    Ok(ExitCode::SUCCESS)
}

fn status(state_dir: &Path, json: bool) -> Result<ExitCode, FieldError> {
    let pid = running_daemon(state_dir);
    let Some(snapshot) = StatusSnapshot::read(state_dir)? else {
        println!("  FieldOS is not running (no status recorded)");
        return Ok(ExitCode::FAILURE);
    };
    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    } else {
        render::print_status(&snapshot, pid);
    }
    if pid.is_none() {
        return Ok(ExitCode::FAILURE);
    }
    Ok(exit_for(snapshot.system_state))
}

fn exit_for(state: SystemState) -> ExitCode {
    if render::is_healthy(state) {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Operator commands
// ────────────────────────────────────────────────────────────────────────────

fn operator(config: &FieldOsConfig, action: OperatorAction) -> Result<ExitCode, FieldError> {
    if running_daemon(&config.system.state_dir).is_none() {
        return Err(FieldError::Connection("FieldOS is not running".into()));
    }
    let reply = block_on(request(config, action))??;
    render::print_reply(&reply);
    Ok(if reply.success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn request(config: &FieldOsConfig, action: OperatorAction) -> Result<Response, FieldError> {
    let token = if config.broker.auth.enabled {
        config.broker.auth.token.clone()
    } else {
        None
    };
    let transport = WsTransport::new(config.broker.client_url()).with_token(token);
    let client = MessagingClient::new(
        config.client_config(&format!("fieldos-cli-{}", std::process::id())),
        Arc::new(TopicRegistry::with_defaults()),
        Arc::new(transport),
    );
    let result = async {
        client.connect().await?;
        send_command(&client, action, REPLY_TIMEOUT).await
    }
    .await;
    client.close().await;
    result
}

fn set_enabled(config: &FieldOsConfig, service: String, enabled: bool) -> Result<ExitCode, FieldError> {
    ensure_service(config, &service)?;
    if running_daemon(&config.system.state_dir).is_some() {
        return operator(config, OperatorAction::SetEnabled { service, enabled });
    }

    let changed = write_override(&config.system.state_dir, &service, enabled)?;
    let verb = if enabled { "enabled" } else { "disabled" };
    if changed {
        println!("  {} {service} {verb} (applies on next start)", "✓".green().bold());
    } else {
        println!("  {service} already {verb}");
    }
    Ok(ExitCode::SUCCESS)
}

fn write_override(state_dir: &Path, service: &str, enabled: bool) -> Result<bool, FieldError> {
    let mut overrides = ServiceOverrides::load(state_dir)?;
    if !overrides.set_enabled(service, enabled) {
        return Ok(false);
    }
    overrides.save(state_dir)?;
    Ok(true)
}

// ────────────────────────────────────────────────────────────────────────────
// Logs
// ────────────────────────────────────────────────────────────────────────────

fn logs(path: &Path, lines: usize, follow: bool) -> Result<ExitCode, FieldError> {
    if !path.exists() {
        println!("  No log at {}", path.display());
        return Ok(ExitCode::FAILURE);
    }
    let (tail, mut offset) = tail_lines(path, lines)?;
    for line in tail {
        println!("{line}");
    }
    if !follow {
        return Ok(ExitCode::SUCCESS);
    }
    loop {
        std::thread::sleep(POLL);
        offset = print_appended(path, offset)?;
    }
}

/// The last `n` lines of `path` and the file length they end at.
fn tail_lines(path: &Path, n: usize) -> Result<(VecDeque<String>, u64), FieldError> {
    let file = std::fs::File::open(path)?;
    let len = file.metadata()?.len();
    let mut tail = VecDeque::with_capacity(n);
    for line in BufReader::new(file).lines() {
        let line = line?;
        if tail.len() == n {
            tail.pop_front();
        }
        if n > 0 {
            tail.push_back(line);
        }
    }
    Ok((tail, len))
}

/// Print whatever was appended after `offset`; returns the new offset.
fn print_appended(path: &Path, offset: u64) -> Result<u64, FieldError> {
    let mut file = std::fs::File::open(path)?;
    let len = file.metadata()?.len();
    // Truncated or rotated: start over.
    let from = if len < offset { 0 } else { offset };
    if len == from {
        return Ok(from);
    }
    file.seek(SeekFrom::Start(from))?;
    let mut appended = String::new();
    file.take(len - from).read_to_string(&mut appended)?;
    print!("{appended}");
    Ok(len)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tail_keeps_the_last_lines() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("nav.log");
        let body: String = (1..=10).map(|i| format!("line {i}\n")).collect();
        std::fs::write(&path, &body)?;

        let (tail, offset) = tail_lines(&path, 3)?;
        assert_eq!(tail, ["line 8", "line 9", "line 10"]);
        assert_eq!(offset, body.len() as u64);

        let (tail, _) = tail_lines(&path, 0)?;
        assert!(tail.is_empty());
        let (tail, _) = tail_lines(&path, 100)?;
        assert_eq!(tail.len(), 10);
        Ok(())
    }

    #[test]
    fn follow_restarts_after_truncation() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("nav.log");
        std::fs::write(&path, "first\nsecond\n")?;
        let (_, offset) = tail_lines(&path, 1)?;
        assert_eq!(print_appended(&path, offset)?, offset);

        std::fs::write(&path, "new\n")?;
        assert_eq!(print_appended(&path, offset)?, 4);
        Ok(())
    }

    #[test]
    fn overrides_are_written_while_the_daemon_is_down() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        assert!(write_override(dir.path(), "vision", false)?);
        assert!(!write_override(dir.path(), "vision", false)?);
        assert!(!ServiceOverrides::load(dir.path())?.is_enabled("vision", true));
        Ok(())
    }

    #[test]
    fn unknown_services_are_rejected() {
        let config = FieldOsConfig::default();
        let err = ensure_service(&config, "ghost").err();
        assert!(matches!(err, Some(FieldError::UnknownService(ref s)) if s == "ghost"));
    }
}
