//! Terminal output for `fieldos system status` and command replies.

use chrono::{DateTime, Utc};
use colored::{ColoredString, Colorize};
use fieldos_kernel::ServicePhase;
use fieldos_runtime::StatusSnapshot;
use fieldos_types::{CircuitState, Response, SystemState};

/// States in which `status` exits with 0.
pub fn is_healthy(state: SystemState) -> bool {
    matches!(state, SystemState::Running | SystemState::Maintenance)
}

fn system_state(state: SystemState) -> ColoredString {
    let label = state.as_str();
    match state {
        SystemState::Running => label.green().bold(),
        SystemState::Degraded | SystemState::Maintenance | SystemState::Starting => label.yellow().bold(),
        SystemState::Error | SystemState::EmergencyStop => label.red().bold(),
        _ => label.normal(),
    }
}

fn phase(phase: ServicePhase) -> ColoredString {
    let label = phase.as_str();
    match phase {
        ServicePhase::Running => label.green(),
        ServicePhase::Starting | ServicePhase::RestartPending | ServicePhase::Blocked => label.yellow(),
        ServicePhase::Suspended | ServicePhase::Exhausted => label.red(),
        _ => label.dimmed(),
    }
}

fn circuit(state: CircuitState) -> ColoredString {
    let label = state.to_string();
    match state {
        CircuitState::Closed => label.normal(),
        CircuitState::HalfOpen => label.yellow(),
        CircuitState::Open => label.red().bold(),
    }
}

/// `"12s ago"`, `"3m ago"`, `"2h ago"`.
pub fn age(at: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let secs = (now - at).num_seconds().max(0);
    match secs {
        0..=119 => format!("{secs}s ago"),
        120..=7199 => format!("{}m ago", secs / 60),
        _ => format!("{}h ago", secs / 3600),
    }
}

pub fn print_status(snapshot: &StatusSnapshot, daemon_pid: Option<u32>) {
    let now = Utc::now();
    println!();
    match daemon_pid {
        Some(pid) => println!("  {} {}", "Daemon".bold(), format!("running (pid {pid})").green()),
        None => println!(
            "  {} {}",
            "Daemon".bold(),
            format!("not running, last snapshot {}", age(snapshot.written_at, now)).red()
        ),
    }
    match snapshot.previous_state {
        Some(previous) => println!(
            "  {} {} {}",
            "System".bold(),
            system_state(snapshot.system_state),
            format!("(was {previous})").dimmed()
        ),
        None => println!("  {} {}", "System".bold(), system_state(snapshot.system_state)),
    }
    let s = &snapshot.summary;
    println!(
        "  {} {} healthy, {} degraded, {} starting, {} failed, {} stopped",
        "Services".bold(),
        s.healthy,
        s.degraded,
        s.starting,
        s.failed,
        s.stopped
    );
    if let Some(broker) = &snapshot.broker {
        let state = if broker.gave_up {
            "gave up".red()
        } else if broker.running && broker.accepting_connections {
            "accepting connections".green()
        } else if broker.running {
            "running, not accepting".yellow()
        } else {
            "down".red()
        };
        println!(
            "  {} {} {}",
            "Broker".bold(),
            state,
            format!("({} restarts)", broker.restarts).dimmed()
        );
    }

    println!();
    println!(
        "  {:<16} {:<16} {:<10} {:<10} {:>8}  {:<10}  {}",
        "SERVICE".bold(),
        "PHASE".bold(),
        "STATE".bold(),
        "CIRCUIT".bold(),
        "RESTARTS".bold(),
        "HEARTBEAT".bold(),
        "LAST ERROR".bold()
    );
    for line in &snapshot.services {
        let name = if line.critical {
            format!("{}*", line.service_id)
        } else {
            line.service_id.clone()
        };
        println!(
            "  {:<16} {:<16} {:<10} {:<10} {:>8}  {:<10}  {}",
            name,
            phase(line.phase),
            line.state.to_string(),
            circuit(line.circuit_state),
            line.restarts,
            line.last_heartbeat.map(|t| age(t, now)).unwrap_or_else(|| "-".into()),
            line.last_error.as_deref().unwrap_or("").dimmed()
        );
    }
    if snapshot.services.iter().any(|l| l.critical) {
        println!("  {}", "* critical".dimmed());
    }

    let open: Vec<&str> = snapshot.open_circuits().map(|l| l.service_id.as_str()).collect();
    if !open.is_empty() {
        println!();
        for id in open {
            println!(
                "  {} circuit open for {}: restarts suspended, run `{}` once fixed",
                "⚠".yellow().bold(),
                id.bold(),
                format!("fieldos system reset-circuit {id}").bold()
            );
        }
    }
    println!();
}

pub fn print_reply(reply: &Response) {
    if reply.success {
        println!("  {} {}", "✓".green().bold(), reply.message);
    } else {
        println!("  {} {}", "✗".red().bold(), reply.message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn only_running_and_maintenance_are_healthy() {
        assert!(is_healthy(SystemState::Running));
        assert!(is_healthy(SystemState::Maintenance));
        assert!(!is_healthy(SystemState::Degraded));
        assert!(!is_healthy(SystemState::EmergencyStop));
    }

    #[test]
    fn ages_are_rounded_to_a_readable_unit() {
        let now = Utc::now();
        assert_eq!(age(now - Duration::seconds(42), now), "42s ago");
        assert_eq!(age(now - Duration::minutes(5), now), "5m ago");
        assert_eq!(age(now - Duration::hours(3), now), "3h ago");
        assert_eq!(age(now + Duration::seconds(3), now), "0s ago");
    }
}
