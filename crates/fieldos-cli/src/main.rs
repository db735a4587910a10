//! `fieldos-cli` – FieldOS Command Line Interface
//!
//! The `fieldos` binary is the operator's handle on a machine:
//!
//! 1. `fieldos system …` starts, stops and inspects the daemon and the
//!    services it supervises (`start`, `stop`, `restart`, `status`, `logs`,
//!    `enable`, `disable`, `estop`, `reset`, `maintenance`).
//! 2. `fieldos broker serve` is the native broker process the daemon spawns.
//! 3. `fieldos config validate|schema` checks a configuration directory and
//!    prints the JSON Schema of the main namespace.
//!
//! Exit codes: `0` success, `1` failure or an unhealthy system, `2` invalid
//! arguments (clap).

mod broker;
mod render;
mod system;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use colored::Colorize;
use fieldos_config::{MAIN_NAMESPACE, json_schema};
use fieldos_kernel::plan_start_order;
use fieldos_runtime::daemon::{self, DaemonOptions, daemon_log_path};
use fieldos_runtime::init_tracing;
use fieldos_types::FieldError;

#[derive(Parser)]
#[command(name = "fieldos")]
#[command(about = "FieldOS - service orchestration for autonomous field machines")]
#[command(version)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration directory holding `fieldos.toml`
    #[arg(long = "config-dir", env = "FIELDOS_CONFIG_DIR", default_value = "/etc/fieldos", global = true)]
    config_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Control the FieldOS daemon and its services
    System {
        #[command(subcommand)]
        action: SystemCommand,
    },

    /// Run the native message broker
    Broker {
        #[command(subcommand)]
        action: BrokerCommand,
    },

    /// Inspect configuration
    Config {
        #[command(subcommand)]
        action: ConfigCommand,
    },

    /// Run the daemon in this process (used by `system start`)
    #[command(hide = true)]
    Daemon,
}

#[derive(Subcommand, Debug, PartialEq)]
pub(crate) enum SystemCommand {
    /// Start the daemon and every enabled service
    Start {
        /// Stay in the foreground and log to stderr
        #[arg(short = 'f', long = "foreground")]
        foreground: bool,

        /// Seconds to wait for the services to come up
        #[arg(long = "wait", default_value_t = 60)]
        wait: u64,
    },

    /// Stop every service and the daemon
    Stop {
        /// Seconds to wait for the daemon to exit
        #[arg(long = "timeout", default_value_t = 30)]
        timeout: u64,
    },

    /// Restart one service, or the whole system
    Restart {
        /// Service to restart (default: everything)
        service: Option<String>,
    },

    /// Show system state and per-service health
    Status {
        /// Print the raw status snapshot as JSON
        #[arg(long = "json")]
        json: bool,
    },

    /// Show the log of a service, or the daemon log
    Logs {
        /// Service whose log to show (default: the daemon)
        service: Option<String>,

        /// Number of trailing lines
        #[arg(short = 'n', long = "lines", default_value_t = 50)]
        lines: usize,

        /// Keep printing lines as they are written
        #[arg(short = 'f', long = "follow")]
        follow: bool,
    },

    /// Enable a service (persisted across restarts)
    Enable { service: String },

    /// Disable a service (persisted across restarts)
    Disable { service: String },

    /// Engage the emergency stop
    Estop {
        #[arg(long = "reason", default_value = "operator emergency stop")]
        reason: String,
    },

    /// Clear an emergency stop and restart services
    Reset {
        /// Reset token from `system.reset_token`
        #[arg(long = "token", env = "FIELDOS_RESET_TOKEN", hide_env_values = true)]
        token: String,
    },

    /// Close the circuit breaker of a suspended service
    ResetCircuit { service: String },

    /// Enter or leave maintenance mode
    Maintenance {
        /// Leave maintenance mode instead of entering it
        #[arg(long = "exit")]
        exit: bool,

        #[arg(long = "reason", default_value = "operator request")]
        reason: String,
    },
}

#[derive(Subcommand)]
enum BrokerCommand {
    /// Serve the native broker with a rendered `broker.toml`
    Serve {
        #[arg(long = "config")]
        config: PathBuf,
    },
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Load and validate the configuration directory
    Validate,
    /// Print the JSON Schema of the main namespace
    Schema,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {e}", "error:".red().bold());
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode, FieldError> {
    match cli.command {
        Commands::System { action } => system::run(&cli.config_dir, action),
        Commands::Broker {
            action: BrokerCommand::Serve { config },
        } => {
            let _guard = init_tracing("fieldos-broker", "info", None);
            block_on(broker::serve(config))?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Config { action } => config_command(&cli.config_dir, action),
        Commands::Daemon => run_daemon(cli.config_dir, false),
    }
}

/// Run the daemon in this process.  In the foreground it logs to stderr,
/// detached to its log file.
pub(crate) fn run_daemon(config_dir: PathBuf, foreground: bool) -> Result<ExitCode, FieldError> {
    let (manager, config) = daemon::load_config(&config_dir)?;
    let log_file = (!foreground).then(|| daemon_log_path(&config));
    let _guard = init_tracing("fieldos", &config.system.log_level, log_file.as_deref());
    block_on(daemon::run(manager, config, DaemonOptions::new(config_dir)))?;
    Ok(ExitCode::SUCCESS)
}

fn config_command(config_dir: &std::path::Path, action: ConfigCommand) -> Result<ExitCode, FieldError> {
    match action {
        ConfigCommand::Schema => {
            println!("{}", serde_json::to_string_pretty(&json_schema())?);
            Ok(ExitCode::SUCCESS)
        }
        ConfigCommand::Validate => match daemon::load_config(config_dir) {
            Ok((manager, config)) => {
                let order = plan_start_order(&config.service_descriptors())?;
                println!(
                    "  {} {} is valid",
                    "✓".green().bold(),
                    manager.base_path(MAIN_NAMESPACE).display().to_string().bold()
                );
                if let Some(env) = manager.environment() {
                    println!("  Environment overlay: {}", env.bold());
                }
                println!("  {} service(s), start order: {}", order.len(), order.join(" → "));
                Ok(ExitCode::SUCCESS)
            }
            Err(e) => {
                println!("  {} {e}", "✗".red().bold());
                Ok(ExitCode::FAILURE)
            }
        },
    }
}

pub(crate) fn block_on<F: std::future::Future>(future: F) -> Result<F::Output, FieldError> {
    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
    Ok(runtime.block_on(future))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn command_line_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn system_subcommands_parse() -> Result<(), Box<dyn std::error::Error>> {
        let cli = Cli::try_parse_from(["fieldos", "--config-dir", "/tmp/cfg", "system", "logs", "nav", "-n", "20"])?;
        assert_eq!(cli.config_dir, PathBuf::from("/tmp/cfg"));
        match cli.command {
            Commands::System { action } => assert_eq!(
                action,
                SystemCommand::Logs {
                    service: Some("nav".into()),
                    lines: 20,
                    follow: false,
                }
            ),
            _ => panic!("expected a system command"),
        }

        let cli = Cli::try_parse_from(["fieldos", "system", "restart"])?;
        assert!(matches!(
            cli.command,
            Commands::System {
                action: SystemCommand::Restart { service: None }
            }
        ));
        Ok(())
    }

    #[test]
    fn invalid_arguments_are_usage_errors() {
        let err = Cli::try_parse_from(["fieldos", "system", "enable"]).err();
        assert_eq!(err.map(|e| e.exit_code()), Some(2));
        let err = Cli::try_parse_from(["fieldos", "system", "launch"]).err();
        assert_eq!(err.map(|e| e.exit_code()), Some(2));
    }
}
