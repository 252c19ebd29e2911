// CLI module - User-facing command-line interface

mod output;

use crate::config::{Registry, SupervisorSettings};
use crate::daemon::Daemon;
use crate::error::ShepherdError;
use crate::ipc::{Command, IpcClient};
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

/// Shepherd - keeps a declared set of processes running
#[derive(Parser)]
#[command(name = "shepherd")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Control socket of a running supervisor. Without this or --config,
    /// clients look for logs/shepherd.sock under the current directory, while
    /// `run` places it in the log directory next to its config file.
    #[arg(short, long, global = true)]
    socket: Option<PathBuf>,

    /// Config file to read the control socket location from
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log debug output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load a config file and supervise its processes until interrupted
    Run {
        /// TOML or JSON process config
        #[arg(value_name = "CONFIG")]
        config_file: PathBuf,
    },

    /// Validate a config file without starting anything
    Check {
        /// TOML or JSON process config
        #[arg(value_name = "CONFIG")]
        config_file: PathBuf,
    },

    /// List all supervised processes
    List,

    /// Show one process in detail
    Status {
        /// Process name
        name: String,
    },

    /// Start a stopped process
    Start {
        /// Process name
        name: String,
    },

    /// Start every process that is not running
    StartAll,

    /// Stop a process without restarting it
    Stop {
        /// Process name
        name: String,
    },

    /// Stop and relaunch a process
    Restart {
        /// Process name
        name: String,
    },

    /// Stop every process and exit the supervisor
    Shutdown,
}

impl Cli {
    /// Run the CLI application
    pub fn run() -> Result<()> {
        let cli = Cli::parse();
        init_tracing(cli.verbose);
        cli.execute()
    }

    /// Execute the parsed command
    fn execute(&self) -> Result<()> {
        match &self.command {
            Commands::Run { config_file } => self.run_supervisor(config_file),
            Commands::Check { config_file } => check_config(config_file),
            _ => self.send_to_supervisor(),
        }
    }

    fn run_supervisor(&self, config_file: &Path) -> Result<()> {
        let registry = load_registry(config_file)?;
        output::print_info(&format!(
            "Loaded {} process(es) from {}",
            registry.len(),
            config_file.display()
        ));

        let runtime = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;
        let socket = self.socket.clone();
        runtime.block_on(async move { Daemon::new(registry, socket).run().await })?;

        output::print_success_msg("Supervisor stopped");
        Ok(())
    }

    fn send_to_supervisor(&self) -> Result<()> {
        let command = self.build_command()?;
        let client = IpcClient::with_socket_path(self.socket_path()?);

        let response = match client.send_command(command) {
            Ok(response) => response,
            Err(ShepherdError::DaemonNotRunning) => bail!(
                "No supervisor is listening on {}. Point --socket at its control socket, \
                 or pass --config with the file given to `shepherd run`",
                client.socket_path().display()
            ),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Control socket {}", client.socket_path().display()))
            }
        };

        match response.result {
            Ok(data) => {
                output::print_success(&data);
                Ok(())
            }
            Err(error_msg) => bail!(error_msg),
        }
    }

    /// Build an IPC command from the CLI arguments
    fn build_command(&self) -> Result<Command> {
        let command = match &self.command {
            Commands::List => Command::List,
            Commands::Status { name } => Command::Status { name: name.clone() },
            Commands::Start { name } => Command::Start { name: name.clone() },
            Commands::StartAll => Command::StartAll,
            Commands::Stop { name } => Command::Stop { name: name.clone() },
            Commands::Restart { name } => Command::Restart { name: name.clone() },
            Commands::Shutdown => Command::Shutdown,
            Commands::Run { .. } | Commands::Check { .. } => {
                bail!("this command does not talk to a running supervisor")
            }
        };
        Ok(command)
    }

    /// `--socket`, else the socket named by `--config`, else the default location
    fn socket_path(&self) -> Result<PathBuf> {
        if let Some(ref socket) = self.socket {
            return Ok(socket.clone());
        }
        if let Some(ref config) = self.config {
            return Ok(load_registry(config)?.settings().control_socket());
        }
        Ok(SupervisorSettings::default().control_socket())
    }
}

fn load_registry(config_file: &Path) -> Result<Registry> {
    let registry = Registry::load(config_file)
        .with_context(|| format!("Failed to load {}", config_file.display()))?;
    if registry.is_empty() {
        bail!("{} declares no processes", config_file.display());
    }
    Ok(registry)
}

fn check_config(config_file: &Path) -> Result<()> {
    let registry = load_registry(config_file)?;
    output::print_spec_table(registry.specs());
    output::print_success_msg(&format!(
        "{} is valid ({} process(es))",
        config_file.display(),
        registry.len()
    ));
    Ok(())
}

/// Install the tracing subscriber. `RUST_LOG` overrides the default filter.
pub fn init_tracing(verbose: bool) {
    let default_filter = if verbose {
        "shepherd=debug"
    } else {
        "shepherd=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_run() {
        let cli = Cli::try_parse_from(["shepherd", "run", "apps.toml", "--verbose"]).unwrap();
        assert!(cli.verbose);
        match cli.command {
            Commands::Run { config_file } => assert_eq!(config_file, PathBuf::from("apps.toml")),
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_build_command() {
        let cli = Cli::try_parse_from(["shepherd", "restart", "api", "-s", "/tmp/s.sock"]).unwrap();
        assert_eq!(
            cli.build_command().unwrap(),
            Command::Restart {
                name: "api".to_string()
            }
        );
        assert_eq!(cli.socket_path().unwrap(), PathBuf::from("/tmp/s.sock"));

        let cli = Cli::try_parse_from(["shepherd", "start-all"]).unwrap();
        assert_eq!(cli.build_command().unwrap(), Command::StartAll);
    }

    #[test]
    fn test_not_running_error_names_socket_and_flags() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let socket = temp_dir.path().join("absent.sock");
        let cli = Cli::try_parse_from([
            "shepherd",
            "list",
            "--socket",
            socket.to_str().unwrap(),
        ])
        .unwrap();

        let message = cli.send_to_supervisor().unwrap_err().to_string();
        assert!(message.contains(socket.to_str().unwrap()), "{}", message);
        assert!(message.contains("--socket"), "{}", message);
        assert!(message.contains("--config"), "{}", message);
    }

    #[test]
    fn test_default_socket_path() {
        let cli = Cli::try_parse_from(["shepherd", "list"]).unwrap();
        assert_eq!(
            cli.socket_path().unwrap(),
            PathBuf::from("logs").join("shepherd.sock")
        );
    }
}
