//! Tether Daemon
//!
//! Signaling endpoint for secure device pairing.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tether_daemon::config::{default_config_path, Config};
use tether_daemon::identity::LocalIdentity;
use tether_daemon::orchestrator::{DaemonOrchestrator, OrchestratorEvent};
use tether_protocol::SessionCode;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

/// Client id used for requests read from standard input.
const STDIN_CLIENT_ID: &str = "stdin";

/// Tether Daemon - secure device pairing and session signaling.
#[derive(Parser, Debug)]
#[command(name = "tether")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for the daemon.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Start the daemon and serve JSON signaling requests on stdin
    Start,

    /// Print this device's id and fingerprint
    Fingerprint {
        /// Print the full hex fingerprint
        #[arg(long)]
        full: bool,
    },

    /// Generate or check session codes
    #[command(subcommand)]
    Code(CodeCommands),

    /// Inspect the configuration
    #[command(subcommand)]
    Config(ConfigCommands),
}

/// Subcommands for session codes.
#[derive(Subcommand, Debug, Clone)]
pub enum CodeCommands {
    /// Generate fresh session codes
    Generate {
        /// Number of codes to generate
        #[arg(long, short = 'n', default_value = "1")]
        count: usize,
    },

    /// Check whether a code is well formed
    Check {
        /// Code as typed, separators allowed
        code: String,
    },
}

/// Subcommands for configuration.
#[derive(Subcommand, Debug, Clone)]
pub enum ConfigCommands {
    /// Print the effective configuration as TOML
    Show,

    /// Validate the configuration file
    Validate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let mut config = Config::load(&config_path)?;
    config.apply_env_overrides();

    // Initialize tracing; logs go to stderr so stdout carries responses only
    let filter = if cli.verbose {
        "debug".to_string()
    } else {
        config.daemon.log_level.clone()
    };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Start => {
            config.validate()?;
            tracing::info!(config = %config_path.display(), "Tether daemon starting...");
            let mut orchestrator = DaemonOrchestrator::new(config)?;
            run_stdio(&mut orchestrator).await?;
        }
        Commands::Fingerprint { full } => {
            let identity = LocalIdentity::load_or_generate(&config.daemon.data_dir)?;
            println!("Device ID:   {}", identity.device_id);
            if full {
                println!("Fingerprint: {}", identity.fingerprint.to_hex());
            } else {
                println!("Fingerprint: {}", identity.fingerprint.medium_display());
            }
        }
        Commands::Code(CodeCommands::Generate { count }) => {
            for _ in 0..count.max(1) {
                println!("{}", SessionCode::generate().to_display());
            }
        }
        Commands::Code(CodeCommands::Check { code }) => match SessionCode::parse(&code) {
            Ok(parsed) => println!("valid: {}", parsed.to_display()),
            Err(e) => {
                eprintln!("invalid: {}", e);
                std::process::exit(1);
            }
        },
        Commands::Config(ConfigCommands::Show) => {
            print!("{}", config.to_toml()?);
        }
        Commands::Config(ConfigCommands::Validate) => match config.validate() {
            Ok(()) => println!("Configuration is valid: {}", config_path.display()),
            Err(e) => {
                eprintln!("Configuration error: {}", e);
                std::process::exit(1);
            }
        },
    }

    Ok(())
}

/// Runs the orchestrator, answering one JSON request per stdin line.
///
/// Returns when stdin closes or a shutdown signal arrives.
async fn run_stdio(orchestrator: &mut DaemonOrchestrator) -> anyhow::Result<()> {
    orchestrator.start().await?;

    let mut events = orchestrator.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                OrchestratorEvent::StateChanged(state) => {
                    tracing::info!("Orchestrator state: {:?}", state);
                }
                OrchestratorEvent::RouterOpened { session_id } => {
                    tracing::debug!(session_id = %session_id, "Router opened");
                }
                OrchestratorEvent::SessionClosed { session_id } => {
                    tracing::info!(session_id = %session_id, "Session closed");
                }
                OrchestratorEvent::ParticipantDisconnected {
                    session_id,
                    device_id,
                } => {
                    tracing::info!(session_id = %session_id, device_id = %device_id, "Participant disconnected");
                }
            }
        }
    });

    let signaling = std::sync::Arc::clone(orchestrator.signaling());
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    loop {
        tokio::select! {
            _ = wait_for_shutdown_signal() => {
                tracing::info!("Received shutdown signal");
                break;
            }
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    tracing::info!("Input closed");
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                let response = signaling.handle_json(STDIN_CLIENT_ID, &line).await;
                stdout.write_all(response.as_bytes()).await?;
                stdout.write_all(b"\n").await?;
                stdout.flush().await?;
            }
        }
    }

    orchestrator.stop().await?;
    Ok(())
}

/// Wait for a shutdown signal (Ctrl-C).
async fn wait_for_shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_debug_assert() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_start_command() {
        let cli = Cli::try_parse_from(["tether", "start"]).unwrap();
        assert!(matches!(cli.command, Commands::Start));
        assert!(!cli.verbose);
        assert!(cli.config.is_none());
    }

    #[test]
    fn test_fingerprint_command() {
        let cli = Cli::try_parse_from(["tether", "fingerprint"]).unwrap();
        assert!(matches!(cli.command, Commands::Fingerprint { full: false }));

        let cli = Cli::try_parse_from(["tether", "fingerprint", "--full"]).unwrap();
        assert!(matches!(cli.command, Commands::Fingerprint { full: true }));
    }

    #[test]
    fn test_code_generate_default_count() {
        let cli = Cli::try_parse_from(["tether", "code", "generate"]).unwrap();
        match cli.command {
            Commands::Code(CodeCommands::Generate { count }) => assert_eq!(count, 1),
            _ => panic!("Expected Code Generate command"),
        }
    }

    #[test]
    fn test_code_generate_with_count() {
        let cli = Cli::try_parse_from(["tether", "code", "generate", "-n", "5"]).unwrap();
        match cli.command {
            Commands::Code(CodeCommands::Generate { count }) => assert_eq!(count, 5),
            _ => panic!("Expected Code Generate command"),
        }
    }

    #[test]
    fn test_code_check() {
        let cli = Cli::try_parse_from(["tether", "code", "check", "ABCD-EFGH"]).unwrap();
        match cli.command {
            Commands::Code(CodeCommands::Check { code }) => assert_eq!(code, "ABCD-EFGH"),
            _ => panic!("Expected Code Check command"),
        }
    }

    #[test]
    fn test_code_check_requires_argument() {
        assert!(Cli::try_parse_from(["tether", "code", "check"]).is_err());
    }

    #[test]
    fn test_config_commands() {
        let cli = Cli::try_parse_from(["tether", "config", "show"]).unwrap();
        assert!(matches!(cli.command, Commands::Config(ConfigCommands::Show)));

        let cli = Cli::try_parse_from(["tether", "config", "validate"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Config(ConfigCommands::Validate)
        ));
    }

    #[test]
    fn test_global_verbose_flag() {
        let cli = Cli::try_parse_from(["tether", "--verbose", "start"]).unwrap();
        assert!(cli.verbose);
    }

    #[test]
    fn test_global_config_flag() {
        let cli =
            Cli::try_parse_from(["tether", "fingerprint", "--config", "/tmp/tether.toml"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/tether.toml")));
    }

    #[test]
    fn test_unknown_command_fails() {
        assert!(Cli::try_parse_from(["tether", "pair"]).is_err());
    }
}
