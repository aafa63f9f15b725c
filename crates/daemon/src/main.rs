//! Lockbox Daemon
//!
//! Multi-user file storage server.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use daemon::accounts::AccountRegistry;
use daemon::config::{default_config_path, Config};
use daemon::logging::init_logging;
use daemon::server::{Server, ServerContext, ServerOptions};

/// Lockbox Daemon - multi-user file storage server.
#[derive(Parser, Debug)]
#[command(name = "lockbox-daemon")]
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
    /// Run the server until an admin sends `stop` or a signal arrives
    Serve {
        /// Address to bind (overrides network.bind_address)
        #[arg(long, value_name = "ADDR")]
        bind: Option<String>,

        /// Port to listen on (overrides network.port)
        #[arg(long, short)]
        port: Option<u16>,
    },

    /// Manage user accounts
    #[command(subcommand)]
    Users(UsersCommands),

    /// Inspect configuration
    #[command(subcommand)]
    Config(ConfigCommands),
}

/// User account subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum UsersCommands {
    /// List accounts and their remaining quota
    List,

    /// Register an account without going through the server
    Add {
        /// Account name
        username: String,

        /// Password
        password: String,

        /// Upload allowance in bytes (defaults to storage.default_quota)
        #[arg(long, value_name = "BYTES")]
        quota: Option<u64>,
    },

    /// Overwrite an account's remaining quota
    SetQuota {
        /// Account name
        username: String,

        /// New remaining quota in bytes
        bytes: u64,
    },
}

/// Configuration subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum ConfigCommands {
    /// Print the effective configuration as TOML
    Show,

    /// Write the effective configuration to the config file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default()?
    };

    // Apply environment variable overrides
    config.apply_env_overrides();

    if let Commands::Serve { bind, port } = &cli.command {
        if let Some(bind) = bind {
            config.network.bind_address = bind.clone();
        }
        if let Some(port) = port {
            config.network.port = *port;
        }
    }

    // Validate configuration
    config.validate()?;

    // File writers flush on drop, so the guards live until exit.
    let _log_guards = init_logging(
        &config.daemon.log_level,
        cli.verbose,
        config.daemon.log_dir.as_deref(),
    )?;

    if let Some(config_path) = &cli.config {
        tracing::debug!("Using config file: {:?}", config_path);
    }

    match cli.command {
        Commands::Serve { .. } => serve(config).await?,
        Commands::Users(cmd) => {
            let registry =
                AccountRegistry::from_config(&config).context("Failed to open account registry")?;

            match cmd {
                UsersCommands::List => print_accounts(&registry),
                UsersCommands::Add {
                    username,
                    password,
                    quota,
                } => {
                    let quota = quota.unwrap_or(config.storage.default_quota);
                    registry
                        .register_with_quota(&username, &password, quota)
                        .with_context(|| format!("Failed to add user {username}"))?;
                    println!("User {} added with quota {} bytes", username, quota);
                }
                UsersCommands::SetQuota { username, bytes } => {
                    registry
                        .set_quota(&username, bytes)
                        .with_context(|| format!("Failed to set quota for {username}"))?;
                    println!("Quota for {} set to {} bytes", username, bytes);
                }
            }
        }
        Commands::Config(ConfigCommands::Show) => {
            print!("{}", config.to_toml()?);
        }
        Commands::Config(ConfigCommands::Init { force }) => {
            let path = cli.config.clone().unwrap_or_else(default_config_path);
            if path.exists() && !force {
                anyhow::bail!(
                    "Config file {} already exists (use --force to overwrite)",
                    path.display()
                );
            }
            config.save(&path)?;
            println!("Configuration written to {}", path.display());
        }
    }

    Ok(())
}

/// Run the server in the foreground.
async fn serve(config: Config) -> anyhow::Result<()> {
    tracing::info!("Lockbox daemon starting...");

    let context = Arc::new(ServerContext::from_config(&config)?);
    tracing::info!(
        accounts = context.registry().len(),
        users_dir = %config.users_dir().display(),
        "Account registry loaded"
    );

    let server = Server::bind(
        config.listen_addr(),
        context,
        ServerOptions::from_config(&config),
    )
    .await
    .with_context(|| format!("Failed to listen on {}", config.listen_addr()))?;

    // Translate SIGTERM/SIGINT into a graceful shutdown
    let coordinator = server.coordinator();
    tokio::spawn(async move {
        match wait_for_shutdown_signal().await {
            Ok(()) => coordinator.request_shutdown(),
            Err(e) => tracing::error!("Signal handling unavailable: {:#}", e),
        }
    });

    server.run().await?;
    tracing::info!("Lockbox daemon stopped");
    Ok(())
}

/// Print accounts as a table.
fn print_accounts(registry: &AccountRegistry) {
    let accounts = registry.list();
    if accounts.is_empty() {
        println!("No accounts registered.");
        return;
    }

    println!("{:<32}  {:>16}", "USERNAME", "QUOTA REMAINING");
    for account in accounts {
        println!("{:<32}  {:>16}", account.username, account.quota_remaining);
    }
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
#[cfg(unix)]
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;
    let mut sigint =
        signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT");
        }
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    tracing::info!("Received Ctrl-C");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_debug_assert() {
        // Verify the CLI structure is valid
        Cli::command().debug_assert();
    }

    #[test]
    fn test_serve_command() {
        let cli = Cli::try_parse_from(["lockbox-daemon", "serve"]).unwrap();
        match cli.command {
            Commands::Serve { bind, port } => {
                assert!(bind.is_none());
                assert!(port.is_none());
            }
            _ => panic!("Expected Serve command"),
        }
    }

    #[test]
    fn test_serve_with_overrides() {
        let cli = Cli::try_parse_from([
            "lockbox-daemon",
            "serve",
            "--bind",
            "127.0.0.1",
            "--port",
            "7000",
        ])
        .unwrap();
        match cli.command {
            Commands::Serve { bind, port } => {
                assert_eq!(bind.as_deref(), Some("127.0.0.1"));
                assert_eq!(port, Some(7000));
            }
            _ => panic!("Expected Serve command"),
        }
    }

    #[test]
    fn test_serve_rejects_invalid_port() {
        assert!(Cli::try_parse_from(["lockbox-daemon", "serve", "--port", "70000"]).is_err());
    }

    #[test]
    fn test_users_list() {
        let cli = Cli::try_parse_from(["lockbox-daemon", "users", "list"]).unwrap();
        assert!(matches!(cli.command, Commands::Users(UsersCommands::List)));
    }

    #[test]
    fn test_users_add() {
        let cli =
            Cli::try_parse_from(["lockbox-daemon", "users", "add", "alice", "secret"]).unwrap();
        match cli.command {
            Commands::Users(UsersCommands::Add {
                username,
                password,
                quota,
            }) => {
                assert_eq!(username, "alice");
                assert_eq!(password, "secret");
                assert!(quota.is_none());
            }
            _ => panic!("Expected Users Add command"),
        }
    }

    #[test]
    fn test_users_add_with_quota() {
        let cli = Cli::try_parse_from([
            "lockbox-daemon",
            "users",
            "add",
            "bob",
            "pw",
            "--quota",
            "2048",
        ])
        .unwrap();
        match cli.command {
            Commands::Users(UsersCommands::Add { quota, .. }) => assert_eq!(quota, Some(2048)),
            _ => panic!("Expected Users Add command"),
        }
    }

    #[test]
    fn test_users_set_quota() {
        let cli =
            Cli::try_parse_from(["lockbox-daemon", "users", "set-quota", "alice", "500"]).unwrap();
        match cli.command {
            Commands::Users(UsersCommands::SetQuota { username, bytes }) => {
                assert_eq!(username, "alice");
                assert_eq!(bytes, 500);
            }
            _ => panic!("Expected Users SetQuota command"),
        }
    }

    #[test]
    fn test_users_set_quota_requires_number() {
        assert!(
            Cli::try_parse_from(["lockbox-daemon", "users", "set-quota", "alice", "lots"]).is_err()
        );
    }

    #[test]
    fn test_config_show() {
        let cli = Cli::try_parse_from(["lockbox-daemon", "config", "show"]).unwrap();
        assert!(matches!(cli.command, Commands::Config(ConfigCommands::Show)));
    }

    #[test]
    fn test_config_init() {
        let cli = Cli::try_parse_from(["lockbox-daemon", "config", "init"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Config(ConfigCommands::Init { force: false })
        ));

        let cli = Cli::try_parse_from(["lockbox-daemon", "config", "init", "--force"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Config(ConfigCommands::Init { force: true })
        ));
    }

    #[test]
    fn test_global_flags() {
        let cli = Cli::try_parse_from([
            "lockbox-daemon",
            "users",
            "list",
            "--verbose",
            "--config",
            "/tmp/lockbox.toml",
        ])
        .unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/lockbox.toml")));
    }

    #[test]
    fn test_missing_subcommand() {
        assert!(Cli::try_parse_from(["lockbox-daemon"]).is_err());
    }
}
