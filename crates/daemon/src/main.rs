//! webterm daemon
//!
//! Serves shell sessions to the browser over websockets.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use daemon::auth::generate_token;
use daemon::config::{default_config_path, Config};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// webterm - browser terminal sessions that survive disconnects.
#[derive(Parser, Debug)]
#[command(name = "webterm")]
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

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Start the server
    Serve {
        /// Address to bind
        #[arg(long)]
        host: Option<String>,

        /// Port to bind
        #[arg(long, short)]
        port: Option<u16>,

        /// Shared access token
        #[arg(long, conflicts_with = "no_auth")]
        token: Option<String>,

        /// Disable authentication even if a token is configured
        #[arg(long)]
        no_auth: bool,

        /// Directory of static client files to serve
        #[arg(long, value_name = "DIR")]
        static_dir: Option<PathBuf>,
    },

    /// Inspect or create the configuration file
    #[command(subcommand)]
    Config(ConfigCommands),

    /// Print a new random access token
    GenerateToken,
}

/// Subcommands for configuration management.
#[derive(Subcommand, Debug, Clone)]
pub enum ConfigCommands {
    /// Print the effective configuration
    Show,

    /// Print the configuration file path
    Path,

    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long, short)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.clone().unwrap_or_else(default_config_path);

    match cli.command {
        Commands::GenerateToken => {
            println!("{}", generate_token());
            Ok(())
        }
        Commands::Config(ConfigCommands::Path) => {
            println!("{}", config_path.display());
            Ok(())
        }
        Commands::Config(ConfigCommands::Init { force }) => {
            if config_path.exists() && !force {
                anyhow::bail!(
                    "{} already exists (use --force to overwrite)",
                    config_path.display()
                );
            }
            let mut config = Config::default();
            config.server.token = Some(generate_token());
            config.save(&config_path)?;
            println!("Wrote {}", config_path.display());
            Ok(())
        }
        Commands::Config(ConfigCommands::Show) => {
            let config = load_config(&config_path)?;
            print!("{}", config.to_toml()?);
            Ok(())
        }
        Commands::Serve {
            host,
            port,
            token,
            no_auth,
            static_dir,
        } => {
            let mut config = load_config(&config_path)?;
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(token) = token {
                config.server.token = Some(token);
            }
            if no_auth {
                config.server.token = None;
            }
            if let Some(dir) = static_dir {
                config.server.static_dir = Some(dir);
            }
            config.validate()?;

            init_tracing(cli.verbose, &config.daemon.log_level);
            tracing::info!("webterm {} starting", env!("CARGO_PKG_VERSION"));
            tracing::debug!("Using config file: {:?}", config_path);

            let shutdown = CancellationToken::new();
            let signal_token = shutdown.clone();
            tokio::spawn(async move {
                match wait_for_shutdown_signal().await {
                    Ok(()) => tracing::info!("Received shutdown signal"),
                    Err(e) => tracing::error!("Failed to listen for shutdown signals: {}", e),
                }
                signal_token.cancel();
            });

            daemon::server::serve(config, shutdown).await
        }
    }
}

fn load_config(path: &std::path::Path) -> anyhow::Result<Config> {
    let mut config = Config::load(path)?;
    config.apply_env_overrides();
    config.validate()?;
    Ok(config)
}

/// `RUST_LOG` wins over `--verbose`, which wins over the configured level.
fn init_tracing(verbose: bool, log_level: &str) {
    let fallback = if verbose { "debug" } else { log_level };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => {}
        _ = sigint.recv() => {}
    }
    Ok(())
}
