use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use buildyard::config::{DEFAULT_CONFIG_FILE, ServerConfig};

mod cmd;

#[derive(Parser)]
#[command(name = "buildyard")]
#[command(version, about = "Build and checkout server for a fleet of repositories")]
pub struct Cli {
    /// Config file (defaults to ./buildyard.toml when present)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Directory holding the repo checkouts. Overrides the config file.
    #[arg(long, global = true)]
    pub root: Option<PathBuf>,

    /// Emit JSON log lines
    #[arg(long, global = true)]
    pub log_json: bool,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the HTTP server with background synchronization
    Serve {
        /// Port to listen on. Overrides the config file.
        #[arg(short, long)]
        port: Option<u16>,

        /// Permissive CORS and bind on all interfaces
        #[arg(long)]
        dev: bool,
    },
    /// Run one synchronization pass and write the snapshot
    Sync,
    /// List checked-out branches that lag their remote
    Stale,
    /// Print the effective configuration
    Config,
}

fn load_config(cli: &Cli) -> Result<ServerConfig> {
    let mut config = match &cli.config {
        Some(path) => ServerConfig::load(path)?,
        None => ServerConfig::load_or_default(&PathBuf::from(DEFAULT_CONFIG_FILE))?,
    };
    config.apply_env()?;
    if let Some(root) = &cli.root {
        config.root_dir = root.clone();
    }
    if cli.log_json {
        config.logging.json = true;
    }
    if let Commands::Serve { port, dev } = &cli.command {
        if let Some(port) = port {
            config.port = *port;
        }
        config.dev_mode |= *dev;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    if let Commands::Config = cli.command {
        return cmd::cmd_config(&config);
    }

    config.validate().context("Invalid configuration")?;
    let default_level = if cli.verbose { "debug" } else { "info" };
    let _guard = buildyard::logging::init(&config.logging, default_level)?;

    match cli.command {
        Commands::Serve { .. } => cmd::cmd_serve(config).await?,
        Commands::Sync => cmd::cmd_sync(&config).await?,
        Commands::Stale => cmd::cmd_stale(&config).await?,
        Commands::Config => {}
    }

    Ok(())
}
