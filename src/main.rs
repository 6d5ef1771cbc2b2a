// src/main.rs

use anyhow::{Context, Result};
use aptd::config::{BackendKind, DaemonConfig, DEFAULT_CONFIG_PATH};
use aptd::daemon::{run_daemon, DaemonOptions};
use clap::Parser;
use std::path::PathBuf;
use tracing::{debug, info};

#[derive(Parser, Debug)]
#[command(name = "aptd")]
#[command(author, version, about = "Transaction daemon for APT: queued, authorized package operations over D-Bus", long_about = None)]
struct Cli {
    /// Show internals
    #[arg(short, long)]
    debug: bool,

    /// Do not make any changes to the system
    #[arg(long)]
    dummy: bool,

    /// Do not shut down the daemon because of inactivity
    #[arg(short = 't', long)]
    disable_timeout: bool,

    /// Quit and replace an already running daemon
    #[arg(short, long)]
    replace: bool,

    /// Listen on the D-Bus session bus (only for testing)
    #[arg(long)]
    session_bus: bool,

    /// Perform operations in the given chroot
    #[arg(short, long, value_name = "DIR")]
    chroot: Option<PathBuf>,

    /// Configuration file
    #[arg(long, value_name = "FILE", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Do not run resolver plugins
    #[arg(long)]
    disable_plugins: bool,
}

impl Cli {
    fn load_config(&self) -> Result<DaemonConfig> {
        let mut config = DaemonConfig::load_or_default(&self.config)
            .with_context(|| format!("Failed to load {}", self.config.display()))?;
        if let Some(ref root) = self.chroot {
            config = config.with_root(root);
        }
        if self.dummy {
            config = config.with_backend(BackendKind::Memory);
        }
        if self.disable_timeout {
            config = config.without_inactivity_timeout();
        }
        if self.disable_plugins {
            config.disable_plugins = true;
        }
        Ok(config)
    }
}

fn init_logging(debug: bool) {
    let default = if debug { "aptd=debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default)),
        )
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug);

    let config = cli.load_config()?;
    debug!("Configuration: {:?}", config);
    if cli.chroot.is_some() {
        info!("Operating on {}", config.root.display());
    }

    let options = DaemonOptions {
        session_bus: cli.session_bus,
        replace: cli.replace,
        dummy: cli.dummy,
    };
    run_daemon(config, options).await?;
    Ok(())
}
