//! hearth member daemon binary
#![warn(missing_docs)]
#![warn(clippy::all)]

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use hearth_daemon::{Daemon, DaemonConfig, Result};
use tracing::{Level, info};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(long, env = "HEARTH_CONFIG")]
    config: Option<PathBuf>,

    /// Name of the local member
    #[arg(long, env = "HEARTH_MEMBER_NAME")]
    member_name: Option<String>,

    /// Cluster address of the local member
    #[arg(long, env = "HEARTH_ADDRESS")]
    address: Option<String>,

    /// Address the API listens on
    #[arg(long, env = "HEARTH_LISTEN")]
    listen: Option<SocketAddr>,

    /// Directory holding local database state
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// JSON file describing network driver state
    #[arg(long)]
    network_fixture: Option<PathBuf>,

    /// Log at debug level
    #[arg(long)]
    debug: bool,
}

impl Args {
    fn into_config(self) -> Result<DaemonConfig> {
        let mut config = match &self.config {
            Some(path) => DaemonConfig::from_file(path)?,
            None => DaemonConfig::default(),
        };

        if let Some(member_name) = self.member_name {
            config.cluster.member_name = member_name;
        }
        if let Some(address) = self.address {
            config.cluster.address = address;
        }
        if let Some(listen) = self.listen {
            config.http.listen_addr = listen;
        }
        if let Some(data_dir) = self.data_dir {
            config.cluster.data_dir = data_dir;
        }
        if let Some(fixture) = self.network_fixture {
            config.network.fixture = Some(fixture);
        }

        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.debug { Level::DEBUG } else { Level::INFO };
    tracing::subscriber::set_global_default(
        FmtSubscriber::builder().with_max_level(level).finish(),
    )?;

    if let Some(path) = &args.config {
        info!("Loading configuration from: {:?}", path);
    }
    let config = args.into_config()?;

    let daemon = Daemon::new(config).await?;
    daemon.start().await?;

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }

    daemon.shutdown().await;

    Ok(())
}
