//! FluxHub server daemon
//!
//! Thin binary: parse CLI arguments, load the TOML configuration, wire
//! up the hub with its consensus store and transport, start the elector
//! and wait for Ctrl-C.

mod listener;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use fluxhub_core::consensus::MemoryConsensus;
use fluxhub_core::election::{self, ElectorHandle};
use fluxhub_core::transport::TcpTransportFactory;
use fluxhub_core::{Hub, HubConfig};

use listener::RespListener;

#[derive(Parser, Debug)]
#[command(name = "fluxhub-server", about = "Cross-datacenter replication hub", version)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the binlog directory
    #[arg(long)]
    log_path: Option<PathBuf>,
}

/// Owns the running pieces so shutdown has one entry point; handed to
/// the signal coordinator instead of living in a process-wide global.
struct ServerHandle {
    hub: Arc<Hub>,
    elector: ElectorHandle,
}

impl ServerHandle {
    fn shutdown(self) {
        self.elector.stop();
        self.hub.shutdown();
    }
}

fn load_config(args: &Args) -> anyhow::Result<HubConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading config {:?}", path))?;
            toml::from_str(&raw).with_context(|| format!("parsing config {:?}", path))?
        }
        None => HubConfig::default(),
    };
    if let Some(log_path) = &args.log_path {
        config.log_path = log_path.clone();
    }
    config.validate().context("invalid configuration")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;
    tracing::info!(
        identity = %config.local_identity(),
        log_path = ?config.log_path,
        peers = config.peers.len(),
        "starting fluxhub"
    );

    let consensus = Arc::new(MemoryConsensus::new());
    let transport = Arc::new(TcpTransportFactory::new(config.io_timeout()));
    let hub = Arc::new(Hub::new(config, consensus, transport).context("initializing hub")?);
    hub.set_listener(Arc::new(RespListener::new()));

    let elector = election::spawn(Arc::clone(&hub)).context("starting elector")?;
    let server = ServerHandle { hub, elector };

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    tracing::info!("shutdown signal received");
    tokio::task::spawn_blocking(move || server.shutdown())
        .await
        .context("shutting down")?;
    tracing::info!("bye");
    Ok(())
}
