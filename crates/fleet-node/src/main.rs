//! Fleetnet node binary.

#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::panic)]

use anyhow::{Context, Result};
use clap::Parser;
use fleetnet_node::collaborators::{CriticalProcess, NvidiaSmi};
use fleetnet_node::{Collaborators, Mode, Node, NodeConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "fleetnet",
    about = "Peer registry node for a self-organising compute fleet",
    version
)]
struct Cli {
    /// YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Network mode: standalone, local or node
    #[arg(long)]
    mode: Option<Mode>,

    /// Identity seed (0 = persisted random key)
    #[arg(long)]
    seed: Option<u64>,

    /// libp2p TCP port
    #[arg(long)]
    tcp_port: Option<u16>,

    /// HTTP API port
    #[arg(long)]
    http_port: Option<u16>,

    /// Publicly reachable IPv4 address
    #[arg(long)]
    public_addr: Option<String>,

    /// Bootstrap address, URL or dnsaddr:// host (repeatable)
    #[arg(short, long)]
    bootstrap: Vec<String>,

    /// Home directory for identity and storage
    #[arg(long)]
    home: Option<PathBuf>,

    /// Log level or filter directive
    #[arg(long)]
    log_level: Option<String>,

    /// Shell command of a critical child process
    #[arg(long)]
    subprocess: Option<String>,
}

impl Cli {
    fn apply(self, config: &mut NodeConfig) -> Vec<String> {
        if let Some(mode) = self.mode {
            config.mode = mode;
        }
        if let Some(seed) = self.seed {
            config.seed = seed;
        }
        if let Some(port) = self.tcp_port {
            config.tcp_port = port;
        }
        if let Some(port) = self.http_port {
            config.http_port = port;
        }
        if self.public_addr.is_some() {
            config.public_addr = self.public_addr;
        }
        if self.home.is_some() {
            config.home = self.home;
        }
        if let Some(level) = self.log_level {
            config.log_level = level;
        }
        if self.subprocess.is_some() {
            config.subprocess = self.subprocess;
        }
        self.bootstrap
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::try_new(format!("fleetnet={level},fleetnet_node={level},libp2p=warn"))
            .unwrap_or_else(|_| EnvFilter::new("info"))
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = NodeConfig::load(cli.config.as_deref()).context("failed to load configuration")?;
    let explicit = cli.apply(&mut config);
    init_logging(&config.log_level);

    let mut collaborators = Collaborators {
        hardware: Arc::new(NvidiaSmi),
        ..Default::default()
    };
    if let Some(command) = config.subprocess.as_deref() {
        let process = CriticalProcess::spawn(command)
            .with_context(|| format!("failed to start subprocess `{command}`"))?;
        collaborators.health = Arc::new(process);
    }

    let mut node = Node::new(config, explicit, collaborators)?;
    let mut fatal = node.take_fatal().context("fatal channel already taken")?;
    node.start().await?;
    info!(peer_id = %node.identity().peer_id(), "fleetnet node running");

    let exit_code = tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("failed to listen for shutdown signal")?;
            info!("received shutdown signal");
            0
        }
        Some(reason) = fatal.recv() => {
            error!(%reason, "fatal condition, exiting");
            1
        }
    };

    node.shutdown().await;
    if exit_code != 0 {
        std::process::exit(exit_code);
    }
    Ok(())
}
