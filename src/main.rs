//! p2pnode: runs the networking core on its own
//!
//! Useful for poking at a network by hand: start a couple of nodes, point
//! them at each other with `--peers` and watch the status lines.

use clap::{Parser, Subcommand};
use p2p_core::config::P2pConfig;
use p2p_core::network::{NodeId, P2pManager};
use std::fs;
use std::net::IpAddr;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "p2pnode")]
#[command(version)]
#[command(about = "Standalone P2P networking core", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a node and run until Ctrl+C
    Start {
        /// JSON config file; flags below override it
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Listen address
        #[arg(long)]
        ip: Option<IpAddr>,

        /// Listen port (0 picks a free one)
        #[arg(short, long)]
        port: Option<u16>,

        /// Chain id peers must match
        #[arg(long)]
        chain_id: Option<u32>,

        /// Comma-separated boot nodes (p2p://<id>@<ip>:<port>)
        #[arg(long)]
        peers: Option<String>,

        /// Maximum active nodes
        #[arg(long)]
        max_active: Option<usize>,

        /// Map the listen port on the router
        #[arg(long)]
        upnp: bool,

        /// Only dial boot nodes and skip gossip
        #[arg(long)]
        seeds_only: bool,
    },

    /// Print a fresh node id
    Id,

    /// Print the default config as JSON
    Config,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Id => println!("{}", NodeId::generate()),

        Commands::Config => println!("{}", serde_json::to_string_pretty(&P2pConfig::default())?),

        Commands::Start {
            config,
            ip,
            port,
            chain_id,
            peers,
            max_active,
            upnp,
            seeds_only,
        } => {
            let mut config = match config {
                Some(path) => P2pConfig::from_json(&fs::read_to_string(path)?)?,
                None => P2pConfig::default(),
            };
            if let Some(ip) = ip {
                config.ip = ip;
            }
            if let Some(port) = port {
                config.port = port;
            }
            if let Some(chain_id) = chain_id {
                config.chain_id = chain_id;
            }
            if let Some(peers) = peers {
                config.boot_nodes = peers
                    .split(',')
                    .map(|p| p.trim().to_string())
                    .filter(|p| !p.is_empty())
                    .collect();
            }
            if let Some(max_active) = max_active {
                config.max_active_nodes = max_active;
            }
            config.upnp_enabled |= upnp;
            config.sync_seeds_only |= seeds_only;

            run_node(config)?;
        }
    }

    Ok(())
}

fn run_node(config: P2pConfig) -> Result<(), Box<dyn std::error::Error>> {
    let rt = tokio::runtime::Runtime::new()?;

    rt.block_on(async {
        let manager = P2pManager::new(config)?;
        manager.run().await?;

        if let Some(addr) = manager.local_addr() {
            log::info!("Boot URI: p2p://{}@{}", manager.local_id(), addr);
        }

        tokio::signal::ctrl_c().await?;
        log::info!("Ctrl+C received");
        manager.shutdown().await;
        log::info!("Final status: {}", serde_json::to_string(&manager.status())?);
        Ok::<(), Box<dyn std::error::Error>>(())
    })
}
