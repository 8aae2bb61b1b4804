//! Mini-P2P node CLI
//!
//! Runs an overlay node, or inspects its address database.

use clap::{Parser, Subcommand};
use mini_p2p::network::{
    unix_time, Endpoint, EndpointPool, Node, NodeConfig, PoolConfig, ProtocolParams,
    RelayHandler,
};
use mini_p2p::storage::FileStore;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "p2pnode")]
#[command(version)]
#[command(about = "A gossip overlay node speaking the Bitcoin wire protocol", long_about = None)]
struct Cli {
    /// Data directory for the address database
    #[arg(short, long, default_value = ".p2p_data")]
    data_dir: PathBuf,

    /// Default peer port
    #[arg(short, long, default_value = "8333")]
    port: u16,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the P2P node
    Node {
        /// Connect only to these nodes (host[:port], repeatable)
        #[arg(long)]
        connect: Vec<String>,

        /// Add a node to the address pool (host[:port], repeatable)
        #[arg(long = "addnode")]
        add_nodes: Vec<String>,

        /// DNS seed to query for bootstrap addresses (repeatable)
        #[arg(long = "seed")]
        seeds: Vec<String>,

        /// Do not accept inbound connections
        #[arg(long)]
        no_listen: bool,

        /// Outbound connection target
        #[arg(long, default_value = "8")]
        max_outbound: usize,

        /// Total connection limit
        #[arg(long, default_value = "125")]
        max_peers: usize,

        /// Address to advertise to peers
        #[arg(long)]
        external_ip: Option<Ipv4Addr>,

        /// Map the listening port through UPnP
        #[arg(long)]
        upnp: bool,
    },

    /// Address database operations
    Addresses {
        #[command(subcommand)]
        action: AddressCommands,
    },
}

#[derive(Subcommand)]
enum AddressCommands {
    /// List known addresses
    List {
        /// Only addresses seen within this many seconds
        #[arg(long)]
        recent: Option<i64>,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Add an address (host[:port])
    Add { address: String },

    /// Drop stale entries and enforce the size limit
    Purge,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Node {
            connect,
            add_nodes,
            seeds,
            no_listen,
            max_outbound,
            max_peers,
            external_ip,
            upnp,
        } => {
            let config = NodeConfig {
                port: cli.port,
                listen: !no_listen,
                data_dir: cli.data_dir,
                connect,
                add_nodes,
                dns_seeds: seeds,
                max_outbound,
                max_peers,
                external_ip,
                upnp,
                pool: PoolConfig::default(),
                protocol: ProtocolParams::default(),
            };
            run_node(config)?;
        }

        Commands::Addresses { action } => {
            run_address_command(action, &cli.data_dir, cli.port)?;
        }
    }

    Ok(())
}

fn run_node(config: NodeConfig) -> Result<(), Box<dyn std::error::Error>> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    rt.block_on(async {
        println!("🌐 Starting P2P node on port {}...", config.port);

        let mut node = Node::new(config, Arc::new(RelayHandler::default()))?;

        // Handle Ctrl+C
        let shutdown = node.shutdown_handle();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            println!("\n📴 Shutting down node...");
            let _ = shutdown.send(()).await;
        });

        node.start().await?;

        let status = node.status();
        println!("Stopped with {} known addresses", status.known_addresses);
        Ok::<(), Box<dyn std::error::Error>>(())
    })
}

fn run_address_command(
    action: AddressCommands,
    data_dir: &Path,
    port: u16,
) -> Result<(), Box<dyn std::error::Error>> {
    let store = FileStore::open(data_dir)?;
    let mut pool = EndpointPool::open(Box::new(store), port, PoolConfig::default())?;

    match action {
        AddressCommands::List { recent, json } => {
            let mut entries: Vec<Endpoint> = match recent {
                Some(within) => pool.get_recent(within, 1).into_iter().collect(),
                None => pool.iter().copied().collect(),
            };
            entries.sort_by_key(|endpoint| std::cmp::Reverse(endpoint.time()));

            if json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
                return Ok(());
            }

            println!("📇 {} addresses", entries.len());
            for endpoint in &entries {
                println!(
                    "   {:<22} services={:<4} seen={} tried={}",
                    endpoint.to_string(),
                    endpoint.services(),
                    format_time(endpoint.time()),
                    format_time(endpoint.last_try())
                );
            }
        }

        AddressCommands::Add { address } => {
            let mut endpoint =
                Endpoint::resolve(&address, port, true, ProtocolParams::default().services)?;
            endpoint.set_time(unix_time());
            if pool.add_endpoint(&endpoint, 0) {
                println!("✅ Added {}", endpoint);
            } else {
                println!("ℹ️  {} not added (known, local or unroutable)", endpoint);
            }
        }

        AddressCommands::Purge => {
            let removed = pool.purge();
            println!("🧹 Removed {} addresses, {} left", removed, pool.len());
        }
    }

    pool.flush()?;
    Ok(())
}

fn format_time(time: i64) -> String {
    if time == 0 {
        return "never".to_string();
    }
    chrono::DateTime::from_timestamp(time, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| time.to_string())
}
