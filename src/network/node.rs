//! P2P Node implementation
//!
//! The node that ties the overlay together: it owns the shared context,
//! accepts inbound connections, keeps the outbound slots filled from the
//! address pool, and runs periodic pool maintenance.

use crate::network::context::{NetContext, ProtocolParams};
use crate::network::endpoint::{unix_time, Endpoint};
use crate::network::handler::MessageHandler;
use crate::network::pool::{EndpointPool, PoolConfig, PoolError};
use crate::network::server::{connect_to_peer, start_peer, Server, CONNECT_TIMEOUT};
use crate::network::upnp::UpnpMapping;
use crate::storage::{FileStore, StorageError};
use serde::Serialize;
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Pause between outbound connection attempts
const CONNECT_INTERVAL: Duration = Duration::from_millis(500);

/// Backoff when no candidate is available
const IDLE_CONNECT_INTERVAL: Duration = Duration::from_secs(5);

/// Pool maintenance and status cadence
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

/// DNS seeds are only queried while the pool is smaller than this
const SEED_THRESHOLD: usize = 100;

#[derive(Error, Debug)]
pub enum NodeError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Address pool error: {0}")]
    Pool(#[from] PoolError),
    #[error("Node already started")]
    AlreadyStarted,
}

/// P2P Node configuration
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Port to listen on (and default port for peers)
    pub port: u16,
    /// Accept inbound connections
    pub listen: bool,
    /// Data directory for the address database
    pub data_dir: PathBuf,
    /// Connect only to these nodes
    pub connect: Vec<String>,
    /// Extra nodes added to the pool at startup
    pub add_nodes: Vec<String>,
    /// Hostnames resolved for bootstrap addresses
    pub dns_seeds: Vec<String>,
    /// Outbound connection target
    pub max_outbound: usize,
    /// Total connection limit
    pub max_peers: usize,
    /// Address to advertise instead of discovering one
    pub external_ip: Option<Ipv4Addr>,
    /// Map the listening port through UPnP
    pub upnp: bool,
    pub pool: PoolConfig,
    pub protocol: ProtocolParams,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            port: 8333,
            listen: true,
            data_dir: PathBuf::from(".p2p_data"),
            connect: Vec::new(),
            add_nodes: Vec::new(),
            dns_seeds: Vec::new(),
            max_outbound: 8,
            max_peers: 125,
            external_ip: None,
            upnp: false,
            pool: PoolConfig::default(),
            protocol: ProtocolParams::default(),
        }
    }
}

/// Snapshot of the node for logging and the CLI
#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    pub peers: usize,
    pub outbound: usize,
    pub inbound: usize,
    pub known_addresses: usize,
    pub local_address: String,
    pub estimated_height: Option<i32>,
}

/// The main P2P node
pub struct Node {
    config: NodeConfig,
    ctx: Arc<NetContext>,
    shutdown_tx: mpsc::Sender<()>,
    shutdown_rx: Option<mpsc::Receiver<()>>,
}

impl Node {
    /// Open the address database and build the shared context
    pub fn new(config: NodeConfig, handler: Arc<dyn MessageHandler>) -> Result<Self, NodeError> {
        let store = FileStore::open(&config.data_dir)?;
        let mut pool = EndpointPool::open(Box::new(store), config.port, config.pool.clone())?;

        if let Some(ip) = config.external_ip {
            pool.set_local(&Endpoint::new(ip, config.port, config.protocol.services));
        }

        let ctx = NetContext::new(pool, handler, config.protocol.clone());
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        Ok(Self {
            config,
            ctx,
            shutdown_tx,
            shutdown_rx: Some(shutdown_rx),
        })
    }

    pub fn context(&self) -> Arc<NetContext> {
        self.ctx.clone()
    }

    pub fn status(&self) -> NodeStatus {
        let (known_addresses, local_address) = {
            let pool = self.ctx.pool.lock();
            (pool.len(), pool.get_local().to_string())
        };
        NodeStatus {
            peers: self.ctx.peers.count(),
            outbound: self.ctx.peers.outbound_count(),
            inbound: self.ctx.peers.inbound_count(),
            known_addresses,
            local_address,
            estimated_height: self.ctx.peers.estimated_height(),
        }
    }

    /// Sending on this stops a running node
    pub fn shutdown_handle(&self) -> mpsc::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Run until shutdown is requested
    pub async fn start(&mut self) -> Result<(), NodeError> {
        let mut shutdown_rx = self.shutdown_rx.take().ok_or(NodeError::AlreadyStarted)?;

        self.add_configured_nodes().await;

        let mut tasks: Vec<JoinHandle<()>> = Vec::new();
        let mut upnp = None;

        if self.config.listen {
            let bind_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), self.config.port);
            let server = Server::bind(bind_addr).await?;
            log::info!("Node started on port {}", server.port());

            if self.config.upnp && self.config.external_ip.is_none() {
                match UpnpMapping::setup(server.port()).await {
                    Ok(mapping) => {
                        self.ctx.pool.lock().set_local(&mapping.external_endpoint());
                        tasks.push(mapping.start_renewal_task());
                        upnp = Some(mapping);
                    }
                    Err(e) => log::warn!("UPnP unavailable: {}", e),
                }
            }

            tasks.push(tokio::spawn(accept_loop(
                self.ctx.clone(),
                server,
                self.config.max_peers,
            )));
        }

        tasks.push(tokio::spawn(connect_loop(self.ctx.clone(), self.config.clone())));
        tasks.push(tokio::spawn(maintenance_loop(self.ctx.clone())));

        let _ = shutdown_rx.recv().await;
        log::info!("Node shutting down...");

        for task in &tasks {
            task.abort();
        }
        self.ctx.peers.stop_all();
        if let Some(mapping) = upnp {
            mapping.cleanup().await;
        }
        self.ctx.pool.lock().flush()?;
        Ok(())
    }

    /// Ask a running node to stop; it flushes the address pool on the way out
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(()).await;
    }

    /// Resolve `--addnode` entries and DNS seeds into the pool
    async fn add_configured_nodes(&self) {
        let now = unix_time();
        let port = self.config.port;
        let services = self.config.protocol.services;
        let mut found = Vec::new();

        for host in &self.config.add_nodes {
            match Endpoint::resolve(host, port, true, services) {
                Ok(mut endpoint) => {
                    endpoint.set_time(now);
                    found.push(endpoint);
                }
                Err(e) => log::warn!("Ignoring -addnode {}: {}", host, e),
            }
        }

        let need_seeds = self.config.connect.is_empty() && self.ctx.pool.lock().len() < SEED_THRESHOLD;
        if need_seeds {
            for seed in &self.config.dns_seeds {
                match tokio::net::lookup_host((seed.as_str(), port)).await {
                    Ok(addrs) => {
                        let before = found.len();
                        found.extend(addrs.filter(|addr| addr.is_ipv4()).map(|addr| {
                            let mut endpoint = Endpoint::from_socket_addr(addr);
                            endpoint.set_time(now);
                            endpoint
                        }));
                        log::info!("{} addresses from seed {}", found.len() - before, seed);
                    }
                    Err(e) => log::warn!("Seed lookup {} failed: {}", seed, e),
                }
            }
        }

        if !found.is_empty() {
            let added = self.ctx.pool.lock().add_endpoints(found.iter(), 0);
            log::info!("Added {} bootstrap addresses", added);
        }
    }
}

async fn accept_loop(ctx: Arc<NetContext>, server: Server, max_peers: usize) {
    loop {
        match server.accept().await {
            Ok((stream, addr)) => {
                if ctx.peers.count() >= max_peers {
                    log::info!("Rejecting {}: connection limit reached", addr);
                    continue;
                }
                log::info!("Incoming connection from {}", addr);
                if let Err(e) = start_peer(ctx.clone(), stream, addr, true) {
                    log::warn!("Connection error with {}: {}", addr, e);
                }
            }
            Err(e) => {
                log::error!("Accept error: {}", e);
            }
        }
    }
}

/// Keep outbound slots filled, from `--connect` targets if any, otherwise
/// from pool candidates
async fn connect_loop(ctx: Arc<NetContext>, config: NodeConfig) {
    let fixed: Vec<Endpoint> = config
        .connect
        .iter()
        .filter_map(|host| match Endpoint::resolve(host, config.port, true, config.protocol.services) {
            Ok(endpoint) => Some(endpoint),
            Err(e) => {
                log::warn!("Ignoring -connect {}: {}", host, e);
                None
            }
        })
        .collect();
    let connect_only = !config.connect.is_empty();

    loop {
        if ctx.peers.outbound_count() >= config.max_outbound
            || ctx.peers.count() >= config.max_peers
        {
            tokio::time::sleep(IDLE_CONNECT_INTERVAL).await;
            continue;
        }

        let target = if connect_only {
            fixed
                .iter()
                .find(|endpoint| !ctx.peers.is_connected_to(endpoint))
                .copied()
        } else {
            next_candidate(&ctx)
        };

        let Some(endpoint) = target else {
            tokio::time::sleep(IDLE_CONNECT_INTERVAL).await;
            continue;
        };

        let addr = endpoint.to_socket_addr();
        log::debug!("Connecting to {}", addr);
        match connect_to_peer(addr, CONNECT_TIMEOUT).await {
            Ok(stream) => {
                if let Err(e) = start_peer(ctx.clone(), stream, addr, false) {
                    log::warn!("Connection error with {}: {}", addr, e);
                }
            }
            Err(e) => log::debug!("{}", e),
        }

        tokio::time::sleep(CONNECT_INTERVAL).await;
    }
}

/// Pick a pool candidate we are not connected to and record the attempt
fn next_candidate(ctx: &NetContext) -> Option<Endpoint> {
    let mut exclude: HashSet<IpAddr> = ctx.peers.connected_ips();
    let mut pool = ctx.pool.lock();
    exclude.insert(pool.get_local().ip());

    let now = unix_time();
    match pool.get_candidate(&exclude, now) {
        Ok(endpoint) => {
            pool.mark_tried(&endpoint, now);
            Some(endpoint)
        }
        Err(PoolError::NoCandidateAvailable) => None,
        Err(e) => {
            log::error!("Candidate selection failed: {}", e);
            None
        }
    }
}

async fn maintenance_loop(ctx: Arc<NetContext>) {
    let mut interval = tokio::time::interval(MAINTENANCE_INTERVAL);
    loop {
        interval.tick().await;

        let (purged, known) = {
            let mut pool = ctx.pool.lock();
            let purged = pool.purge();
            if let Err(e) = pool.flush() {
                log::error!("Failed to flush address pool: {}", e);
            }
            (purged, pool.len())
        };

        log::info!(
            "{} peers ({} outbound), {} known addresses{}",
            ctx.peers.count(),
            ctx.peers.outbound_count(),
            known,
            if purged > 0 {
                format!(", {} purged", purged)
            } else {
                String::new()
            }
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::handler::NullHandler;

    fn config(dir: &std::path::Path) -> NodeConfig {
        NodeConfig {
            data_dir: dir.to_path_buf(),
            ..NodeConfig::default()
        }
    }

    #[test]
    fn test_default_config() {
        let config = NodeConfig::default();
        assert_eq!(config.port, 8333);
        assert_eq!(config.max_outbound, 8);
        assert_eq!(config.max_peers, 125);
        assert!(config.listen);
        assert!(!config.upnp);
    }

    #[test]
    fn test_external_ip_sets_local() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config = NodeConfig {
            external_ip: Some(Ipv4Addr::new(8, 8, 8, 8)),
            ..config(temp_dir.path())
        };
        let node = Node::new(config, Arc::new(NullHandler)).unwrap();
        assert_eq!(node.status().local_address, "8.8.8.8:8333");
    }

    #[tokio::test]
    async fn test_addnode_populates_pool() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config = NodeConfig {
            add_nodes: vec!["1.2.3.4".to_string(), "5.6.7.8:9000".to_string()],
            ..config(temp_dir.path())
        };
        let node = Node::new(config, Arc::new(NullHandler)).unwrap();
        node.add_configured_nodes().await;

        let status = node.status();
        assert_eq!(status.known_addresses, 2);
        assert_eq!(status.peers, 0);
    }

    #[test]
    fn test_next_candidate_marks_tried() {
        let temp_dir = tempfile::tempdir().unwrap();
        let node = Node::new(config(temp_dir.path()), Arc::new(NullHandler)).unwrap();
        let ctx = node.context();

        let mut endpoint = Endpoint::new(Ipv4Addr::new(1, 2, 3, 4), 8333, 1);
        endpoint.set_time(unix_time());
        ctx.pool.lock().add_endpoint(&endpoint, 0);

        assert_eq!(next_candidate(&ctx), Some(endpoint));
        assert_ne!(ctx.pool.lock().get(&endpoint.key()).unwrap().last_try(), 0);
        // backoff keeps it from being picked again straight away
        assert_eq!(next_candidate(&ctx), None);
    }
}
