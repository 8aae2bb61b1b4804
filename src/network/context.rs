//! State shared by every connection

use crate::network::endpoint::ServiceFlags;
use crate::network::handler::MessageHandler;
use crate::network::manager::PeerManager;
use crate::network::message::{MAGIC, PROTOCOL_VERSION};
use crate::network::pool::EndpointPool;
use parking_lot::Mutex;
use std::sync::Arc;

/// What we announce about ourselves
#[derive(Debug, Clone)]
pub struct ProtocolParams {
    pub magic: [u8; 4],
    pub version: i32,
    pub services: u64,
    pub sub_version: String,
}

impl Default for ProtocolParams {
    fn default() -> Self {
        Self {
            magic: MAGIC,
            version: PROTOCOL_VERSION,
            services: ServiceFlags::NODE_NETWORK.bits(),
            sub_version: format!("/mini-p2p:{}/", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Address pool, peer registry and dispatch, shared by all peer tasks.
///
/// Lock order: a peer's own lock may be held while taking the pool lock or
/// calling into the registry, never the other way round.
pub struct NetContext {
    pub pool: Mutex<EndpointPool>,
    pub peers: PeerManager,
    pub handler: Arc<dyn MessageHandler>,
    pub params: ProtocolParams,
}

impl NetContext {
    pub fn new(
        pool: EndpointPool,
        handler: Arc<dyn MessageHandler>,
        params: ProtocolParams,
    ) -> Arc<Self> {
        Arc::new(Self {
            pool: Mutex::new(pool),
            peers: PeerManager::new(),
            handler,
            params,
        })
    }
}
