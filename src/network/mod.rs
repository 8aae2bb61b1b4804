//! P2P Networking module
//!
//! An unstructured gossip overlay speaking the Bitcoin wire format.
//!
//! # Features
//! - Framed TCP connections with version handshake
//! - Persistent, weighted address pool
//! - Inventory and address gossip with trickling
//! - Request/reply correlation over arbitrary commands
//! - UPnP port mapping

pub mod builder;
pub mod codec;
pub mod context;
pub mod endpoint;
pub mod handler;
pub mod manager;
pub mod message;
pub mod node;
pub mod peer;
pub mod pool;
pub mod server;
pub mod upnp;

pub use builder::SendQueue;
pub use codec::MessageParser;
pub use context::{NetContext, ProtocolParams};
pub use endpoint::{unix_time, Endpoint, EndpointError, EndpointKey, ServiceFlags};
pub use handler::{MessageHandler, NullHandler, RelayHandler};
pub use manager::{PeerId, PeerManager, PeerRef};
pub use message::{
    command, Decodable, Encodable, InvType, Inventory, Message, RejectCode, RejectMessage,
    VersionMessage, WireError, MAGIC, MAX_MESSAGE_SIZE, MIN_PROTOCOL_VERSION, PROTOCOL_VERSION,
};
pub use node::{Node, NodeConfig, NodeError, NodeStatus};
pub use peer::{Peer, PeerError, PeerState};
pub use pool::{EndpointPool, PoolConfig, PoolError};
pub use server::{connect_to_peer, start_peer, Server};
pub use upnp::{UpnpError, UpnpMapping};
