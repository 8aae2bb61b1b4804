//! Mini-P2P: a gossip overlay network in Rust
//!
//! This crate provides the networking layer of a Bitcoin-style node:
//! - Bitcoin wire framing (magic, command, length, checksum)
//! - Version handshake with self-connection detection
//! - A persistent address pool with weighted candidate selection
//! - Inventory announcement, trickled relay and spaced re-requests
//! - Address gossip and `getaddr` answers
//! - Request/reply correlation by nonce
//!
//! # Example
//!
//! ```rust,no_run
//! use mini_p2p::network::{Node, NodeConfig, RelayHandler};
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = NodeConfig {
//!     port: 18333,
//!     add_nodes: vec!["203.0.113.7".to_string()],
//!     ..NodeConfig::default()
//! };
//! let mut node = Node::new(config, Arc::new(RelayHandler::default()))?;
//! node.start().await?;
//! # Ok(())
//! # }
//! ```

pub mod crypto;
pub mod network;
pub mod storage;

// Re-export commonly used types
pub use crypto::Hash256;
pub use network::{
    Endpoint, EndpointPool, Inventory, Message, MessageHandler, NetContext, Node, NodeConfig,
    Peer, RelayHandler,
};
pub use storage::{EndpointStore, FileStore};
