//! Application message dispatch
//!
//! The overlay handles handshake, address gossip, inventory and liveness
//! itself. Every other command goes to a [`MessageHandler`], which also
//! answers the inventory questions the overlay needs to relay data.

use crate::crypto::Hash256;
use crate::network::context::NetContext;
use crate::network::message::{command, InvType, Inventory, Message, WireError};
use crate::network::peer::Peer;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};

pub trait MessageHandler: Send + Sync {
    /// Handle an application message. `Ok(false)` means not handled, which
    /// is not an error; `Err` marks the peer as misbehaving.
    fn handle(&self, ctx: &NetContext, peer: &mut Peer, message: &Message)
        -> Result<bool, WireError>;

    /// Whether an announced object needs no fetching
    fn already_have(&self, _inventory: &Inventory) -> bool {
        false
    }

    /// The message that serves a getdata request for `inventory`
    fn lookup(&self, _inventory: &Inventory) -> Option<Message> {
        None
    }

    /// Height advertised in our version message
    fn best_height(&self) -> i32 {
        0
    }
}

/// Handler that ignores every application message
#[derive(Debug, Default, Clone, Copy)]
pub struct NullHandler;

impl MessageHandler for NullHandler {
    fn handle(&self, _ctx: &NetContext, _peer: &mut Peer, _message: &Message) -> Result<bool, WireError> {
        Ok(false)
    }
}

/// Default number of objects a [`RelayHandler`] keeps
pub const DEFAULT_RELAY_CAPACITY: usize = 5000;

#[derive(Default)]
struct RelayCache {
    objects: HashMap<Inventory, Message>,
    order: VecDeque<Inventory>,
}

/// Relay-only handler: stores tx and block payloads it has not seen, serves
/// them on getdata and floods their inventory to every other peer. Objects
/// are identified by the double-SHA256 of the payload; nothing is validated.
pub struct RelayHandler {
    cache: Mutex<RelayCache>,
    capacity: usize,
}

impl RelayHandler {
    pub fn new(capacity: usize) -> Self {
        Self {
            cache: Mutex::new(RelayCache::default()),
            capacity: capacity.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.cache.lock().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Store an object, returning false if it was already known
    pub fn insert(&self, inventory: Inventory, message: Message) -> bool {
        let mut cache = self.cache.lock();
        if cache.objects.contains_key(&inventory) {
            return false;
        }
        while cache.order.len() >= self.capacity {
            match cache.order.pop_front() {
                Some(oldest) => {
                    cache.objects.remove(&oldest);
                }
                None => break,
            }
        }
        cache.order.push_back(inventory);
        cache.objects.insert(inventory, message);
        true
    }
}

impl Default for RelayHandler {
    fn default() -> Self {
        Self::new(DEFAULT_RELAY_CAPACITY)
    }
}

impl MessageHandler for RelayHandler {
    fn handle(&self, ctx: &NetContext, peer: &mut Peer, message: &Message) -> Result<bool, WireError> {
        let kind = match message.command.as_str() {
            command::TX => InvType::Tx,
            command::BLOCK => InvType::Block,
            _ => return Ok(false),
        };

        let inventory = Inventory::new(kind, Hash256::digest(&message.payload));
        peer.add_inventory_known(inventory);
        ctx.peers.forget_asked(&inventory);

        if self.insert(inventory, message.clone()) {
            log::debug!("New {} from {}", inventory, peer.endpoint());
            peer.relay_inventory(inventory);
        }
        Ok(true)
    }

    fn already_have(&self, inventory: &Inventory) -> bool {
        self.cache.lock().objects.contains_key(inventory)
    }

    fn lookup(&self, inventory: &Inventory) -> Option<Message> {
        self.cache.lock().objects.get(inventory).cloned()
    }
}
