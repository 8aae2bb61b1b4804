//! Peer registry
//!
//! Holds the owning handle of every live connection, the nonces of our own
//! outstanding version messages, network-wide ask-for bookkeeping and the
//! heights reported by peers. Connection tasks only keep weak handles.

use crate::network::endpoint::Endpoint;
use crate::network::message::Inventory;
use crate::network::peer::Peer;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use rand::thread_rng;
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub type PeerId = u64;
pub type PeerRef = Arc<Mutex<Peer>>;

/// Minimum spacing between two requests for the same object
pub const ASK_RETRY_INTERVAL_US: i64 = 2 * 60 * 1_000_000;

/// Gossiped addresses are forwarded to this many random peers
pub const ADDR_RELAY_FANOUT: usize = 2;

/// Peer heights kept for the median
const HEIGHT_SAMPLES: usize = 5;

/// Bound on remembered request times
const MAX_ASKED: usize = 50_000;

struct PeerEntry {
    peer: PeerRef,
    endpoint: Endpoint,
    inbound: bool,
}

#[derive(Default)]
struct AskedFor {
    /// Last scheduled request time per object
    requested: HashMap<Inventory, i64>,
    /// Keeps deadlines unique and increasing
    last_time: i64,
}

pub struct PeerManager {
    peers: Mutex<HashMap<PeerId, PeerEntry>>,
    nonces: Mutex<HashSet<u64>>,
    asked: Mutex<AskedFor>,
    heights: Mutex<VecDeque<i32>>,
    next_id: AtomicU64,
}

impl PeerManager {
    pub fn new() -> Self {
        Self {
            peers: Mutex::new(HashMap::new()),
            nonces: Mutex::new(HashSet::new()),
            asked: Mutex::new(AskedFor::default()),
            heights: Mutex::new(VecDeque::with_capacity(HEIGHT_SAMPLES)),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> PeerId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Take ownership of a peer
    pub fn register(&self, peer: Peer) -> PeerRef {
        let id = peer.id();
        let entry = PeerEntry {
            endpoint: *peer.endpoint(),
            inbound: peer.is_inbound(),
            peer: Arc::new(Mutex::new(peer)),
        };
        let handle = entry.peer.clone();
        log::info!(
            "Added peer {} ({})",
            entry.endpoint,
            if entry.inbound { "inbound" } else { "outbound" }
        );
        self.peers.lock().insert(id, entry);
        handle
    }

    /// Drop the owning handle of a peer and forget its version nonce
    pub fn unregister(&self, id: PeerId) -> Option<PeerRef> {
        let entry = self.peers.lock().remove(&id)?;
        if let Some(nonce) = entry.peer.lock().local_nonce() {
            self.nonces.lock().remove(&nonce);
        }
        log::info!("Removed peer {}", entry.endpoint);
        Some(entry.peer)
    }

    pub fn get(&self, id: PeerId) -> Option<PeerRef> {
        self.peers.lock().get(&id).map(|entry| entry.peer.clone())
    }

    pub fn all(&self) -> Vec<(PeerId, PeerRef)> {
        self.peers
            .lock()
            .iter()
            .map(|(id, entry)| (*id, entry.peer.clone()))
            .collect()
    }

    pub fn count(&self) -> usize {
        self.peers.lock().len()
    }

    pub fn outbound_count(&self) -> usize {
        self.peers.lock().values().filter(|entry| !entry.inbound).count()
    }

    pub fn inbound_count(&self) -> usize {
        self.peers.lock().values().filter(|entry| entry.inbound).count()
    }

    /// Addresses we already have a connection to
    pub fn connected_ips(&self) -> HashSet<IpAddr> {
        self.peers
            .lock()
            .values()
            .map(|entry| entry.endpoint.ip())
            .collect()
    }

    pub fn is_connected_to(&self, endpoint: &Endpoint) -> bool {
        self.peers
            .lock()
            .values()
            .any(|entry| entry.endpoint == *endpoint)
    }

    pub fn add_nonce(&self, nonce: u64) {
        self.nonces.lock().insert(nonce);
    }

    /// Whether `nonce` belongs to one of our own version messages
    pub fn is_own_nonce(&self, nonce: u64) -> bool {
        self.nonces.lock().contains(&nonce)
    }

    pub fn record_peer_height(&self, height: i32) {
        let mut heights = self.heights.lock();
        if heights.len() == HEIGHT_SAMPLES {
            heights.pop_front();
        }
        heights.push_back(height);
    }

    /// Median of the most recently reported peer heights
    pub fn estimated_height(&self) -> Option<i32> {
        let mut heights: Vec<i32> = self.heights.lock().iter().copied().collect();
        if heights.is_empty() {
            return None;
        }
        heights.sort_unstable();
        Some(heights[heights.len() / 2])
    }

    /// Deadline for requesting `inventory`: at least `stagger_us` from now,
    /// and at least [`ASK_RETRY_INTERVAL_US`] after the previous request for
    /// the same object from any peer
    pub fn schedule_ask(&self, inventory: &Inventory, now_us: i64, stagger_us: i64) -> i64 {
        let mut asked = self.asked.lock();
        let earliest = (now_us + stagger_us).max(asked.last_time + 1);
        asked.last_time = earliest;

        if asked.requested.len() >= MAX_ASKED {
            let horizon = now_us - ASK_RETRY_INTERVAL_US;
            asked.requested.retain(|_, time| *time > horizon);
        }

        let deadline = match asked.requested.get(inventory) {
            Some(previous) => (previous + ASK_RETRY_INTERVAL_US).max(earliest),
            None => earliest,
        };
        asked.requested.insert(*inventory, deadline);
        deadline
    }

    /// The object arrived; later announcements need no spacing
    pub fn forget_asked(&self, inventory: &Inventory) {
        self.asked.lock().requested.remove(inventory);
    }

    /// Announce inventory to every active peer but `origin`, and forward
    /// gossiped addresses to a few random active peers.
    ///
    /// Must be called without holding any peer lock.
    pub fn relay(&self, origin: PeerId, inventory: &[Inventory], addresses: &[Endpoint]) {
        let mut targets: Vec<PeerRef> = self
            .peers
            .lock()
            .iter()
            .filter(|(id, _)| **id != origin)
            .map(|(_, entry)| entry.peer.clone())
            .collect();

        if !inventory.is_empty() {
            for target in &targets {
                let mut peer = target.lock();
                if peer.is_active() {
                    for item in inventory {
                        peer.push_inventory(*item);
                    }
                }
            }
        }

        if !addresses.is_empty() {
            targets.shuffle(&mut thread_rng());
            let mut sent = 0;
            for target in &targets {
                if sent == ADDR_RELAY_FANOUT {
                    break;
                }
                let mut peer = target.lock();
                if peer.is_active() {
                    for endpoint in addresses {
                        peer.push_address(endpoint);
                    }
                    sent += 1;
                }
            }
        }
    }

    /// Stop every peer; their tasks tear down on the next wakeup
    pub fn stop_all(&self) {
        for (_, peer) in self.all() {
            peer.lock().stop();
        }
    }
}

impl Default for PeerManager {
    fn default() -> Self {
        Self::new()
    }
}
