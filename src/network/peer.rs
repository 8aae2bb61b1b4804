//! Per-connection protocol state
//!
//! A [`Peer`] owns everything we know about one connection: handshake
//! progress, the outbound send queue, relay bookkeeping, scheduled object
//! requests and pending nonce-correlated requests. It does no I/O itself;
//! the connection task in `server` feeds it parsed messages and drains its
//! send queue.

use crate::crypto::Hash256;
use crate::network::builder::SendQueue;
use crate::network::context::NetContext;
use crate::network::endpoint::{unix_time, Endpoint, EndpointKey, DEFAULT_ENDPOINT_TIME};
use crate::network::manager::PeerId;
use crate::network::message::{
    command, decode_list, Encodable, Inventory, Message, Raw, RejectMessage, VersionAddr,
    VersionMessage, WireError, ADDR_TIME_VERSION, MAX_ADDR_PER_MESSAGE, MAX_INV_PER_MESSAGE,
    MIN_PROTOCOL_VERSION, PROTOCOL_VERSION,
};
use bytes::Bytes;
use rand::rngs::OsRng;
use rand::{thread_rng, Rng, RngCore};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Notify;

/// Idle limit before the handshake completes (seconds)
pub const INITIAL_TIMEOUT: i64 = 60;

/// Idle limit once active (seconds)
pub const HEARTBEAT_TIMEOUT: i64 = 90 * 60;

/// Mean trickle delay; each deadline is drawn from `[0, 2 * TRICKLE_INTERVAL_US]`
pub const TRICKLE_INTERVAL_US: i64 = 5 * 1_000_000;

/// Entries per addr / inv batch sent by one trickle
pub const MAX_TRICKLE_BATCH: usize = 1000;

/// Extra delay per request already scheduled on this peer
pub const ASK_STAGGER_US: i64 = 1000;

/// Quiet time after which an empty ping is sent (seconds)
pub const KEEPALIVE_INTERVAL: i64 = 30 * 60;

/// Committed-but-unsent bytes allowed before the peer is dropped
pub const MAX_SEND_BUFFER: usize = 10 * 1024 * 1024;

/// Gossiped addresses count as this much older than announced (seconds)
pub const ADDR_GOSSIP_PENALTY: i64 = 2 * 60 * 60;

/// Outbound peers ask for addresses while the pool is smaller than this
const GETADDR_THRESHOLD: usize = 1000;

/// Window and sample size used to answer getaddr
const GETADDR_WINDOW: i64 = 3 * 60 * 60;
const GETADDR_SAMPLE: usize = 2500;

/// Unsolicited addr batches up to this size are forwarded
const MAX_RELAYED_ADDR_BATCH: usize = 10;

/// Gossiped addresses seen within this window are forwarded (seconds)
const ADDR_RELAY_WINDOW: i64 = 10 * 60;

/// Callback run with the remaining payload of a matching reply
pub type ReplyCallback = Box<dyn FnOnce(&mut Peer, &[u8]) + Send>;

/// Peer connection errors
#[derive(Error, Debug)]
pub enum PeerError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Wire error: {0}")]
    Wire(#[from] WireError),
    #[error("Protocol violation: {0}")]
    Protocol(String),
    #[error("Obsolete protocol version {0}")]
    ObsoleteVersion(i32),
    #[error("Connected to self")]
    SelfConnection,
    #[error("Send buffer full ({0} bytes)")]
    SendBufferFull(usize),
    #[error("Peer disconnected")]
    Disconnected,
}

/// Peer connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Connecting,
    Handshaking,
    Active,
    Disconnecting,
    Closed,
}

pub struct Peer {
    id: PeerId,
    endpoint: Endpoint,
    inbound: bool,
    state: PeerState,

    // What the remote told us
    version: i32,
    services: u64,
    sub_version: String,
    start_height: i32,

    local_nonce: Option<u64>,
    got_version: bool,
    got_verack: bool,
    /// We sent getaddr and the answer has not fully arrived
    get_addr: bool,

    connected_at: i64,
    last_send: i64,
    last_recv: i64,
    last_send_empty: i64,

    inbox: VecDeque<Message>,
    send: SendQueue,
    requests: HashMap<Hash256, ReplyCallback>,

    addr_known: HashSet<EndpointKey>,
    addr_to_send: Vec<Endpoint>,
    inventory_known: HashSet<Inventory>,
    inventory_to_send: Vec<Inventory>,
    /// Scheduled requests keyed by (deadline in microseconds, sequence)
    ask_for: BTreeMap<(i64, u64), Inventory>,
    /// Objects with a request scheduled on this peer
    asking: HashSet<Inventory>,
    ask_seq: u64,
    next_trickle: i64,

    relay_inventory: Vec<Inventory>,
    relay_addresses: Vec<Endpoint>,

    wake: Arc<Notify>,
}

impl Peer {
    pub fn new(id: PeerId, endpoint: Endpoint, inbound: bool, magic: [u8; 4], now: i64) -> Self {
        Self {
            id,
            endpoint,
            inbound,
            state: PeerState::Connecting,
            version: 0,
            services: 0,
            sub_version: String::new(),
            start_height: 0,
            local_nonce: None,
            got_version: false,
            got_verack: false,
            get_addr: false,
            connected_at: now,
            last_send: 0,
            last_recv: now,
            last_send_empty: now,
            inbox: VecDeque::new(),
            send: SendQueue::new(magic),
            requests: HashMap::new(),
            addr_known: HashSet::new(),
            addr_to_send: Vec::new(),
            inventory_known: HashSet::new(),
            inventory_to_send: Vec::new(),
            ask_for: BTreeMap::new(),
            asking: HashSet::new(),
            ask_seq: 0,
            next_trickle: 0,
            relay_inventory: Vec::new(),
            relay_addresses: Vec::new(),
            wake: Arc::new(Notify::new()),
        }
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn is_inbound(&self) -> bool {
        self.inbound
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == PeerState::Active
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self.state, PeerState::Disconnecting | PeerState::Closed)
    }

    pub fn version(&self) -> i32 {
        self.version
    }

    pub fn services(&self) -> u64 {
        self.services
    }

    pub fn sub_version(&self) -> &str {
        &self.sub_version
    }

    pub fn start_height(&self) -> i32 {
        self.start_height
    }

    pub fn connected_at(&self) -> i64 {
        self.connected_at
    }

    pub fn last_send(&self) -> i64 {
        self.last_send
    }

    pub fn last_recv(&self) -> i64 {
        self.last_recv
    }

    pub fn local_nonce(&self) -> Option<u64> {
        self.local_nonce
    }

    /// Signalled whenever the connection task has work to do
    pub fn waker(&self) -> Arc<Notify> {
        self.wake.clone()
    }

    /// Transport is up: start the handshake. Outbound connections speak first.
    pub fn start(&mut self, ctx: &NetContext, now: i64) -> Result<(), PeerError> {
        if self.state != PeerState::Connecting {
            return Ok(());
        }
        self.state = PeerState::Handshaking;
        if !self.inbound {
            self.push_version(ctx, now)?;
        }
        Ok(())
    }

    /// Request teardown. Safe to call repeatedly, including from a reply
    /// callback running on this peer; pending callbacks are dropped unrun.
    pub fn stop(&mut self) {
        if self.is_stopped() {
            return;
        }
        log::debug!("Disconnecting {}", self.endpoint);
        self.state = PeerState::Disconnecting;
        self.requests.clear();
        self.inbox.clear();
        self.ask_for.clear();
        self.asking.clear();
        self.send.abort();
        self.wake.notify_one();
    }

    /// Socket released; nothing further happens on this peer
    pub fn close(&mut self) {
        self.stop();
        self.state = PeerState::Closed;
    }

    // Message construction

    pub fn begin_message(&mut self, command: &str) -> Result<(), PeerError> {
        if self.is_stopped() {
            return Err(PeerError::Disconnected);
        }
        self.send.begin(command)?;
        Ok(())
    }

    pub fn append(&mut self, field: &dyn Encodable) -> Result<(), PeerError> {
        self.send.append(field)?;
        Ok(())
    }

    pub fn abort_message(&mut self) {
        self.send.abort();
    }

    pub fn end_message(&mut self) -> Result<(), PeerError> {
        let payload_len = self.send.commit()?;
        self.sent(payload_len)
    }

    /// Commit the message, or drop it if no field was appended
    pub fn end_message_abort_if_empty(&mut self) -> Result<bool, PeerError> {
        match self.send.commit_or_abort_if_empty()? {
            Some(payload_len) => self.sent(payload_len).map(|_| true),
            None => Ok(false),
        }
    }

    fn sent(&mut self, payload_len: usize) -> Result<(), PeerError> {
        let now = unix_time();
        self.last_send = now;
        if payload_len == 0 {
            self.last_send_empty = now;
        }
        if self.send.len() > MAX_SEND_BUFFER {
            log::warn!("Send buffer for {} overflowed", self.endpoint);
            let size = self.send.len();
            self.stop();
            return Err(PeerError::SendBufferFull(size));
        }
        self.wake.notify_one();
        Ok(())
    }

    /// Build and queue a whole message; nothing is queued on failure
    pub fn push_message(&mut self, command: &str, fields: &[&dyn Encodable]) -> Result<(), PeerError> {
        self.begin_message(command)?;
        for field in fields {
            self.append(*field)?;
        }
        self.end_message()
    }

    /// Send a message whose payload is already encoded
    pub fn push_raw(&mut self, message: &Message) -> Result<(), PeerError> {
        self.push_message(&message.command, &[&Raw(&message.payload)])
    }

    /// Send `fields` prefixed by a fresh nonce. `callback` runs once with the
    /// rest of the payload when a reply carrying that nonce arrives.
    pub fn push_request<F>(
        &mut self,
        command: &str,
        fields: &[&dyn Encodable],
        callback: F,
    ) -> Result<Hash256, PeerError>
    where
        F: FnOnce(&mut Peer, &[u8]) + Send + 'static,
    {
        let nonce = Hash256::random();
        let mut all: Vec<&dyn Encodable> = Vec::with_capacity(fields.len() + 1);
        all.push(&nonce);
        all.extend_from_slice(fields);

        self.push_message(command, &all)?;
        self.requests.insert(nonce, Box::new(callback));
        Ok(nonce)
    }

    pub fn pending_requests(&self) -> usize {
        self.requests.len()
    }

    /// Run the callback whose nonce leads `payload`, if any
    fn complete_request(&mut self, payload: &[u8]) -> bool {
        let Some(nonce) = payload.get(..32).and_then(Hash256::from_slice) else {
            return false;
        };
        match self.requests.remove(&nonce) {
            Some(callback) => {
                callback(self, &payload[32..]);
                true
            }
            None => false,
        }
    }

    pub fn push_version(&mut self, ctx: &NetContext, now: i64) -> Result<(), PeerError> {
        let nonce = loop {
            let n = OsRng.next_u64();
            if n != 0 {
                break n;
            }
        };
        self.local_nonce = Some(nonce);
        ctx.peers.add_nonce(nonce);

        let local = *ctx.pool.lock().get_local();
        let version = VersionMessage {
            version: ctx.params.version,
            services: ctx.params.services,
            timestamp: now,
            addr_recv: self.endpoint,
            addr_from: local,
            nonce,
            sub_version: ctx.params.sub_version.clone(),
            start_height: ctx.handler.best_height(),
        };
        self.push_message(command::VERSION, &[&version])
    }

    // Relay bookkeeping

    pub fn add_address_known(&mut self, endpoint: &Endpoint) {
        self.addr_known.insert(endpoint.key());
    }

    /// Queue an address for the next trickle unless this peer knows it
    pub fn push_address(&mut self, endpoint: &Endpoint) {
        if endpoint.is_valid() && self.addr_known.insert(endpoint.key()) {
            self.addr_to_send.push(*endpoint);
        }
    }

    pub fn add_inventory_known(&mut self, inventory: Inventory) {
        self.inventory_known.insert(inventory);
    }

    /// Queue an announcement for the next trickle unless this peer knows it
    pub fn push_inventory(&mut self, inventory: Inventory) {
        if self.inventory_known.insert(inventory) {
            self.inventory_to_send.push(inventory);
        }
    }

    pub fn pending_addresses(&self) -> &[Endpoint] {
        &self.addr_to_send
    }

    pub fn pending_inventory(&self) -> &[Inventory] {
        &self.inventory_to_send
    }

    /// Mark an object we got from this peer for flooding to the others
    pub fn relay_inventory(&mut self, inventory: Inventory) {
        self.add_inventory_known(inventory);
        self.relay_inventory.push(inventory);
    }

    /// Drain what should be relayed to other peers
    pub fn take_relay(&mut self) -> (Vec<Inventory>, Vec<Endpoint>) {
        (
            std::mem::take(&mut self.relay_inventory),
            std::mem::take(&mut self.relay_addresses),
        )
    }

    /// Schedule a getdata for `inventory`, returning its deadline
    pub fn ask_for(&mut self, inventory: Inventory, ctx: &NetContext, now_us: i64) -> i64 {
        let stagger = self.ask_for.len() as i64 * ASK_STAGGER_US;
        let deadline = ctx.peers.schedule_ask(&inventory, now_us, stagger);
        self.ask_seq += 1;
        self.ask_for.insert((deadline, self.ask_seq), inventory);
        self.asking.insert(inventory);
        log::trace!("Asking {} for {} at {}", self.endpoint, inventory, deadline);
        deadline
    }

    pub fn scheduled_asks(&self) -> impl Iterator<Item = (i64, &Inventory)> {
        self.ask_for.iter().map(|((deadline, _), inv)| (*deadline, inv))
    }

    // Inbound processing

    /// Bytes arrived, even if no whole message has yet
    pub fn touch(&mut self, now: i64) {
        self.last_recv = self.last_recv.max(now);
    }

    /// Queue a parsed message; any received message counts as activity
    pub fn receive(&mut self, message: Message, now: i64) {
        self.touch(now);
        if !self.is_stopped() {
            self.inbox.push_back(message);
        }
    }

    /// Handle every queued message. Returns false once the peer should be
    /// disconnected; a misbehaving peer is stopped, nothing else is affected.
    pub fn process_messages(&mut self, ctx: &NetContext, now: i64) -> bool {
        while let Some(message) = self.inbox.pop_front() {
            if self.is_stopped() {
                break;
            }
            if let Err(e) = self.process_message(ctx, &message, now) {
                log::warn!(
                    "Dropping {} after {}: {}",
                    self.endpoint,
                    message.type_name(),
                    e
                );
                self.stop();
            }
        }
        !self.is_stopped()
    }

    fn process_message(&mut self, ctx: &NetContext, message: &Message, now: i64) -> Result<(), PeerError> {
        log::debug!("Received {} from {}", message.type_name(), self.endpoint);

        if !self.got_version && message.command != command::VERSION {
            return Err(PeerError::Protocol(format!(
                "{} before version",
                message.command
            )));
        }

        match message.command.as_str() {
            command::VERSION => self.on_version(ctx, message, now)?,
            command::VERACK => {
                self.got_verack = true;
                self.update_state(ctx);
            }
            command::ADDR => self.on_addr(ctx, message, now)?,
            command::GETADDR => self.on_getaddr(ctx)?,
            command::INV => self.on_inv(ctx, message, now)?,
            command::GETDATA => self.on_getdata(ctx, message)?,
            command::NOTFOUND => {
                let missing: Vec<Inventory> = decode_list(&mut message.reader(), MAX_INV_PER_MESSAGE)?;
                log::debug!("{} does not have {} objects", self.endpoint, missing.len());
            }
            command::PING => {
                // pre-BIP31 pings carry no nonce and expect no answer
                if message.payload.len() >= 8 {
                    let nonce: u64 = message.reader().read()?;
                    self.push_message(command::PONG, &[&nonce])?;
                }
            }
            command::PONG => {}
            command::REJECT => {
                let reject: RejectMessage = message.decode()?;
                log::warn!(
                    "{} rejected our {}: {:?} {}",
                    self.endpoint,
                    reject.message,
                    reject.code,
                    reject.reason
                );
            }
            command::REPLY => {
                if !self.complete_request(&message.payload) {
                    log::debug!("Unmatched reply from {}", self.endpoint);
                }
            }
            _ => {
                if !self.complete_request(&message.payload) {
                    if !ctx.handler.handle(ctx, self, message)? {
                        log::debug!("Ignoring {} from {}", message.command, self.endpoint);
                    }
                }
            }
        }

        if !self.inbound
            && self.is_active()
            && matches!(
                message.command.as_str(),
                command::VERSION | command::ADDR | command::INV | command::GETDATA | command::PING
            )
        {
            ctx.pool.lock().currently_connected(&self.endpoint);
        }
        Ok(())
    }

    fn on_version(&mut self, ctx: &NetContext, message: &Message, now: i64) -> Result<(), PeerError> {
        if self.got_version {
            return Err(PeerError::Protocol("duplicate version".into()));
        }

        let version: VersionMessage = message.decode()?;
        if version.version < MIN_PROTOCOL_VERSION {
            return Err(PeerError::ObsoleteVersion(version.version));
        }
        if version.nonce != 0 && ctx.peers.is_own_nonce(version.nonce) {
            log::info!("Connected to self at {}, disconnecting", self.endpoint);
            return Err(PeerError::SelfConnection);
        }

        self.version = version.version.min(PROTOCOL_VERSION);
        self.services = version.services;
        self.sub_version = version.sub_version;
        self.start_height = version.start_height;
        self.got_version = true;

        if self.inbound {
            self.push_version(ctx, now)?;
        }
        self.push_message(command::VERACK, &[])?;

        if !self.inbound {
            let (local, pool_size) = {
                let pool = ctx.pool.lock();
                (*pool.get_local(), pool.len())
            };
            if local.is_routable() {
                let mut advertised = local;
                advertised.set_time(now);
                self.push_address(&advertised);
            }
            if pool_size < GETADDR_THRESHOLD {
                self.push_message(command::GETADDR, &[])?;
                self.get_addr = true;
            }
        }

        ctx.peers.record_peer_height(version.start_height);
        log::info!(
            "Version from {}: {} {} height={}",
            self.endpoint,
            self.version,
            self.sub_version,
            self.start_height
        );
        self.update_state(ctx);
        Ok(())
    }

    fn update_state(&mut self, ctx: &NetContext) {
        if self.state == PeerState::Handshaking && self.got_version && self.got_verack {
            self.state = PeerState::Active;
            log::info!("Peer {} active", self.endpoint);
            if !self.inbound {
                ctx.pool.lock().currently_connected(&self.endpoint);
            }
        }
    }

    fn on_addr(&mut self, ctx: &NetContext, message: &Message, now: i64) -> Result<(), PeerError> {
        let mut reader = message.reader();
        let mut addresses: Vec<Endpoint> = if self.version >= ADDR_TIME_VERSION {
            decode_list(&mut reader, MAX_ADDR_PER_MESSAGE)?
        } else {
            decode_list::<VersionAddr>(&mut reader, MAX_ADDR_PER_MESSAGE)?
                .into_iter()
                .map(|VersionAddr(endpoint)| endpoint)
                .collect()
        };
        reader.finish()?;

        for endpoint in &mut addresses {
            if endpoint.time() <= DEFAULT_ENDPOINT_TIME || endpoint.time() > now + 10 * 60 {
                endpoint.set_time(now - 5 * 24 * 60 * 60);
            }
            self.add_address_known(endpoint);
        }

        let added = ctx
            .pool
            .lock()
            .add_endpoints(addresses.iter(), ADDR_GOSSIP_PENALTY);
        log::debug!(
            "{} sent {} addresses, {} new",
            self.endpoint,
            addresses.len(),
            added
        );

        // Solicited batches are not forwarded
        if !self.get_addr && addresses.len() <= MAX_RELAYED_ADDR_BATCH {
            self.relay_addresses.extend(
                addresses
                    .iter()
                    .filter(|endpoint| endpoint.is_routable() && endpoint.time() > now - ADDR_RELAY_WINDOW),
            );
        }
        if addresses.len() < MAX_ADDR_PER_MESSAGE {
            self.get_addr = false;
        }
        Ok(())
    }

    fn on_getaddr(&mut self, ctx: &NetContext) -> Result<(), PeerError> {
        let recent = {
            let pool = ctx.pool.lock();
            let count = pool.count_recent(GETADDR_WINDOW);
            let rand_max = count.div_ceil(GETADDR_SAMPLE).max(1) as u32;
            pool.get_recent(GETADDR_WINDOW, rand_max)
        };

        self.addr_to_send.clear();
        for endpoint in &recent {
            self.push_address(endpoint);
        }
        Ok(())
    }

    fn on_inv(&mut self, ctx: &NetContext, message: &Message, now: i64) -> Result<(), PeerError> {
        let inventory: Vec<Inventory> = decode_list(&mut message.reader(), MAX_INV_PER_MESSAGE)?;
        for item in inventory {
            self.add_inventory_known(item);
            if !self.asking.contains(&item) && !ctx.handler.already_have(&item) {
                self.ask_for(item, ctx, now * 1_000_000);
            }
        }
        Ok(())
    }

    fn on_getdata(&mut self, ctx: &NetContext, message: &Message) -> Result<(), PeerError> {
        let wanted: Vec<Inventory> = decode_list(&mut message.reader(), MAX_INV_PER_MESSAGE)?;
        let mut missing = Vec::new();
        for item in wanted {
            match ctx.handler.lookup(&item) {
                Some(object) => self.push_raw(&object)?,
                None => missing.push(item),
            }
        }
        if !missing.is_empty() {
            self.push_message(command::NOTFOUND, &[&missing])?;
        }
        Ok(())
    }

    // Outbound cadence

    /// Requests whose deadline has passed, plus the keep-alive ping
    pub fn reply(&mut self, ctx: &NetContext, now_us: i64) -> Result<(), PeerError> {
        if !self.is_active() {
            return Ok(());
        }

        let now = now_us / 1_000_000;
        if now - self.last_send_empty > KEEPALIVE_INTERVAL && self.send.is_empty() {
            self.push_message(command::PING, &[])?;
        }

        let mut wanted = Vec::new();
        while let Some(entry) = self.ask_for.first_entry() {
            if entry.key().0 > now_us {
                break;
            }
            let item = entry.remove();
            self.asking.remove(&item);
            if ctx.handler.already_have(&item) {
                continue;
            }
            wanted.push(item);
            if wanted.len() >= MAX_TRICKLE_BATCH {
                self.push_message(command::GETDATA, &[&wanted])?;
                wanted.clear();
            }
        }
        if !wanted.is_empty() {
            self.push_message(command::GETDATA, &[&wanted])?;
        }
        Ok(())
    }

    /// Send at most one addr and one inv batch once the randomized trickle
    /// deadline passes. Returns whether this call was due.
    pub fn trickle(&mut self, now_us: i64) -> Result<bool, PeerError> {
        if !self.is_active() || now_us < self.next_trickle {
            return Ok(false);
        }
        self.next_trickle = now_us + thread_rng().gen_range(0..=2 * TRICKLE_INTERVAL_US);

        if !self.addr_to_send.is_empty() {
            let take = self.addr_to_send.len().min(MAX_TRICKLE_BATCH);
            let batch: Vec<Endpoint> = self.addr_to_send.drain(..take).collect();
            if self.version >= ADDR_TIME_VERSION {
                self.push_message(command::ADDR, &[&batch])?;
            } else {
                let bare: Vec<VersionAddr> = batch.into_iter().map(VersionAddr).collect();
                self.push_message(command::ADDR, &[&bare])?;
            }
        }

        if !self.inventory_to_send.is_empty() {
            let take = self.inventory_to_send.len().min(MAX_TRICKLE_BATCH);
            let batch: Vec<Inventory> = self.inventory_to_send.drain(..take).collect();
            self.push_message(command::INV, &[&batch])?;
        }
        Ok(true)
    }

    /// Committed bytes ready for the socket
    pub fn take_outbound(&mut self) -> Bytes {
        self.send.take()
    }

    pub fn send_queue_len(&self) -> usize {
        self.send.len()
    }

    /// Liveness check. Returns false (and stops the peer) when it has been
    /// silent too long for its state.
    pub fn check_activity(&mut self, now: i64) -> bool {
        if self.is_stopped() {
            return false;
        }
        let timeout = if self.is_active() {
            HEARTBEAT_TIMEOUT
        } else {
            INITIAL_TIMEOUT
        };
        let idle = now - self.last_recv;
        if idle > timeout {
            log::info!("{} inactive for {}s, disconnecting", self.endpoint, idle);
            self.stop();
            return false;
        }
        true
    }

    #[cfg(test)]
    pub(crate) fn force_active(&mut self) {
        self.state = PeerState::Active;
        self.got_version = true;
        self.got_verack = true;
        self.version = PROTOCOL_VERSION;
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint.to_string())
            .field("inbound", &self.inbound)
            .field("state", &self.state)
            .field("version", &self.version)
            .finish()
    }
}
