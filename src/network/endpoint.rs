//! Network endpoints
//!
//! An [`Endpoint`] is a peer address together with the discovery metadata the
//! address pool keeps for it (advertised services, last-seen time and the
//! time of the last connection attempt). Identity is the address and port
//! only: two endpoints that differ in metadata are the same endpoint.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};
use thiserror::Error;

/// IPv4-mapped prefix of a 16-byte address
const IPV4_PREFIX: [u8; 12] = [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0xff, 0xff];

/// Last-seen time given to endpoints we know nothing about
pub const DEFAULT_ENDPOINT_TIME: i64 = 100_000_000;

/// Length of [`EndpointKey`]: address (16) + IPv4 (4) + port (2)
pub const ENDPOINT_KEY_SIZE: usize = 22;

bitflags! {
    /// Service bits advertised in version and addr messages
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ServiceFlags: u64 {
        /// Full node able to serve blocks
        const NODE_NETWORK = 1;
    }
}

/// Endpoint construction errors
#[derive(Error, Debug)]
pub enum EndpointError {
    #[error("Could not resolve {0}")]
    Resolution(String),
    #[error("Invalid port in {0}")]
    InvalidPort(String),
}

/// Current unix time in seconds
pub fn unix_time() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Current unix time in microseconds
pub fn unix_time_micros() -> i64 {
    chrono::Utc::now().timestamp_micros()
}

/// Canonical byte key of an endpoint, used for the pool map and the store
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointKey([u8; ENDPOINT_KEY_SIZE]);

impl EndpointKey {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        Some(Self(bytes.try_into().ok()?))
    }
}

impl fmt::Debug for EndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EndpointKey({})", self.to_hex())
    }
}

/// A network address plus discovery metadata
#[derive(Clone, Copy, Serialize, Deserialize)]
pub struct Endpoint {
    address: [u8; 16],
    port: u16,
    services: u64,
    time: i64,
    last_try: i64,
}

impl Endpoint {
    /// Create an IPv4 endpoint
    pub fn new(ip: Ipv4Addr, port: u16, services: u64) -> Self {
        let mut address = [0u8; 16];
        address[..12].copy_from_slice(&IPV4_PREFIX);
        address[12..].copy_from_slice(&ip.octets());
        Self::from_bytes(address, port, services)
    }

    /// Create an endpoint from its raw 16-byte address
    pub fn from_bytes(address: [u8; 16], port: u16, services: u64) -> Self {
        Self {
            address,
            port,
            services,
            time: DEFAULT_ENDPOINT_TIME,
            last_try: 0,
        }
    }

    /// Create an endpoint for the remote side of a socket
    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        let services = ServiceFlags::NODE_NETWORK.bits();
        match addr.ip() {
            IpAddr::V4(ip) => Self::new(ip, addr.port(), services),
            IpAddr::V6(ip) => match ip.to_ipv4_mapped() {
                Some(v4) => Self::new(v4, addr.port(), services),
                None => Self::from_bytes(ip.octets(), addr.port(), services),
            },
        }
    }

    /// Resolve `host` or `host:port` into an endpoint.
    ///
    /// Literal IPv4 addresses never touch the resolver. Names are only looked
    /// up when `allow_lookup` is set; the first valid IPv4 answer wins.
    pub fn resolve(
        host: &str,
        default_port: u16,
        allow_lookup: bool,
        services: u64,
    ) -> Result<Self, EndpointError> {
        let (name, port) = split_host_port(host, default_port)?;

        if let Ok(ip) = name.parse::<Ipv4Addr>() {
            return Ok(Self::new(ip, port, services));
        }

        if !allow_lookup || name.is_empty() {
            return Err(EndpointError::Resolution(host.to_string()));
        }

        let addrs = (name, port)
            .to_socket_addrs()
            .map_err(|_| EndpointError::Resolution(host.to_string()))?;

        addrs
            .filter_map(|addr| match addr {
                SocketAddr::V4(v4) => Some(Self::new(*v4.ip(), port, services)),
                SocketAddr::V6(_) => None,
            })
            .find(|ep| ep.is_valid())
            .ok_or_else(|| EndpointError::Resolution(host.to_string()))
    }

    pub fn address(&self) -> &[u8; 16] {
        &self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn set_port(&mut self, port: u16) {
        self.port = port;
    }

    pub fn services(&self) -> u64 {
        self.services
    }

    pub fn set_services(&mut self, services: u64) {
        self.services = services;
    }

    /// Last-seen time (unix seconds)
    pub fn time(&self) -> i64 {
        self.time
    }

    pub fn set_time(&mut self, time: i64) {
        self.time = time;
    }

    /// Time of the last connection attempt (0 = never)
    pub fn last_try(&self) -> i64 {
        self.last_try
    }

    pub fn set_last_try(&mut self, time: i64) {
        self.last_try = time;
    }

    /// The trailing four address bytes as an IPv4 address
    pub fn ipv4(&self) -> Ipv4Addr {
        Ipv4Addr::new(
            self.address[12],
            self.address[13],
            self.address[14],
            self.address[15],
        )
    }

    fn ipv4_bits(&self) -> u32 {
        u32::from(self.ipv4())
    }

    pub fn ip(&self) -> IpAddr {
        if self.is_ipv4() {
            IpAddr::V4(self.ipv4())
        } else {
            IpAddr::V6(Ipv6Addr::from(self.address))
        }
    }

    pub fn to_socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip(), self.port)
    }

    pub fn key(&self) -> EndpointKey {
        let mut key = [0u8; ENDPOINT_KEY_SIZE];
        key[..16].copy_from_slice(&self.address);
        key[16..20].copy_from_slice(&self.ipv4_bits().to_be_bytes());
        key[20..].copy_from_slice(&self.port.to_be_bytes());
        EndpointKey(key)
    }

    pub fn is_ipv4(&self) -> bool {
        self.address[..12] == IPV4_PREFIX
    }

    /// Private networks (10/8, 192.168/16, 172.16/12)
    pub fn is_rfc1918(&self) -> bool {
        let o = self.ipv4().octets();
        self.is_ipv4()
            && (o[0] == 10 || (o[0] == 192 && o[1] == 168) || (o[0] == 172 && (16..=31).contains(&o[1])))
    }

    /// Link-local autoconfiguration (169.254/16)
    pub fn is_rfc3927(&self) -> bool {
        let o = self.ipv4().octets();
        self.is_ipv4() && o[0] == 169 && o[1] == 254
    }

    pub fn is_local(&self) -> bool {
        let o = self.ipv4().octets();
        self.is_ipv4() && (o[0] == 127 || o[0] == 0)
    }

    pub fn is_routable(&self) -> bool {
        self.is_valid() && !(self.is_rfc1918() || self.is_rfc3927() || self.is_local())
    }

    pub fn is_valid(&self) -> bool {
        // Addresses shifted by three bytes come from garbled addr vectors
        if self.address[..9] == IPV4_PREFIX[3..] {
            return false;
        }

        let bits = self.ipv4_bits();
        bits != 0 && bits != u32::MAX && self.port != u16::MAX
    }
}

/// Split `host[:port]` (or `[v6]:port`), falling back to `default_port`
fn split_host_port(input: &str, default_port: u16) -> Result<(&str, u16), EndpointError> {
    let (host, port) = match input.rsplit_once(':') {
        // a bare IPv6 literal has more than one colon and no brackets
        Some((host, port)) if !host.contains(':') || host.ends_with(']') => (host, Some(port)),
        _ => (input, None),
    };

    let port = match port {
        Some(p) => p
            .parse::<u16>()
            .map_err(|_| EndpointError::InvalidPort(input.to_string()))?,
        None => default_port,
    };

    Ok((host.trim_start_matches('[').trim_end_matches(']'), port))
}

impl PartialEq for Endpoint {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address && self.port == other.port
    }
}

impl Eq for Endpoint {}

impl Hash for Endpoint {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address.hash(state);
        self.port.hash(state);
    }
}

impl Ord for Endpoint {
    fn cmp(&self, other: &Self) -> Ordering {
        self.address
            .cmp(&other.address)
            .then_with(|| self.ipv4_bits().cmp(&other.ipv4_bits()))
            .then_with(|| self.port.cmp(&other.port))
    }
}

impl PartialOrd for Endpoint {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_ipv4() {
            write!(f, "{}:{}", self.ipv4(), self.port)
        } else {
            write!(f, "[{}]:{}", Ipv6Addr::from(self.address), self.port)
        }
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("addr", &self.to_string())
            .field("services", &self.services)
            .field("time", &self.time)
            .field("last_try", &self.last_try)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ep(a: u8, b: u8, c: u8, d: u8, port: u16) -> Endpoint {
        Endpoint::new(Ipv4Addr::new(a, b, c, d), port, 1)
    }

    #[test]
    fn test_display() {
        assert_eq!(ep(1, 2, 3, 4, 8333).to_string(), "1.2.3.4:8333");
    }

    #[test]
    fn test_equality_ignores_metadata() {
        let a = ep(1, 2, 3, 4, 8333);
        let mut b = a;
        b.set_time(123);
        b.set_last_try(456);
        b.set_services(0xff);
        assert_eq!(a, b);
        assert_eq!(a.cmp(&b), Ordering::Equal);
        assert_eq!(a.key(), b.key());
    }

    #[test]
    fn test_total_order() {
        let eps = [
            ep(1, 2, 3, 4, 8333),
            ep(1, 2, 3, 4, 8334),
            ep(1, 2, 3, 5, 1),
            ep(9, 0, 0, 1, 8333),
            ep(200, 1, 1, 1, 80),
        ];
        for a in &eps {
            for b in &eps {
                let outcomes = [a < b, b < a, a == b];
                assert_eq!(outcomes.iter().filter(|x| **x).count(), 1, "{} vs {}", a, b);
            }
        }
        assert!(ep(1, 2, 3, 4, 8333) < ep(1, 2, 3, 4, 8334));
        assert!(ep(1, 2, 3, 4, 9999) < ep(1, 2, 3, 5, 1));
    }

    #[test]
    fn test_key_order_matches_endpoint_order() {
        let a = ep(1, 2, 3, 4, 9999);
        let b = ep(1, 2, 3, 5, 1);
        assert!(a.key() < b.key());
        assert_eq!(a.key().as_bytes().len(), ENDPOINT_KEY_SIZE);
        assert_eq!(EndpointKey::from_hex(&a.key().to_hex()), Some(a.key()));
    }

    #[test]
    fn test_classification() {
        assert!(ep(8, 8, 8, 8, 8333).is_routable());
        assert!(ep(10, 0, 0, 1, 8333).is_rfc1918());
        assert!(ep(192, 168, 1, 1, 8333).is_rfc1918());
        assert!(ep(172, 16, 0, 1, 8333).is_rfc1918());
        assert!(!ep(172, 32, 0, 1, 8333).is_rfc1918());
        assert!(ep(169, 254, 3, 3, 8333).is_rfc3927());
        assert!(ep(127, 0, 0, 1, 8333).is_local());
        assert!(!ep(127, 0, 0, 1, 8333).is_routable());
        assert!(!ep(192, 168, 1, 1, 8333).is_routable());
    }

    #[test]
    fn test_validity() {
        assert!(!ep(0, 0, 0, 0, 8333).is_valid());
        assert!(!ep(255, 255, 255, 255, 8333).is_valid());
        assert!(!ep(1, 2, 3, 4, u16::MAX).is_valid());
        assert!(ep(1, 2, 3, 4, 8333).is_valid());

        let mut shifted = [0u8; 16];
        shifted[7] = 0xff;
        shifted[8] = 0xff;
        shifted[15] = 1;
        assert!(!Endpoint::from_bytes(shifted, 8333, 1).is_valid());
    }

    #[test]
    fn test_from_socket_addr() {
        let addr: SocketAddr = "1.2.3.4:18333".parse().unwrap();
        let endpoint = Endpoint::from_socket_addr(addr);
        assert!(endpoint.is_ipv4());
        assert_eq!(endpoint.to_string(), "1.2.3.4:18333");
        assert_eq!(endpoint.to_socket_addr(), addr);

        let v6: SocketAddr = "[2001:db8::1]:8333".parse().unwrap();
        let endpoint = Endpoint::from_socket_addr(v6);
        assert!(!endpoint.is_ipv4());
        assert_eq!(endpoint.to_string(), "[2001:db8::1]:8333");
    }

    #[test]
    fn test_resolve_literal() {
        let endpoint = Endpoint::resolve("1.2.3.4", 8333, false, 1).unwrap();
        assert_eq!(endpoint.to_string(), "1.2.3.4:8333");

        let endpoint = Endpoint::resolve("1.2.3.4:9000", 8333, false, 1).unwrap();
        assert_eq!(endpoint.port(), 9000);
    }

    #[test]
    fn test_resolve_lookup_disallowed() {
        let result = Endpoint::resolve("seed.example.invalid", 8333, false, 1);
        assert!(matches!(result, Err(EndpointError::Resolution(_))));
    }

    #[test]
    fn test_resolve_bad_port() {
        let result = Endpoint::resolve("1.2.3.4:notaport", 8333, false, 1);
        assert!(matches!(result, Err(EndpointError::InvalidPort(_))));
    }

    #[test]
    fn test_serde_keeps_metadata() {
        let mut endpoint = ep(1, 2, 3, 4, 8333);
        endpoint.set_time(1_700_000_000);
        let json = serde_json::to_string(&endpoint).unwrap();
        let back: Endpoint = serde_json::from_str(&json).unwrap();
        assert_eq!(back, endpoint);
        assert_eq!(back.time(), 1_700_000_000);
    }
}
