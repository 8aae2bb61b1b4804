//! Wire protocol types
//!
//! Messages travel as a 24-byte header (magic, command, payload length,
//! checksum) followed by a binary payload. This module defines the payload
//! encoding ([`Encodable`] / [`Decodable`]), the command names, and the
//! structured payloads the overlay itself understands.

use crate::crypto::Hash256;
use crate::network::endpoint::Endpoint;
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;
use thiserror::Error;

/// Protocol version we speak
pub const PROTOCOL_VERSION: i32 = 60002;

/// Oldest protocol version we accept
pub const MIN_PROTOCOL_VERSION: i32 = 209;

/// First version whose addr entries carry a timestamp
pub const ADDR_TIME_VERSION: i32 = 31402;

/// Magic bytes for message framing (main network)
pub const MAGIC: [u8; 4] = [0xf9, 0xbe, 0xb4, 0xd9];

/// Maximum payload size
pub const MAX_MESSAGE_SIZE: usize = 0x0200_0000;

/// Width of the NUL-padded command field
pub const COMMAND_SIZE: usize = 12;

/// magic (4) + command (12) + length (4) + checksum (4)
pub const HEADER_SIZE: usize = 24;

/// Maximum addresses in a single addr message
pub const MAX_ADDR_PER_MESSAGE: usize = 1000;

/// Maximum entries in a single inv / getdata message
pub const MAX_INV_PER_MESSAGE: usize = 50_000;

/// Command names
pub mod command {
    pub const VERSION: &str = "version";
    pub const VERACK: &str = "verack";
    pub const ADDR: &str = "addr";
    pub const GETADDR: &str = "getaddr";
    pub const INV: &str = "inv";
    pub const GETDATA: &str = "getdata";
    pub const NOTFOUND: &str = "notfound";
    pub const TX: &str = "tx";
    pub const BLOCK: &str = "block";
    pub const PING: &str = "ping";
    pub const PONG: &str = "pong";
    pub const REJECT: &str = "reject";
    pub const REPLY: &str = "reply";
}

/// Wire encoding and framing errors
#[derive(Error, Debug)]
pub enum WireError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Truncated payload: needed {needed} bytes, {remaining} left")]
    Truncated { needed: usize, remaining: usize },
    #[error("Message too large: {size} bytes, max {max} bytes")]
    Oversized { size: usize, max: usize },
    #[error("Invalid magic: {0:02x?}")]
    BadMagic([u8; 4]),
    #[error("Checksum mismatch for {command}")]
    BadChecksum { command: String },
    #[error("Invalid command name: {0:?}")]
    InvalidCommand(String),
    #[error("Invalid string encoding")]
    InvalidString,
    #[error("Unknown inventory type {0}")]
    UnknownInvType(u32),
    #[error("No message in progress")]
    NoMessageInProgress,
    #[error("{0}")]
    Custom(String),
}

/// Types that can be appended to a message payload
pub trait Encodable {
    fn encode(&self, out: &mut BytesMut) -> Result<(), WireError>;
}

/// Types that can be read back out of a message payload
pub trait Decodable: Sized {
    fn decode(reader: &mut PayloadReader<'_>) -> Result<Self, WireError>;
}

/// A framed message: command plus raw payload
#[derive(Clone, PartialEq, Eq)]
pub struct Message {
    pub command: String,
    pub payload: Bytes,
}

impl Message {
    pub fn new(command: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            command: command.into(),
            payload: payload.into(),
        }
    }

    /// Build a message from a list of fields
    pub fn from_fields(command: &str, fields: &[&dyn Encodable]) -> Result<Self, WireError> {
        let mut payload = BytesMut::new();
        for field in fields {
            field.encode(&mut payload)?;
        }
        Ok(Self::new(command, payload.freeze()))
    }

    pub fn reader(&self) -> PayloadReader<'_> {
        PayloadReader::new(&self.payload)
    }

    /// Decode the whole payload as a single value, rejecting trailing bytes
    pub fn decode<T: Decodable>(&self) -> Result<T, WireError> {
        let mut reader = self.reader();
        let value = T::decode(&mut reader)?;
        reader.finish()?;
        Ok(value)
    }

    /// Get message type name for logging
    pub fn type_name(&self) -> &str {
        &self.command
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Message({}, {} bytes)", self.command, self.payload.len())
    }
}

/// Cursor over a payload
pub struct PayloadReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Everything not yet consumed
    pub fn rest(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }

    pub fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        if self.remaining() < n {
            return Err(WireError::Truncated {
                needed: n,
                remaining: self.remaining(),
            });
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn read<T: Decodable>(&mut self) -> Result<T, WireError> {
        T::decode(self)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], WireError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn read_compact_size(&mut self) -> Result<u64, WireError> {
        let first = self.array::<1>()?[0];
        Ok(match first {
            0xfd => u16::from_le_bytes(self.array()?) as u64,
            0xfe => u32::from_le_bytes(self.array()?) as u64,
            0xff => u64::from_le_bytes(self.array()?),
            n => n as u64,
        })
    }

    /// A length prefix, bounded by `max`
    pub fn read_length(&mut self, max: usize) -> Result<usize, WireError> {
        let len = self.read_compact_size()?;
        if len > max as u64 {
            return Err(WireError::Oversized {
                size: len as usize,
                max,
            });
        }
        Ok(len as usize)
    }

    pub fn finish(&self) -> Result<(), WireError> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(WireError::Custom(format!("{} unexpected trailing bytes", n))),
        }
    }
}

pub fn write_compact_size(out: &mut BytesMut, n: u64) {
    match n {
        0..=0xfc => out.put_u8(n as u8),
        0xfd..=0xffff => {
            out.put_u8(0xfd);
            out.put_u16_le(n as u16);
        }
        0x1_0000..=0xffff_ffff => {
            out.put_u8(0xfe);
            out.put_u32_le(n as u32);
        }
        _ => {
            out.put_u8(0xff);
            out.put_u64_le(n);
        }
    }
}

macro_rules! impl_int {
    ($($t:ty => $put:ident),* $(,)?) => {$(
        impl Encodable for $t {
            fn encode(&self, out: &mut BytesMut) -> Result<(), WireError> {
                out.$put(*self);
                Ok(())
            }
        }

        impl Decodable for $t {
            fn decode(reader: &mut PayloadReader<'_>) -> Result<Self, WireError> {
                Ok(<$t>::from_le_bytes(reader.array()?))
            }
        }
    )*};
}

impl_int!(
    u8 => put_u8,
    u16 => put_u16_le,
    u32 => put_u32_le,
    u64 => put_u64_le,
    i32 => put_i32_le,
    i64 => put_i64_le,
);

impl Encodable for bool {
    fn encode(&self, out: &mut BytesMut) -> Result<(), WireError> {
        out.put_u8(*self as u8);
        Ok(())
    }
}

impl Decodable for bool {
    fn decode(reader: &mut PayloadReader<'_>) -> Result<Self, WireError> {
        Ok(reader.read::<u8>()? != 0)
    }
}

/// Length-prefixed string
impl Encodable for str {
    fn encode(&self, out: &mut BytesMut) -> Result<(), WireError> {
        if self.len() > MAX_MESSAGE_SIZE {
            return Err(WireError::Oversized {
                size: self.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }
        write_compact_size(out, self.len() as u64);
        out.put_slice(self.as_bytes());
        Ok(())
    }
}

impl Encodable for String {
    fn encode(&self, out: &mut BytesMut) -> Result<(), WireError> {
        self.as_str().encode(out)
    }
}

impl Decodable for String {
    fn decode(reader: &mut PayloadReader<'_>) -> Result<Self, WireError> {
        let bytes = Vec::<u8>::decode(reader)?;
        String::from_utf8(bytes).map_err(|_| WireError::InvalidString)
    }
}

impl Decodable for Vec<u8> {
    fn decode(reader: &mut PayloadReader<'_>) -> Result<Self, WireError> {
        let len = reader.read_length(MAX_MESSAGE_SIZE)?;
        Ok(reader.take(len)?.to_vec())
    }
}

/// Bytes appended verbatim, without a length prefix
pub struct Raw<'a>(pub &'a [u8]);

impl Encodable for Raw<'_> {
    fn encode(&self, out: &mut BytesMut) -> Result<(), WireError> {
        out.put_slice(self.0);
        Ok(())
    }
}

impl Encodable for Hash256 {
    fn encode(&self, out: &mut BytesMut) -> Result<(), WireError> {
        out.put_slice(&self.0);
        Ok(())
    }
}

impl Decodable for Hash256 {
    fn decode(reader: &mut PayloadReader<'_>) -> Result<Self, WireError> {
        Ok(Hash256(reader.array()?))
    }
}

impl<T: Encodable> Encodable for [T] {
    fn encode(&self, out: &mut BytesMut) -> Result<(), WireError> {
        write_compact_size(out, self.len() as u64);
        for item in self {
            item.encode(out)?;
        }
        Ok(())
    }
}

impl<T: Encodable> Encodable for Vec<T> {
    fn encode(&self, out: &mut BytesMut) -> Result<(), WireError> {
        self.as_slice().encode(out)
    }
}

/// Decode a length-prefixed list of at most `max` items
pub fn decode_list<T: Decodable>(
    reader: &mut PayloadReader<'_>,
    max: usize,
) -> Result<Vec<T>, WireError> {
    let len = reader.read_length(max)?;
    let mut items = Vec::with_capacity(len.min(1024));
    for _ in 0..len {
        items.push(T::decode(reader)?);
    }
    Ok(items)
}

impl<T: Encodable + ?Sized> Encodable for &T {
    fn encode(&self, out: &mut BytesMut) -> Result<(), WireError> {
        (**self).encode(out)
    }
}

// Endpoints in addr messages carry their last-seen time
impl Encodable for Endpoint {
    fn encode(&self, out: &mut BytesMut) -> Result<(), WireError> {
        out.put_u32_le(self.time().clamp(0, u32::MAX as i64) as u32);
        VersionAddr(*self).encode(out)
    }
}

impl Decodable for Endpoint {
    fn decode(reader: &mut PayloadReader<'_>) -> Result<Self, WireError> {
        let time = reader.read::<u32>()?;
        let VersionAddr(mut endpoint) = reader.read::<VersionAddr>()?;
        endpoint.set_time(time as i64);
        Ok(endpoint)
    }
}

/// Endpoint in its timeless form, as embedded in version messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionAddr(pub Endpoint);

impl Encodable for VersionAddr {
    fn encode(&self, out: &mut BytesMut) -> Result<(), WireError> {
        out.put_u64_le(self.0.services());
        out.put_slice(self.0.address());
        out.put_u16(self.0.port());
        Ok(())
    }
}

impl Decodable for VersionAddr {
    fn decode(reader: &mut PayloadReader<'_>) -> Result<Self, WireError> {
        let services = reader.read::<u64>()?;
        let address = reader.array::<16>()?;
        let port = u16::from_be_bytes(reader.array()?);
        Ok(Self(Endpoint::from_bytes(address, port, services)))
    }
}

/// Inventory object types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum InvType {
    Error = 0,
    Tx = 1,
    Block = 2,
}

impl InvType {
    pub fn command(&self) -> &'static str {
        match self {
            InvType::Error => "ERROR",
            InvType::Tx => command::TX,
            InvType::Block => command::BLOCK,
        }
    }
}

impl TryFrom<u32> for InvType {
    type Error = WireError;

    fn try_from(value: u32) -> Result<Self, WireError> {
        match value {
            0 => Ok(InvType::Error),
            1 => Ok(InvType::Tx),
            2 => Ok(InvType::Block),
            other => Err(WireError::UnknownInvType(other)),
        }
    }
}

/// Identifier of a relayable object
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Inventory {
    pub kind: InvType,
    pub hash: Hash256,
}

impl Inventory {
    pub fn new(kind: InvType, hash: Hash256) -> Self {
        Self { kind, hash }
    }

    pub fn tx(hash: Hash256) -> Self {
        Self::new(InvType::Tx, hash)
    }

    pub fn block(hash: Hash256) -> Self {
        Self::new(InvType::Block, hash)
    }
}

impl fmt::Display for Inventory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self.hash.to_string();
        write!(f, "{} {}", self.kind.command(), &hex[..16])
    }
}

impl fmt::Debug for Inventory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Inventory({})", self)
    }
}

impl Encodable for Inventory {
    fn encode(&self, out: &mut BytesMut) -> Result<(), WireError> {
        out.put_u32_le(self.kind as u32);
        self.hash.encode(out)
    }
}

impl Decodable for Inventory {
    fn decode(reader: &mut PayloadReader<'_>) -> Result<Self, WireError> {
        let kind = InvType::try_from(reader.read::<u32>()?)?;
        Ok(Self::new(kind, reader.read()?))
    }
}

/// Handshake message sent when a connection opens
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionMessage {
    pub version: i32,
    pub services: u64,
    pub timestamp: i64,
    /// The address of the receiving node as we see it
    pub addr_recv: Endpoint,
    /// Our own address as we advertise it
    pub addr_from: Endpoint,
    /// Random nonce used to detect connections to self
    pub nonce: u64,
    pub sub_version: String,
    pub start_height: i32,
}

impl Encodable for VersionMessage {
    fn encode(&self, out: &mut BytesMut) -> Result<(), WireError> {
        self.version.encode(out)?;
        self.services.encode(out)?;
        self.timestamp.encode(out)?;
        VersionAddr(self.addr_recv).encode(out)?;
        VersionAddr(self.addr_from).encode(out)?;
        self.nonce.encode(out)?;
        self.sub_version.encode(out)?;
        self.start_height.encode(out)
    }
}

impl Decodable for VersionMessage {
    fn decode(reader: &mut PayloadReader<'_>) -> Result<Self, WireError> {
        let version = reader.read()?;
        let services = reader.read()?;
        let timestamp = reader.read()?;
        let VersionAddr(addr_recv) = reader.read::<VersionAddr>()?;

        // Very old peers stop after the receiver address
        if reader.remaining() == 0 {
            return Ok(Self {
                version,
                services,
                timestamp,
                addr_recv,
                addr_from: Endpoint::from_bytes([0u8; 16], 0, 0),
                nonce: 0,
                sub_version: String::new(),
                start_height: 0,
            });
        }

        let VersionAddr(addr_from) = reader.read::<VersionAddr>()?;
        let nonce = reader.read()?;
        let sub_version = if reader.remaining() > 0 {
            reader.read()?
        } else {
            String::new()
        };
        let start_height = if reader.remaining() >= 4 {
            reader.read()?
        } else {
            0
        };

        // Newer peers may append fields we do not know about
        let _ = reader.take(reader.remaining())?;

        Ok(Self {
            version,
            services,
            timestamp,
            addr_recv,
            addr_from,
            nonce,
            sub_version,
            start_height,
        })
    }
}

/// Reject codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectCode {
    Malformed,
    Invalid,
    Obsolete,
    Duplicate,
    Nonstandard,
    Other(u8),
}

impl From<u8> for RejectCode {
    fn from(code: u8) -> Self {
        match code {
            0x01 => RejectCode::Malformed,
            0x10 => RejectCode::Invalid,
            0x11 => RejectCode::Obsolete,
            0x12 => RejectCode::Duplicate,
            0x40 => RejectCode::Nonstandard,
            other => RejectCode::Other(other),
        }
    }
}

impl From<RejectCode> for u8 {
    fn from(code: RejectCode) -> Self {
        match code {
            RejectCode::Malformed => 0x01,
            RejectCode::Invalid => 0x10,
            RejectCode::Obsolete => 0x11,
            RejectCode::Duplicate => 0x12,
            RejectCode::Nonstandard => 0x40,
            RejectCode::Other(other) => other,
        }
    }
}

/// Notification that a message was rejected
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectMessage {
    /// Command of the rejected message
    pub message: String,
    pub code: RejectCode,
    pub reason: String,
}

impl Encodable for RejectMessage {
    fn encode(&self, out: &mut BytesMut) -> Result<(), WireError> {
        self.message.encode(out)?;
        u8::from(self.code).encode(out)?;
        self.reason.encode(out)
    }
}

impl Decodable for RejectMessage {
    fn decode(reader: &mut PayloadReader<'_>) -> Result<Self, WireError> {
        let message = reader.read()?;
        let code = RejectCode::from(reader.read::<u8>()?);
        let reason = reader.read()?;
        // optional object hash follows for tx/block rejects
        let _ = reader.take(reader.remaining())?;
        Ok(Self {
            message,
            code,
            reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_compact_size_boundaries() {
        for (n, len) in [(0u64, 1), (0xfc, 1), (0xfd, 3), (0xffff, 3), (0x10000, 5), (1 << 32, 9)] {
            let mut buf = BytesMut::new();
            write_compact_size(&mut buf, n);
            assert_eq!(buf.len(), len, "encoding of {}", n);
            assert_eq!(PayloadReader::new(&buf).read_compact_size().unwrap(), n);
        }
    }

    #[test]
    fn test_endpoint_wire_layout() {
        let mut endpoint = Endpoint::new(Ipv4Addr::new(1, 2, 3, 4), 8333, 1);
        endpoint.set_time(0x01020304);

        let mut buf = BytesMut::new();
        endpoint.encode(&mut buf).unwrap();
        assert_eq!(buf.len(), 30);
        // port is big-endian, unlike every other integer
        assert_eq!(&buf[28..], &[0x20, 0x8d]);

        let decoded: Endpoint = PayloadReader::new(&buf).read().unwrap();
        assert_eq!(decoded, endpoint);
        assert_eq!(decoded.time(), 0x01020304);
        assert_eq!(decoded.services(), 1);
    }

    #[test]
    fn test_version_message() {
        let version = VersionMessage {
            version: PROTOCOL_VERSION,
            services: 1,
            timestamp: 1_700_000_000,
            addr_recv: Endpoint::new(Ipv4Addr::new(1, 2, 3, 4), 8333, 1),
            addr_from: Endpoint::new(Ipv4Addr::new(5, 6, 7, 8), 8333, 1),
            nonce: 42,
            sub_version: "/mini-p2p:0.1.0/".to_string(),
            start_height: 1000,
        };

        let msg = Message::from_fields(command::VERSION, &[&version]).unwrap();
        let decoded: VersionMessage = msg.decode().unwrap();
        assert_eq!(decoded, version);
    }

    #[test]
    fn test_truncated_payload() {
        let msg = Message::new(command::PING, vec![1u8, 2, 3]);
        let err = msg.decode::<u64>().unwrap_err();
        assert!(matches!(err, WireError::Truncated { needed: 8, remaining: 3 }));
    }

    #[test]
    fn test_inventory_list_limit() {
        let mut buf = BytesMut::new();
        write_compact_size(&mut buf, (MAX_INV_PER_MESSAGE + 1) as u64);
        let result = decode_list::<Inventory>(&mut PayloadReader::new(&buf), MAX_INV_PER_MESSAGE);
        assert!(matches!(result, Err(WireError::Oversized { .. })));
    }

    #[test]
    fn test_unknown_inv_type() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(7);
        buf.put_slice(&[0u8; 32]);
        let result = PayloadReader::new(&buf).read::<Inventory>();
        assert!(matches!(result, Err(WireError::UnknownInvType(7))));
    }

    #[test]
    fn test_reject_message() {
        let reject = RejectMessage {
            message: command::TX.to_string(),
            code: RejectCode::Duplicate,
            reason: "already have".to_string(),
        };
        let msg = Message::from_fields(command::REJECT, &[&reject]).unwrap();
        assert_eq!(msg.decode::<RejectMessage>().unwrap(), reject);
    }
}
