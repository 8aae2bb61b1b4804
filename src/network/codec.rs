//! Stream framing
//!
//! Turns a raw byte stream into discrete [`Message`]s. The header carries a
//! magic prefix, a NUL-padded command name, the payload length and a 4-byte
//! checksum; all three are validated here so higher layers only deal with
//! command semantics.

use crate::crypto::checksum;
use crate::network::message::{
    Message, WireError, COMMAND_SIZE, HEADER_SIZE, MAGIC, MAX_MESSAGE_SIZE,
};
use bytes::{Buf, BytesMut};
use tokio_util::codec::Decoder;

/// NUL-pad a command name into its fixed-width header field
pub fn encode_command(command: &str) -> Result<[u8; COMMAND_SIZE], WireError> {
    if command.is_empty()
        || command.len() > COMMAND_SIZE
        || !command.bytes().all(|b| b.is_ascii_graphic())
    {
        return Err(WireError::InvalidCommand(command.to_string()));
    }
    let mut field = [0u8; COMMAND_SIZE];
    field[..command.len()].copy_from_slice(command.as_bytes());
    Ok(field)
}

/// Command name must be printable ASCII followed only by NUL padding
fn decode_command(field: &[u8]) -> Result<String, WireError> {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    let (name, padding) = field.split_at(end);
    if name.is_empty()
        || !name.iter().all(|b| b.is_ascii_graphic())
        || padding.iter().any(|&b| b != 0)
    {
        return Err(WireError::InvalidCommand(
            String::from_utf8_lossy(field).into_owned(),
        ));
    }
    Ok(String::from_utf8_lossy(name).into_owned())
}

/// Decoder for the framed wire protocol
#[derive(Debug, Clone)]
pub struct MessageParser {
    magic: [u8; 4],
}

impl MessageParser {
    pub fn new(magic: [u8; 4]) -> Self {
        Self { magic }
    }
}

impl Default for MessageParser {
    fn default() -> Self {
        Self::new(MAGIC)
    }
}

impl Decoder for MessageParser {
    type Item = Message;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Need at least header
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        let mut magic = [0u8; 4];
        magic.copy_from_slice(&src[..4]);
        if magic != self.magic {
            return Err(WireError::BadMagic(magic));
        }

        let command = decode_command(&src[4..4 + COMMAND_SIZE])?;

        let len = u32::from_le_bytes([src[16], src[17], src[18], src[19]]) as usize;
        if len > MAX_MESSAGE_SIZE {
            return Err(WireError::Oversized {
                size: len,
                max: MAX_MESSAGE_SIZE,
            });
        }

        // Check if we have full message
        if src.len() < HEADER_SIZE + len {
            src.reserve(HEADER_SIZE + len - src.len());
            return Ok(None);
        }

        let mut expected = [0u8; 4];
        expected.copy_from_slice(&src[20..24]);

        src.advance(HEADER_SIZE);
        let payload = src.split_to(len).freeze();

        if checksum(&payload) != expected {
            return Err(WireError::BadChecksum { command });
        }

        log::trace!("Parsed {} ({} bytes)", command, len);
        Ok(Some(Message { command, payload }))
    }
}
