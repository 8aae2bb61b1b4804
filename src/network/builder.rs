//! Transactional outbound message builder
//!
//! A [`SendQueue`] holds fully framed messages waiting for the socket.
//! Messages are built in place: [`SendQueue::begin`] reserves a header and
//! marks the queue offset, fields are appended, and [`SendQueue::commit`]
//! backpatches length and checksum. [`SendQueue::abort`] truncates back to
//! the mark, so a partially built message never reaches the wire.

use crate::crypto::checksum;
use crate::network::codec::encode_command;
use crate::network::message::{Encodable, WireError, HEADER_SIZE, MAGIC, MAX_MESSAGE_SIZE};
use bytes::{BufMut, Bytes, BytesMut};

pub struct SendQueue {
    magic: [u8; 4],
    buf: BytesMut,
    /// Offset of the header of the message being built
    mark: Option<usize>,
}

impl SendQueue {
    pub fn new(magic: [u8; 4]) -> Self {
        Self {
            magic,
            buf: BytesMut::new(),
            mark: None,
        }
    }

    /// Start a new message. Any message still in progress is discarded.
    pub fn begin(&mut self, command: &str) -> Result<(), WireError> {
        if self.mark.is_some() {
            log::warn!("Discarding unfinished message before {}", command);
            self.abort();
        }
        let name = encode_command(command)?;
        self.mark = Some(self.buf.len());
        self.buf.put_slice(&self.magic);
        self.buf.put_slice(&name);
        // length and checksum are filled in on commit
        self.buf.put_slice(&[0u8; 8]);
        Ok(())
    }

    /// Append one field to the message in progress. On failure the whole
    /// message is rolled back.
    pub fn append(&mut self, field: &dyn Encodable) -> Result<(), WireError> {
        if self.mark.is_none() {
            return Err(WireError::NoMessageInProgress);
        }
        if let Err(e) = field.encode(&mut self.buf) {
            self.abort();
            return Err(e);
        }
        Ok(())
    }

    /// Finish the message in progress, returning its payload length
    pub fn commit(&mut self) -> Result<usize, WireError> {
        let start = self.mark.ok_or(WireError::NoMessageInProgress)?;
        let payload_start = start + HEADER_SIZE;
        let payload_len = self.buf.len() - payload_start;

        if payload_len > MAX_MESSAGE_SIZE {
            self.abort();
            return Err(WireError::Oversized {
                size: payload_len,
                max: MAX_MESSAGE_SIZE,
            });
        }

        let sum = checksum(&self.buf[payload_start..]);
        self.buf[start + 16..start + 20].copy_from_slice(&(payload_len as u32).to_le_bytes());
        self.buf[start + 20..start + 24].copy_from_slice(&sum);
        self.mark = None;

        Ok(payload_len)
    }

    /// Commit, unless nothing was appended since `begin`, in which case the
    /// message is dropped. Returns whether anything was committed.
    pub fn commit_or_abort_if_empty(&mut self) -> Result<Option<usize>, WireError> {
        let start = self.mark.ok_or(WireError::NoMessageInProgress)?;
        if self.buf.len() == start + HEADER_SIZE {
            self.abort();
            return Ok(None);
        }
        self.commit().map(Some)
    }

    /// Drop the message in progress, restoring the queue to its length
    /// before `begin`
    pub fn abort(&mut self) {
        if let Some(start) = self.mark.take() {
            self.buf.truncate(start);
        }
    }

    pub fn in_progress(&self) -> bool {
        self.mark.is_some()
    }

    /// Bytes of committed messages
    pub fn len(&self) -> usize {
        self.mark.unwrap_or(self.buf.len())
    }

    /// Total bytes including any message still being built
    pub fn raw_len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove and return every committed message. A message still in
    /// progress stays queued.
    pub fn take(&mut self) -> Bytes {
        let committed = self.len();
        let out = self.buf.split_to(committed).freeze();
        if let Some(mark) = self.mark.as_mut() {
            *mark = 0;
        }
        out
    }
}

impl Default for SendQueue {
    fn default() -> Self {
        Self::new(MAGIC)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::codec::MessageParser;
    use crate::network::message::command;
    use tokio_util::codec::Decoder;

    struct Failing;

    impl Encodable for Failing {
        fn encode(&self, out: &mut BytesMut) -> Result<(), WireError> {
            out.put_slice(&[0xaa; 5]);
            Err(WireError::Custom("field failed".into()))
        }
    }

    fn push_verack(queue: &mut SendQueue) {
        queue.begin(command::VERACK).unwrap();
        queue.commit().unwrap();
    }

    #[test]
    fn test_commit_produces_parseable_frame() {
        let mut queue = SendQueue::default();
        queue.begin(command::PING).unwrap();
        queue.append(&7u64).unwrap();
        assert_eq!(queue.commit().unwrap(), 8);

        let mut bytes = BytesMut::from(&queue.take()[..]);
        let msg = MessageParser::default().decode(&mut bytes).unwrap().unwrap();
        assert_eq!(msg.command, command::PING);
        assert_eq!(msg.decode::<u64>().unwrap(), 7);
    }

    #[test]
    fn test_abort_restores_length() {
        let mut queue = SendQueue::default();
        push_verack(&mut queue);
        let before = queue.raw_len();

        queue.begin(command::INV).unwrap();
        queue.append(&1u32).unwrap();
        queue.abort();

        assert_eq!(queue.raw_len(), before);
        assert!(!queue.in_progress());
    }

    #[test]
    fn test_failed_append_rolls_back() {
        let mut queue = SendQueue::default();
        push_verack(&mut queue);
        let before = queue.raw_len();

        queue.begin(command::TX).unwrap();
        queue.append(&1u32).unwrap();
        assert!(queue.append(&Failing).is_err());
        assert_eq!(queue.raw_len(), before);
        assert!(!queue.in_progress());
    }

    #[test]
    fn test_append_without_begin() {
        let mut queue = SendQueue::default();
        assert!(matches!(
            queue.append(&1u8),
            Err(WireError::NoMessageInProgress)
        ));
        assert!(matches!(queue.commit(), Err(WireError::NoMessageInProgress)));
    }

    #[test]
    fn test_begin_discards_unfinished() {
        let mut queue = SendQueue::default();
        queue.begin(command::INV).unwrap();
        queue.append(&1u32).unwrap();
        queue.begin(command::PING).unwrap();
        queue.commit().unwrap();
        assert_eq!(queue.len(), HEADER_SIZE);
    }

    #[test]
    fn test_abort_if_empty() {
        let mut queue = SendQueue::default();
        queue.begin(command::INV).unwrap();
        assert_eq!(queue.commit_or_abort_if_empty().unwrap(), None);
        assert!(queue.is_empty());

        queue.begin(command::INV).unwrap();
        queue.append(&0u8).unwrap();
        assert_eq!(queue.commit_or_abort_if_empty().unwrap(), Some(1));
        assert_eq!(queue.len(), HEADER_SIZE + 1);
    }

    #[test]
    fn test_take_leaves_message_in_progress() {
        let mut queue = SendQueue::default();
        push_verack(&mut queue);
        queue.begin(command::PING).unwrap();
        queue.append(&1u64).unwrap();

        let sent = queue.take();
        assert_eq!(sent.len(), HEADER_SIZE);
        assert!(queue.is_empty());

        queue.commit().unwrap();
        assert_eq!(queue.len(), HEADER_SIZE + 8);
    }
}
