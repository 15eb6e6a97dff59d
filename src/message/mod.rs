//! The tagged message layer.
//!
//! A serialized message is a 2 byte big-endian header word followed by an
//! optional 2 byte ping code and the payload:
//!
//! - bit 15 of the header word marks transport-internal command messages,
//! - bits 14 and 13 sit in the tag's reserved high range and mark ping
//!   requests and ping acknowledgements; either one implies the ping code
//!   field is present,
//! - the low 15 bits carry the tag.
//!
//! On the reliable channel each message travels inside a length-prefixed
//! frame; on the unreliable channel one serialized message is one datagram.

pub mod buffer;
pub mod cursor;

use std::sync::atomic::{AtomicU16, Ordering};

use byteorder::{BigEndian, ByteOrder};

use crate::message::buffer::MessageBuffer;
use crate::message::cursor::{MessageReader, MessageWriter};
use crate::pool::cache::ObjectCache;
use crate::pool::object::Recycle;
use crate::shared::{ErrorType, NetworkError, NetworkResult};

/// Application-visible message kind. User tags should stay below the
/// reserved high range.
pub type Tag = u16;

pub const COMMAND_FLAG: u16 = 0x8000;
pub const PING_FLAG: u16 = 0x4000;
pub const PING_ACK_FLAG: u16 = 0x2000;

const TAG_MASK: u16 = 0x7fff;
const FLAG_MASK: u16 = COMMAND_FLAG | PING_FLAG | PING_ACK_FLAG;

pub const HEADER_SIZE: usize = 2;
pub const PING_CODE_SIZE: usize = 2;

/// Command tags exchanged during a session.
pub mod command {
    /// Delivers the server-assigned client id as a `u16` payload.
    pub const CONFIGURE: super::Tag = 0;
}

static NEXT_PING_CODE: AtomicU16 = AtomicU16::new(1);

/// A recycled message: tag and flag view plus a payload window into a pooled
/// buffer. A message owns one reference to its buffer and releases it when
/// dropped.
#[derive(Debug)]
pub struct Message {
    header: u16,
    ping_code: Option<u16>,
    body: Option<MessageBuffer>,
    inert: bool,
}

impl Message {
    /// A fresh message with the given tag and no payload.
    pub fn create(tag: Tag) -> Message {
        assert!(
            tag & FLAG_MASK == 0,
            "Tag {:#06x} collides with the reserved flag bits",
            tag
        );

        let mut message = ObjectCache::acquire_message();
        message.header = tag;

        message
    }

    /// A message carrying a copy of `payload`.
    pub fn with_payload(tag: Tag, payload: &[u8]) -> Message {
        let mut message = Message::create(tag);
        message.body = Some(MessageBuffer::from_slice(payload));

        message
    }

    /// A message taking its payload from a writer.
    pub fn from_writer(tag: Tag, writer: MessageWriter) -> Message {
        let mut message = Message::create(tag);
        message.body = Some(writer.detach());

        message
    }

    /// Parses a received buffer, taking shared ownership of it. The payload
    /// view aliases the buffer rather than copying it.
    pub fn from_buffer(buffer: MessageBuffer) -> NetworkResult<Message> {
        let total = buffer.len();
        if total < HEADER_SIZE {
            return Err(NetworkError::Fatal(ErrorType::MalformedMessage));
        }

        let header = BigEndian::read_u16(buffer.as_slice());
        let mut consumed = HEADER_SIZE;

        let ping_code = if header & (PING_FLAG | PING_ACK_FLAG) != 0 {
            if total < consumed + PING_CODE_SIZE {
                return Err(NetworkError::Fatal(ErrorType::MalformedMessage));
            }
            let code = BigEndian::read_u16(&buffer.as_slice()[consumed..]);
            consumed += PING_CODE_SIZE;
            Some(code)
        } else {
            None
        };

        let mut message = ObjectCache::acquire_message();
        message.header = header;
        message.ping_code = ping_code;
        message.body = Some(buffer.slice(consumed, total - consumed));

        Ok(message)
    }

    #[inline]
    pub fn tag(&self) -> Tag {
        self.header & TAG_MASK
    }

    #[inline]
    pub fn is_command(&self) -> bool {
        self.header & COMMAND_FLAG != 0
    }

    #[inline]
    pub fn is_ping(&self) -> bool {
        self.header & PING_FLAG != 0
    }

    #[inline]
    pub fn is_ping_ack(&self) -> bool {
        self.header & PING_ACK_FLAG != 0
    }

    #[inline]
    pub fn ping_code(&self) -> Option<u16> {
        self.ping_code
    }

    /// Turns this message into a ping request carrying the next correlation
    /// code.
    pub fn make_ping(&mut self) {
        self.header |= PING_FLAG;
        self.ping_code = Some(NEXT_PING_CODE.fetch_add(1, Ordering::Relaxed));
    }

    /// Turns this message into an acknowledgement of the given ping code.
    pub fn make_ping_ack(&mut self, code: u16) {
        self.header |= PING_ACK_FLAG;
        self.ping_code = Some(code);
    }

    #[inline]
    pub fn payload_len(&self) -> usize {
        match self.body {
            Some(ref body) => body.len(),
            None => 0,
        }
    }

    /// A cursor over the payload region. The cursor shares the payload
    /// buffer, so the message can be dropped while the reader lives.
    pub fn reader(&self) -> MessageReader {
        MessageReader::over(self.body.clone())
    }

    /// Materializes the full wire image into a pooled buffer suitable for
    /// the transport.
    pub fn to_buffer(&self) -> MessageBuffer {
        let ping_bytes = if self.header & (PING_FLAG | PING_ACK_FLAG) != 0 {
            PING_CODE_SIZE
        } else {
            0
        };
        let payload_len = self.payload_len();
        let total = HEADER_SIZE + ping_bytes + payload_len;

        let mut buffer = MessageBuffer::with_capacity(total);
        {
            let target = buffer
                .write_slice()
                .expect("Fresh buffer must be uniquely owned");

            BigEndian::write_u16(target, self.header);
            let mut at = HEADER_SIZE;

            if ping_bytes > 0 {
                BigEndian::write_u16(&mut target[at..], self.ping_code.unwrap_or(0));
                at += PING_CODE_SIZE;
            }

            if let Some(ref body) = self.body {
                target[at..at + payload_len].copy_from_slice(body.as_slice());
            }
        }
        buffer.set_count(total);

        buffer
    }

    pub(crate) fn activate(&mut self) {
        self.inert = false;
    }
}

impl Default for Message {
    fn default() -> Message {
        Message {
            header: 0,
            ping_code: None,
            body: None,
            inert: true,
        }
    }
}

impl Recycle for Message {
    fn reset(&mut self) {
        self.header = 0;
        self.ping_code = None;
        self.body = None;
    }
}

impl Drop for Message {
    fn drop(&mut self) {
        if self.inert {
            return;
        }

        // Release the payload buffer before the shell goes back to the cache.
        drop(self.body.take());
        self.inert = true;
        ObjectCache::release_message(Message::default());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_layout_plain() {
        let message = Message::with_payload(0x0105, b"xyz");
        let buffer = message.to_buffer();

        assert_eq!(buffer.as_slice(), &[0x01, 0x05, b'x', b'y', b'z']);
    }

    #[test]
    fn test_wire_layout_ping() {
        let mut message = Message::create(0);
        message.make_ping();
        let code = message.ping_code().unwrap();
        let buffer = message.to_buffer();

        assert_eq!(buffer.len(), 4);
        assert_eq!(BigEndian::read_u16(buffer.as_slice()), PING_FLAG);
        assert_eq!(BigEndian::read_u16(&buffer.as_slice()[2..]), code);
    }

    #[test]
    fn test_wire_layout_ping_ack() {
        let mut message = Message::create(0);
        message.make_ping_ack(0x0a55);
        let buffer = message.to_buffer();

        assert_eq!(buffer.as_slice(), &[0x20, 0x00, 0x0a, 0x55]);
    }

    #[test]
    fn test_from_writer_payload() {
        let mut writer = MessageWriter::acquire();
        writer.write_u16(0xbeef);
        writer.write_u8(3);

        let message = Message::from_writer(12, writer);
        assert_eq!(message.payload_len(), 3);
        assert_eq!(
            message.to_buffer().as_slice(),
            &[0x00, 0x0c, 0xbe, 0xef, 0x03]
        );
    }

    #[test]
    fn test_parse_command() {
        let buffer = MessageBuffer::from_slice(&[0x80, 0x00, 0x00, 0x07]);
        let message = Message::from_buffer(buffer).unwrap();

        assert!(message.is_command());
        assert!(!message.is_ping());
        assert_eq!(message.tag(), command::CONFIGURE);

        let mut reader = message.reader();
        assert_eq!(reader.read_u16().unwrap(), 7);
    }

    #[test]
    fn test_parse_shares_buffer() {
        let buffer = MessageBuffer::from_slice(&[0x00, 0x09, 1, 2, 3]);
        let message = Message::from_buffer(buffer.clone()).unwrap();

        assert_eq!(message.tag(), 9);
        assert_eq!(message.payload_len(), 3);
        // The original handle plus the message's own payload view.
        assert_eq!(buffer.handles(), 2);
    }

    #[test]
    fn test_roundtrip_through_wire_image() {
        let mut message = Message::create(42);
        message.make_ping_ack(77);
        let parsed = Message::from_buffer(message.to_buffer()).unwrap();

        assert!(parsed.is_ping_ack());
        assert!(!parsed.is_command());
        assert_eq!(parsed.ping_code(), Some(77));
        assert_eq!(parsed.tag() & !PING_ACK_FLAG, 42);
    }

    #[test]
    fn test_truncated_header_is_malformed() {
        let buffer = MessageBuffer::from_slice(&[0x00]);

        assert_eq!(
            Message::from_buffer(buffer).unwrap_err(),
            NetworkError::Fatal(ErrorType::MalformedMessage)
        );
    }

    #[test]
    fn test_truncated_ping_code_is_malformed() {
        let buffer = MessageBuffer::from_slice(&[0x40, 0x00, 0x01]);

        assert_eq!(
            Message::from_buffer(buffer).unwrap_err(),
            NetworkError::Fatal(ErrorType::MalformedMessage)
        );
    }

    #[test]
    #[should_panic(expected = "collides with the reserved flag bits")]
    fn test_reserved_tag_fails() {
        let _ = Message::create(COMMAND_FLAG | 5);
    }

    #[test]
    fn test_reader_outlives_message() {
        let message = Message::with_payload(3, b"keep");
        let mut reader = message.reader();
        drop(message);

        assert_eq!(reader.read_bytes(4).unwrap(), b"keep");
    }
}
