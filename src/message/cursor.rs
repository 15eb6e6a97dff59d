use byteorder::{BigEndian, ByteOrder};

use crate::message::buffer::MessageBuffer;
use crate::pool::cache::ObjectCache;
use crate::pool::object::Recycle;
use crate::shared::{ErrorType, NetworkError, NetworkResult};

/// Recycled cursor reading a message payload. All multi-byte values are
/// big-endian. Underflow is a malformed-message error; by the time a reader
/// exists the payload is complete, so there is no wait state.
pub struct MessageReader {
    buffer: Option<MessageBuffer>,
    position: usize,
    inert: bool,
}

impl MessageReader {
    pub(crate) fn over(buffer: Option<MessageBuffer>) -> MessageReader {
        let mut reader = ObjectCache::acquire_reader();
        reader.buffer = buffer;
        reader
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.data().len() - self.position
    }

    pub fn read_u8(&mut self) -> NetworkResult<u8> {
        self.take(1).map(|data| data[0])
    }

    pub fn read_u16(&mut self) -> NetworkResult<u16> {
        self.take(2).map(BigEndian::read_u16)
    }

    pub fn read_u32(&mut self) -> NetworkResult<u32> {
        self.take(4).map(BigEndian::read_u32)
    }

    pub fn read_bytes(&mut self, count: usize) -> NetworkResult<&[u8]> {
        self.take(count)
    }

    #[inline]
    fn data(&self) -> &[u8] {
        match self.buffer {
            Some(ref buffer) => buffer.as_slice(),
            None => &[],
        }
    }

    fn take(&mut self, count: usize) -> NetworkResult<&[u8]> {
        if self.remaining() < count {
            return Err(NetworkError::Fatal(ErrorType::MalformedMessage));
        }

        let start = self.position;
        self.position += count;

        Ok(&self.data()[start..start + count])
    }

    pub(crate) fn activate(&mut self) {
        self.inert = false;
    }
}

impl Default for MessageReader {
    fn default() -> MessageReader {
        MessageReader {
            buffer: None,
            position: 0,
            inert: true,
        }
    }
}

impl Recycle for MessageReader {
    fn reset(&mut self) {
        self.buffer = None;
        self.position = 0;
    }
}

impl Drop for MessageReader {
    fn drop(&mut self) {
        if self.inert {
            return;
        }

        drop(self.buffer.take());
        self.inert = true;
        ObjectCache::release_reader(MessageReader::default());
    }
}

/// Recycled cursor composing a message payload. The backing buffer grows
/// through the size classes as needed, so writes cannot fail.
pub struct MessageWriter {
    buffer: Option<MessageBuffer>,
    position: usize,
    inert: bool,
}

impl MessageWriter {
    pub fn acquire() -> MessageWriter {
        ObjectCache::acquire_writer()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.position
    }

    pub fn write_u8(&mut self, value: u8) {
        self.reserve(1)[0] = value;
    }

    pub fn write_u16(&mut self, value: u16) {
        BigEndian::write_u16(self.reserve(2), value);
    }

    pub fn write_u32(&mut self, value: u32) {
        BigEndian::write_u32(self.reserve(4), value);
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.reserve(bytes.len()).copy_from_slice(bytes);
    }

    /// Surrenders the written payload as a buffer window.
    pub(crate) fn detach(mut self) -> MessageBuffer {
        let mut buffer = self
            .buffer
            .take()
            .unwrap_or_else(|| MessageBuffer::with_capacity(0));
        buffer.set_count(self.position);

        buffer
    }

    fn reserve(&mut self, extra: usize) -> &mut [u8] {
        let required = self.position + extra;

        let grow = match self.buffer {
            Some(ref buffer) => buffer.capacity() < required,
            None => true,
        };

        if grow {
            let mut fresh = MessageBuffer::with_capacity(required);
            if let Some(mut old) = self.buffer.take() {
                old.set_count(self.position);
                fresh
                    .write_slice()
                    .expect("Fresh buffer must be uniquely owned")[..self.position]
                    .copy_from_slice(old.as_slice());
            }
            self.buffer = Some(fresh);
        }

        let start = self.position;
        self.position += extra;

        let buffer = self
            .buffer
            .as_mut()
            .expect("Writer holds a buffer after growth");
        &mut buffer
            .write_slice()
            .expect("Writer buffer is never shared")[start..start + extra]
    }

    pub(crate) fn activate(&mut self) {
        self.inert = false;
    }
}

impl Default for MessageWriter {
    fn default() -> MessageWriter {
        MessageWriter {
            buffer: None,
            position: 0,
            inert: true,
        }
    }
}

impl Recycle for MessageWriter {
    fn reset(&mut self) {
        self.buffer = None;
        self.position = 0;
    }
}

impl Drop for MessageWriter {
    fn drop(&mut self) {
        if self.inert {
            return;
        }

        drop(self.buffer.take());
        self.inert = true;
        ObjectCache::release_writer(MessageWriter::default());
    }
}
