use std::mem;
use std::sync::Arc;

use crate::pool::cache::ObjectCache;
use crate::pool::memory::{self, Block};
use crate::pool::object::Recycle;

/// A shared window `(offset, count)` over a pooled block. Clones share the
/// backing block; when the last clone is dropped the block returns to its
/// pool. Mutable access requires unique ownership, so a buffer can only be
/// filled before it has been handed out.
#[derive(Debug)]
pub struct MessageBuffer {
    block: Arc<Block>,
    offset: usize,
    count: usize,
}

impl MessageBuffer {
    /// Draws a fresh buffer backed by a block of at least `min_size` bytes.
    /// The window starts empty.
    pub fn with_capacity(min_size: usize) -> MessageBuffer {
        MessageBuffer {
            block: Arc::new(memory::acquire(min_size)),
            offset: 0,
            count: 0,
        }
    }

    /// Draws a buffer and fills it with a copy of `data`.
    pub fn from_slice(data: &[u8]) -> MessageBuffer {
        let mut buffer = MessageBuffer::with_capacity(data.len());
        buffer
            .write_slice()
            .expect("Fresh buffer must be uniquely owned")[..data.len()]
            .copy_from_slice(data);
        buffer.set_count(data.len());

        buffer
    }

    /// Number of bytes in the window.
    #[inline]
    pub fn len(&self) -> usize {
        self.count
    }

    /// Bytes available between the window start and the end of the block.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.block.len() - self.offset
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.block.as_slice()[self.offset..self.offset + self.count]
    }

    /// Writable region from the window start to the end of the block. `None`
    /// while the block is shared with another buffer.
    #[inline]
    pub fn write_slice(&mut self) -> Option<&mut [u8]> {
        let offset = self.offset;
        Arc::get_mut(&mut self.block).map(|block| &mut block.as_mut_slice()[offset..])
    }

    /// Marks `count` bytes of the window as filled.
    #[inline]
    pub fn set_count(&mut self, count: usize) {
        assert!(count <= self.capacity(), "Window exceeds block capacity");
        self.count = count;
    }

    /// A sub-window sharing the same block.
    pub fn slice(&self, from: usize, count: usize) -> MessageBuffer {
        assert!(from + count <= self.count, "Slice exceeds window");

        MessageBuffer {
            block: self.block.clone(),
            offset: self.offset + from,
            count,
        }
    }

    /// Number of live references to the backing block.
    #[inline]
    pub fn handles(&self) -> usize {
        Arc::strong_count(&self.block)
    }
}

impl Clone for MessageBuffer {
    #[inline]
    fn clone(&self) -> MessageBuffer {
        MessageBuffer {
            block: self.block.clone(),
            offset: self.offset,
            count: self.count,
        }
    }
}

/// A recycled growable byte array. Unlike `MessageBuffer` it is exclusively
/// owned and keeps its storage across uses, which makes it the scratch of
/// choice for repeated reads of unknown size.
pub struct RecyclingArray {
    data: Vec<u8>,
    inert: bool,
}

impl RecyclingArray {
    /// Draws an array from the calling thread's cache, sized to at least
    /// `min_size` bytes.
    pub fn acquire(min_size: usize) -> RecyclingArray {
        let mut array = ObjectCache::acquire_array();
        array.ensure_len(min_size);
        array
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Grows the array to at least `min_size` bytes, zero-filling new space.
    pub fn ensure_len(&mut self, min_size: usize) {
        if self.data.len() < min_size {
            self.data.resize(min_size, 0);
        }
    }

    pub(crate) fn activate(&mut self) {
        self.inert = false;
    }
}

impl Default for RecyclingArray {
    fn default() -> RecyclingArray {
        RecyclingArray {
            data: Vec::new(),
            inert: true,
        }
    }
}

impl Recycle for RecyclingArray {
    fn reset(&mut self) {
        self.data.clear();
    }
}

impl Drop for RecyclingArray {
    fn drop(&mut self) {
        if self.inert {
            return;
        }

        let shell = RecyclingArray {
            data: mem::take(&mut self.data),
            inert: true,
        };
        ObjectCache::release_array(shell);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_capacity_starts_empty() {
        let buffer = MessageBuffer::with_capacity(100);

        assert_eq!(buffer.len(), 0);
        assert!(buffer.capacity() >= 100);
        assert_eq!(buffer.as_slice(), &[] as &[u8]);
    }

    #[test]
    fn test_from_slice_roundtrip() {
        let buffer = MessageBuffer::from_slice(&[1, 2, 3, 4]);

        assert_eq!(buffer.len(), 4);
        assert_eq!(buffer.as_slice(), &[1, 2, 3, 4]);
    }

    #[test]
    fn test_clone_shares_block() {
        let buffer = MessageBuffer::from_slice(&[9, 8, 7]);
        let clone = buffer.clone();

        assert_eq!(buffer.handles(), 2);
        assert_eq!(clone.as_slice(), buffer.as_slice());
    }

    #[test]
    fn test_write_slice_requires_unique_ownership() {
        let mut buffer = MessageBuffer::with_capacity(16);
        assert!(buffer.write_slice().is_some());

        let clone = buffer.clone();
        assert!(buffer.write_slice().is_none());

        drop(clone);
        assert!(buffer.write_slice().is_some());
    }

    #[test]
    fn test_slice_windows_into_block() {
        let buffer = MessageBuffer::from_slice(&[10, 20, 30, 40, 50]);
        let window = buffer.slice(2, 2);

        assert_eq!(window.as_slice(), &[30, 40]);
        assert_eq!(window.handles(), 2);
    }

    #[test]
    #[should_panic(expected = "Slice exceeds window")]
    fn test_slice_out_of_bounds_fails() {
        let buffer = MessageBuffer::from_slice(&[1, 2, 3]);
        let _ = buffer.slice(2, 2);
    }

    #[test]
    fn test_recycling_array_keeps_storage() {
        let mut array = RecyclingArray::acquire(64);
        array.as_mut_slice()[0] = 42;
        assert_eq!(array.len(), 64);
        drop(array);

        let array = RecyclingArray::acquire(32);
        assert_eq!(array.len(), 32);
    }
}
