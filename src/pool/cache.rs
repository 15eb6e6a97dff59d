use std::cell::RefCell;
use std::sync::Mutex;

use lazy_static::lazy_static;

use crate::message::buffer::RecyclingArray;
use crate::message::cursor::{MessageReader, MessageWriter};
use crate::message::Message;
use crate::net::client::{DispatchTask, MessageReceivedEvent};
use crate::net::connection::ReceiveOp;
use crate::pool::memory::CLASS_COUNT;
use crate::pool::object::ObjectPool;

/// Object-cache settings: per-kind pool caps and the memory pool size
/// classes. One record configures the whole process; when multiple clients
/// coexist they share it.
#[derive(Debug, Copy, Clone)]
pub struct CacheSettings {
    pub max_writers: usize,
    pub max_readers: usize,
    pub max_messages: usize,
    /// Cap on pooled message-buffer wrappers. Buffer windows are plain
    /// values here and their backing storage is bounded by the block caps,
    /// so this knob is accepted for configuration compatibility.
    pub max_message_buffers: usize,
    /// Cap on pooled per-read operation records.
    pub max_receive_ops: usize,
    /// Cap on pooled deferred-task records.
    pub max_dispatcher_tasks: usize,
    /// Cap on pooled deferred-release array wrappers.
    pub max_recycling_arrays: usize,
    pub extra_small_block_size: usize,
    pub small_block_size: usize,
    pub medium_block_size: usize,
    pub large_block_size: usize,
    pub extra_large_block_size: usize,
    pub max_extra_small_blocks: usize,
    pub max_small_blocks: usize,
    pub max_medium_blocks: usize,
    pub max_large_blocks: usize,
    pub max_extra_large_blocks: usize,
    pub max_message_received_events: usize,
}

impl Default for CacheSettings {
    fn default() -> CacheSettings {
        CacheSettings {
            max_writers: 2,
            max_readers: 2,
            max_messages: 4,
            max_message_buffers: 4,
            max_receive_ops: 32,
            max_dispatcher_tasks: 16,
            max_recycling_arrays: 4,
            extra_small_block_size: 16,
            small_block_size: 64,
            medium_block_size: 256,
            large_block_size: 1024,
            extra_large_block_size: 4096,
            max_extra_small_blocks: 2,
            max_small_blocks: 2,
            max_medium_blocks: 2,
            max_large_blocks: 2,
            max_extra_large_blocks: 2,
            max_message_received_events: 4,
        }
    }
}

impl CacheSettings {
    pub fn block_sizes(&self) -> [usize; CLASS_COUNT] {
        [
            self.extra_small_block_size,
            self.small_block_size,
            self.medium_block_size,
            self.large_block_size,
            self.extra_large_block_size,
        ]
    }

    pub fn block_caps(&self) -> [usize; CLASS_COUNT] {
        [
            self.max_extra_small_blocks,
            self.max_small_blocks,
            self.max_medium_blocks,
            self.max_large_blocks,
            self.max_extra_large_blocks,
        ]
    }
}

lazy_static! {
    static ref SETTINGS: Mutex<Option<CacheSettings>> = Mutex::new(None);
}

thread_local! {
    static CACHE: RefCell<Option<ObjectCache>> = RefCell::new(None);
}

/// The process-wide settings. Installs the defaults on first access if
/// `ObjectCache::initialize` was never called.
pub fn settings() -> CacheSettings {
    let mut slot = SETTINGS.lock().expect("Cache settings lock poisoned");
    *slot.get_or_insert_with(CacheSettings::default)
}

/// Per-thread cache of recyclable objects. Every acquire and release goes
/// through the calling thread's instance, which is built lazily from the
/// process-wide settings.
pub struct ObjectCache {
    messages: ObjectPool<Message>,
    readers: ObjectPool<MessageReader>,
    writers: ObjectPool<MessageWriter>,
    receive_ops: ObjectPool<ReceiveOp>,
    events: ObjectPool<MessageReceivedEvent>,
    arrays: ObjectPool<RecyclingArray>,
    tasks: ObjectPool<DispatchTask>,
}

impl ObjectCache {
    /// Installs the process-wide settings. The first call wins; later calls
    /// are ignored and report `false`.
    pub fn initialize(settings: CacheSettings) -> bool {
        let mut slot = SETTINGS.lock().expect("Cache settings lock poisoned");
        match *slot {
            Some(_) => false,
            None => {
                *slot = Some(settings);
                true
            }
        }
    }

    pub fn acquire_message() -> Message {
        let mut message = Self::with(|cache| cache.messages.acquire()).unwrap_or_default();
        message.activate();
        message
    }

    pub(crate) fn release_message(shell: Message) {
        drop(Self::with(|cache| cache.messages.release(shell)));
    }

    pub fn acquire_reader() -> MessageReader {
        let mut reader = Self::with(|cache| cache.readers.acquire()).unwrap_or_default();
        reader.activate();
        reader
    }

    pub(crate) fn release_reader(shell: MessageReader) {
        drop(Self::with(|cache| cache.readers.release(shell)));
    }

    pub fn acquire_writer() -> MessageWriter {
        let mut writer = Self::with(|cache| cache.writers.acquire()).unwrap_or_default();
        writer.activate();
        writer
    }

    pub(crate) fn release_writer(shell: MessageWriter) {
        drop(Self::with(|cache| cache.writers.release(shell)));
    }

    pub(crate) fn acquire_receive_op() -> ReceiveOp {
        let mut op = Self::with(|cache| cache.receive_ops.acquire()).unwrap_or_default();
        op.activate();
        op
    }

    pub(crate) fn release_receive_op(shell: ReceiveOp) {
        drop(Self::with(|cache| cache.receive_ops.release(shell)));
    }

    pub(crate) fn acquire_event() -> MessageReceivedEvent {
        let mut event = Self::with(|cache| cache.events.acquire()).unwrap_or_default();
        event.activate();
        event
    }

    pub(crate) fn release_event(shell: MessageReceivedEvent) {
        drop(Self::with(|cache| cache.events.release(shell)));
    }

    pub fn acquire_array() -> RecyclingArray {
        let mut array = Self::with(|cache| cache.arrays.acquire()).unwrap_or_default();
        array.activate();
        array
    }

    pub(crate) fn release_array(shell: RecyclingArray) {
        drop(Self::with(|cache| cache.arrays.release(shell)));
    }

    pub(crate) fn acquire_task() -> DispatchTask {
        let mut task = Self::with(|cache| cache.tasks.acquire()).unwrap_or_default();
        task.activate();
        task
    }

    pub(crate) fn release_task(shell: DispatchTask) {
        drop(Self::with(|cache| cache.tasks.release(shell)));
    }

    fn from_settings(settings: &CacheSettings) -> ObjectCache {
        ObjectCache {
            messages: ObjectPool::new(settings.max_messages),
            readers: ObjectPool::new(settings.max_readers),
            writers: ObjectPool::new(settings.max_writers),
            receive_ops: ObjectPool::new(settings.max_receive_ops),
            events: ObjectPool::new(settings.max_message_received_events),
            arrays: ObjectPool::new(settings.max_recycling_arrays),
            tasks: ObjectPool::new(settings.max_dispatcher_tasks),
        }
    }

    /// Runs `f` against the calling thread's cache. `None` when thread-local
    /// storage is already being torn down, in which case callers fall back
    /// to plain construction or destruction.
    fn with<R, F: FnOnce(&mut ObjectCache) -> R>(f: F) -> Option<R> {
        CACHE
            .try_with(|cell| {
                let mut slot = cell.borrow_mut();
                let cache = slot.get_or_insert_with(|| ObjectCache::from_settings(&settings()));
                f(cache)
            })
            .ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = CacheSettings::default();

        assert_eq!(settings.block_sizes(), [16, 64, 256, 1024, 4096]);
        assert_eq!(settings.block_caps(), [2, 2, 2, 2, 2]);
        assert_eq!(settings.max_messages, 4);
        assert_eq!(settings.max_receive_ops, 32);
    }

    #[test]
    fn test_initialize_first_wins() {
        // Another test may have touched the settings already; either way the
        // second explicit initialization must be rejected.
        ObjectCache::initialize(CacheSettings::default());
        assert!(!ObjectCache::initialize(CacheSettings::default()));
    }

    #[test]
    fn test_message_shells_recycle() {
        // Drain whatever the thread accumulated so far.
        while ObjectCache::with(|cache| cache.messages.pooled()).unwrap_or(0) > 0 {
            drop(ObjectCache::with(|cache| cache.messages.acquire()));
        }

        drop(ObjectCache::acquire_message());
        let pooled = ObjectCache::with(|cache| cache.messages.pooled()).unwrap_or(0);
        assert_eq!(pooled, 1);
    }

    #[test]
    fn test_event_pool_respects_cap() {
        let cap = settings().max_message_received_events;
        let events: Vec<_> = (0..cap + 2).map(|_| ObjectCache::acquire_event()).collect();
        drop(events);

        let pooled = ObjectCache::with(|cache| cache.events.pooled()).unwrap_or(0);
        assert_eq!(pooled, cap);
    }
}
