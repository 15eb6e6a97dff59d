use std::cell::RefCell;
use std::mem;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::pool::cache;

/// Number of fixed size classes, extra-small through extra-large.
pub const CLASS_COUNT: usize = 5;

static ACQUIRED: AtomicUsize = AtomicUsize::new(0);
static RELEASED: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static LOCAL: RefCell<Option<MemoryPool>> = RefCell::new(None);
}

/// A recycled byte region drawn from one of the size classes. The block
/// remembers the class it came from and returns there when dropped; blocks
/// larger than the biggest class are unpooled and simply freed.
#[derive(Debug)]
pub struct Block {
    data: Box<[u8]>,
    class: Option<usize>,
}

impl Block {
    /// Total size of the backing region.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Index of the size class this block was drawn from, if pooled.
    #[inline]
    pub fn class(&self) -> Option<usize> {
        self.class
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        let data = mem::take(&mut self.data);
        recycle(data, self.class);
    }
}

/// Recycles raw byte regions in five fixed size classes. Instances are not
/// synchronized; thread safety comes from each thread owning its own pool.
pub struct MemoryPool {
    classes: Vec<ClassPool>,
}

struct ClassPool {
    size: usize,
    max: usize,
    free: Vec<Box<[u8]>>,
}

impl MemoryPool {
    pub fn new(sizes: [usize; CLASS_COUNT], caps: [usize; CLASS_COUNT]) -> MemoryPool {
        for window in sizes.windows(2) {
            if window[0] >= window[1] {
                panic!("Size classes must be strictly ascending, got {:?}", sizes);
            }
        }

        let classes = sizes
            .iter()
            .zip(caps.iter())
            .map(|(&size, &max)| ClassPool {
                size,
                max,
                free: Vec::new(),
            })
            .collect();

        MemoryPool { classes }
    }

    /// Returns a region of the smallest class that fits `min_size`, creating
    /// a fresh one if that class is empty. Requests beyond the largest class
    /// yield an unpooled region of exactly `min_size`.
    pub fn acquire(&mut self, min_size: usize) -> (Box<[u8]>, Option<usize>) {
        for (index, class) in self.classes.iter_mut().enumerate() {
            if class.size >= min_size {
                let data = class
                    .free
                    .pop()
                    .unwrap_or_else(|| vec![0u8; class.size].into_boxed_slice());
                return (data, Some(index));
            }
        }

        (vec![0u8; min_size].into_boxed_slice(), None)
    }

    /// Returns a region to the class it was drawn from. Regions released
    /// into a full class, and unpooled regions, are dropped.
    pub fn release(&mut self, data: Box<[u8]>, class: Option<usize>) {
        if let Some(index) = class {
            let class = &mut self.classes[index];
            debug_assert_eq!(data.len(), class.size);

            if class.free.len() < class.max {
                class.free.push(data);
            }
        }
    }

    /// Number of regions currently resting in the given class.
    #[inline]
    pub fn depth(&self, class: usize) -> usize {
        self.classes[class].free.len()
    }

    #[inline]
    pub fn class_size(&self, class: usize) -> usize {
        self.classes[class].size
    }
}

/// Draws a block from the calling thread's pool.
pub fn acquire(min_size: usize) -> Block {
    let (data, class) = with_local(|pool| pool.acquire(min_size));
    ACQUIRED.fetch_add(1, Ordering::Relaxed);

    Block { data, class }
}

/// Count of blocks acquired and not yet released, across all threads.
pub fn live_blocks() -> usize {
    ACQUIRED
        .load(Ordering::Relaxed)
        .saturating_sub(RELEASED.load(Ordering::Relaxed))
}

/// Depth of the given class in the calling thread's pool.
pub fn local_depth(class: usize) -> usize {
    with_local(|pool| pool.depth(class))
}

fn recycle(data: Box<[u8]>, class: Option<usize>) {
    let released = RELEASED.fetch_add(1, Ordering::Relaxed) + 1;
    debug_assert!(
        released <= ACQUIRED.load(Ordering::Relaxed),
        "Block released more often than acquired"
    );

    // A block dropped on a foreign thread lands in that thread's pool of the
    // same class. During thread teardown the pool is gone and the region is
    // simply freed.
    drop(LOCAL.try_with(|cell| {
        let mut slot = cell.borrow_mut();
        let pool = slot.get_or_insert_with(default_pool);
        pool.release(data, class);
    }));
}

fn with_local<R, F: FnOnce(&mut MemoryPool) -> R>(f: F) -> R {
    LOCAL.with(|cell| {
        let mut slot = cell.borrow_mut();
        let pool = slot.get_or_insert_with(default_pool);
        f(pool)
    })
}

fn default_pool() -> MemoryPool {
    let settings = cache::settings();
    MemoryPool::new(settings.block_sizes(), settings.block_caps())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIZES: [usize; CLASS_COUNT] = [16, 64, 256, 1024, 4096];
    const CAPS: [usize; CLASS_COUNT] = [2, 2, 2, 2, 2];

    #[test]
    fn test_acquire_selects_smallest_fitting_class() {
        let mut pool = MemoryPool::new(SIZES, CAPS);

        let (data, class) = pool.acquire(1);
        assert_eq!(data.len(), 16);
        assert_eq!(class, Some(0));

        let (data, class) = pool.acquire(17);
        assert_eq!(data.len(), 64);
        assert_eq!(class, Some(1));

        let (data, class) = pool.acquire(4096);
        assert_eq!(data.len(), 4096);
        assert_eq!(class, Some(4));
    }

    #[test]
    fn test_acquire_exact_boundary() {
        let mut pool = MemoryPool::new(SIZES, CAPS);

        let (data, class) = pool.acquire(64);
        assert_eq!(data.len(), 64);
        assert_eq!(class, Some(1));
    }

    #[test]
    fn test_oversized_acquire_is_unpooled() {
        let mut pool = MemoryPool::new(SIZES, CAPS);

        let (data, class) = pool.acquire(4097);
        assert_eq!(data.len(), 4097);
        assert_eq!(class, None);

        pool.release(data, class);
        for index in 0..CLASS_COUNT {
            assert_eq!(pool.depth(index), 0);
        }
    }

    #[test]
    fn test_release_returns_to_origin_class() {
        let mut pool = MemoryPool::new(SIZES, CAPS);

        // A 64 byte region satisfies the extra-small class size as well, but
        // it must land back in the class it was drawn from.
        let (data, class) = pool.acquire(64);
        pool.release(data, class);

        assert_eq!(pool.depth(0), 0);
        assert_eq!(pool.depth(1), 1);
    }

    #[test]
    fn test_release_respects_cap() {
        let mut pool = MemoryPool::new(SIZES, CAPS);

        let blocks: Vec<_> = (0..4).map(|_| pool.acquire(16)).collect();
        for (data, class) in blocks {
            pool.release(data, class);
        }

        assert_eq!(pool.depth(0), CAPS[0]);
    }

    #[test]
    fn test_acquire_reuses_released_region() {
        let mut pool = MemoryPool::new(SIZES, CAPS);

        let (mut data, class) = pool.acquire(16);
        data[0] = 123;
        pool.release(data, class);

        let (data, _) = pool.acquire(16);
        assert_eq!(data[0], 123);
        assert_eq!(pool.depth(0), 0);
    }

    #[test]
    #[should_panic(expected = "Size classes must be strictly ascending")]
    fn test_fail_on_unordered_classes() {
        let _ = MemoryPool::new([16, 16, 256, 1024, 4096], CAPS);
    }

    #[test]
    fn test_block_drop_recycles_into_local_pool() {
        with_local(|pool| pool.classes[2].free.clear());

        {
            let block = acquire(100);
            assert_eq!(block.len(), 256);
            assert_eq!(block.class(), Some(2));
        }

        assert_eq!(local_depth(2), 1);
    }
}
