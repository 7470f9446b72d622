//! Block memory pool.
//!
//! Container reads land in fixed-granularity blocks that are recycled
//! through per-size free lists instead of going back to the allocator.
//! Segments and frames of one stream have similar sizes, so after warm-up
//! nearly every allocation is a free-list hit.
//!
//! Two independent locks guard the pool: one for the free lists and one for
//! the usage counters consulted by [`MemoryPool::clean_up`].

mod block;

pub use block::{BlockRef, UploadCounter, UploadGuard};

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

/// Allocation granularity; every block is a multiple of this.
pub const BLOCK_GRANULARITY: usize = 256 * 1024;

/// Utilization below which [`MemoryPool::clean_up`] releases memory.
pub const CLEANUP_UTILIZATION: f64 = 0.5;

/// Round `size` up to the block granularity (at least one granule).
#[inline]
pub const fn round_to_granularity(size: usize) -> usize {
    if size == 0 {
        BLOCK_GRANULARITY
    } else {
        size.div_ceil(BLOCK_GRANULARITY) * BLOCK_GRANULARITY
    }
}

/// Free blocks of one size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolBucket {
    pub block_size: usize,
    pub free_blocks: usize,
}

/// Snapshot of pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    /// Bytes owned by the pool (live + free).
    pub allocated_bytes: usize,
    /// Bytes handed out and not yet returned.
    pub utilized_bytes: usize,
    /// Bytes sitting in free lists.
    pub free_bytes: usize,
    pub hits: u64,
    pub misses: u64,
}

impl PoolStats {
    /// Fraction of allocated bytes currently in use (1.0 for an empty pool).
    pub fn utilization(&self) -> f64 {
        if self.allocated_bytes == 0 {
            1.0
        } else {
            self.utilized_bytes as f64 / self.allocated_bytes as f64
        }
    }
}

pub(crate) struct PoolShared {
    free_lists: Mutex<BTreeMap<usize, Vec<Box<[u8]>>>>,
    /// Allocations per block size since the last clean-up.
    usage: Mutex<HashMap<usize, usize>>,
    total_allocated: AtomicUsize,
    total_utilized: AtomicUsize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl PoolShared {
    fn new() -> Self {
        Self {
            free_lists: Mutex::new(BTreeMap::new()),
            usage: Mutex::new(HashMap::new()),
            total_allocated: AtomicUsize::new(0),
            total_utilized: AtomicUsize::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub(crate) fn recycle(&self, data: Box<[u8]>) {
        if data.is_empty() {
            return;
        }
        self.total_utilized.fetch_sub(data.len(), Ordering::AcqRel);
        self.free_lists.lock().entry(data.len()).or_default().push(data);
    }

    fn release(&self, blocks: Vec<Box<[u8]>>) -> usize {
        let bytes: usize = blocks.iter().map(|b| b.len()).sum();
        self.total_allocated.fetch_sub(bytes, Ordering::AcqRel);
        drop(blocks);
        bytes
    }
}

/// Thread-safe block pool. Clones share the same pool.
#[derive(Clone)]
pub struct MemoryPool {
    shared: Arc<PoolShared>,
}

impl Default for MemoryPool {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryPool {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(PoolShared::new()),
        }
    }

    /// Allocate a block of at least `size` bytes.
    pub fn allocate(&self, size: usize) -> BlockRef {
        let size = round_to_granularity(size);
        *self.shared.usage.lock().entry(size).or_default() += 1;

        let reused = self
            .shared
            .free_lists
            .lock()
            .get_mut(&size)
            .and_then(Vec::pop);

        let data = match reused {
            Some(data) => {
                self.shared.hits.fetch_add(1, Ordering::Relaxed);
                data
            }
            None => {
                self.shared.misses.fetch_add(1, Ordering::Relaxed);
                self.shared.total_allocated.fetch_add(size, Ordering::AcqRel);
                vec![0u8; size].into_boxed_slice()
            }
        };

        self.shared.total_utilized.fetch_add(size, Ordering::AcqRel);
        BlockRef::new(data, Arc::downgrade(&self.shared))
    }

    /// Release a handle explicitly.
    ///
    /// Returns `true` when this was the last handle and the buffer went back
    /// to the free list; otherwise it returns when the remaining holders drop.
    pub fn deallocate(&self, block: BlockRef) -> bool {
        let last = block.is_unique();
        drop(block);
        last
    }

    /// Put `count` fresh blocks of `size` bytes on the free list.
    pub fn preallocate(&self, size: usize, count: usize) {
        if count == 0 {
            return;
        }
        let size = round_to_granularity(size);
        let blocks: Vec<Box<[u8]>> = (0..count)
            .map(|_| vec![0u8; size].into_boxed_slice())
            .collect();
        self.shared
            .total_allocated
            .fetch_add(size * count, Ordering::AcqRel);
        self.shared.free_lists.lock().entry(size).or_default().extend(blocks);
        debug!(size, count, "preallocated pool blocks");
    }

    /// Free surplus blocks when utilization is low.
    ///
    /// Usage counters are copied and reset first. Below
    /// [`CLEANUP_UTILIZATION`], the bucket whose free count most exceeds its
    /// recent usage has that surplus freed. Returns the bytes released.
    pub fn clean_up(&self) -> usize {
        let usage = std::mem::take(&mut *self.shared.usage.lock());

        let stats = self.stats();
        if stats.allocated_bytes == 0 || stats.utilization() >= CLEANUP_UTILIZATION {
            return 0;
        }

        let mut target: Option<(usize, usize)> = None;
        for bucket in self.peek_pool_contents() {
            let used = usage.get(&bucket.block_size).copied().unwrap_or(0);
            let surplus = bucket.free_blocks.saturating_sub(used);
            if surplus > target.map_or(0, |(_, s)| s) {
                target = Some((bucket.block_size, surplus));
            }
        }
        let Some((block_size, surplus)) = target else {
            return 0;
        };

        let released: Vec<Box<[u8]>> = {
            let mut lists = self.shared.free_lists.lock();
            match lists.get_mut(&block_size) {
                Some(list) => {
                    let keep = list.len().saturating_sub(surplus);
                    list.split_off(keep)
                }
                None => Vec::new(),
            }
        };
        let bytes = self.shared.release(released);
        debug!(
            block_size,
            surplus,
            bytes,
            utilization = stats.utilization(),
            "pool clean-up"
        );
        bytes
    }

    /// Free block counts per size.
    pub fn peek_pool_contents(&self) -> Vec<PoolBucket> {
        self.shared
            .free_lists
            .lock()
            .iter()
            .filter(|(_, list)| !list.is_empty())
            .map(|(&block_size, list)| PoolBucket {
                block_size,
                free_blocks: list.len(),
            })
            .collect()
    }

    /// Drop every free block. Live blocks are unaffected.
    pub fn empty(&self) -> usize {
        let lists = std::mem::take(&mut *self.shared.free_lists.lock());
        self.shared.release(lists.into_values().flatten().collect())
    }

    pub fn stats(&self) -> PoolStats {
        let free_bytes = self
            .shared
            .free_lists
            .lock()
            .iter()
            .map(|(size, list)| size * list.len())
            .sum();
        PoolStats {
            allocated_bytes: self.shared.total_allocated.load(Ordering::Acquire),
            utilized_bytes: self.shared.total_utilized.load(Ordering::Acquire),
            free_bytes,
            hits: self.shared.hits.load(Ordering::Relaxed),
            misses: self.shared.misses.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for MemoryPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("MemoryPool")
            .field("allocated", &stats.allocated_bytes)
            .field("utilized", &stats.utilized_bytes)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const G: usize = BLOCK_GRANULARITY;

    fn conserved(pool: &MemoryPool) -> bool {
        let s = pool.stats();
        s.allocated_bytes == s.free_bytes + s.utilized_bytes
    }

    #[test]
    fn test_rounding() {
        assert_eq!(round_to_granularity(0), G);
        assert_eq!(round_to_granularity(1), G);
        assert_eq!(round_to_granularity(G), G);
        assert_eq!(round_to_granularity(G + 1), 2 * G);
    }

    #[test]
    fn test_allocate_recycles() {
        let pool = MemoryPool::new();
        let a = pool.allocate(100);
        assert_eq!(a.size(), G);
        assert_eq!(pool.stats().misses, 1);
        assert!(pool.deallocate(a));
        assert_eq!(pool.peek_pool_contents(), vec![PoolBucket { block_size: G, free_blocks: 1 }]);

        let b = pool.allocate(G - 1);
        let stats = pool.stats();
        assert_eq!((stats.hits, stats.misses), (1, 1));
        assert_eq!(stats.allocated_bytes, G);
        assert!(conserved(&pool));
        drop(b);
        assert!(conserved(&pool));
    }

    #[test]
    fn test_shared_block_returns_on_last_drop() {
        let pool = MemoryPool::new();
        let a = pool.allocate(3 * G);
        let b = a.clone();
        assert!(!pool.deallocate(a));
        assert!(pool.peek_pool_contents().is_empty());
        assert_eq!(pool.stats().utilized_bytes, 3 * G);
        drop(b);
        assert_eq!(pool.stats().utilized_bytes, 0);
        assert_eq!(pool.stats().free_bytes, 3 * G);
    }

    #[test]
    fn test_clean_up_frees_surplus_bucket() {
        let pool = MemoryPool::new();
        pool.preallocate(G, 6);
        pool.preallocate(2 * G, 2);
        let live = pool.allocate(G);
        // Utilization 1/10; usage says one G block was needed recently
        let freed = pool.clean_up();
        assert_eq!(freed, 4 * G);
        let contents = pool.peek_pool_contents();
        assert_eq!(contents[0], PoolBucket { block_size: G, free_blocks: 1 });
        assert_eq!(contents[1], PoolBucket { block_size: 2 * G, free_blocks: 2 });
        assert!(conserved(&pool));
        drop(live);
        assert!(conserved(&pool));
    }

    #[test]
    fn test_clean_up_skips_busy_pool() {
        let pool = MemoryPool::new();
        let held: Vec<_> = (0..3).map(|_| pool.allocate(G)).collect();
        pool.preallocate(G, 1);
        assert_eq!(pool.clean_up(), 0);
        assert_eq!(pool.stats().free_bytes, G);
        drop(held);
    }

    #[test]
    fn test_empty_and_outliving_pool() {
        let pool = MemoryPool::new();
        let live = pool.allocate(1);
        pool.preallocate(1, 3);
        assert_eq!(pool.empty(), 3 * G);
        assert_eq!(pool.stats().allocated_bytes, G);
        drop(pool);
        // Block outlives its pool and is freed normally
        assert_eq!(live.size(), G);
    }

    #[test]
    fn test_concurrent_allocations_conserve() {
        let pool = MemoryPool::new();
        std::thread::scope(|s| {
            for t in 0..4 {
                let pool = pool.clone();
                s.spawn(move || {
                    for i in 0..50 {
                        let block = pool.allocate((t + i % 3) * G);
                        drop(block);
                    }
                });
            }
        });
        let stats = pool.stats();
        assert_eq!(stats.utilized_bytes, 0);
        assert_eq!(stats.allocated_bytes, stats.free_bytes);
        assert_eq!(stats.hits + stats.misses, 200);
    }
}
