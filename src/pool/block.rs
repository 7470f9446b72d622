//! Pool blocks and upload pinning.

use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use super::PoolShared;

struct BlockInner {
    data: Box<[u8]>,
    pool: Weak<PoolShared>,
}

impl Drop for BlockInner {
    fn drop(&mut self) {
        let data = std::mem::take(&mut self.data);
        if let Some(pool) = self.pool.upgrade() {
            pool.recycle(data);
        }
    }
}

/// Shared handle to a pool-managed buffer.
///
/// Cloning is cheap. The buffer goes back to its pool's free list when the
/// last handle is dropped; if the pool is gone by then it is simply freed.
#[derive(Clone)]
pub struct BlockRef(Arc<BlockInner>);

impl BlockRef {
    pub(crate) fn new(data: Box<[u8]>, pool: Weak<PoolShared>) -> Self {
        Self(Arc::new(BlockInner { data, pool }))
    }

    /// A block owned by no pool. Freed normally on drop.
    pub fn detached(size: usize) -> Self {
        Self::new(vec![0u8; size].into_boxed_slice(), Weak::new())
    }

    /// Capacity in bytes (a multiple of the pool granularity for pooled blocks).
    #[inline]
    pub fn size(&self) -> usize {
        self.0.data.len()
    }

    /// Mutable access while this is the only handle.
    pub fn get_mut(&mut self) -> Option<&mut [u8]> {
        Arc::get_mut(&mut self.0).map(|inner| &mut inner.data[..])
    }

    #[inline]
    pub fn is_unique(&self) -> bool {
        Arc::strong_count(&self.0) == 1
    }

    #[inline]
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    #[inline]
    pub fn ptr_eq(&self, other: &BlockRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Deref for BlockRef {
    type Target = [u8];

    #[inline]
    fn deref(&self) -> &[u8] {
        &self.0.data
    }
}

impl fmt::Debug for BlockRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockRef")
            .field("size", &self.size())
            .field("refs", &self.ref_count())
            .finish()
    }
}

// ============================================================================
// Upload tracking
// ============================================================================

/// Counts consumers (typically GPU upload threads) still reading a
/// segment or frame. The cache never evicts while the count is non-zero.
#[derive(Debug, Clone, Default)]
pub struct UploadCounter(Arc<AtomicUsize>);

impl UploadCounter {
    #[inline]
    pub fn count(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }

    /// Pin `block` and count one active upload until the guard drops.
    pub fn acquire(&self, block: BlockRef, len: usize) -> UploadGuard {
        self.0.fetch_add(1, Ordering::AcqRel);
        UploadGuard {
            counter: self.clone(),
            block,
            len,
        }
    }
}

/// Keeps a block alive for an asynchronous consumer.
///
/// Dereferences to the first `len` bytes of the block.
pub struct UploadGuard {
    counter: UploadCounter,
    block: BlockRef,
    len: usize,
}

impl UploadGuard {
    pub fn block(&self) -> &BlockRef {
        &self.block
    }
}

impl Deref for UploadGuard {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.block[..self.len.min(self.block.size())]
    }
}

impl Drop for UploadGuard {
    fn drop(&mut self) {
        self.counter.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl fmt::Debug for UploadGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadGuard").field("len", &self.len).finish()
    }
}
