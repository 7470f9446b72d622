//! In-memory storage.

use std::sync::Arc;

use super::{check_range, Storage};
use crate::util::Result;

/// Storage over a shared byte buffer.
#[derive(Debug, Clone)]
pub struct MemoryStorage {
    data: Arc<[u8]>,
}

impl MemoryStorage {
    pub fn new(data: impl Into<Arc<[u8]>>) -> Self {
        Self { data: data.into() }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }
}

impl Storage for MemoryStorage {
    fn len(&self) -> u64 {
        self.data.len() as u64
    }

    fn read_sync(&self, offset: u64, out: &mut [u8]) -> Result<()> {
        check_range(offset, out.len(), self.len())?;
        let start = offset as usize;
        out.copy_from_slice(&self.data[start..start + out.len()]);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::MemoryPool;
    use crate::storage::IoStatus;

    #[test]
    fn test_read_sync_bounds() {
        let storage = MemoryStorage::new((0u8..32).collect::<Vec<_>>());
        let mut out = [0u8; 4];
        storage.read_sync(8, &mut out).unwrap();
        assert_eq!(out, [8, 9, 10, 11]);
        assert!(storage.read_sync(30, &mut out).is_err());
    }

    #[test]
    fn test_read_async_fills_block() {
        let storage = Arc::new(MemoryStorage::new((0u8..=255).collect::<Vec<_>>()));
        let pool = MemoryPool::new();
        let handle = storage.read_async(100, 16, pool.allocate(16), None);
        while handle.poll() == IoStatus::Waiting {
            std::thread::yield_now();
        }
        assert_eq!(handle.poll(), IoStatus::Completed);
        let block = handle.take_block().unwrap();
        assert_eq!(&block[..4], &[100, 101, 102, 103]);
    }

    #[test]
    fn test_read_async_shared_block_fails() {
        let storage = Arc::new(MemoryStorage::new(vec![0u8; 64]));
        let block = crate::pool::BlockRef::detached(16);
        let _other = block.clone();
        let handle = storage.read_async(0, 16, block, None);
        while handle.poll() == IoStatus::Waiting {
            std::thread::yield_now();
        }
        assert_eq!(handle.poll(), IoStatus::Error);
        assert!(handle.error().unwrap().contains("shared"));
    }
}
