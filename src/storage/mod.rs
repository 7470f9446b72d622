//! Storage contract the reader streams from.
//!
//! The core only needs "read N bytes at offset O" against one package.
//! [`Storage::read_sync`] is used for the meta section and blocking
//! requests; [`Storage::read_async`] returns an [`IoHandle`] that the reader
//! polls from its update cycle. Readers created by the runtime run those
//! reads on its worker pool.

mod file;
mod memory;

pub use file::FileStorage;
pub use memory::MemoryStorage;

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rayon::ThreadPool;

use crate::format::{ContainerId, ContainerSpan, Package, PackageLayout};
use crate::pool::BlockRef;
use crate::util::{Error, Result};

/// Random-access byte source.
pub trait Storage: Send + Sync + 'static {
    /// Total size in bytes.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fill `out` with the bytes at `offset`.
    fn read_sync(&self, offset: u64, out: &mut [u8]) -> Result<()>;

    /// Read `len` bytes at `offset` into the start of `block`.
    ///
    /// The default runs [`Storage::read_sync`] on `workers`, or on the global
    /// rayon pool when none is given. `block` must be uniquely held so the
    /// read can write into it.
    fn read_async(
        self: Arc<Self>,
        offset: u64,
        len: usize,
        mut block: BlockRef,
        workers: Option<&ThreadPool>,
    ) -> IoHandle {
        let (handle, completer) = IoHandle::pending(offset, len);
        let job = move || {
            let result = match block.get_mut() {
                Some(buf) if buf.len() >= len => self.read_sync(offset, &mut buf[..len]),
                Some(buf) => Err(Error::ReadFailed {
                    offset,
                    len,
                    reason: format!("target block holds only {} bytes", buf.len()),
                }),
                None => Err(Error::ReadFailed {
                    offset,
                    len,
                    reason: "target block is shared".into(),
                }),
            };
            match result {
                Ok(()) => completer.complete(block),
                Err(e) => completer.fail(e.to_string()),
            }
        };
        match workers {
            Some(pool) => pool.spawn(job),
            None => rayon::spawn(job),
        }
        handle
    }
}

/// Check that `[offset, offset + len)` lies inside a storage of `size` bytes.
pub(crate) fn check_range(offset: u64, len: usize, size: u64) -> Result<()> {
    match offset.checked_add(len as u64) {
        Some(end) if end <= size => Ok(()),
        _ => Err(Error::ReadFailed {
            offset,
            len,
            reason: format!("past end of storage ({size} bytes)"),
        }),
    }
}

// ============================================================================
// Async handles
// ============================================================================

/// Poll result of an asynchronous read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoStatus {
    Waiting,
    Completed,
    Error,
}

#[derive(Debug)]
enum Slot {
    Waiting,
    Completed { block: BlockRef, latency: Duration },
    Taken { latency: Duration },
    Failed(String),
}

#[derive(Debug)]
struct IoShared {
    slot: Mutex<Slot>,
    issued: Instant,
}

/// Consumer side of an asynchronous read.
#[derive(Debug)]
pub struct IoHandle {
    offset: u64,
    len: usize,
    shared: Arc<IoShared>,
}

/// Producer side of an asynchronous read.
///
/// Dropping it without completing marks the read as failed.
#[derive(Debug)]
pub struct IoCompleter {
    shared: Option<Arc<IoShared>>,
}

impl IoHandle {
    /// A read that completes when the returned completer is used.
    pub fn pending(offset: u64, len: usize) -> (IoHandle, IoCompleter) {
        let shared = Arc::new(IoShared {
            slot: Mutex::new(Slot::Waiting),
            issued: Instant::now(),
        });
        let completer = IoCompleter {
            shared: Some(Arc::clone(&shared)),
        };
        (IoHandle { offset, len, shared }, completer)
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn poll(&self) -> IoStatus {
        match &*self.shared.slot.lock() {
            Slot::Waiting => IoStatus::Waiting,
            Slot::Completed { .. } | Slot::Taken { .. } => IoStatus::Completed,
            Slot::Failed(_) => IoStatus::Error,
        }
    }

    /// Take the filled block of a completed read (once).
    pub fn take_block(&self) -> Option<BlockRef> {
        let mut slot = self.shared.slot.lock();
        let latency = match &*slot {
            Slot::Completed { latency, .. } => *latency,
            _ => return None,
        };
        match std::mem::replace(&mut *slot, Slot::Taken { latency }) {
            Slot::Completed { block, .. } => Some(block),
            _ => None,
        }
    }

    /// Failure reason of an errored read.
    pub fn error(&self) -> Option<String> {
        match &*self.shared.slot.lock() {
            Slot::Failed(reason) => Some(reason.clone()),
            _ => None,
        }
    }

    /// Time from issue to completion, once completed.
    pub fn latency(&self) -> Option<Duration> {
        match &*self.shared.slot.lock() {
            Slot::Completed { latency, .. } | Slot::Taken { latency } => Some(*latency),
            _ => None,
        }
    }
}

impl IoCompleter {
    pub fn complete(mut self, block: BlockRef) {
        if let Some(shared) = self.shared.take() {
            let latency = shared.issued.elapsed();
            *shared.slot.lock() = Slot::Completed { block, latency };
        }
    }

    pub fn fail(mut self, reason: impl Into<String>) {
        if let Some(shared) = self.shared.take() {
            *shared.slot.lock() = Slot::Failed(reason.into());
        }
    }
}

impl Drop for IoCompleter {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            *shared.slot.lock() = Slot::Failed("read abandoned before completion".into());
        }
    }
}

// ============================================================================
// Asset
// ============================================================================

/// A streamable AVV package: its container table plus the storage holding it.
#[derive(Clone)]
pub struct AvvAsset {
    pub layout: PackageLayout,
    pub storage: Arc<dyn Storage>,
}

impl AvvAsset {
    pub fn new(layout: PackageLayout, storage: Arc<dyn Storage>) -> Self {
        Self { layout, storage }
    }

    /// Serve an in-memory package. Spans index straight into the blob.
    pub fn from_package(package: Package) -> Self {
        Self {
            layout: package.layout,
            storage: Arc::new(MemoryStorage::new(package.blob)),
        }
    }

    /// Open a package file written by [`Package::write_to`].
    pub fn open_file(path: impl AsRef<Path>) -> Result<Self> {
        let storage = Arc::new(FileStorage::open(path)?);
        Self::from_storage(storage)
    }

    /// Read the package header from the front of `storage`.
    pub fn from_storage(storage: Arc<dyn Storage>) -> Result<Self> {
        let layout = PackageLayout::read_from(storage.as_ref())?;
        Ok(Self { layout, storage })
    }

    pub fn span(&self, id: ContainerId) -> Option<ContainerSpan> {
        self.layout.span(id)
    }

    /// Synchronously read a whole container into a fresh vector.
    pub fn read_container(&self, id: ContainerId) -> Result<Vec<u8>> {
        let span = self.span(id).ok_or_else(|| Error::other(format!("no container {id:?}")))?;
        let mut out = vec![0u8; span.len as usize];
        self.storage.read_sync(span.offset, &mut out)?;
        Ok(out)
    }
}

impl std::fmt::Debug for AvvAsset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AvvAsset")
            .field("segments", &self.layout.segment_count())
            .field("frames", &self.layout.frame_count())
            .field("storage_len", &self.storage.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_complete() {
        let (handle, completer) = IoHandle::pending(10, 4);
        assert_eq!(handle.poll(), IoStatus::Waiting);
        assert!(handle.take_block().is_none());
        completer.complete(BlockRef::detached(4));
        assert_eq!(handle.poll(), IoStatus::Completed);
        assert!(handle.latency().is_some());
        assert!(handle.take_block().is_some());
        assert!(handle.take_block().is_none());
        assert_eq!(handle.poll(), IoStatus::Completed);
    }

    #[test]
    fn test_dropped_completer_fails() {
        let (handle, completer) = IoHandle::pending(0, 1);
        drop(completer);
        assert_eq!(handle.poll(), IoStatus::Error);
        assert!(handle.error().unwrap().contains("abandoned"));
    }

    #[test]
    fn test_check_range() {
        assert!(check_range(0, 10, 10).is_ok());
        assert!(check_range(1, 10, 10).is_err());
        assert!(check_range(u64::MAX, 2, 10).is_err());
    }
}
