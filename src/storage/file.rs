//! File-backed storage for package files.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

#[cfg(feature = "mmap")]
use memmap2::Mmap;
use parking_lot::Mutex;
use tracing::debug;

use super::{check_range, Storage};
use crate::util::Result;

enum FileInner {
    /// Memory-mapped file (preferred)
    #[cfg(feature = "mmap")]
    Mmap(Mmap),
    /// Seek + read fallback
    File(Mutex<File>),
}

/// Package file opened for streaming.
pub struct FileStorage {
    inner: FileInner,
    size: u64,
}

impl FileStorage {
    /// Open with memory mapping when available.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_opts(path, cfg!(feature = "mmap"))
    }

    /// Open, choosing between memory mapping and plain reads.
    pub fn open_opts(path: impl AsRef<Path>, use_mmap: bool) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let size = file.metadata()?.len();

        #[cfg(feature = "mmap")]
        let inner = if use_mmap && size > 0 {
            // Safety: mapped read-only; the package file is not modified while open
            FileInner::Mmap(unsafe { Mmap::map(&file) }?)
        } else {
            FileInner::File(Mutex::new(file))
        };
        #[cfg(not(feature = "mmap"))]
        let inner = {
            let _ = use_mmap;
            FileInner::File(Mutex::new(file))
        };

        let storage = Self { inner, size };
        debug!(path = %path.display(), size, mapped = storage.is_mapped(), "opened package file");
        Ok(storage)
    }

    /// Whether the file is memory mapped.
    pub fn is_mapped(&self) -> bool {
        !matches!(self.inner, FileInner::File(_))
    }
}

impl Storage for FileStorage {
    fn len(&self) -> u64 {
        self.size
    }

    fn read_sync(&self, offset: u64, out: &mut [u8]) -> Result<()> {
        check_range(offset, out.len(), self.size)?;
        match &self.inner {
            #[cfg(feature = "mmap")]
            FileInner::Mmap(mmap) => {
                let start = offset as usize;
                out.copy_from_slice(&mmap[start..start + out.len()]);
            }
            FileInner::File(file) => {
                let mut f = file.lock();
                f.seek(SeekFrom::Start(offset))?;
                f.read_exact(out)?;
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for FileStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileStorage")
            .field("size", &self.size)
            .field("mapped", &self.is_mapped())
            .finish()
    }
}
