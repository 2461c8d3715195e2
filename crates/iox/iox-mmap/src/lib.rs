//! File-backed shared memory.
//!
//! Every process that maps the same file with [`MmapFileMut`] sees the same
//! bytes, at a different base address each time.

use memmap2::MmapMut;
use std::{
    fs::{File, OpenOptions},
    io,
    path::{Path, PathBuf},
    ptr::NonNull,
};

pub struct MmapFileMut {
    _file: File,
    mmap: MmapMut,
    base: NonNull<u8>,
    path: PathBuf,
}

impl MmapFileMut {
    /// Create (or truncate) the file at `path`, size it to `size_bytes` and map
    /// it read-write. The new content is zero-filled.
    pub fn create_rw<P: AsRef<Path>>(path: P, size_bytes: u64) -> io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(path.as_ref())?;
        file.set_len(size_bytes)?;
        Self::map(file, path.as_ref())
    }

    /// Open an existing file and map it read-write
    pub fn open_rw<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path.as_ref())?;
        Self::map(file, path.as_ref())
    }

    fn map(file: File, path: &Path) -> io::Result<Self> {
        // SAFETY: the file stays open for the lifetime of the mapping. Other
        // processes mutate it concurrently, which is why all access goes
        // through the raw base pointer instead of slices.
        let mut mmap = unsafe { MmapMut::map_mut(&file)? };
        let base = NonNull::new(mmap.as_mut_ptr())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "empty mapping"))?;
        Ok(Self {
            _file: file,
            mmap,
            base,
            path: path.to_path_buf(),
        })
    }

    /// Start of the mapped data. Stable for the lifetime of `self`.
    #[inline]
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    #[inline]
    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.mmap.is_empty()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write dirty pages back to the file.
    pub fn flush(&self) -> io::Result<()> {
        self.mmap.flush()
    }
}

// SAFETY: the mapping is plain memory; synchronisation of its content is the
// job of whatever is placed inside.
unsafe impl Send for MmapFileMut {}
unsafe impl Sync for MmapFileMut {}
