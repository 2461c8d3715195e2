//! A mapped segment and the chunk reference counting shared by publishers
//! and subscribers.

use crate::error::SegmentError;
use crate::layout::{Chunk, ChunkHeader, SegmentHeader, SegmentLayout, SubscriberSlot, bytes_for_segment};
use iox_concurrent::{ResizeableLockFreeQueue, TypedAllocator};
use iox_memory::Relocatable;
use iox_mmap::MmapFileMut;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::ptr::{NonNull, addr_of_mut};
use std::sync::atomic::{AtomicBool, Ordering, fence};
use tracing::{debug, info};

/// Mappings start on a page boundary; the layout must not need more.
const MAP_ALIGN: usize = 4096;

/// One topic's shared memory: header, chunk pool and subscriber slots.
///
/// Several processes (and threads) may hold a `ShmSegment` for the same file
/// at the same time. All mutation of the shared content goes through atomics
/// and the lock-free queues inside the segment.
///
/// # Type Parameters
/// - `T`: payload type. `Copy` because chunks are recycled without running
///   destructors, `Relocatable` because it is read from other address spaces.
/// - `CHUNKS`: number of chunks in the pool.
/// - `SLOTS`: maximum number of attached subscribers.
/// - `DEPTH`: maximum capacity of each subscriber queue.
pub struct ShmSegment<T, const CHUNKS: usize, const SLOTS: usize, const DEPTH: usize> {
    /// Owns the mapping; only accessed through `layout`.
    _mm: MmapFileMut,
    layout: NonNull<SegmentLayout<T, CHUNKS, SLOTS, DEPTH>>,
    _pd: PhantomData<T>,
}

impl<T, const CHUNKS: usize, const SLOTS: usize, const DEPTH: usize> ShmSegment<T, CHUNKS, SLOTS, DEPTH>
where
    T: Copy + Relocatable,
{
    const FITS_PAGE_ALIGN: () = assert!(
        align_of::<SegmentLayout<T, CHUNKS, SLOTS, DEPTH>>() <= MAP_ALIGN,
        "segment layout needs more than page alignment"
    );
    const CHUNK_INDEX_FITS_U32: () = assert!(CHUNKS <= u32::MAX as usize, "too many chunks");

    /// Creates the segment file at `path` and initialises it, replacing any
    /// file already there.
    ///
    /// The segment is built under a temporary sibling name and renamed into
    /// place, so [`open`](Self::open) either sees the previous file or a fully
    /// initialised segment, never a half-written one. Processes still mapping
    /// a replaced segment keep the old one; use
    /// [`open_or_create`](Self::open_or_create) to keep serving them.
    ///
    /// Every chunk starts free, every subscriber slot detached, every
    /// subscriber queue at full capacity.
    ///
    /// # Errors
    /// Returns [`SegmentError::Io`] if the file cannot be created, mapped or
    /// moved into place.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self, SegmentError> {
        #[allow(clippy::let_unit_value)]
        let ((), ()) = (Self::FITS_PAGE_ALIGN, Self::CHUNK_INDEX_FITS_U32);

        let path = path.as_ref();
        let staging = staging_path(path);
        let bytes = bytes_for_segment::<T, CHUNKS, SLOTS, DEPTH>();
        let io_error = |source| SegmentError::Io {
            path: path.to_path_buf(),
            source,
        };

        let mm = MmapFileMut::create_rw(&staging, bytes as u64).map_err(io_error)?;
        let layout = mm.base().cast::<SegmentLayout<T, CHUNKS, SLOTS, DEPTH>>();

        // SAFETY: the staging file has a name nobody else opens, so nobody
        // else has it mapped yet; the mapping is page aligned and exactly
        // `bytes` long.
        unsafe {
            let layout = layout.as_ptr();
            addr_of_mut!((*layout).header).write(SegmentHeader::new::<T, CHUNKS, SLOTS, DEPTH>());
            TypedAllocator::emplace(addr_of_mut!((*layout).chunks));
            let slots = addr_of_mut!((*layout).slots).cast::<SubscriberSlot<DEPTH>>();
            for i in 0..SLOTS {
                let slot = slots.add(i);
                addr_of_mut!((*slot).attached).write(AtomicBool::new(false));
                ResizeableLockFreeQueue::emplace(addr_of_mut!((*slot).queue), DEPTH as u64);
            }
        }

        if let Err(source) = std::fs::rename(&staging, path) {
            let _ = std::fs::remove_file(&staging);
            return Err(io_error(source));
        }

        info!(
            path = %path.display(),
            bytes,
            chunks = CHUNKS,
            slots = SLOTS,
            depth = DEPTH,
            "created segment"
        );

        Ok(Self {
            _mm: mm,
            layout,
            _pd: PhantomData,
        })
    }

    /// Maps the segment at `path` if it exists and has this shape, otherwise
    /// creates a fresh one.
    ///
    /// A restarted publisher uses this to reach subscribers that are still
    /// attached to the segment it created before.
    ///
    /// # Errors
    /// Returns [`SegmentError::Io`] if a new segment has to be created and
    /// that fails.
    pub fn open_or_create<P: AsRef<Path>>(path: P) -> Result<Self, SegmentError> {
        let path = path.as_ref();
        match Self::open(path) {
            Ok(segment) => Ok(segment),
            Err(reason) => {
                debug!(path = %path.display(), %reason, "no usable segment, creating");
                Self::create(path)
            }
        }
    }

    /// Maps an existing segment and checks that it was created with the same
    /// payload type and parameters.
    ///
    /// # Errors
    /// - [`SegmentError::Io`] if the file cannot be opened or mapped
    /// - [`SegmentError::TooSmall`] if the file is shorter than the layout
    /// - header validation errors, see [`SegmentHeader::validate`]
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, SegmentError> {
        #[allow(clippy::let_unit_value)]
        let ((), ()) = (Self::FITS_PAGE_ALIGN, Self::CHUNK_INDEX_FITS_U32);

        let path = path.as_ref();
        let mm = MmapFileMut::open_rw(path).map_err(|source| SegmentError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let expected = bytes_for_segment::<T, CHUNKS, SLOTS, DEPTH>();
        if mm.len() < expected {
            return Err(SegmentError::TooSmall {
                expected,
                actual: mm.len(),
            });
        }
        let layout = mm.base().cast::<SegmentLayout<T, CHUNKS, SLOTS, DEPTH>>();

        // SAFETY: the mapping is large enough for the header, and the header
        // holds plain integers that are valid for any bit pattern.
        let header = unsafe { &(*layout.as_ptr()).header };
        header.validate::<T, CHUNKS, SLOTS, DEPTH>()?;

        debug!(path = %path.display(), "opened segment");

        Ok(Self {
            _mm: mm,
            layout,
            _pd: PhantomData,
        })
    }

    #[inline(always)]
    fn layout(&self) -> &SegmentLayout<T, CHUNKS, SLOTS, DEPTH> {
        // SAFETY: initialised by `create` or validated by `open`; every field
        // is either immutable after creation or synchronised internally.
        unsafe { self.layout.as_ref() }
    }

    #[inline(always)]
    pub fn header(&self) -> &SegmentHeader {
        &self.layout().header
    }

    #[inline(always)]
    pub(crate) fn slots(&self) -> &[SubscriberSlot<DEPTH>; SLOTS] {
        &self.layout().slots
    }

    #[inline(always)]
    pub(crate) fn chunk(&self, index: u32) -> NonNull<Chunk<T>> {
        self.layout().chunks.block(index as usize)
    }

    /// Reserves a free chunk holding one reference, `None` if the pool is
    /// exhausted.
    pub(crate) fn allocate_chunk(&self) -> Option<u32> {
        let index = self.layout().chunks.allocate_index()? as u32;
        self.chunk_header(index).references.store(1, Ordering::Relaxed);
        Some(index)
    }

    /// Adds a reference for a new holder of an already referenced chunk.
    #[inline]
    pub(crate) fn retain(&self, index: u32) {
        self.chunk_header(index).references.fetch_add(1, Ordering::Relaxed);
    }

    /// Drops one reference; the last one returns the chunk to the pool.
    #[inline]
    pub(crate) fn release(&self, index: u32) {
        if self.chunk_header(index).references.fetch_sub(1, Ordering::Release) == 1 {
            // pairs with the release above in every other holder
            fence(Ordering::Acquire);
            // SAFETY: the count hit zero, no holder is left.
            unsafe { self.layout().chunks.deallocate_index(index as usize) };
        }
    }

    #[inline(always)]
    pub(crate) fn chunk_header(&self, index: u32) -> &ChunkHeader {
        // SAFETY: headers are only touched through atomics once initialised.
        unsafe { &(*self.chunk(index).as_ptr()).header }
    }

    /// Number of chunks currently free in the pool. Intended for diagnostics
    /// and tests; it drains and refills the free list, so only call it while
    /// the segment is quiet.
    pub fn free_chunks(&self) -> usize {
        let chunks = &self.layout().chunks;
        let taken: Vec<usize> = std::iter::from_fn(|| chunks.allocate_index()).collect();
        for &index in &taken {
            // SAFETY: just allocated above.
            unsafe { chunks.deallocate_index(index) };
        }
        taken.len()
    }

    /// Number of subscriber slots currently attached.
    pub fn attached_subscribers(&self) -> usize {
        self.slots()
            .iter()
            .filter(|slot| slot.attached.load(Ordering::Relaxed))
            .count()
    }
}

/// `<path>.creating.<pid>`, next to `path` so the rename stays on one
/// filesystem.
fn staging_path(path: &Path) -> PathBuf {
    let mut staging = path.as_os_str().to_owned();
    staging.push(format!(".creating.{}", std::process::id()));
    PathBuf::from(staging)
}

// SAFETY: the mapping is shared memory designed for concurrent access; all
// shared state is synchronised through atomics inside the segment.
unsafe impl<T: Send, const C: usize, const S: usize, const D: usize> Send for ShmSegment<T, C, S, D> {}
unsafe impl<T: Send, const C: usize, const S: usize, const D: usize> Sync for ShmSegment<T, C, S, D> {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::SEGMENT_MAGIC;
    use crate::{Publisher, Subscriber};
    use std::sync::Arc;
    use tempfile::TempDir;

    type Segment = ShmSegment<u64, 4, 2, 4>;

    #[test]
    fn create_initialises_pool_and_slots() {
        let dir = TempDir::new().unwrap();
        let seg = Segment::create(dir.path().join("seg")).unwrap();
        assert_eq!(seg.free_chunks(), 4);
        assert_eq!(seg.attached_subscribers(), 0);
        assert_eq!(seg.header().sequence.load(Ordering::Relaxed), 0);
        for slot in seg.slots() {
            assert_eq!(slot.queue.capacity(), 4);
            assert!(slot.queue.is_empty());
        }
    }

    #[test]
    fn open_sees_the_same_segment() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("seg");
        let a = Segment::create(&path).unwrap();
        let b = Segment::open(&path).unwrap();

        let index = a.allocate_chunk().unwrap();
        assert_eq!(b.free_chunks(), 3);
        b.release(index);
        assert_eq!(a.free_chunks(), 4);
    }

    #[test]
    fn open_rejects_other_parameters() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("seg");
        let _seg = Segment::create(&path).unwrap();

        let err = ShmSegment::<u64, 4, 3, 4>::open(&path).err().unwrap();
        assert!(matches!(err, SegmentError::TooSmall { .. } | SegmentError::LayoutMismatch { .. }));

        let err = ShmSegment::<u32, 2, 2, 4>::open(&path).err().unwrap();
        assert!(matches!(err, SegmentError::LayoutMismatch { .. }));
    }

    #[test]
    fn open_rejects_non_segment_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("junk");
        std::fs::write(&path, vec![0xAAu8; bytes_for_segment::<u64, 4, 2, 4>()]).unwrap();
        assert!(matches!(Segment::open(&path), Err(SegmentError::BadMagic(_))));

        let short = dir.path().join("short");
        std::fs::write(&short, [0u8; 8]).unwrap();
        assert!(matches!(Segment::open(&short), Err(SegmentError::TooSmall { .. })));
    }

    #[test]
    fn open_missing_file_is_io_error() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(Segment::open(dir.path().join("none")), Err(SegmentError::Io { .. })));
    }

    /// The chunk goes back to the pool exactly when the last reference is
    /// released, no matter how many holders there were.
    #[test]
    fn chunk_returns_after_last_release() {
        let dir = TempDir::new().unwrap();
        let seg = Segment::create(dir.path().join("seg")).unwrap();

        let index = seg.allocate_chunk().unwrap();
        seg.retain(index);
        seg.retain(index);
        assert_eq!(seg.free_chunks(), 3);

        seg.release(index);
        seg.release(index);
        assert_eq!(seg.free_chunks(), 3);
        seg.release(index);
        assert_eq!(seg.free_chunks(), 4);
    }

    /// Re-creating a segment never rewrites a file another process has
    /// mapped: the old mapping keeps its header and its attached slot.
    #[test]
    fn create_does_not_touch_mapped_segment() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("seg");
        let first = Segment::create(&path).unwrap();
        let mapped = Arc::new(Segment::open(&path).unwrap());
        let _subscriber = Subscriber::attach(Arc::clone(&mapped)).unwrap();

        let _second = Segment::create(&path).unwrap();
        assert_eq!(mapped.header().magic, SEGMENT_MAGIC);
        assert_eq!(mapped.attached_subscribers(), 1);
        assert_eq!(first.attached_subscribers(), 1);

        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(names, vec!["seg"]);
    }

    /// A restarted publisher reaches the subscriber that stayed attached.
    #[test]
    fn open_or_create_keeps_attached_subscribers() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("seg");
        drop(Segment::create(&path).unwrap());
        let mapped = Arc::new(Segment::open(&path).unwrap());
        let subscriber = Subscriber::attach(Arc::clone(&mapped)).unwrap();

        let restarted = Arc::new(Segment::open_or_create(&path).unwrap());
        assert_eq!(restarted.attached_subscribers(), 1);
        let publisher = Publisher::new(restarted);
        assert_eq!(publisher.send(7), Some(1));
        assert_eq!(subscriber.take().map(|s| *s), Some(7));
    }

    #[test]
    fn open_or_create_replaces_foreign_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("seg");
        std::fs::write(&path, [0u8; 16]).unwrap();
        let seg = Segment::open_or_create(&path).unwrap();
        assert_eq!(seg.free_chunks(), 4);
        assert!(Segment::open(&path).is_ok());
    }

    #[test]
    fn pool_exhaustion_is_reported() {
        let dir = TempDir::new().unwrap();
        let seg = Segment::create(dir.path().join("seg")).unwrap();
        let held: Vec<_> = std::iter::from_fn(|| seg.allocate_chunk()).collect();
        assert_eq!(held.len(), 4);
        assert!(seg.allocate_chunk().is_none());
        for index in held {
            seg.release(index);
        }
    }
}
