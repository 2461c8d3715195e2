//! Binary layout of a shared-memory segment.
//!
//! A segment carries one topic: a pool of fixed-size chunks and a fixed set of
//! subscriber slots. Publishers write into chunks and hand chunk *indices* to
//! the subscriber queues; the payload itself is never copied.
//!
//! # Memory Layout
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        SegmentHeader                             │
//! │  magic │ version │ chunks │ payload size/align │ slots │ depth   │
//! │  sequence (atomic)                                               │
//! ├──────────────────────────────────────────────────────────────────┤
//! │              TypedAllocator<Chunk<T>, CHUNKS>                    │
//! │  ┌─────────────────────────────┐                                 │
//! │  │ ChunkHeader │ payload: T    │  × CHUNKS                       │
//! │  └─────────────────────────────┘                                 │
//! │  free chunk indices (IndexQueue)                                 │
//! ├──────────────────────────────────────────────────────────────────┤
//! │  SubscriberSlot[0]: attached │ ResizeableLockFreeQueue<u32, D>   │
//! │  SubscriberSlot[1]                                               │
//! │  ...                                                             │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Nothing in the segment stores an absolute address, so every process can
//! map it wherever its kernel likes.

use crate::error::SegmentError;
use iox_concurrent::{ResizeableLockFreeQueue, TypedAllocator};
use iox_memory::Relocatable;
use std::mem::{align_of, size_of};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64};

/// Magic number identifying a segment file.
///
/// ASCII encoding of "IOXSEGMT":
/// `0x494F_5853_4547_4D54` = "IOXSEGMT"
pub const SEGMENT_MAGIC: u64 = u64::from_be_bytes(*b"IOXSEGMT");

/// Current segment format version.
///
/// Increment this when making incompatible changes to the layout.
/// Processes reject segments with a different version.
pub const SEGMENT_VERSION: u64 = 1;

/// Header at offset 0 of every segment.
///
/// Describes the compile-time parameters the segment was created with, so that
/// a process opening it can refuse a segment built for a different type.
#[repr(C)]
pub struct SegmentHeader {
    /// Must equal [`SEGMENT_MAGIC`].
    pub magic: u64,
    /// Must equal [`SEGMENT_VERSION`].
    pub version: u64,
    pub chunk_count: u64,
    pub payload_size: u64,
    pub payload_align: u64,
    pub subscriber_slots: u64,
    /// Maximum capacity of each subscriber queue.
    pub queue_depth: u64,
    /// Sequence number handed to the next published chunk.
    pub sequence: AtomicU64,
}

impl SegmentHeader {
    pub fn new<T, const CHUNKS: usize, const SLOTS: usize, const DEPTH: usize>() -> Self {
        Self {
            magic: SEGMENT_MAGIC,
            version: SEGMENT_VERSION,
            chunk_count: CHUNKS as u64,
            payload_size: size_of::<T>() as u64,
            payload_align: align_of::<T>() as u64,
            subscriber_slots: SLOTS as u64,
            queue_depth: DEPTH as u64,
            sequence: AtomicU64::new(0),
        }
    }

    /// Checks that the header describes a segment of exactly this shape.
    ///
    /// # Errors
    /// - [`SegmentError::BadMagic`] if the file is not a segment
    /// - [`SegmentError::VersionMismatch`] for a different format version
    /// - [`SegmentError::LayoutMismatch`] naming the first parameter that differs
    pub fn validate<T, const CHUNKS: usize, const SLOTS: usize, const DEPTH: usize>(
        &self,
    ) -> Result<(), SegmentError> {
        if self.magic != SEGMENT_MAGIC {
            return Err(SegmentError::BadMagic(self.magic));
        }
        if self.version != SEGMENT_VERSION {
            return Err(SegmentError::VersionMismatch {
                found: self.version,
                expected: SEGMENT_VERSION,
            });
        }

        let expected = Self::new::<T, CHUNKS, SLOTS, DEPTH>();
        let fields = [
            ("chunk_count", self.chunk_count, expected.chunk_count),
            ("payload_size", self.payload_size, expected.payload_size),
            ("payload_align", self.payload_align, expected.payload_align),
            ("subscriber_slots", self.subscriber_slots, expected.subscriber_slots),
            ("queue_depth", self.queue_depth, expected.queue_depth),
        ];
        for (field, found, expected) in fields {
            if found != expected {
                return Err(SegmentError::LayoutMismatch {
                    field,
                    found,
                    expected,
                });
            }
        }
        Ok(())
    }
}

/// Per-chunk bookkeeping in front of the payload.
#[repr(C)]
pub struct ChunkHeader {
    /// Publish order of the chunk within its segment.
    pub sequence: AtomicU64,
    /// One reference per holder: the loaning publisher, each subscriber queue
    /// the index sits in, each sample being read. The chunk returns to the
    /// pool when this drops to zero.
    pub references: AtomicU32,
}

#[repr(C)]
pub(crate) struct Chunk<T> {
    pub header: ChunkHeader,
    pub payload: T,
}

#[repr(C)]
pub(crate) struct SubscriberSlot<const DEPTH: usize> {
    pub attached: AtomicBool,
    /// Chunk indices waiting to be taken.
    pub queue: ResizeableLockFreeQueue<u32, DEPTH>,
}

#[repr(C)]
pub(crate) struct SegmentLayout<T, const CHUNKS: usize, const SLOTS: usize, const DEPTH: usize> {
    pub header: SegmentHeader,
    pub chunks: TypedAllocator<Chunk<T>, CHUNKS>,
    pub slots: [SubscriberSlot<DEPTH>; SLOTS],
}

// SAFETY: all segment types hold plain data, atomics and index queues.
unsafe impl Relocatable for SegmentHeader {}
unsafe impl Relocatable for ChunkHeader {}
unsafe impl<T: Relocatable> Relocatable for Chunk<T> {}
unsafe impl<const DEPTH: usize> Relocatable for SubscriberSlot<DEPTH> {}
unsafe impl<T: Relocatable, const C: usize, const S: usize, const D: usize> Relocatable
    for SegmentLayout<T, C, S, D>
{
}

/// Bytes needed for a segment of payload `T` with `CHUNKS` chunks, `SLOTS`
/// subscriber slots and queues of at most `DEPTH` entries.
pub fn bytes_for_segment<T, const CHUNKS: usize, const SLOTS: usize, const DEPTH: usize>() -> usize {
    size_of::<SegmentLayout<T, CHUNKS, SLOTS, DEPTH>>()
}
