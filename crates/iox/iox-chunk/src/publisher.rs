//! Publisher side of the loan/publish/take data path.
//!
//! # Protocol
//!
//! ```text
//!   loan()      chunk pool ──► chunk (refs = 1, owned by the loan)
//!   write       payload written in place, no copy
//!   publish()   for each attached slot: refs += 1, push index to its queue
//!               overflow: the evicted index loses its queue reference
//!               refs -= 1 (the loan's own reference)
//! ```
//!
//! A chunk that nobody took a reference to returns to the pool at the end
//! of `publish`.

use crate::segment::ShmSegment;
use iox_memory::Relocatable;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tracing::trace;

/// Writes samples into a segment.
///
/// Any number of publishers may share one segment.
pub struct Publisher<T, const CHUNKS: usize, const SLOTS: usize, const DEPTH: usize> {
    segment: Arc<ShmSegment<T, CHUNKS, SLOTS, DEPTH>>,
}

/// A chunk on loan to the publisher.
///
/// Dereferences to the payload. Dropping it without calling
/// [`publish`](LoanedSample::publish) returns the chunk to the pool.
pub struct LoanedSample<'a, T, const CHUNKS: usize, const SLOTS: usize, const DEPTH: usize>
where
    T: Copy + Relocatable,
{
    segment: &'a ShmSegment<T, CHUNKS, SLOTS, DEPTH>,
    index: u32,
}

impl<T, const CHUNKS: usize, const SLOTS: usize, const DEPTH: usize> Publisher<T, CHUNKS, SLOTS, DEPTH>
where
    T: Copy + Relocatable,
{
    pub fn new(segment: Arc<ShmSegment<T, CHUNKS, SLOTS, DEPTH>>) -> Self {
        Self { segment }
    }

    pub fn segment(&self) -> &Arc<ShmSegment<T, CHUNKS, SLOTS, DEPTH>> {
        &self.segment
    }

    /// Loans a chunk initialised with `T::default()`.
    ///
    /// Returns `None` when every chunk is in use (all loaned or still held by
    /// subscribers).
    pub fn loan(&self) -> Option<LoanedSample<'_, T, CHUNKS, SLOTS, DEPTH>>
    where
        T: Default,
    {
        self.loan_with(T::default())
    }

    /// Loans a chunk initialised with `value`.
    pub fn loan_with(&self, value: T) -> Option<LoanedSample<'_, T, CHUNKS, SLOTS, DEPTH>> {
        let index = self.segment.allocate_chunk()?;
        // SAFETY: the chunk was just allocated for us alone.
        unsafe {
            let chunk = self.segment.chunk(index).as_ptr();
            std::ptr::addr_of_mut!((*chunk).payload).write(value);
        }
        Some(LoanedSample {
            segment: &self.segment,
            index,
        })
    }

    /// Loans, writes and publishes `value` in one go.
    ///
    /// Returns the number of subscriber queues it was delivered to, or `None`
    /// if no chunk was available.
    pub fn send(&self, value: T) -> Option<usize> {
        Some(self.loan_with(value)?.publish())
    }
}

impl<T, const CHUNKS: usize, const SLOTS: usize, const DEPTH: usize> LoanedSample<'_, T, CHUNKS, SLOTS, DEPTH>
where
    T: Copy + Relocatable,
{
    /// Delivers the chunk to every attached subscriber.
    ///
    /// Returns the number of subscriber queues the chunk was pushed to.
    pub fn publish(self) -> usize {
        let segment = self.segment;
        let index = self.index;
        std::mem::forget(self);

        let sequence = segment.header().sequence.fetch_add(1, Ordering::Relaxed);
        segment.chunk_header(index).sequence.store(sequence, Ordering::Relaxed);

        let mut delivered = 0;
        for (slot_id, slot) in segment.slots().iter().enumerate() {
            if !slot.attached.load(Ordering::Acquire) {
                continue;
            }
            // the queue's reference, taken before the index becomes visible
            segment.retain(index);
            // the queue push releases the payload and header writes above
            if let Some(evicted) = slot.queue.push(index) {
                trace!(slot = slot_id, chunk = evicted, "subscriber queue overflow");
                segment.release(evicted);
            }
            delivered += 1;
        }

        segment.release(index);
        delivered
    }

    /// Index of the loaned chunk in the segment's pool.
    pub fn chunk_index(&self) -> u32 {
        self.index
    }
}

impl<T, const CHUNKS: usize, const SLOTS: usize, const DEPTH: usize> Deref for LoanedSample<'_, T, CHUNKS, SLOTS, DEPTH>
where
    T: Copy + Relocatable,
{
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the payload was initialised by the loan and is exclusively ours.
        unsafe { &(*self.segment.chunk(self.index).as_ptr()).payload }
    }
}

impl<T, const CHUNKS: usize, const SLOTS: usize, const DEPTH: usize> DerefMut
    for LoanedSample<'_, T, CHUNKS, SLOTS, DEPTH>
where
    T: Copy + Relocatable,
{
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: as above, nobody else can reach an unpublished chunk.
        unsafe { &mut (*self.segment.chunk(self.index).as_ptr()).payload }
    }
}

impl<T, const CHUNKS: usize, const SLOTS: usize, const DEPTH: usize> Drop for LoanedSample<'_, T, CHUNKS, SLOTS, DEPTH>
where
    T: Copy + Relocatable,
{
    fn drop(&mut self) {
        self.segment.release(self.index);
    }
}
