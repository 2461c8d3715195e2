//! Subscriber side of the data path.
//!
//! A subscriber owns one slot of the segment for as long as it lives. The
//! slot's queue holds chunk indices, each carrying one chunk reference.

use crate::error::SegmentError;
use crate::layout::SubscriberSlot;
use crate::segment::ShmSegment;
use iox_memory::Relocatable;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tracing::{debug, info};

/// Receives samples from every publisher of a segment.
pub struct Subscriber<T, const CHUNKS: usize, const SLOTS: usize, const DEPTH: usize>
where
    T: Copy + Relocatable,
{
    segment: Arc<ShmSegment<T, CHUNKS, SLOTS, DEPTH>>,
    slot_id: usize,
}

/// A received chunk. Releases its reference when dropped.
pub struct Sample<'a, T, const CHUNKS: usize, const SLOTS: usize, const DEPTH: usize>
where
    T: Copy + Relocatable,
{
    segment: &'a ShmSegment<T, CHUNKS, SLOTS, DEPTH>,
    index: u32,
}

impl<T, const CHUNKS: usize, const SLOTS: usize, const DEPTH: usize> Subscriber<T, CHUNKS, SLOTS, DEPTH>
where
    T: Copy + Relocatable,
{
    /// Claims a free subscriber slot.
    ///
    /// Indices left in the slot by an earlier subscriber (or pushed by a
    /// publisher racing with its detach) are released first, so the new
    /// subscriber starts with an empty queue at full capacity.
    ///
    /// # Errors
    /// Returns [`SegmentError::NoFreeSubscriberSlot`] if all slots are taken.
    pub fn attach(segment: Arc<ShmSegment<T, CHUNKS, SLOTS, DEPTH>>) -> Result<Self, SegmentError> {
        let slot_id = segment
            .slots()
            .iter()
            .position(|slot| {
                slot.attached
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
            })
            .ok_or(SegmentError::NoFreeSubscriberSlot(SLOTS))?;

        let subscriber = Self { segment, slot_id };
        let stale = subscriber.drain();
        subscriber.slot().queue.set_capacity_discarding(DEPTH as u64);
        info!(slot = slot_id, stale, "subscriber attached");
        Ok(subscriber)
    }

    #[inline(always)]
    fn slot(&self) -> &SubscriberSlot<DEPTH> {
        &self.segment.slots()[self.slot_id]
    }

    pub fn slot_id(&self) -> usize {
        self.slot_id
    }

    pub fn segment(&self) -> &Arc<ShmSegment<T, CHUNKS, SLOTS, DEPTH>> {
        &self.segment
    }

    /// Takes the oldest pending sample, if any.
    pub fn take(&self) -> Option<Sample<'_, T, CHUNKS, SLOTS, DEPTH>> {
        let index = self.slot().queue.pop()?;
        Some(Sample {
            segment: &self.segment,
            index,
        })
    }

    /// Number of samples waiting in the queue.
    pub fn pending(&self) -> u64 {
        self.slot().queue.size()
    }

    pub fn queue_capacity(&self) -> u64 {
        self.slot().queue.capacity()
    }

    /// Resizes the receive queue to `capacity` entries.
    ///
    /// Samples that no longer fit are dropped oldest first and their chunks
    /// released. Returns `false` if `capacity` is outside `1..=DEPTH` or
    /// another resize of this queue is running.
    pub fn set_queue_capacity(&self, capacity: u64) -> bool {
        let mut dropped = 0u64;
        let resized = self.slot().queue.set_capacity(capacity, |index| {
            self.segment.release(index);
            dropped += 1;
        });
        if resized {
            debug!(slot = self.slot_id, capacity, dropped, "subscriber queue resized");
        }
        resized
    }

    /// Releases every pending index and returns how many there were.
    fn drain(&self) -> usize {
        let mut released = 0;
        while let Some(index) = self.slot().queue.pop() {
            self.segment.release(index);
            released += 1;
        }
        released
    }
}

impl<T, const CHUNKS: usize, const SLOTS: usize, const DEPTH: usize> Drop for Subscriber<T, CHUNKS, SLOTS, DEPTH>
where
    T: Copy + Relocatable,
{
    fn drop(&mut self) {
        self.slot().attached.store(false, Ordering::Release);
        let released = self.drain();
        info!(slot = self.slot_id, released, "subscriber detached");
    }
}

impl<T, const CHUNKS: usize, const SLOTS: usize, const DEPTH: usize> Sample<'_, T, CHUNKS, SLOTS, DEPTH>
where
    T: Copy + Relocatable,
{
    /// Publish order within the segment, starting at 0.
    pub fn sequence(&self) -> u64 {
        self.segment.chunk_header(self.index).sequence.load(Ordering::Relaxed)
    }

    pub fn chunk_index(&self) -> u32 {
        self.index
    }
}

impl<T, const CHUNKS: usize, const SLOTS: usize, const DEPTH: usize> Deref for Sample<'_, T, CHUNKS, SLOTS, DEPTH>
where
    T: Copy + Relocatable,
{
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: published chunks are read-only and our reference keeps the
        // chunk out of the pool.
        unsafe { &(*self.segment.chunk(self.index).as_ptr()).payload }
    }
}

impl<T, const CHUNKS: usize, const SLOTS: usize, const DEPTH: usize> Drop for Sample<'_, T, CHUNKS, SLOTS, DEPTH>
where
    T: Copy + Relocatable,
{
    fn drop(&mut self) {
        self.segment.release(self.index);
    }
}
