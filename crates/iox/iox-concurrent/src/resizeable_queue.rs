//! Lock-free MPMC value queue with a runtime-adjustable capacity.
//!
//! Values live in a fixed buffer of `MAX` slots. Two [`IndexQueue`]s move
//! slot indices around:
//!
//! ```text
//!            pop free        write slot        push used
//!   push:  free_indices ───► buffer[i] ◄─── ─► used_indices
//!
//!            pop used        read slot         push free
//!   pop:   used_indices ───► buffer[i] ───── ► free_indices
//!
//!   unused_indices: slots parked by set_capacity, invisible to push/pop
//! ```
//!
//! The logical capacity is the number of indices circulating between the
//! free and used queues. Shrinking parks indices in the unused list, taking
//! free ones first and evicting the oldest stored values when no free index
//! is left. Growing hands parked indices back to the free queue. Push and pop
//! never look at the unused list, so they keep running lock-free while a
//! resize is in progress.
//!
//! When the queue is full, [`push`](ResizeableLockFreeQueue::push) claims the
//! oldest used index with `pop_if_size_is_at_least(capacity)` and hands the
//! overwritten value back to the caller instead of dropping it.

use crate::index_queue::{IndexQueue, InitialState};
use iox_memory::Relocatable;
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::ptr::addr_of_mut;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Indices taken out of circulation by a capacity decrease.
///
/// Only touched by the thread holding the resize flag.
#[repr(C)]
struct UnusedIndices<const MAX: usize> {
    len: usize,
    indices: [u64; MAX],
}

impl<const MAX: usize> UnusedIndices<MAX> {
    fn new() -> Self {
        Self {
            len: 0,
            indices: [0; MAX],
        }
    }

    fn push(&mut self, index: u64) {
        // at most MAX indices exist, so there is always room
        self.indices[self.len] = index;
        self.len += 1;
    }

    fn pop(&mut self) -> Option<u64> {
        if self.len == 0 {
            return None;
        }
        self.len -= 1;
        Some(self.indices[self.len])
    }
}

#[repr(C)]
pub struct ResizeableLockFreeQueue<T, const MAX: usize> {
    free_indices: IndexQueue<MAX>,
    used_indices: IndexQueue<MAX>,
    buffer: [UnsafeCell<MaybeUninit<T>>; MAX],
    /// Best-effort occupancy; may briefly run ahead of the used queue.
    size: AtomicU64,
    capacity: AtomicU64,
    resize_in_progress: AtomicBool,
    unused_indices: UnsafeCell<UnusedIndices<MAX>>,
}

/// Clears the resize flag when a resize ends, also if the removal handler
/// panics.
struct ResizeGuard<'a>(&'a AtomicBool);

impl Drop for ResizeGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl<T, const MAX: usize> ResizeableLockFreeQueue<T, MAX> {
    const NON_EMPTY: () = assert!(MAX > 0, "maximum capacity must be at least 1");

    /// Creates a queue with capacity `MAX`.
    pub fn new() -> Self {
        #[allow(clippy::let_unit_value)]
        let () = Self::NON_EMPTY;
        Self {
            free_indices: IndexQueue::new(InitialState::Full),
            used_indices: IndexQueue::new(InitialState::Empty),
            buffer: std::array::from_fn(|_| UnsafeCell::new(MaybeUninit::uninit())),
            size: AtomicU64::new(0),
            capacity: AtomicU64::new(MAX as u64),
            resize_in_progress: AtomicBool::new(false),
            unused_indices: UnsafeCell::new(UnusedIndices::new()),
        }
    }

    /// Creates a queue with `initial_capacity` clamped into `1..=MAX`.
    pub fn with_capacity(initial_capacity: u64) -> Self {
        let queue = Self::new();
        queue.set_capacity_discarding(Self::clamp_capacity(initial_capacity));
        queue
    }

    /// Initialises an empty queue in place.
    ///
    /// # Safety
    /// `dst` must be valid for writes of `Self` and suitably aligned. Any
    /// previous content is overwritten without being dropped.
    pub unsafe fn emplace(dst: *mut Self, initial_capacity: u64) {
        #[allow(clippy::let_unit_value)]
        let () = Self::NON_EMPTY;
        // SAFETY: caller guarantees `dst` is writable and aligned; the buffer
        // is MaybeUninit and needs no initialisation. An all-zero unused list
        // is a valid empty list.
        unsafe {
            IndexQueue::emplace(addr_of_mut!((*dst).free_indices), InitialState::Full);
            IndexQueue::emplace(addr_of_mut!((*dst).used_indices), InitialState::Empty);
            addr_of_mut!((*dst).size).write(AtomicU64::new(0));
            addr_of_mut!((*dst).capacity).write(AtomicU64::new(MAX as u64));
            addr_of_mut!((*dst).resize_in_progress).write(AtomicBool::new(false));
            UnsafeCell::raw_get(addr_of_mut!((*dst).unused_indices)).write_bytes(0, 1);
            (*dst).set_capacity_discarding(Self::clamp_capacity(initial_capacity));
        }
    }

    fn clamp_capacity(capacity: u64) -> u64 {
        capacity.clamp(1, MAX as u64)
    }

    #[inline(always)]
    pub const fn max_capacity(&self) -> u64 {
        MAX as u64
    }

    #[inline]
    pub fn capacity(&self) -> u64 {
        self.capacity.load(Ordering::Relaxed)
    }

    /// Number of stored values; a snapshot under concurrent access.
    #[inline]
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Relaxed).min(self.capacity())
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.used_indices.is_empty()
    }

    /// Stores `value` if a free slot exists, otherwise hands it back.
    pub fn try_push(&self, value: T) -> Result<(), T> {
        let Some(index) = self.free_indices.pop() else {
            return Err(value);
        };
        self.size.fetch_add(1, Ordering::Relaxed);
        // SAFETY: `index` came out of the free queue, the slot is ours.
        unsafe { self.write_slot(index, value) };
        self.used_indices.push(index);
        Ok(())
    }

    /// Stores `value`, evicting the oldest value if the queue is full.
    ///
    /// Returns the evicted value, if any.
    pub fn push(&self, value: T) -> Option<T> {
        let mut evicted = None;
        let index = loop {
            if let Some(index) = self.free_indices.pop() {
                self.size.fetch_add(1, Ordering::Relaxed);
                break index;
            }
            if let Some(index) = self.try_get_used_index() {
                // SAFETY: the index left the used queue through us, the slot
                // holds the oldest value and nobody else can reach it.
                evicted = Some(unsafe { self.read_slot(index) });
                break index;
            }
            // The used queue was not full, so a concurrent pop is about to
            // return an index to the free queue.
            std::hint::spin_loop();
        };

        // SAFETY: exclusive slot, see above.
        unsafe { self.write_slot(index, value) };
        self.used_indices.push(index);
        evicted
    }

    /// Removes and returns the oldest value.
    pub fn pop(&self) -> Option<T> {
        let index = self.used_indices.pop()?;
        // SAFETY: a used index always refers to an initialised slot and the
        // pop made us its only owner.
        let value = unsafe { self.read_slot(index) };
        self.size.fetch_sub(1, Ordering::Relaxed);
        self.free_indices.push(index);
        Some(value)
    }

    /// Changes the capacity to `new_capacity`.
    ///
    /// When shrinking below the number of stored values, the oldest values
    /// are removed and passed to `on_remove`, on the calling thread, before
    /// this returns. Returns `false` without changing anything if
    /// `new_capacity` is outside `1..=MAX` or another resize is running.
    ///
    /// `on_remove` must not push into or pop from this queue.
    pub fn set_capacity<F>(&self, new_capacity: u64, mut on_remove: F) -> bool
    where
        F: FnMut(T),
    {
        if new_capacity == 0 || new_capacity > MAX as u64 {
            return false;
        }
        if self.resize_in_progress.swap(true, Ordering::Acquire) {
            return false;
        }
        let _guard = ResizeGuard(&self.resize_in_progress);

        // SAFETY: holding the resize flag grants exclusive access.
        let unused = unsafe { &mut *self.unused_indices.get() };

        let mut capacity = self.capacity();
        while capacity != new_capacity {
            if capacity < new_capacity {
                self.increase_capacity(unused, new_capacity - capacity);
            } else {
                self.decrease_capacity(unused, capacity - new_capacity, &mut on_remove);
            }
            capacity = self.capacity();
        }
        true
    }

    /// [`set_capacity`](Self::set_capacity) that drops removed values.
    pub fn set_capacity_discarding(&self, new_capacity: u64) -> bool {
        self.set_capacity(new_capacity, drop)
    }

    fn increase_capacity(&self, unused: &mut UnusedIndices<MAX>, amount: u64) {
        for _ in 0..amount {
            let Some(index) = unused.pop() else {
                return;
            };
            self.capacity.fetch_add(1, Ordering::Release);
            self.free_indices.push(index);
        }
    }

    fn decrease_capacity<F>(&self, unused: &mut UnusedIndices<MAX>, amount: u64, on_remove: &mut F)
    where
        F: FnMut(T),
    {
        let mut decreased = 0;
        while decreased < amount {
            while decreased < amount {
                let Some(index) = self.free_indices.pop() else {
                    break;
                };
                unused.push(index);
                self.capacity.fetch_sub(1, Ordering::Release);
                decreased += 1;
            }

            // No free index left; take the oldest values. A plain pop is not
            // enough here: a concurrent push could refill the queue right away.
            while decreased < amount {
                let Some(index) = self.try_get_used_index() else {
                    break;
                };
                // SAFETY: the index left the used queue through us.
                let value = unsafe { self.read_slot(index) };
                self.size.fetch_sub(1, Ordering::Relaxed);
                on_remove(value);
                unused.push(index);
                self.capacity.fetch_sub(1, Ordering::Release);
                decreased += 1;
            }
        }
    }

    /// Claims the oldest used index, but only while the queue is at capacity.
    #[inline]
    fn try_get_used_index(&self) -> Option<u64> {
        self.used_indices.pop_if_size_is_at_least(self.capacity())
    }

    /// # Safety
    /// The caller must own `index` (popped from one of the index queues) and
    /// the slot must be uninitialised or already read out.
    #[inline(always)]
    unsafe fn write_slot(&self, index: u64, value: T) {
        // SAFETY: exclusive slot access per the contract above.
        unsafe { (*self.buffer[index as usize].get()).write(value) };
    }

    /// # Safety
    /// The caller must own `index` and the slot must hold an initialised value,
    /// which is moved out.
    #[inline(always)]
    unsafe fn read_slot(&self, index: u64) -> T {
        // SAFETY: exclusive slot access per the contract above.
        unsafe { (*self.buffer[index as usize].get()).assume_init_read() }
    }
}

impl<T, const MAX: usize> Default for ResizeableLockFreeQueue<T, MAX> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, const MAX: usize> Drop for ResizeableLockFreeQueue<T, MAX> {
    fn drop(&mut self) {
        while self.pop().is_some() {}
    }
}

// SAFETY: slots are only reachable through uniquely owned indices and the
// unused list only under the resize flag.
unsafe impl<T: Send, const MAX: usize> Send for ResizeableLockFreeQueue<T, MAX> {}
unsafe impl<T: Send, const MAX: usize> Sync for ResizeableLockFreeQueue<T, MAX> {}

// SAFETY: indices and counters only, no addresses.
unsafe impl<T: Relocatable, const MAX: usize> Relocatable for ResizeableLockFreeQueue<T, MAX> {}
