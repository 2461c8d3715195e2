//! Fixed-capacity, lock-free pool of `T` blocks.
//!
//! Blocks are handed out by index through an [`IndexQueue`] seeded with every
//! index, so allocation and deallocation are a single queue pop or push and
//! safe from any number of threads. The pool has no notion of what is stored
//! in a block: dropping the allocator does not run `T`'s destructor for
//! blocks that were never destroyed.

use crate::index_queue::{IndexQueue, InitialState};
use iox_memory::Relocatable;
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::ptr::{NonNull, addr_of_mut};

#[repr(C)]
pub struct TypedAllocator<T, const CAPACITY: usize> {
    blocks: [UnsafeCell<MaybeUninit<T>>; CAPACITY],
    free_indices: IndexQueue<CAPACITY>,
}

impl<T, const CAPACITY: usize> TypedAllocator<T, CAPACITY> {
    const NON_ZERO_SIZED: () = assert!(size_of::<T>() != 0, "zero-sized blocks are not supported");

    pub fn new() -> Self {
        #[allow(clippy::let_unit_value)]
        let () = Self::NON_ZERO_SIZED;
        Self {
            blocks: std::array::from_fn(|_| UnsafeCell::new(MaybeUninit::uninit())),
            free_indices: IndexQueue::new(InitialState::Full),
        }
    }

    /// Initialises an allocator in place with every block free.
    ///
    /// # Safety
    /// `dst` must be valid for writes of `Self` and suitably aligned.
    pub unsafe fn emplace(dst: *mut Self) {
        #[allow(clippy::let_unit_value)]
        let () = Self::NON_ZERO_SIZED;
        // SAFETY: blocks are MaybeUninit, only the queue needs initialising.
        unsafe { IndexQueue::emplace(addr_of_mut!((*dst).free_indices), InitialState::Full) };
    }

    #[inline(always)]
    pub const fn capacity(&self) -> usize {
        CAPACITY
    }

    /// Reserves a block and returns its index, `None` when exhausted.
    #[inline]
    pub fn allocate_index(&self) -> Option<usize> {
        self.free_indices.pop().map(|i| i as usize)
    }

    /// Reserves an uninitialised block.
    #[inline]
    pub fn allocate(&self) -> Option<NonNull<T>> {
        self.allocate_index().map(|i| self.block(i))
    }

    /// Reserves a block and moves `value` into it.
    ///
    /// Hands `value` back if the pool is exhausted.
    pub fn create(&self, value: T) -> Result<NonNull<T>, T> {
        match self.allocate() {
            Some(block) => {
                // SAFETY: the block was just reserved for us alone.
                unsafe { block.as_ptr().write(value) };
                Ok(block)
            }
            None => Err(value),
        }
    }

    /// Address of block `index`. Panics if `index >= CAPACITY`.
    #[inline(always)]
    pub fn block(&self, index: usize) -> NonNull<T> {
        NonNull::from(&self.blocks[index]).cast()
    }

    /// Index of the block at `ptr`.
    ///
    /// `ptr` must be a block address previously returned by this allocator.
    pub fn index_of(&self, ptr: NonNull<T>) -> usize {
        let base = self.blocks.as_ptr().addr();
        let offset = ptr.as_ptr().addr().wrapping_sub(base);
        debug_assert!(offset < CAPACITY * size_of::<T>(), "pointer is not from this allocator");
        debug_assert_eq!(offset % size_of::<T>(), 0, "pointer is not on a block boundary");
        offset / size_of::<T>()
    }

    /// Returns a block to the pool without running `T`'s destructor.
    ///
    /// # Safety
    /// `ptr` must come from `allocate`/`create` on this allocator and must
    /// not be used afterwards. Releasing a block twice corrupts the pool.
    pub unsafe fn deallocate(&self, ptr: NonNull<T>) {
        // SAFETY: forwarded to the caller.
        unsafe { self.deallocate_index(self.index_of(ptr)) };
    }

    /// Index-based form of [`deallocate`](Self::deallocate).
    ///
    /// # Safety
    /// `index` must be currently allocated from this allocator.
    pub unsafe fn deallocate_index(&self, index: usize) {
        debug_assert!(index < CAPACITY);
        let pushed = self.free_indices.push(index as u64);
        debug_assert!(pushed, "free list overflow, block {index} released twice");
    }

    /// Drops the value in the block and releases it.
    ///
    /// # Safety
    /// `ptr` must come from `create` (or `allocate` followed by a write) on
    /// this allocator and must not be used afterwards.
    pub unsafe fn destroy(&self, ptr: NonNull<T>) {
        // SAFETY: the block holds an initialised T owned by the caller.
        unsafe {
            ptr.as_ptr().drop_in_place();
            self.deallocate(ptr);
        }
    }
}

impl<T, const CAPACITY: usize> Default for TypedAllocator<T, CAPACITY> {
    fn default() -> Self {
        Self::new()
    }
}

// SAFETY: blocks are only reachable through indices handed out exactly once by
// the lock-free free list; whoever holds an index has exclusive access.
unsafe impl<T: Send, const CAPACITY: usize> Send for TypedAllocator<T, CAPACITY> {}
unsafe impl<T: Send, const CAPACITY: usize> Sync for TypedAllocator<T, CAPACITY> {}

// SAFETY: block storage and free list are both address-free.
unsafe impl<T: Relocatable, const CAPACITY: usize> Relocatable for TypedAllocator<T, CAPACITY> {}
