//! Lock-free multi-producer, multi-consumer FIFO of slot indices.
//!
//! The queue does not carry payloads. It carries indices in `[0, CAPACITY)`
//! that refer to storage owned by somebody else (an allocator's block array,
//! a queue's value buffer). Each index exists exactly once in the system:
//! inside this queue, in flight between a pop and a push, or held by a user.
//! That uniqueness is what lets the queue get away with a fixed array of
//! `CAPACITY` cells and no separate element count.
//!
//! # Layout
//!
//! ```text
//!              read_position                 write_position
//!                   │                              │
//!                   ▼                              ▼
//! cells:  ┌───────┬───────┬───────┬───────┬───────┬───────┐
//!         │ i,c   │ j,c   │ k,c   │ .,c-1 │ .,c-1 │ .,c-1 │
//!         └───────┴───────┴───────┴───────┴───────┴───────┘
//!           valid   valid   valid   free    free    free
//! ```
//!
//! Cells and cursors are [`CyclicIndex`] values. A cell tagged with the same
//! cycle as the read cursor holds a valid entry; a cell one cycle behind the
//! cursor that reaches it is empty (for readers) or free (for writers). The
//! cycle tag takes the place of a spare cell: full and empty are told apart
//! without a counter, and a cell cannot be reused for a new push before the
//! pop of its previous content has claimed the read cursor.
//!
//! # Protocol
//!
//! **push:** find the cell at the write cursor; if it is free, CAS the new
//! `(index, cycle)` into it (release), then advance the write cursor. A
//! pusher that finds the cell already written for this cycle helps advance
//! the cursor and retries.
//!
//! **pop:** find the cell at the read cursor (acquire); if it is valid for
//! this cycle, CAS the read cursor forward (acq-rel) to claim it. If it is one
//! cycle behind, the queue is empty.

use crate::cyclic_index::CyclicIndex;
use iox_memory::Relocatable;
use std::ptr::addr_of_mut;
use std::sync::atomic::{AtomicU64, Ordering};

/// Which indices a fresh queue contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitialState {
    /// No index; used for queues of active content.
    Empty,
    /// Every index `0..CAPACITY` in ascending order; used for free lists.
    Full,
}

/// Fixed-capacity lock-free queue of unique indices in `[0, CAPACITY)`.
///
/// `#[repr(C)]` and free of pointers, so it can be placed in shared memory
/// (see [`emplace`](IndexQueue::emplace)) and used from several processes.
#[repr(C)]
pub struct IndexQueue<const CAPACITY: usize> {
    cells: [AtomicU64; CAPACITY],
    read_position: AtomicU64,
    write_position: AtomicU64,
}

type Position<const N: usize> = CyclicIndex<N>;

impl<const CAPACITY: usize> IndexQueue<CAPACITY> {
    const LEN: u64 = Position::<CAPACITY>::CYCLE_LENGTH;

    /// Creates a queue that is either empty or holds every index once.
    pub fn new(state: InitialState) -> Self {
        let (read, write, cells) = Self::initial_values(state);
        Self {
            cells: std::array::from_fn(|i| AtomicU64::new(cells(i as u64))),
            read_position: AtomicU64::new(read),
            write_position: AtomicU64::new(write),
        }
    }

    /// Initialises a queue in place.
    ///
    /// # Safety
    /// `dst` must be valid for writes of `Self` and suitably aligned. Any
    /// previous content is overwritten without being dropped.
    pub unsafe fn emplace(dst: *mut Self, state: InitialState) {
        let (read, write, cells) = Self::initial_values(state);
        // SAFETY: caller guarantees `dst` is writable and aligned.
        unsafe {
            let first = addr_of_mut!((*dst).cells) as *mut AtomicU64;
            for i in 0..CAPACITY {
                first.add(i).write(AtomicU64::new(cells(i as u64)));
            }
            addr_of_mut!((*dst).read_position).write(AtomicU64::new(read));
            addr_of_mut!((*dst).write_position).write(AtomicU64::new(write));
        }
    }

    /// Raw read cursor, raw write cursor and the raw cell value per index.
    fn initial_values(state: InitialState) -> (u64, u64, fn(u64) -> u64) {
        match state {
            // cursors in cycle 1, every cell tagged cycle 0 => all empty
            InitialState::Empty => (
                Position::<CAPACITY>::new(0, 1).raw(),
                Position::<CAPACITY>::new(0, 1).raw(),
                |_| Position::<CAPACITY>::new(0, 0).raw(),
            ),
            // read cursor in cycle 0 sees cell i = (i, 0) as valid
            InitialState::Full => (
                Position::<CAPACITY>::new(0, 0).raw(),
                Position::<CAPACITY>::new(0, 1).raw(),
                |i| Position::<CAPACITY>::new(i, 0).raw(),
            ),
        }
    }

    #[inline(always)]
    pub const fn capacity(&self) -> usize {
        CAPACITY
    }

    #[inline(always)]
    fn cell(&self, position: Position<CAPACITY>) -> &AtomicU64 {
        // index() < CAPACITY whenever CAPACITY > 0, which callers check first
        &self.cells[position.index() as usize]
    }

    #[inline(always)]
    fn load_read_position(&self, order: Ordering) -> Position<CAPACITY> {
        Position::<CAPACITY>::from_raw(self.read_position.load(order))
    }

    #[inline(always)]
    fn load_write_position(&self, order: Ordering) -> Position<CAPACITY> {
        Position::<CAPACITY>::from_raw(self.write_position.load(order))
    }

    /// Appends `index`.
    ///
    /// Returns `false` only if the queue was observed holding `CAPACITY`
    /// indices, which cannot happen while every index is unique. Pushing an
    /// index that is already in the queue breaks that invariant and is a
    /// caller error.
    pub fn push(&self, index: u64) -> bool {
        if CAPACITY == 0 {
            return false;
        }
        debug_assert!(index < Self::LEN, "index {index} out of range");

        let mut write_position = self.load_write_position(Ordering::Relaxed);
        loop {
            let old = Position::<CAPACITY>::from_raw(self.cell(write_position).load(Ordering::Relaxed));

            if old.is_one_cycle_behind(write_position) {
                // The cell looks free, but it could also hold an entry from the
                // previous lap that nobody popped yet (queue full).
                let read_position = self.load_read_position(Ordering::Acquire);
                let held = read_position.distance_to(write_position);
                if held == Self::LEN {
                    return false;
                }
                if held > Self::LEN {
                    // cursors from different instants, start over
                    write_position = self.load_write_position(Ordering::Relaxed);
                    continue;
                }

                let new = Position::<CAPACITY>::new(index, write_position.cycle());
                if self
                    .cell(write_position)
                    .compare_exchange_weak(old.raw(), new.raw(), Ordering::Release, Ordering::Relaxed)
                    .is_ok()
                {
                    break;
                }
                // lost against a concurrent push, fall through and re-examine
            }

            let cell_now = Position::<CAPACITY>::from_raw(self.cell(write_position).load(Ordering::Relaxed));
            if cell_now.cycle() == write_position.cycle() {
                // Another push published here but has not advanced the cursor
                // yet. Help it, then retry on the next cell.
                let next = write_position.next();
                write_position = match self.write_position.compare_exchange(
                    write_position.raw(),
                    next.raw(),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => next,
                    Err(current) => Position::<CAPACITY>::from_raw(current),
                };
            } else if !cell_now.is_one_cycle_behind(write_position) {
                // cursor is stale (cell is further ahead or behind), reload
                write_position = self.load_write_position(Ordering::Relaxed);
            }
        }

        // Failure only means some other push already advanced the cursor for us.
        let _ = self.write_position.compare_exchange(
            write_position.raw(),
            write_position.next().raw(),
            Ordering::Relaxed,
            Ordering::Relaxed,
        );
        true
    }

    /// Removes and returns the oldest index, or `None` if the queue is empty.
    pub fn pop(&self) -> Option<u64> {
        if CAPACITY == 0 {
            return None;
        }

        let mut read_position = self.load_read_position(Ordering::Relaxed);
        loop {
            let value = Position::<CAPACITY>::from_raw(self.cell(read_position).load(Ordering::Acquire));

            if value.cycle() == read_position.cycle() {
                match self.read_position.compare_exchange_weak(
                    read_position.raw(),
                    read_position.next().raw(),
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => return Some(value.index()),
                    Err(current) => read_position = Position::<CAPACITY>::from_raw(current),
                }
            } else if value.is_one_cycle_behind(read_position) {
                return None;
            } else {
                read_position = self.load_read_position(Ordering::Relaxed);
            }
        }
    }

    /// Pops the oldest index only if the queue holds exactly `CAPACITY`
    /// indices at the moment of the check.
    ///
    /// No retry loop: if a concurrent pop made room, the queue is not full
    /// any more and `None` is the right answer.
    pub fn pop_if_full(&self) -> Option<u64> {
        if CAPACITY == 0 {
            return None;
        }

        let write_position = self.load_write_position(Ordering::Acquire);
        let read_position = self.load_read_position(Ordering::Acquire);
        let is_full = write_position.index() == read_position.index()
            && read_position.is_one_cycle_behind(write_position);
        if !is_full {
            return None;
        }
        self.claim(read_position)
    }

    /// Pops the oldest index only if at least `min_size` indices are held.
    ///
    /// `min_size == 0` behaves like [`pop`](IndexQueue::pop).
    pub fn pop_if_size_is_at_least(&self, min_size: u64) -> Option<u64> {
        if min_size == 0 {
            return self.pop();
        }
        if CAPACITY == 0 {
            return None;
        }

        let write_position = self.load_write_position(Ordering::Acquire);
        let read_position = self.load_read_position(Ordering::Acquire);
        let held = read_position.distance_to(write_position);

        // held > LEN means the two loads saw inconsistent cursors
        if held > Self::LEN || held < min_size {
            return None;
        }
        self.claim(read_position)
    }

    /// Claims the cell at `read_position` if it is still the valid head.
    #[inline]
    fn claim(&self, read_position: Position<CAPACITY>) -> Option<u64> {
        let value = Position::<CAPACITY>::from_raw(self.cell(read_position).load(Ordering::Acquire));
        if value.cycle() != read_position.cycle() {
            return None;
        }
        self.read_position
            .compare_exchange(
                read_position.raw(),
                read_position.next().raw(),
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .ok()
            .map(|_| value.index())
    }

    /// Snapshot emptiness check; a concurrent push may change it right away.
    pub fn is_empty(&self) -> bool {
        if CAPACITY == 0 {
            return true;
        }
        let read_position = self.load_read_position(Ordering::Relaxed);
        let value = Position::<CAPACITY>::from_raw(self.cell(read_position).load(Ordering::Relaxed));
        value.is_one_cycle_behind(read_position)
    }
}

// SAFETY: cells and cursors are plain atomics, no addresses.
unsafe impl<const CAPACITY: usize> Relocatable for IndexQueue<CAPACITY> {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::MaybeUninit;

    const CAP: usize = 4;

    fn drain<const N: usize>(q: &IndexQueue<N>) -> Vec<u64> {
        std::iter::from_fn(|| q.pop()).collect()
    }

    #[test]
    fn empty_queue_pops_nothing() {
        let q = IndexQueue::<CAP>::new(InitialState::Empty);
        assert!(q.is_empty());
        assert_eq!(q.pop(), None);
    }

    /// A full queue hands out every index exactly once, in ascending order,
    /// and then reports empty.
    #[test]
    fn full_queue_pops_every_index_once() {
        let q = IndexQueue::<CAP>::new(InitialState::Full);
        assert!(!q.is_empty());
        assert_eq!(drain(&q), vec![0, 1, 2, 3]);
        assert_eq!(q.pop(), None);
        assert!(q.is_empty());
    }

    #[test]
    fn popped_index_can_be_pushed_back() {
        let q = IndexQueue::<CAP>::new(InitialState::Full);
        let popped = drain(&q);
        assert!(q.push(popped[2]));
        assert_eq!(q.pop(), Some(popped[2]));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn preserves_fifo_order() {
        let q = IndexQueue::<CAP>::new(InitialState::Empty);
        for i in [3, 1, 0, 2] {
            assert!(q.push(i));
        }
        assert_eq!(drain(&q), vec![3, 1, 0, 2]);
    }

    #[test]
    fn push_fails_exactly_when_full() {
        let q = IndexQueue::<CAP>::new(InitialState::Empty);
        for i in 0..CAP as u64 {
            assert!(q.push(i));
        }
        assert!(!q.push(0));

        assert_eq!(q.pop(), Some(0));
        assert!(q.push(0));
        assert!(!q.push(1));
    }

    #[test]
    fn full_constructed_queue_rejects_push() {
        let q = IndexQueue::<CAP>::new(InitialState::Full);
        assert!(!q.push(1));
    }

    /// Running many laps moves the cursors through many cycles; ordering
    /// and emptiness detection must not drift.
    #[test]
    fn survives_many_laps() {
        let q = IndexQueue::<3>::new(InitialState::Empty);
        for lap in 0..1000u64 {
            let a = lap % 3;
            let b = (lap + 1) % 3;
            assert!(q.push(a));
            assert!(q.push(b));
            assert_eq!(q.pop(), Some(a));
            assert_eq!(q.pop(), Some(b));
            assert_eq!(q.pop(), None);
        }
    }

    #[test]
    fn pop_if_full_only_pops_full_queue() {
        let q = IndexQueue::<CAP>::new(InitialState::Empty);
        assert_eq!(q.pop_if_full(), None);

        for i in 0..3 {
            q.push(i);
        }
        assert_eq!(q.pop_if_full(), None);

        q.push(3);
        assert_eq!(q.pop_if_full(), Some(0));
        assert_eq!(q.pop_if_full(), None);
        assert_eq!(drain(&q), vec![1, 2, 3]);
    }

    #[test]
    fn pop_if_size_is_at_least_respects_threshold() {
        let q = IndexQueue::<CAP>::new(InitialState::Empty);
        assert_eq!(q.pop_if_size_is_at_least(1), None);
        assert_eq!(q.pop_if_size_is_at_least(0), None);

        q.push(2);
        assert_eq!(q.pop_if_size_is_at_least(2), None);
        assert_eq!(q.pop_if_size_is_at_least(1), Some(2));

        q.push(1);
        assert_eq!(q.pop_if_size_is_at_least(0), Some(1));

        let full = IndexQueue::<CAP>::new(InitialState::Full);
        assert_eq!(full.pop_if_size_is_at_least(CAP as u64), Some(0));
        assert_eq!(full.pop_if_size_is_at_least(CAP as u64), None);
        assert_eq!(full.pop_if_size_is_at_least(CAP as u64 - 1), Some(1));
    }

    /// Capacity zero degenerates to a queue that is always empty and always
    /// full at the same time.
    #[test]
    fn zero_capacity_never_holds_a_value() {
        let q = IndexQueue::<0>::new(InitialState::Full);
        assert!(q.is_empty());
        assert!(!q.push(0));
        assert_eq!(q.pop(), None);
        assert_eq!(q.pop_if_full(), None);
        assert_eq!(q.pop_if_size_is_at_least(1), None);
    }

    #[test]
    fn emplace_matches_new() {
        let mut slot = MaybeUninit::<IndexQueue<CAP>>::uninit();
        let q = unsafe {
            IndexQueue::emplace(slot.as_mut_ptr(), InitialState::Full);
            slot.assume_init_ref()
        };
        assert_eq!(drain(q), vec![0, 1, 2, 3]);

        unsafe { IndexQueue::emplace(slot.as_mut_ptr(), InitialState::Empty) };
        let q = unsafe { slot.assume_init_ref() };
        assert!(q.is_empty());
        assert!(q.push(3));
        assert_eq!(q.pop(), Some(3));
    }

    /// The queue holds no addresses, so a raw byte copy is a working queue
    /// with the same content.
    #[test]
    fn raw_copy_is_an_equivalent_queue() {
        let q = IndexQueue::<CAP>::new(InitialState::Empty);
        q.push(2);
        q.push(0);

        let mut copy = MaybeUninit::<IndexQueue<CAP>>::uninit();
        let copy = unsafe {
            std::ptr::copy_nonoverlapping(&q as *const IndexQueue<CAP>, copy.as_mut_ptr(), 1);
            copy.assume_init_ref()
        };
        assert_eq!(drain(copy), vec![2, 0]);
        assert_eq!(drain(&q), vec![2, 0]);
    }
}
