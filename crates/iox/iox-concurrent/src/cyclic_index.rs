//! Cycle-tagged index arithmetic for the lock-free index queue.
//!
//! A `CyclicIndex<N>` packs an index in `[0, N)` together with a cycle
//! counter into one `u64`:
//!
//! ```text
//! raw = cycle * N + index
//!
//! N = 4:   raw  0  1  2  3 | 4  5  6  7 | 8  9 ...
//!        index  0  1  2  3 | 0  1  2  3 | 0  1
//!        cycle  0  0  0  0 | 1  1  1  1 | 2  2
//! ```
//!
//! Queue cursors advance through raw values one by one, so every lap over the
//! cell array bumps the cycle. Cells store the same encoding, tagged with the
//! cycle of the cursor that wrote them. Comparing a cell's cycle with a
//! cursor's cycle tells whether the cell is valid for that lap or left over
//! from the previous one, which is what makes push/pop safe against ABA.
//!
//! The raw value wraps to 0 at `MAX_CYCLE * N`, the largest multiple of `N`
//! that fits into a `u64`, so the `index`/`cycle` decomposition stays
//! consistent across the wrap.

/// An index in `[0, N)` tagged with a cycle counter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct CyclicIndex<const N: usize> {
    value: u64,
}

impl<const N: usize> CyclicIndex<N> {
    /// Cycle length used for the arithmetic. `N == 0` is treated as 1 so
    /// that the type stays well defined for degenerate queues.
    pub const CYCLE_LENGTH: u64 = if N == 0 { 1 } else { N as u64 };

    /// Number of distinct cycles before the raw value wraps.
    pub const MAX_CYCLE: u64 = u64::MAX / Self::CYCLE_LENGTH;

    /// First raw value that is *not* representable; `next` wraps here.
    const WRAP_VALUE: u64 = Self::MAX_CYCLE * Self::CYCLE_LENGTH;

    #[inline(always)]
    pub const fn new(index: u64, cycle: u64) -> Self {
        debug_assert!(index < Self::CYCLE_LENGTH);
        debug_assert!(cycle < Self::MAX_CYCLE);
        Self {
            value: cycle * Self::CYCLE_LENGTH + index,
        }
    }

    #[inline(always)]
    pub const fn from_raw(value: u64) -> Self {
        Self { value }
    }

    #[inline(always)]
    pub const fn raw(self) -> u64 {
        self.value
    }

    #[inline(always)]
    pub const fn index(self) -> u64 {
        self.value % Self::CYCLE_LENGTH
    }

    #[inline(always)]
    pub const fn cycle(self) -> u64 {
        self.value / Self::CYCLE_LENGTH
    }

    /// The successor, wrapping back to raw value 0 after the last cycle.
    #[inline(always)]
    pub const fn next(self) -> Self {
        let next = self.value + 1;
        if next == Self::WRAP_VALUE {
            Self { value: 0 }
        } else {
            Self { value: next }
        }
    }

    /// True iff `other` is exactly one cycle ahead of `self` (modulo the
    /// cycle wrap). The index part is ignored.
    #[inline(always)]
    pub const fn is_one_cycle_behind(self, other: Self) -> bool {
        let next_cycle = self.cycle() + 1;
        let next_cycle = if next_cycle == Self::MAX_CYCLE { 0 } else { next_cycle };
        next_cycle == other.cycle()
    }

    /// Number of `next` steps from `self` to `later`, modulo the wrap.
    ///
    /// If `later` is actually behind `self` (a stale snapshot), the result is
    /// a very large number; callers treat anything above the cycle length as
    /// an inconsistent snapshot.
    #[inline(always)]
    pub const fn distance_to(self, later: Self) -> u64 {
        if later.value >= self.value {
            later.value - self.value
        } else {
            Self::WRAP_VALUE - self.value + later.value
        }
    }
}
