//! Self-relative pointer for data structures that live in shared memory.
//!
//! A shared-memory segment is mapped at a different base address in every
//! process. An ordinary pointer stored inside the segment is only meaningful
//! in the process that wrote it. `RelocatablePtr` instead stores the signed
//! byte distance from *its own address* to the pointee, so it resolves
//! correctly in any mapping as long as pointer and pointee keep the same
//! relative displacement (i.e. both live in the same segment).
//!
//! # Memory Layout
//!
//! ```text
//!   ┌──────────────────┐            ┌──────────┐
//!   │ offset: isize    │── +off ──► │  target  │
//!   └──────────────────┘            └──────────┘
//!   ^ &self                         ^ &self + off
//! ```
//!
//! # Moves and Copies
//!
//! Rust moves are bitwise, which keeps the stored displacement. That is
//! exactly right when a whole structure (pointer *and* pointee) is moved or
//! byte-copied together, and wrong when the pointer alone changes address.
//! For the latter the pointer offers [`assign_from`](RelocatablePtr::assign_from)
//! and [`take_from`](RelocatablePtr::take_from), which recompute the offset
//! against the destination's own address. The type is deliberately neither
//! `Clone` nor `Copy`.

use crate::Relocatable;
use std::fmt;
use std::marker::PhantomData;
use std::ptr;

/// Offset-based pointer to a `T` located at a fixed displacement from the
/// pointer itself.
#[repr(C)]
pub struct RelocatablePtr<T> {
    /// Byte distance from `self` to the target, or [`Self::NULL_OFFSET`].
    offset: isize,
    _pd: PhantomData<*mut T>,
}

impl<T> RelocatablePtr<T> {
    /// Sentinel offset for the null pointer. No real displacement between two
    /// objects in one address space can reach `isize::MAX`.
    pub const NULL_OFFSET: isize = isize::MAX;

    /// Creates a null pointer.
    pub const fn null() -> Self {
        Self {
            offset: Self::NULL_OFFSET,
            _pd: PhantomData,
        }
    }

    #[inline(always)]
    fn self_addr(&self) -> usize {
        (self as *const Self).addr()
    }

    /// Points `self` at `target`, or at nothing if `target` is null.
    ///
    /// The offset is computed against the current address of `self`; moving
    /// `self` afterwards without moving the target invalidates it.
    #[inline]
    pub fn set(&mut self, target: *const T) {
        self.offset = if target.is_null() {
            Self::NULL_OFFSET
        } else {
            (target.expose_provenance() as isize).wrapping_sub(self.self_addr() as isize)
        };
    }

    /// Resolves the pointer relative to the current address of `self`.
    #[inline]
    pub fn get(&self) -> *mut T {
        if self.offset == Self::NULL_OFFSET {
            return ptr::null_mut();
        }
        ptr::with_exposed_provenance_mut(self.self_addr().wrapping_add_signed(self.offset))
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        self.offset == Self::NULL_OFFSET
    }

    /// Raw displacement to the target, `None` for the null pointer.
    pub fn offset(&self) -> Option<isize> {
        (!self.is_null()).then_some(self.offset)
    }

    /// Resets the pointer to null.
    #[inline]
    pub fn clear(&mut self) {
        self.offset = Self::NULL_OFFSET;
    }

    /// Copy semantics: afterwards `self` points at whatever `other` points at.
    ///
    /// The offset is recomputed from `other`'s resolved target and `self`'s
    /// own address, never copied verbatim.
    #[inline]
    pub fn assign_from(&mut self, other: &Self) {
        self.set(other.get());
    }

    /// Move semantics: `self` takes over `other`'s target and `other` becomes
    /// null.
    #[inline]
    pub fn take_from(&mut self, other: &mut Self) {
        self.assign_from(other);
        other.clear();
    }

    /// Resolves to a shared reference.
    ///
    /// # Safety
    /// The target must be a live, initialised `T` for the chosen lifetime and
    /// must not be mutated through another path meanwhile.
    #[inline]
    pub unsafe fn resolve<'a>(&self) -> Option<&'a T> {
        // SAFETY: upheld by the caller.
        unsafe { self.get().as_ref() }
    }

    /// Resolves to an exclusive reference.
    ///
    /// # Safety
    /// The target must be a live, initialised `T` for the chosen lifetime and
    /// no other reference to it may exist meanwhile.
    #[inline]
    pub unsafe fn resolve_mut<'a>(&self) -> Option<&'a mut T> {
        // SAFETY: upheld by the caller.
        unsafe { self.get().as_mut() }
    }
}

impl<T> Default for RelocatablePtr<T> {
    fn default() -> Self {
        Self::null()
    }
}

/// Two pointers are equal when they resolve to the same address.
impl<T> PartialEq for RelocatablePtr<T> {
    fn eq(&self, other: &Self) -> bool {
        self.get() == other.get()
    }
}

impl<T> Eq for RelocatablePtr<T> {}

impl<T> fmt::Debug for RelocatablePtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.offset() {
            Some(off) => f
                .debug_struct("RelocatablePtr")
                .field("offset", &off)
                .field("target", &self.get())
                .finish(),
            None => f.write_str("RelocatablePtr(null)"),
        }
    }
}

// SAFETY: the pointer stores only a self-relative displacement.
unsafe impl<T> Relocatable for RelocatablePtr<T> {}
