//! Marker for types that may live inside a shared-memory segment.
//!
//! A segment is mapped at a different virtual address in every process that
//! opens it, and the creating process may even copy a whole segment image
//! byte-for-byte. Only values whose logical state survives such a raw copy
//! may be placed there: no heap handles, no absolute pointers, no file
//! descriptors.

/// Types whose state is preserved by a raw byte copy to another address.
///
/// # Safety
/// Implementors must not contain absolute addresses (references, `Box`,
/// `Vec`, raw pointers into other allocations) or process-local handles.
/// Self-relative offsets (see [`RelocatablePtr`](crate::RelocatablePtr))
/// are fine as long as the pointee is moved together with the pointer.
pub unsafe trait Relocatable {}

macro_rules! relocatable {
    ($($t:ty),* $(,)?) => {
        $(unsafe impl Relocatable for $t {})*
    };
}

relocatable!(
    u8, u16, u32, u64, u128, usize, i8, i16, i32, i64, i128, isize, f32, f64, bool, char, (),
);

unsafe impl<T: Relocatable, const N: usize> Relocatable for [T; N] {}
unsafe impl<A: Relocatable, B: Relocatable> Relocatable for (A, B) {}
unsafe impl<A: Relocatable, B: Relocatable, C: Relocatable> Relocatable for (A, B, C) {}
unsafe impl<T: Relocatable> Relocatable for core::mem::MaybeUninit<T> {}
unsafe impl<T: Relocatable> Relocatable for core::cell::UnsafeCell<T> {}

unsafe impl Relocatable for core::sync::atomic::AtomicBool {}
unsafe impl Relocatable for core::sync::atomic::AtomicU32 {}
unsafe impl Relocatable for core::sync::atomic::AtomicU64 {}
unsafe impl Relocatable for core::sync::atomic::AtomicUsize {}
