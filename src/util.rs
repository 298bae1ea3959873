use std::mem::size_of;
use std::ptr;

use static_assertions::const_assert;

// On-disk records are copied verbatim, ext2 stores everything little-endian
const_assert!(cfg!(target_endian = "little"));
const_assert!(size_of::<usize>() >= size_of::<u32>());

/// Lossless conversion from u32, which `std` only provides for u64 but not for usize.
pub trait FromU32 {
    fn fromx(n: u32) -> Self;
}

impl FromU32 for usize {
    fn fromx(n: u32) -> Self {
        // cannot truncate, see the `const_assert` above
        n as usize
    }
}

impl FromU32 for u64 {
    fn fromx(n: u32) -> Self {
        u64::from(n)
    }
}

/// Marker for `#[repr(C)]` structs that consist only of integers and integer arrays, so that every bit pattern is a
/// valid value and the in-memory representation is exactly the on-disk one.
/// SAFETY: Implementors must not contain padding, pointers, references or enums.
pub unsafe trait Plain: Copy {}

/// Reads a `T` from the start of `bytes`.
/// PANICS: Panics if `bytes` is shorter than `T`.
pub fn read_plain<T: Plain>(bytes: &[u8]) -> T {
    assert!(bytes.len() >= size_of::<T>(), "Buffer too small to hold the record");
    // SAFETY: the length is checked above, `read_unaligned` has no alignment requirement and `T: Plain` accepts any
    // bit pattern.
    unsafe { ptr::read_unaligned(bytes.as_ptr() as *const T) }
}

/// Writes `value` to the start of `bytes`.
/// PANICS: Panics if `bytes` is shorter than `T`.
pub fn write_plain<T: Plain>(bytes: &mut [u8], value: &T) {
    assert!(bytes.len() >= size_of::<T>(), "Buffer too small to hold the record");
    // SAFETY: the length is checked above and `write_unaligned` has no alignment requirement.
    unsafe { ptr::write_unaligned(bytes.as_mut_ptr() as *mut T, *value) }
}

/// Returns `Some(log2(n))` if `n` is a power of two, `None` otherwise.
pub fn exact_log2(n: u32) -> Option<u8> {
    if n.is_power_of_two() {
        // at most 31, so this fits
        Some(n.trailing_zeros() as u8)
    } else {
        None
    }
}

pub const fn aligned_length(n: usize, alignment: usize) -> usize {
    (n + alignment - 1) / alignment * alignment
}
