//! Stack address probing.

use core::hint::black_box;

/// Returns an address inside the calling function's stack frame.
///
/// The value is only meaningful as a location; it is used to find the TLS block that owns the
/// stack the caller runs on.
#[inline(always)]
pub fn current_stack_addr() -> usize {
    let marker = 0u8;
    black_box(&raw const marker) as usize
}
