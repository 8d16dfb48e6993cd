//! Per-thread byte allocation with accounting.

use core::{alloc::Layout, cell::Cell, ptr::NonNull};

use exo_svc::error::ErrorKind;

use crate::error::RtError;

/// Alignment of every allocation.
pub const MM_ALIGN: usize = 16;

/// General-purpose allocator front end that keeps per-thread usage counters.
#[derive(Debug, Default)]
pub struct Mm {
    live_bytes: Cell<usize>,
    live_allocs: Cell<usize>,
    peak_bytes: Cell<usize>,
}

impl Mm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates `size` bytes aligned to [`MM_ALIGN`].
    pub fn alloc(&self, size: usize) -> Result<NonNull<u8>, RtError> {
        let layout = layout(size)?;
        // SAFETY: `layout` has a non-zero size.
        let ptr = NonNull::new(unsafe { std::alloc::alloc(layout) }).ok_or(ErrorKind::OutOfMemory)?;

        let live = self.live_bytes.get() + layout.size();
        self.live_bytes.set(live);
        self.live_allocs.set(self.live_allocs.get() + 1);
        self.peak_bytes.set(self.peak_bytes.get().max(live));
        Ok(ptr)
    }

    /// Releases an allocation.
    ///
    /// # Safety
    ///
    /// `ptr` must come from [`alloc`](Self::alloc) on this `Mm` with the same `size`, and must
    /// not be used afterwards.
    pub unsafe fn free(&self, ptr: NonNull<u8>, size: usize) {
        let Ok(layout) = layout(size) else {
            return;
        };
        // SAFETY: Forwarded from the caller.
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
        self.live_bytes.set(self.live_bytes.get() - layout.size());
        self.live_allocs.set(self.live_allocs.get() - 1);
    }

    pub fn live_bytes(&self) -> usize {
        self.live_bytes.get()
    }

    pub fn live_allocs(&self) -> usize {
        self.live_allocs.get()
    }

    pub fn peak_bytes(&self) -> usize {
        self.peak_bytes.get()
    }
}

fn layout(size: usize) -> Result<Layout, RtError> {
    Layout::from_size_align(size.max(1), MM_ALIGN).map_err(|_| ErrorKind::InvalidArgument.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accounting_follows_alloc_and_free() {
        let mm = Mm::new();

        let a = mm.alloc(10).unwrap();
        let b = mm.alloc(100).unwrap();
        assert_eq!(a.as_ptr() as usize % MM_ALIGN, 0);
        assert_eq!(mm.live_allocs(), 2);
        assert_eq!(mm.live_bytes(), 110);

        // SAFETY: Both pointers come from `mm` and are not used again.
        unsafe {
            mm.free(b, 100);
            mm.free(a, 10);
        }
        assert_eq!(mm.live_allocs(), 0);
        assert_eq!(mm.live_bytes(), 0);
        assert_eq!(mm.peak_bytes(), 110);
    }

    #[test]
    fn test_oversized_request_rejected() {
        let mm = Mm::new();
        assert!(mm.alloc(usize::MAX).is_err());
        assert_eq!(mm.live_allocs(), 0);
    }
}
