//! Allocation, release and discovery of TLS blocks.

use core::ptr::NonNull;

use exo_svc::{
    error::{Errno, ErrorKind, ResultCode, ToRawResultCode},
    mem::{self, MapError, ProtectError, Protection, UnmapError},
};

use crate::{
    layout::{TLS_SIZE, TlsLayout},
    vars::{ThreadVars, USER_AREA_OFFSET},
};

/// Returns the base of the TLS block containing `addr`.
#[inline(always)]
pub const fn block_base(addr: usize) -> usize {
    addr & !(TLS_SIZE - 1)
}

/// Handle to a TLS block.
///
/// The handle is a plain address; it does not own the block. A block is released exactly once
/// with [`ThreadLocalBlock::free`] by whoever called [`ThreadLocalBlock::init`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(transparent)]
pub struct ThreadLocalBlock(NonNull<u8>);

// SAFETY: The handle is an address; shared state inside the block is synchronized by
// `ThreadVars`.
unsafe impl Send for ThreadLocalBlock {}
unsafe impl Sync for ThreadLocalBlock {}

impl ThreadLocalBlock {
    /// Allocates a block of [`TLS_SIZE`] bytes aligned to [`TLS_SIZE`], installs its guard pages
    /// and initializes its [`ThreadVars`].
    ///
    /// On failure every partial allocation is released and the first error is returned.
    pub fn init() -> Result<Self, TlsInitError> {
        let layout = TlsLayout::current();
        if !layout.fits() {
            return Err(TlsInitError::LayoutTooLarge);
        }

        // Over-allocate so an aligned block is guaranteed to exist inside the mapping.
        let span = 2 * TLS_SIZE;
        let region = mem::map(span)?;
        let region_start = region.as_ptr() as usize;
        let base = (region_start + TLS_SIZE - 1) & !(TLS_SIZE - 1);

        let head = base - region_start;
        let tail = span - head - TLS_SIZE;

        // SAFETY: All ranges below lie inside `region`, which nothing else references yet.
        unsafe {
            if head != 0 {
                if let Err(err) = mem::unmap(region, head) {
                    let _ = mem::unmap(region, span);
                    return Err(err.into());
                }
            }
            let block = NonNull::new_unchecked(base as *mut u8);
            if tail != 0 {
                let tail_start = NonNull::new_unchecked((base + TLS_SIZE) as *mut u8);
                if let Err(err) = mem::unmap(tail_start, tail) {
                    let _ = mem::unmap(block, TLS_SIZE + tail);
                    return Err(err.into());
                }
            }

            for (offset, size) in layout.guards() {
                let guard = NonNull::new_unchecked((base + offset) as *mut u8);
                if let Err(err) = mem::protect(guard, size, Protection::NONE) {
                    let _ = mem::unmap(block, TLS_SIZE);
                    return Err(err.into());
                }
            }

            block.cast::<ThreadVars>().write(ThreadVars::new());
        }

        log::trace!("tls: allocated block at {base:#x}");
        Ok(Self(
            // SAFETY: `base` is inside a successful mapping, hence non-null.
            unsafe { NonNull::new_unchecked(base as *mut u8) },
        ))
    }

    /// Releases the block together with its guard pages.
    ///
    /// # Safety
    ///
    /// No thread may run on, or reference, any part of the block afterwards. The calling thread
    /// must not be executing on this block's stacks.
    pub unsafe fn free(self) -> Result<(), TlsFreeError> {
        log::trace!("tls: releasing block at {:#x}", self.base());
        // SAFETY: The caller guarantees nothing references the block anymore.
        unsafe { mem::unmap(self.0, TLS_SIZE) }.map_err(TlsFreeError::from)
    }

    /// Returns the block the caller is running on.
    ///
    /// Computed by masking the address of a stack-local variable.
    ///
    /// # Safety
    ///
    /// The caller must be executing on the thread stack or signal stack of a live TLS block.
    /// Otherwise the returned handle points at unrelated memory.
    #[inline(always)]
    pub unsafe fn current() -> Self {
        // SAFETY: The masked address of a mapped stack is non-null.
        unsafe { Self::from_addr(exo_cpu::stack::current_stack_addr()) }
    }

    /// Returns the block containing `addr`.
    ///
    /// # Safety
    ///
    /// `addr` must lie inside a live TLS block.
    #[inline(always)]
    pub unsafe fn from_addr(addr: usize) -> Self {
        // SAFETY: The caller guarantees `addr` lies inside a block, whose base is non-null.
        Self(unsafe { NonNull::new_unchecked(block_base(addr) as *mut u8) })
    }

    /// Base address of the block.
    #[inline]
    pub fn base(&self) -> usize {
        self.0.as_ptr() as usize
    }

    /// Returns `true` if `addr` lies inside this block.
    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        block_base(addr) == self.base()
    }

    /// The block's [`ThreadVars`].
    #[inline]
    pub fn thread_vars(&self) -> &'static ThreadVars {
        // SAFETY: `ThreadVars` is written at offset 0 by `init` and lives as long as the block.
        unsafe { self.0.cast::<ThreadVars>().as_ref() }
    }

    /// The user area of the variables segment as `(start, size)`.
    pub fn user_area(&self) -> (NonNull<u8>, usize) {
        let layout = TlsLayout::current();
        // SAFETY: The offset is inside the variables segment.
        let start = unsafe { self.0.add(USER_AREA_OFFSET) };
        (start, layout.vars_size - USER_AREA_OFFSET)
    }

    /// The alternate signal stack segment as `(start, size)`.
    pub fn signal_stack(&self) -> (NonNull<u8>, usize) {
        let layout = TlsLayout::current();
        // SAFETY: The offset is inside the block.
        let start = unsafe { self.0.add(layout.signal_stack_offset) };
        (start, layout.signal_stack_size)
    }

    /// The primary thread stack segment as `(start, size)`. Stacks grow downwards, so the first
    /// frame lives near `start + size`.
    pub fn thread_stack(&self) -> (NonNull<u8>, usize) {
        let layout = TlsLayout::current();
        // SAFETY: The offset is inside the block.
        let start = unsafe { self.0.add(layout.thread_stack_offset) };
        (start, layout.thread_stack_size)
    }
}

/// Error type for [`ThreadLocalBlock::init`].
#[derive(Debug, thiserror::Error)]
pub enum TlsInitError {
    /// The segments do not fit into [`TLS_SIZE`] with this page size.
    #[error("TLS layout exceeds block size")]
    LayoutTooLarge,
    /// Not enough memory or address space.
    #[error("Out of memory")]
    OutOfMemory,
    /// A guard page could not be installed.
    #[error("Failed to install guard page: {0}")]
    ProtectFailed(ProtectError),
    /// Any other errno.
    #[error("Unknown error: {0}")]
    Unknown(Errno),
}

impl From<MapError> for TlsInitError {
    fn from(value: MapError) -> Self {
        match value {
            MapError::OutOfMemory => Self::OutOfMemory,
            MapError::InvalidSize => Self::LayoutTooLarge,
            MapError::Unknown(err) => Self::Unknown(err),
        }
    }
}

impl From<UnmapError> for TlsInitError {
    fn from(value: UnmapError) -> Self {
        match value {
            UnmapError::Unaligned => Self::LayoutTooLarge,
            UnmapError::Unknown(err) => Self::Unknown(err),
        }
    }
}

impl From<ProtectError> for TlsInitError {
    fn from(value: ProtectError) -> Self {
        match value {
            ProtectError::OutOfMemory => Self::OutOfMemory,
            err => Self::ProtectFailed(err),
        }
    }
}

impl ToRawResultCode for TlsInitError {
    fn to_rc(self) -> ResultCode {
        match self {
            Self::LayoutTooLarge => ErrorKind::InvalidArgument.to_rc(),
            Self::OutOfMemory => ErrorKind::OutOfMemory.to_rc(),
            Self::ProtectFailed(_) => ErrorKind::ProtectFailed.to_rc(),
            Self::Unknown(err) => err.to_rc(),
        }
    }
}

/// Error type for [`ThreadLocalBlock::free`].
#[derive(Debug, thiserror::Error)]
pub enum TlsFreeError {
    /// Releasing the mapping failed.
    #[error("Failed to unmap TLS block: {0}")]
    Unmap(#[from] UnmapError),
}

impl ToRawResultCode for TlsFreeError {
    fn to_rc(self) -> ResultCode {
        match self {
            Self::Unmap(err) => err.to_rc(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_base_masks_every_offset() {
        let probes = |page: usize| [0, 1, page - 1, page, TLS_SIZE / 2, TLS_SIZE - 2, TLS_SIZE - 1];
        let page = mem::page_size();
        let first = 0x7f00_0000_0000usize & !(TLS_SIZE - 1);

        for i in 0..10_000 {
            let base = first + i * TLS_SIZE;
            for k in probes(page) {
                assert_eq!(block_base(base + k), base);
            }
            assert_eq!(block_base(base + TLS_SIZE), base + TLS_SIZE);
        }
    }

    #[test]
    fn test_init_aligned_and_free() {
        let block = ThreadLocalBlock::init().expect("tls init");

        assert_eq!(block.base() % TLS_SIZE, 0);
        assert!(block.thread_vars().is_initialized());
        for offset in 0..TLS_SIZE {
            assert!(block.contains(block.base() + offset));
        }
        assert!(!block.contains(block.base() + TLS_SIZE));

        // SAFETY: Nothing runs on the block.
        unsafe { block.free() }.expect("tls free");
    }

    #[test]
    fn test_segments_inside_block_and_writable() {
        let block = ThreadLocalBlock::init().expect("tls init");

        for (start, size) in [block.user_area(), block.signal_stack(), block.thread_stack()] {
            let start_addr = start.as_ptr() as usize;
            assert!(block.contains(start_addr));
            assert!(block.contains(start_addr + size - 1));
            // SAFETY: The segments are mapped read/write.
            unsafe {
                start.as_ptr().write(0xA5);
                start.as_ptr().add(size - 1).write(0x5A);
            }
        }

        let (stack, _) = block.thread_stack();
        // SAFETY: `stack` points into the block's live thread stack.
        let found = unsafe { ThreadLocalBlock::from_addr(stack.as_ptr() as usize + 100) };
        assert_eq!(found, block);

        // SAFETY: Nothing runs on the block.
        unsafe { block.free() }.expect("tls free");
    }
}
