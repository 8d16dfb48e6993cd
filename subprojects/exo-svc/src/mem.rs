//! Page-granular virtual memory.
//!
//! Regions are anonymous, private mappings. All sizes passed to [`protect`] and [`unmap`] must be
//! multiples of [`page_size`], and addresses must be page aligned.

use core::{
    ffi::c_void,
    ptr::{self, NonNull},
    sync::atomic::{AtomicUsize, Ordering},
};

use crate::error::{Errno, ErrorKind, ResultCode, ToRawResultCode};

/// Fallback page size used if `sysconf` cannot report one.
const DEFAULT_PAGE_SIZE: usize = 4096;

static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

/// Returns the size of a virtual memory page in bytes.
///
/// The value is read once from `sysconf(_SC_PAGESIZE)` and cached.
pub fn page_size() -> usize {
    let cached = PAGE_SIZE.load(Ordering::Relaxed);
    if cached != 0 {
        return cached;
    }

    // SAFETY: `sysconf` has no memory safety preconditions.
    let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    let size = if raw > 0 && (raw as usize).is_power_of_two() {
        raw as usize
    } else {
        DEFAULT_PAGE_SIZE
    };
    PAGE_SIZE.store(size, Ordering::Relaxed);
    size
}

/// Rounds `size` up to the next multiple of the page size.
#[inline]
pub fn round_up_to_page(size: usize) -> usize {
    let mask = page_size() - 1;
    (size + mask) & !mask
}

/// Returns `true` if `value` is a multiple of the page size.
#[inline]
pub fn is_page_aligned(value: usize) -> bool {
    value & (page_size() - 1) == 0
}

bitflags::bitflags! {
    /// Access permissions of a mapped region.
    ///
    /// The empty set strips all access; that is how guard pages are made.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct Protection: u32 {
        /// The region may be read.
        const READ = 1 << 0;
        /// The region may be written.
        const WRITE = 1 << 1;
    }
}

impl Protection {
    /// No access at all.
    pub const NONE: Protection = Protection::empty();

    fn to_prot(self) -> libc::c_int {
        let mut prot = libc::PROT_NONE;
        if self.contains(Protection::READ) {
            prot |= libc::PROT_READ;
        }
        if self.contains(Protection::WRITE) {
            prot |= libc::PROT_WRITE;
        }
        prot
    }
}

/// Maps `size` bytes of zeroed, read/write memory.
///
/// `size` must be a non-zero multiple of [`page_size`].
pub fn map(size: usize) -> Result<NonNull<u8>, MapError> {
    if size == 0 || !is_page_aligned(size) {
        return Err(MapError::InvalidSize);
    }

    // SAFETY: An anonymous private mapping with a null hint has no preconditions.
    let addr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if addr == libc::MAP_FAILED {
        return Err(match Errno::last().to_raw() {
            libc::ENOMEM => MapError::OutOfMemory,
            libc::EINVAL => MapError::InvalidSize,
            raw => MapError::Unknown(Errno::from_raw(raw)),
        });
    }

    NonNull::new(addr.cast::<u8>()).ok_or(MapError::OutOfMemory)
}

/// Error type for [`map`].
#[derive(Debug, thiserror::Error)]
pub enum MapError {
    /// The size is zero or not page aligned.
    #[error("Invalid mapping size")]
    InvalidSize,
    /// The address space or memory is exhausted.
    #[error("Out of memory")]
    OutOfMemory,
    /// Any other errno.
    #[error("Unknown error: {0}")]
    Unknown(Errno),
}

impl ToRawResultCode for MapError {
    fn to_rc(self) -> ResultCode {
        match self {
            Self::InvalidSize => ErrorKind::InvalidArgument.to_rc(),
            Self::OutOfMemory => ErrorKind::OutOfMemory.to_rc(),
            Self::Unknown(err) => err.to_rc(),
        }
    }
}

/// Changes the access permissions of `size` bytes at `addr`.
///
/// # Safety
///
/// `addr..addr + size` must lie inside a region returned by [`map`]. Removing access from
/// memory that is still referenced turns every later access into a fault.
pub unsafe fn protect(addr: NonNull<u8>, size: usize, prot: Protection) -> Result<(), ProtectError> {
    if !is_page_aligned(addr.as_ptr() as usize) || !is_page_aligned(size) {
        return Err(ProtectError::Unaligned);
    }

    // SAFETY: The caller guarantees the range belongs to a live mapping.
    let rc = unsafe { libc::mprotect(addr.as_ptr().cast::<c_void>(), size, prot.to_prot()) };
    if rc != 0 {
        return Err(match Errno::last().to_raw() {
            libc::ENOMEM => ProtectError::OutOfMemory,
            libc::EACCES | libc::EINVAL => ProtectError::Denied,
            raw => ProtectError::Unknown(Errno::from_raw(raw)),
        });
    }

    Ok(())
}

/// Error type for [`protect`].
#[derive(Debug, thiserror::Error)]
pub enum ProtectError {
    /// Address or size are not page aligned.
    #[error("Unaligned protection range")]
    Unaligned,
    /// The kernel could not split the mapping.
    #[error("Out of memory")]
    OutOfMemory,
    /// The requested protection is not permitted for the range.
    #[error("Protection change denied")]
    Denied,
    /// Any other errno.
    #[error("Unknown error: {0}")]
    Unknown(Errno),
}

impl ToRawResultCode for ProtectError {
    fn to_rc(self) -> ResultCode {
        match self {
            Self::Unaligned => ErrorKind::InvalidArgument.to_rc(),
            Self::OutOfMemory => ErrorKind::OutOfMemory.to_rc(),
            Self::Denied => ErrorKind::ProtectFailed.to_rc(),
            Self::Unknown(err) => err.to_rc(),
        }
    }
}

/// Unmaps `size` bytes at `addr`.
///
/// # Safety
///
/// Nothing may reference the range after this call.
pub unsafe fn unmap(addr: NonNull<u8>, size: usize) -> Result<(), UnmapError> {
    if !is_page_aligned(addr.as_ptr() as usize) || size == 0 || !is_page_aligned(size) {
        return Err(UnmapError::Unaligned);
    }

    // SAFETY: The caller guarantees exclusive ownership of the range.
    let rc = unsafe { libc::munmap(addr.as_ptr().cast::<c_void>(), size) };
    if rc != 0 {
        return Err(UnmapError::Unknown(Errno::last()));
    }

    Ok(())
}

/// Error type for [`unmap`].
#[derive(Debug, thiserror::Error)]
pub enum UnmapError {
    /// Address or size are not page aligned, or the size is zero.
    #[error("Unaligned unmap range")]
    Unaligned,
    /// Any other errno.
    #[error("Unknown error: {0}")]
    Unknown(Errno),
}

impl ToRawResultCode for UnmapError {
    fn to_rc(self) -> ResultCode {
        match self {
            Self::Unaligned => ErrorKind::InvalidArgument.to_rc(),
            Self::Unknown(err) => err.to_rc(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_size_is_power_of_two() {
        let size = page_size();
        assert!(size.is_power_of_two());
        assert!(size >= 4096);
        assert_eq!(round_up_to_page(1), size);
        assert_eq!(round_up_to_page(size), size);
        assert_eq!(round_up_to_page(size + 1), 2 * size);
    }

    #[test]
    fn test_map_rejects_unaligned_size() {
        assert!(matches!(map(0), Err(MapError::InvalidSize)));
        assert!(matches!(map(page_size() + 1), Err(MapError::InvalidSize)));
    }

    #[test]
    fn test_map_write_unmap() {
        let size = 2 * page_size();
        let addr = map(size).expect("map");

        // SAFETY: The region is freshly mapped read/write.
        unsafe {
            assert_eq!(*addr.as_ptr(), 0);
            addr.as_ptr().add(size - 1).write(0xAB);
            assert_eq!(*addr.as_ptr().add(size - 1), 0xAB);
        }

        // SAFETY: The second page is part of the mapping and no longer used.
        unsafe {
            let second = NonNull::new_unchecked(addr.as_ptr().add(page_size()));
            protect(second, page_size(), Protection::NONE).expect("protect");
            unmap(addr, size).expect("unmap");
        }
    }
}
