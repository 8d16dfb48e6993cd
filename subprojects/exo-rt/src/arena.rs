//! Static bump arena for process-lifetime objects.
//!
//! The arena hands out memory from a fixed region in strict LIFO order: only the most recent
//! allocation can be released. It records the current fill level and its high-water mark, and
//! nothing else.

use core::{fmt, ops::Deref, ptr::NonNull};

use exo_svc::error::{ErrorKind, ResultCode, ToRawResultCode};

use crate::config::round_up;

/// Alignment of every arena allocation.
pub const ARENA_ALIGN: usize = 16;

/// A LIFO bump allocator over a borrowed region.
pub struct StaticArena {
    base: usize,
    capacity: usize,
    used: usize,
    high_water: usize,
}

// SAFETY: The arena is only an address range plus counters; mutation requires `&mut`.
unsafe impl Send for StaticArena {}
unsafe impl Sync for StaticArena {}

impl StaticArena {
    /// An arena with no backing memory.
    pub const fn empty() -> Self {
        Self {
            base: 0,
            capacity: 0,
            used: 0,
            high_water: 0,
        }
    }

    /// An arena over `start..start + size`. The start is rounded up to [`ARENA_ALIGN`].
    ///
    /// # Safety
    ///
    /// The region must be writable and unused by anything else for as long as the arena or any
    /// of its allocations is alive.
    pub unsafe fn new(start: NonNull<u8>, size: usize) -> Self {
        let addr = start.as_ptr() as usize;
        let base = round_up(addr, ARENA_ALIGN);
        Self {
            base,
            capacity: size.saturating_sub(base - addr) & !(ARENA_ALIGN - 1),
            used: 0,
            high_water: 0,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn used(&self) -> usize {
        self.used
    }

    /// Largest fill level seen.
    #[inline]
    pub fn high_water(&self) -> usize {
        self.high_water
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    /// Returns `true` for an arena with no backing memory.
    #[inline]
    pub fn is_static(&self) -> bool {
        self.base == 0
    }

    /// Allocates `size` bytes, rounded up to [`ARENA_ALIGN`].
    pub fn alloc(&mut self, size: usize) -> Result<NonNull<u8>, ArenaError> {
        let size = round_up(size.max(1), ARENA_ALIGN);
        if size > self.capacity - self.used {
            return Err(ArenaError::Exhausted);
        }
        let addr = self.base + self.used;
        self.used += size;
        self.high_water = self.high_water.max(self.used);
        // SAFETY: `base` is non-zero for an arena with capacity.
        Ok(unsafe { NonNull::new_unchecked(addr as *mut u8) })
    }

    /// Releases the last `size` bytes allocated, rounded up like [`alloc`](Self::alloc).
    ///
    /// The arena cannot tell allocations apart: the caller must free in reverse allocation
    /// order.
    pub fn free(&mut self, size: usize) -> Result<(), ArenaError> {
        let size = round_up(size.max(1), ARENA_ALIGN);
        if size > self.used {
            return Err(ArenaError::Underflow);
        }
        self.used -= size;
        Ok(())
    }

    /// Moves `value` into the arena.
    pub fn alloc_value<T>(&mut self, value: T) -> Result<ArenaBox<T>, ArenaError> {
        static_assertions::const_assert!(ARENA_ALIGN.is_power_of_two());
        if align_of::<T>() > ARENA_ALIGN {
            return Err(ArenaError::Misaligned);
        }
        let ptr = self.alloc(size_of::<T>())?.cast::<T>();
        // SAFETY: Fresh, aligned, writable memory of the right size.
        unsafe { ptr.write(value) };
        Ok(ArenaBox { ptr })
    }

    /// Drops a value allocated with [`alloc_value`](Self::alloc_value) and releases its memory.
    ///
    /// Fails with [`ArenaError::NotLast`] unless `value` is the most recent allocation; the value
    /// is handed back untouched in that case.
    pub fn release<T>(&mut self, value: ArenaBox<T>) -> Result<(), (ArenaError, ArenaBox<T>)> {
        let size = round_up(size_of::<T>().max(1), ARENA_ALIGN);
        if value.ptr.as_ptr() as usize + size != self.base + self.used {
            return Err((ArenaError::NotLast, value));
        }
        // SAFETY: The value is initialized and owned by `value`, which is consumed here.
        unsafe { value.ptr.drop_in_place() };
        self.used -= size;
        Ok(())
    }
}

impl fmt::Debug for StaticArena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticArena")
            .field("base", &format_args!("{:#x}", self.base))
            .field("capacity", &self.capacity)
            .field("used", &self.used)
            .field("high_water", &self.high_water)
            .finish()
    }
}

/// An owning pointer to a value in a [`StaticArena`].
///
/// Dropping an `ArenaBox` leaks the value; give it back with [`StaticArena::release`].
#[must_use = "arena values must be released to their arena"]
pub struct ArenaBox<T> {
    ptr: NonNull<T>,
}

// SAFETY: `ArenaBox<T>` owns its `T` like a `Box<T>`.
unsafe impl<T: Send> Send for ArenaBox<T> {}
unsafe impl<T: Sync> Sync for ArenaBox<T> {}

impl<T> Deref for ArenaBox<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: The value is initialized until released.
        unsafe { self.ptr.as_ref() }
    }
}

impl<T: fmt::Debug> fmt::Debug for ArenaBox<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

/// Error type for arena operations.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ArenaError {
    #[error("Arena exhausted")]
    Exhausted,
    #[error("Arena free exceeds allocated size")]
    Underflow,
    #[error("Arena release out of LIFO order")]
    NotLast,
    #[error("Type alignment exceeds arena alignment")]
    Misaligned,
}

impl ToRawResultCode for ArenaError {
    fn to_rc(self) -> ResultCode {
        match self {
            Self::Exhausted => ErrorKind::OutOfMemory.to_rc(),
            Self::Underflow | Self::NotLast => ErrorKind::InvalidState.to_rc(),
            Self::Misaligned => ErrorKind::InvalidArgument.to_rc(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::Cell, rc::Rc};

    use super::*;

    #[repr(align(16))]
    struct Region([u8; 256]);

    fn arena_over(region: &mut Region) -> StaticArena {
        // SAFETY: The region outlives the arena in each test.
        unsafe { StaticArena::new(NonNull::from(&mut region.0).cast(), region.0.len()) }
    }

    #[test]
    fn test_alloc_rounds_and_tracks_high_water() {
        let mut region = Region([0; 256]);
        let mut arena = arena_over(&mut region);

        let a = arena.alloc(1).unwrap();
        let b = arena.alloc(17).unwrap();
        assert_eq!(a.as_ptr() as usize % ARENA_ALIGN, 0);
        assert_eq!(b.as_ptr() as usize - a.as_ptr() as usize, 16);
        assert_eq!(arena.used(), 48);

        arena.free(17).unwrap();
        arena.free(1).unwrap();
        assert!(arena.is_empty());
        assert_eq!(arena.high_water(), 48);
    }

    #[test]
    fn test_alloc_beyond_capacity_fails() {
        let mut region = Region([0; 256]);
        let mut arena = arena_over(&mut region);

        arena.alloc(240).unwrap();
        assert_eq!(arena.alloc(32), Err(ArenaError::Exhausted));
        assert_eq!(arena.used(), 240);
        assert_eq!(arena.free(512), Err(ArenaError::Underflow));
    }

    #[test]
    fn test_release_enforces_lifo_and_drops() {
        struct Tracked(Rc<Cell<u32>>);
        impl Drop for Tracked {
            fn drop(&mut self) {
                self.0.set(self.0.get() + 1);
            }
        }

        let drops = Rc::new(Cell::new(0));
        let mut region = Region([0; 256]);
        let mut arena = arena_over(&mut region);

        let first = arena.alloc_value(Tracked(Rc::clone(&drops))).unwrap();
        let second = arena.alloc_value(Tracked(Rc::clone(&drops))).unwrap();

        let (err, first) = arena.release(first).unwrap_err();
        assert_eq!(err, ArenaError::NotLast);
        assert_eq!(drops.get(), 0);

        assert!(arena.release(second).is_ok());
        assert!(arena.release(first).is_ok());
        assert_eq!(drops.get(), 2);
        assert!(arena.is_empty());
    }

    #[test]
    fn test_empty_arena_rejects_alloc() {
        let mut arena = StaticArena::empty();
        assert!(arena.is_static());
        assert_eq!(arena.alloc(1), Err(ArenaError::Exhausted));
    }
}
