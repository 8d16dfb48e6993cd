//! Typed atomic primitives.
//!
//! Every operation on shared state outside an OS mutex goes through one of these functions. They
//! are implemented for the native integer widths (8/32/64 bits and pointer sized) and, where the
//! operation makes sense, for raw pointers.
//!
//! | Operation | Ordering |
//! |-----------|----------|
//! | [`Atomic::read`] | acquire |
//! | [`Atomic::write`] | sequentially consistent (full fence) |
//! | [`Atomic::compare_swap`] | sequentially consistent (full fence) |
//! | [`AtomicInt::add`] / [`AtomicInt::sub`] | sequentially consistent (full fence) |
//! | [`set_flag`] | acquire |
//! | [`clear_flag`] | release |
//!
//! A [`set_flag`] that observes a flag released by [`clear_flag`] on another thread establishes
//! a happens-before edge from everything the releasing thread wrote before the clear.

use core::sync::atomic::{
    AtomicI32, AtomicI64, AtomicPtr, AtomicU8, AtomicU32, AtomicU64, AtomicUsize, Ordering,
};

/// Load/store/compare-and-swap on an atomic cell.
pub trait Atomic {
    /// The plain value stored in the cell.
    type Value: Copy + PartialEq;

    /// Loads the value with acquire ordering.
    fn read(&self) -> Self::Value;

    /// Stores `value` and returns the value it replaced.
    ///
    /// Implemented as a compare-and-swap loop that retries until the observed old value is the
    /// one replaced.
    fn write(&self, value: Self::Value) -> Self::Value;

    /// Stores `new` if the cell holds `expected`.
    ///
    /// Returns the value observed before the operation; the swap happened iff it equals
    /// `expected`.
    fn compare_swap(&self, expected: Self::Value, new: Self::Value) -> Self::Value;
}

/// Wrapping arithmetic on an atomic integer cell.
pub trait AtomicInt: Atomic {
    /// Adds `value` and returns the previous value.
    fn add(&self, value: Self::Value) -> Self::Value;

    /// Subtracts `value` and returns the previous value.
    fn sub(&self, value: Self::Value) -> Self::Value;
}

macro_rules! impl_atomic_int {
    ($($atomic:ty => $value:ty),* $(,)?) => {$(
        impl Atomic for $atomic {
            type Value = $value;

            #[inline]
            fn read(&self) -> $value {
                self.load(Ordering::Acquire)
            }

            #[inline]
            fn write(&self, value: $value) -> $value {
                let mut old = self.load(Ordering::Relaxed);
                loop {
                    match self.compare_exchange_weak(old, value, Ordering::SeqCst, Ordering::Relaxed) {
                        Ok(prev) => return prev,
                        Err(current) => old = current,
                    }
                }
            }

            #[inline]
            fn compare_swap(&self, expected: $value, new: $value) -> $value {
                match self.compare_exchange(expected, new, Ordering::SeqCst, Ordering::SeqCst) {
                    Ok(prev) | Err(prev) => prev,
                }
            }
        }

        impl AtomicInt for $atomic {
            #[inline]
            fn add(&self, value: $value) -> $value {
                self.fetch_add(value, Ordering::SeqCst)
            }

            #[inline]
            fn sub(&self, value: $value) -> $value {
                self.fetch_sub(value, Ordering::SeqCst)
            }
        }
    )*};
}

impl_atomic_int! {
    AtomicU8 => u8,
    AtomicU32 => u32,
    AtomicU64 => u64,
    AtomicUsize => usize,
    AtomicI32 => i32,
    AtomicI64 => i64,
}

impl<T> Atomic for AtomicPtr<T> {
    type Value = *mut T;

    #[inline]
    fn read(&self) -> *mut T {
        self.load(Ordering::Acquire)
    }

    #[inline]
    fn write(&self, value: *mut T) -> *mut T {
        let mut old = self.load(Ordering::Relaxed);
        loop {
            match self.compare_exchange_weak(old, value, Ordering::SeqCst, Ordering::Relaxed) {
                Ok(prev) => return prev,
                Err(current) => old = current,
            }
        }
    }

    #[inline]
    fn compare_swap(&self, expected: *mut T, new: *mut T) -> *mut T {
        match self.compare_exchange(expected, new, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(prev) | Err(prev) => prev,
        }
    }
}

/// Sets a lock flag byte.
///
/// Returns `true` if the flag was already set, in which case the caller did not acquire it.
#[inline]
pub fn set_flag(flag: &AtomicU8) -> bool {
    flag.swap(1, Ordering::Acquire) != 0
}

/// Clears a lock flag byte previously acquired with [`set_flag`].
#[inline]
pub fn clear_flag(flag: &AtomicU8) {
    flag.store(0, Ordering::Release);
}

#[cfg(test)]
mod tests {
    use core::ptr;
    use std::{sync::Arc, thread};

    use super::*;

    #[test]
    fn test_write_returns_prior() {
        let cell = AtomicU32::new(7);
        assert_eq!(cell.write(9), 7);
        assert_eq!(cell.read(), 9);
    }

    #[test]
    fn test_add_sub_return_prior_and_wrap() {
        let cell = AtomicU8::new(u8::MAX);
        assert_eq!(cell.add(1), u8::MAX);
        assert_eq!(cell.read(), 0);
        assert_eq!(cell.sub(1), 0);
        assert_eq!(cell.read(), u8::MAX);
    }

    #[test]
    fn test_swap_only_on_expected() {
        let cell = AtomicI64::new(-3);
        assert_eq!(cell.compare_swap(5, 10), -3);
        assert_eq!(cell.read(), -3);
        assert_eq!(cell.compare_swap(-3, 10), -3);
        assert_eq!(cell.read(), 10);
    }

    #[test]
    fn test_pointer_cell() {
        let mut value = 1u32;
        let cell = AtomicPtr::new(ptr::null_mut::<u32>());
        assert!(cell.write(&mut value).is_null());
        assert_eq!(cell.compare_swap(ptr::null_mut(), ptr::null_mut()), &raw mut value);
        assert_eq!(cell.read(), &raw mut value);
    }

    #[test]
    fn test_flag_set_clear() {
        let flag = AtomicU8::new(0);
        assert!(!set_flag(&flag));
        assert!(set_flag(&flag));
        clear_flag(&flag);
        assert!(!set_flag(&flag));
    }

    #[test]
    fn test_flag_guards_counter_across_threads() {
        struct Shared {
            flag: AtomicU8,
            counter: core::cell::UnsafeCell<u64>,
        }
        // SAFETY: `counter` is only touched while `flag` is held.
        unsafe impl Sync for Shared {}

        let shared = Arc::new(Shared {
            flag: AtomicU8::new(0),
            counter: core::cell::UnsafeCell::new(0),
        });

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let shared = Arc::clone(&shared);
                thread::spawn(move || {
                    for _ in 0..10_000 {
                        while set_flag(&shared.flag) {
                            core::hint::spin_loop();
                        }
                        // SAFETY: The flag is held.
                        unsafe { *shared.counter.get() += 1 };
                        clear_flag(&shared.flag);
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        // SAFETY: All workers have been joined.
        assert_eq!(unsafe { *shared.counter.get() }, 40_000);
    }
}
