//! Error-checking futex mutex.
//!
//! The lock word follows the classic three-state protocol:
//!
//! - `0`: unlocked
//! - `1`: locked, no waiters
//! - `2`: locked, waiters may be sleeping on the futex
//!
//! The owner's kernel thread id is recorded so that a relock by the owner is reported as
//! [`MutexLockError::Deadlock`] and an unlock by anyone else as [`MutexUnlockError::NotOwner`].
//! The mutex works on any OS thread; it does not need a TLS block.

use core::sync::atomic::{AtomicI32, AtomicU32, Ordering};

use exo_svc::{
    error::{ErrorKind, ResultCode, ToRawResultCode},
    thread::{self as svc, Tid},
};

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;
const CONTENDED: u32 = 2;

/// No owner.
const NO_OWNER: Tid = 0;

/// Bounded spinning before sleeping on the futex.
const SPIN_LIMIT: u32 = 100;

/// A non-recursive mutual exclusion lock.
///
/// A `Mutex` must not be moved while it is locked.
#[repr(C)]
pub struct Mutex {
    futex: AtomicU32,
    owner: AtomicI32,
}

static_assertions::assert_impl_all!(Mutex: Send, Sync);

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

impl Mutex {
    /// Creates an unlocked mutex.
    pub const fn new() -> Self {
        Self {
            futex: AtomicU32::new(UNLOCKED),
            owner: AtomicI32::new(NO_OWNER),
        }
    }

    /// Acquires the mutex, blocking until it is available.
    ///
    /// Fails with [`MutexLockError::Deadlock`] if the calling thread already holds it.
    pub fn lock(&self) -> Result<(), MutexLockError> {
        let tid = svc::current_tid();
        if self.owner.load(Ordering::Relaxed) == tid {
            return Err(MutexLockError::Deadlock);
        }

        if self
            .futex
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            self.lock_contended();
        }
        self.owner.store(tid, Ordering::Relaxed);
        Ok(())
    }

    /// Acquires the mutex if it is free.
    pub fn try_lock(&self) -> Result<(), MutexTryLockError> {
        let tid = svc::current_tid();
        if self.owner.load(Ordering::Relaxed) == tid {
            return Err(MutexTryLockError::Deadlock);
        }

        self.futex
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .map_err(|_| MutexTryLockError::Busy)?;
        self.owner.store(tid, Ordering::Relaxed);
        Ok(())
    }

    /// Releases the mutex.
    ///
    /// Fails with [`MutexUnlockError::NotOwner`] if the calling thread does not hold it.
    pub fn unlock(&self) -> Result<(), MutexUnlockError> {
        if self.owner.load(Ordering::Relaxed) != svc::current_tid() {
            return Err(MutexUnlockError::NotOwner);
        }

        self.owner.store(NO_OWNER, Ordering::Relaxed);
        if self.futex.swap(UNLOCKED, Ordering::Release) == CONTENDED {
            svc::futex_wake(&self.futex, 1);
        }
        Ok(())
    }

    /// Acquires the mutex or aborts the process.
    pub fn slock(&self) {
        if let Err(err) = self.lock() {
            exo_svc::fatal!("mutex lock: {err}");
        }
    }

    /// Releases the mutex or aborts the process.
    pub fn sunlock(&self) {
        if let Err(err) = self.unlock() {
            exo_svc::fatal!("mutex unlock: {err}");
        }
    }

    /// Returns `true` if some thread holds the mutex.
    pub fn is_locked(&self) -> bool {
        self.futex.load(Ordering::Relaxed) != UNLOCKED
    }

    /// Returns `true` if the calling thread holds the mutex.
    pub fn is_owned_by_current(&self) -> bool {
        self.owner.load(Ordering::Relaxed) == svc::current_tid()
    }

    #[cold]
    fn lock_contended(&self) {
        let mut state = self.spin();

        if state == UNLOCKED {
            match self.futex.compare_exchange(
                UNLOCKED,
                LOCKED,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(current) => state = current,
            }
        }

        loop {
            // Announce the waiter before sleeping. Whoever unlocks sees `CONTENDED` and wakes us.
            if state != CONTENDED && self.futex.swap(CONTENDED, Ordering::Acquire) == UNLOCKED {
                return;
            }

            if let Err(err) = svc::futex_wait(&self.futex, CONTENDED) {
                log::warn!("mutex: futex wait failed: {err}");
            }
            state = self.spin();
        }
    }

    fn spin(&self) -> u32 {
        let mut spins = SPIN_LIMIT;
        loop {
            let state = self.futex.load(Ordering::Relaxed);
            if state != LOCKED || spins == 0 {
                return state;
            }
            core::hint::spin_loop();
            spins -= 1;
        }
    }
}

impl core::fmt::Debug for Mutex {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Mutex")
            .field("locked", &self.is_locked())
            .field("owner", &self.owner.load(Ordering::Relaxed))
            .finish()
    }
}

/// Error type for [`Mutex::lock`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MutexLockError {
    /// The calling thread already holds the mutex.
    #[error("Mutex already held by the calling thread")]
    Deadlock,
}

impl ToRawResultCode for MutexLockError {
    fn to_rc(self) -> ResultCode {
        match self {
            Self::Deadlock => ErrorKind::Deadlock.to_rc(),
        }
    }
}

/// Error type for [`Mutex::try_lock`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MutexTryLockError {
    /// Another thread holds the mutex.
    #[error("Mutex is busy")]
    Busy,
    /// The calling thread already holds the mutex.
    #[error("Mutex already held by the calling thread")]
    Deadlock,
}

impl ToRawResultCode for MutexTryLockError {
    fn to_rc(self) -> ResultCode {
        match self {
            Self::Busy => ErrorKind::Busy.to_rc(),
            Self::Deadlock => ErrorKind::Deadlock.to_rc(),
        }
    }
}

/// Error type for [`Mutex::unlock`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MutexUnlockError {
    /// The calling thread does not hold the mutex.
    #[error("Mutex not held by the calling thread")]
    NotOwner,
}

impl ToRawResultCode for MutexUnlockError {
    fn to_rc(self) -> ResultCode {
        match self {
            Self::NotOwner => ErrorKind::Permission.to_rc(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::UnsafeCell, sync::Arc, thread};

    use super::*;

    #[test]
    fn test_relock_reports_deadlock() {
        let mutex = Mutex::new();
        mutex.lock().unwrap();
        assert_eq!(mutex.lock(), Err(MutexLockError::Deadlock));
        assert_eq!(mutex.try_lock(), Err(MutexTryLockError::Deadlock));
        mutex.unlock().unwrap();
        assert!(!mutex.is_locked());
    }

    #[test]
    fn test_unlock_unlocked_reports_not_owner() {
        let mutex = Mutex::new();
        assert_eq!(mutex.unlock(), Err(MutexUnlockError::NotOwner));
    }

    #[test]
    fn test_try_lock_busy_from_other_thread() {
        let mutex = Arc::new(Mutex::new());
        mutex.lock().unwrap();

        let other = Arc::clone(&mutex);
        let (busy, unlock) = thread::spawn(move || (other.try_lock(), other.unlock()))
            .join()
            .unwrap();

        assert_eq!(busy, Err(MutexTryLockError::Busy));
        assert_eq!(unlock, Err(MutexUnlockError::NotOwner));
        assert!(mutex.is_owned_by_current());
        mutex.unlock().unwrap();
    }

    #[test]
    fn test_mutual_exclusion_under_contention() {
        struct Counter {
            mutex: Mutex,
            value: UnsafeCell<u64>,
        }
        // SAFETY: `value` is only accessed with `mutex` held.
        unsafe impl Sync for Counter {}

        let counter = Arc::new(Counter {
            mutex: Mutex::new(),
            value: UnsafeCell::new(0),
        });

        let workers: Vec<_> = (0..8)
            .map(|_| {
                let counter = Arc::clone(&counter);
                thread::spawn(move || {
                    for _ in 0..5_000 {
                        counter.mutex.slock();
                        // SAFETY: The mutex is held.
                        unsafe { *counter.value.get() += 1 };
                        counter.mutex.sunlock();
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        // SAFETY: All workers have been joined.
        assert_eq!(unsafe { *counter.value.get() }, 40_000);
    }
}
