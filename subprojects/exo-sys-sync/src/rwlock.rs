//! Read/write lock built from two mutexes and thread suspension.
//!
//! ## Protocol
//!
//! - Readers take the `entry` mutex only long enough to increment the reader count, and the
//!   `exit` mutex only long enough to decrement it.
//! - A writer takes `entry` and keeps it for the whole write region, so no new reader gets in.
//!   It then records itself as the waiting writer under `exit` and suspends until the reader
//!   count drops to zero. The last reader out resumes it.
//! - The writer re-reads the count under `exit` after every wakeup, so unrelated resumes are
//!   harmless.
//!
//! A pending writer does not stop readers that already incremented the count; it only blocks
//! readers that arrive after it took `entry`.

use core::{
    ptr,
    sync::atomic::{AtomicPtr, AtomicU32},
};

use exo_cpu::atomic::{Atomic, AtomicInt};
use exo_svc::error::{ErrorKind, ResultCode, ToRawResultCode};
use exo_sys_thread::tls::ThreadVars;

use crate::mutex::{Mutex, MutexLockError, MutexUnlockError};

/// Many readers or a single writer.
///
/// An `RwLock` must not be moved while it is locked.
#[repr(C)]
pub struct RwLock {
    entry: Mutex,
    exit: Mutex,
    reader_count: AtomicU32,
    writer: AtomicPtr<ThreadVars>,
}

static_assertions::assert_impl_all!(RwLock: Send, Sync);

impl Default for RwLock {
    fn default() -> Self {
        Self::new()
    }
}

impl RwLock {
    /// Creates an unlocked lock.
    pub const fn new() -> Self {
        Self {
            entry: Mutex::new(),
            exit: Mutex::new(),
            reader_count: AtomicU32::new(0),
            writer: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Enters the lock as a reader.
    ///
    /// Blocks while a writer holds or waits for the lock. Fails with
    /// [`RwLockReadError::Overflow`] if the reader count is already at its maximum, in which
    /// case the count is left unchanged.
    pub fn lock_reader(&self) -> Result<(), RwLockReadError> {
        self.entry.lock()?;

        // Increments are serialized by `entry`; concurrent decrements only lower the count.
        if self.reader_count.read() == u32::MAX {
            self.entry.sunlock();
            return Err(RwLockReadError::Overflow);
        }
        self.reader_count.add(1);

        self.entry.sunlock();
        Ok(())
    }

    /// Leaves the lock as a reader, resuming a waiting writer if this was the last reader.
    pub fn unlock_reader(&self) -> Result<(), RwLockUnlockError> {
        self.exit.lock()?;

        if self.reader_count.read() == 0 {
            self.exit.sunlock();
            return Err(RwLockUnlockError::NotLocked);
        }
        let prev = self.reader_count.sub(1);

        if prev == 1 {
            let writer = self.writer.read();
            if !writer.is_null() {
                // SAFETY: A recorded writer is suspended inside `lock_writer`, so its TLS block
                // is alive.
                exo_sys_thread::resume(unsafe { &*writer });
            }
        }

        self.exit.sunlock();
        Ok(())
    }

    /// Enters the lock as the single writer.
    ///
    /// Returns once every reader has left. Must be called from a runtime thread, since the
    /// writer suspends itself while readers remain.
    pub fn lock_writer(&self) -> Result<(), RwLockWriteError> {
        self.entry.lock()?;

        let me = exo_sys_thread::current() as *const ThreadVars as *mut ThreadVars;
        loop {
            self.exit.slock();
            self.writer.write(me);
            let readers = self.reader_count.read();
            self.exit.sunlock();

            if readers == 0 {
                return Ok(());
            }
            exo_sys_thread::suspend();
        }
    }

    /// Leaves the lock as the writer.
    pub fn unlock_writer(&self) -> Result<(), RwLockUnlockError> {
        if !self.entry.is_owned_by_current() {
            return Err(RwLockUnlockError::NotOwner);
        }

        self.writer.write(ptr::null_mut());
        self.entry.unlock()?;
        Ok(())
    }

    /// [`lock_reader`](Self::lock_reader), aborting the process on failure.
    pub fn slock_reader(&self) {
        if let Err(err) = self.lock_reader() {
            exo_svc::fatal!("rwlock lock_reader: {err}");
        }
    }

    /// [`unlock_reader`](Self::unlock_reader), aborting the process on failure.
    pub fn sunlock_reader(&self) {
        if let Err(err) = self.unlock_reader() {
            exo_svc::fatal!("rwlock unlock_reader: {err}");
        }
    }

    /// [`lock_writer`](Self::lock_writer), aborting the process on failure.
    pub fn slock_writer(&self) {
        if let Err(err) = self.lock_writer() {
            exo_svc::fatal!("rwlock lock_writer: {err}");
        }
    }

    /// [`unlock_writer`](Self::unlock_writer), aborting the process on failure.
    pub fn sunlock_writer(&self) {
        if let Err(err) = self.unlock_writer() {
            exo_svc::fatal!("rwlock unlock_writer: {err}");
        }
    }

    /// Number of readers currently inside.
    pub fn reader_count(&self) -> u32 {
        self.reader_count.read()
    }

    /// The recorded writer, null if none holds or waits for the lock.
    pub fn writer(&self) -> *const ThreadVars {
        self.writer.read()
    }
}

impl core::fmt::Debug for RwLock {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RwLock")
            .field("reader_count", &self.reader_count())
            .field("writer", &self.writer())
            .finish()
    }
}

/// Error type for [`RwLock::lock_reader`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RwLockReadError {
    /// The reader count is at its maximum.
    #[error("Reader count overflow")]
    Overflow,
    /// The calling thread holds the lock as writer.
    #[error("Entry lock: {0}")]
    Entry(#[from] MutexLockError),
}

impl ToRawResultCode for RwLockReadError {
    fn to_rc(self) -> ResultCode {
        match self {
            Self::Overflow => ErrorKind::Overflow.to_rc(),
            Self::Entry(err) => err.to_rc(),
        }
    }
}

/// Error type for [`RwLock::lock_writer`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RwLockWriteError {
    /// The calling thread already holds the lock as writer.
    #[error("Entry lock: {0}")]
    Entry(#[from] MutexLockError),
}

impl ToRawResultCode for RwLockWriteError {
    fn to_rc(self) -> ResultCode {
        match self {
            Self::Entry(err) => err.to_rc(),
        }
    }
}

/// Error type for [`RwLock::unlock_reader`] and [`RwLock::unlock_writer`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RwLockUnlockError {
    /// No reader is inside.
    #[error("Lock not held by any reader")]
    NotLocked,
    /// The calling thread is not the writer.
    #[error("Lock not held by the calling thread")]
    NotOwner,
    /// Locking the exit mutex failed.
    #[error("Exit lock: {0}")]
    Exit(#[from] MutexLockError),
    /// Releasing the entry mutex failed.
    #[error("Entry unlock: {0}")]
    Entry(#[from] MutexUnlockError),
}

impl ToRawResultCode for RwLockUnlockError {
    fn to_rc(self) -> ResultCode {
        match self {
            Self::NotLocked => ErrorKind::InvalidState.to_rc(),
            Self::NotOwner => ErrorKind::Permission.to_rc(),
            Self::Exit(err) => err.to_rc(),
            Self::Entry(err) => err.to_rc(),
        }
    }
}
