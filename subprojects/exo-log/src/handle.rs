//! Per-thread log handles and routing.
//!
//! Every thread context owns a [`LogHandle`]. A fresh handle is *static*: entries go to the
//! process-global [`StaticLog`](crate::StaticLog). [`LogHandle::init_thread_log`] gives the
//! handle its own [`LogWriter`]; [`LogHandle::free_thread_log`] flushes it and returns to the
//! static log.
//!
//! The free functions [`print`] and [`flush`] act on the handle installed for the calling OS
//! thread with [`install_current`], or on the static log if none is installed.

use core::{
    cell::{Cell, RefCell},
    fmt, ptr,
};

use exo_svc::io::{self, Fd};

use crate::{
    static_log::static_log,
    writer::{LogError, LogWriter},
};

/// A thread's log: either the static fallback or a buffered writer.
///
/// A handle belongs to a single thread; it is not `Sync`.
#[derive(Debug)]
pub struct LogHandle {
    writer: RefCell<Option<LogWriter>>,
}

impl Default for LogHandle {
    fn default() -> Self {
        Self::new_static()
    }
}

impl LogHandle {
    /// A handle routing to the static log.
    pub const fn new_static() -> Self {
        Self {
            writer: RefCell::new(None),
        }
    }

    /// Returns `true` while the handle routes to the static log.
    pub fn is_static(&self) -> bool {
        self.writer.try_borrow().map_or(false, |w| w.is_none())
    }

    /// Gives the handle a buffered writer of `pages` pages flushing to standard error.
    pub fn init_thread_log(&self, pages: usize) -> Result<(), LogError> {
        self.init_thread_log_with_sink(pages, io::STDERR)
    }

    /// Gives the handle a buffered writer of `pages` pages flushing to `sink`.
    pub fn init_thread_log_with_sink(&self, pages: usize, sink: Fd) -> Result<(), LogError> {
        let mut slot = self
            .writer
            .try_borrow_mut()
            .map_err(|_| LogError::AlreadyInitialized)?;
        if slot.is_some() {
            return Err(LogError::AlreadyInitialized);
        }
        *slot = Some(LogWriter::new(pages, sink)?);
        Ok(())
    }

    /// Flushes and releases the buffered writer. The handle routes to the static log afterwards.
    ///
    /// A no-op on a static handle.
    pub fn free_thread_log(&self) -> Result<(), LogError> {
        let writer = match self.writer.try_borrow_mut() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        match writer {
            Some(mut writer) => writer.flush(),
            None => Ok(()),
        }
    }

    /// Appends an entry.
    ///
    /// Falls back to the static log if the handle is static or its writer is in use further up
    /// the stack.
    pub fn print(&self, args: fmt::Arguments<'_>) -> Result<(), LogError> {
        if let Ok(mut slot) = self.writer.try_borrow_mut() {
            if let Some(writer) = slot.as_mut() {
                return writer.print(args);
            }
        }
        static_log().print(args);
        Ok(())
    }

    /// Flushes the buffered writer, if any.
    pub fn flush(&self) -> Result<(), LogError> {
        match self.writer.try_borrow_mut() {
            Ok(mut slot) => slot.as_mut().map_or(Ok(()), LogWriter::flush),
            Err(_) => Ok(()),
        }
    }

    /// Calls `f` with the buffered bytes, or an empty slice for a static handle.
    pub fn with_buffer<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        match self.writer.try_borrow() {
            Ok(slot) => f(slot.as_ref().map_or(&[], LogWriter::buffer)),
            Err(_) => f(&[]),
        }
    }
}

std::thread_local! {
    static CURRENT: Cell<*const LogHandle> = const { Cell::new(ptr::null()) };
}

/// Routes this OS thread's log output to `handle`.
pub fn install_current(handle: &'static LogHandle) {
    CURRENT.with(|current| current.set(handle));
}

/// Routes this OS thread's log output back to the static log.
pub fn uninstall_current() {
    CURRENT.with(|current| current.set(ptr::null()));
}

fn with_current<R>(f: impl FnOnce(Option<&LogHandle>) -> R) -> R {
    let handle = CURRENT.try_with(Cell::get).unwrap_or(ptr::null());
    // SAFETY: Installed handles are `'static`.
    f(unsafe { handle.as_ref() })
}

/// Appends an entry to this thread's log.
pub fn print(args: fmt::Arguments<'_>) -> Result<(), LogError> {
    with_current(|handle| match handle {
        Some(handle) => handle.print(args),
        None => {
            static_log().print(args);
            Ok(())
        }
    })
}

/// Flushes this thread's log.
pub fn flush() -> Result<(), LogError> {
    with_current(|handle| handle.map_or(Ok(()), LogHandle::flush))
}
