//! # exo-log
//!
//! Diagnostic logging for the exo runtime.
//!
//! - [`LogWriter`]: a page-mapped byte buffer with bounded per-entry append, flushed to a file
//!   descriptor when full or on request
//! - [`StaticLog`]: the process-global fallback that writes straight to standard error. It works
//!   before the runtime is initialized and after it is torn down
//! - [`LogHandle`]: a thread's log. It starts out routing to the static log;
//!   [`LogHandle::init_thread_log`] swaps in a buffered writer and
//!   [`LogHandle::free_thread_log`] restores the fallback
//! - [`ExoLogger`]: the `log` crate backend. Records go to the calling thread's installed handle,
//!   or to the static log if none is installed
//!
//! A log call is always safe, whatever the state of the runtime.

mod entry;
mod handle;
mod logger;
mod static_log;
mod writer;

pub use self::{
    entry::{PRINTF_MAX, TRUNCATION_MARKER},
    handle::{LogHandle, flush, install_current, print, uninstall_current},
    logger::{ExoLogger, init},
    static_log::{StaticLog, static_log},
    writer::{LogError, LogWriter},
};

/// Prints to the calling thread's log with `format_args!` syntax.
#[macro_export]
macro_rules! exo_print {
    ($($arg:tt)*) => {
        $crate::print(format_args!($($arg)*))
    };
}
