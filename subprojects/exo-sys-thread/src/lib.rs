//! # exo-sys-thread
//!
//! OS threads that run on TLS blocks.
//!
//! A thread started with [`spawn`] executes on the primary stack of its own
//! [`ThreadLocalBlock`](tls::ThreadLocalBlock) and uses the block's signal segment as its alternate
//! signal stack. From inside the thread, [`current`] finds the thread's
//! [`ThreadVars`](tls::ThreadVars) by masking a stack address.

#![cfg_attr(not(test), no_std)]

mod activity;
mod sleep;
mod spawn;

pub use exo_sys_thread_tls as tls;

pub use self::{activity::*, sleep::*, spawn::*};

/// Returns the calling thread's [`ThreadVars`](tls::ThreadVars).
///
/// Only meaningful on a runtime thread: one started by [`spawn`] or by the runtime's startup
/// code, running on its TLS block's thread stack or signal stack.
#[inline(always)]
pub fn current() -> &'static tls::ThreadVars {
    // SAFETY: Runtime threads always execute on a stack inside their live TLS block.
    let vars = unsafe { tls::ThreadLocalBlock::current() }.thread_vars();
    debug_assert!(vars.is_initialized());
    vars
}
