//! # Thread-Local Storage (TLS) blocks
//!
//! Every runtime thread owns one **TLS block**: a memory region of exactly [`TLS_SIZE`] bytes
//! whose base address is a multiple of [`TLS_SIZE`]. The block holds the thread's variables,
//! its alternate signal stack and its primary stack, separated by guard pages.
//!
//! ## Memory Layout
//!
//! ```text
//! base (multiple of TLS_SIZE)
//!        ┌────────────────────────────┐
//!        │ Variables                  │ ≥ 16 KiB, read/write
//!        │   ThreadVars               │   per-thread handle record
//!        │   user area                │   thread context, static arena
//!        ├────────────────────────────┤
//!        │ Guard                      │ 1 page, no access
//!        ├────────────────────────────┤
//!        │ Signal stack               │ ≥ max(MINSIGSTKSZ, SIGSTKSZ), read/write
//!        ├────────────────────────────┤
//!        │ Guard                      │ 1 page, no access
//!        ├────────────────────────────┤
//!        │ Thread stack               │ ≥ 256 KiB and ≥ PTHREAD_STACK_MIN, read/write
//!        ├────────────────────────────┤
//!        │ Guard                      │ remainder, no access
//! base + TLS_SIZE └──────────────────┘
//! ```
//!
//! Segment sizes are rounded up to whole pages at runtime (see [`TlsLayout`]).
//!
//! ## Self-discovery
//!
//! Because the block is self-aligned, `addr & !(TLS_SIZE - 1)` maps any address inside the block
//! back to its base. Code running on the thread stack (or the signal stack) finds its own
//! [`ThreadVars`] by masking the address of any local variable, see [`ThreadLocalBlock::current`].
//! That makes "which thread am I?" a constant-time, lock-free, allocation-free operation which is
//! also usable from signal handlers.

#![cfg_attr(not(test), no_std)]

mod block;
mod layout;
mod vars;

pub use self::{
    block::{ThreadLocalBlock, TlsFreeError, TlsInitError, block_base},
    layout::{THREAD_STACK_MIN_SIZE, TLS_SIZE, TlsLayout, VARS_MIN_SIZE},
    vars::{MainTask, THREAD_VARS_MAGIC, ThreadVars, USER_AREA_OFFSET},
};
