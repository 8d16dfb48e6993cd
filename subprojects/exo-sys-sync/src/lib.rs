//! # exo-sys-sync
//!
//! Synchronization primitives of the exo runtime:
//!
//! - [`Mutex`]: a futex-backed, non-recursive, error-checking mutex
//! - [`RwLock`]: many readers or one writer, built from two mutexes and suspend/resume
//! - [`WaitList`]: a FIFO of suspended threads with atomic task handoff on wakeup
//!
//! Every blocking operation comes in two flavours: a fallible one returning `Result`, and an
//! `s`-prefixed fail-fast one that aborts the process through
//! [`exo_svc::debug::fatal`] if the fallible variant fails.
//!
//! [`RwLock::lock_writer`] and [`WaitList::wait`] suspend the calling thread, so they must be
//! called from a runtime thread (one that runs on a TLS block).

#![cfg_attr(not(test), no_std)]

mod mutex;
mod rwlock;
mod waitlist;

pub use self::{mutex::*, rwlock::*, waitlist::*};
