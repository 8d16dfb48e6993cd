//! # exo-svc
//!
//! Thin, typed wrappers around the host (Linux) system calls the exo runtime is built on.
//!
//! Every wrapper returns a `Result` whose error type names the failure modes the caller can
//! act on. Anything the kernel reports that is not expected for a given call is preserved as an
//! [`Errno`](error::Errno) inside an `Unknown` variant.
//!
//! The modules are grouped by concern:
//!
//! - [`error`]: the error taxonomy and raw result codes shared by every crate in the workspace
//! - [`mem`]: page-granular virtual memory (map, protect, unmap)
//! - [`thread`]: OS threads on caller-provided stacks, futexes, yielding and sleeping
//! - [`signal`]: alternate signal stack registration
//! - [`context`]: user-level execution contexts (`ucontext_t`)
//! - [`io`]: interruption-safe descriptor writes
//! - [`process`]: process identity and termination
//! - [`debug`]: the fatal diagnostic path
//!
//! ## References
//! - [futex(2)](https://man7.org/linux/man-pages/man2/futex.2.html)
//! - [sigaltstack(2)](https://man7.org/linux/man-pages/man2/sigaltstack.2.html)
//! - [makecontext(3)](https://man7.org/linux/man-pages/man3/makecontext.3.html)

#![cfg_attr(not(test), no_std)]

pub mod context;
pub mod debug;
pub mod error;
pub mod io;
pub mod mem;
pub mod process;
pub mod signal;
pub mod thread;
