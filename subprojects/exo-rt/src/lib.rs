//! # exo-rt
//!
//! The exo process/thread runtime.
//!
//! [`startup::start`] (or [`run_main`]) turns the calling thread into the runtime main thread:
//! it moves execution onto a fresh TLS block, brings up the [`ProcessContext`] and the main
//! [`ThreadContext`], and calls the user main. Further runtime threads are started with
//! [`thread::spawn`]; each gets its own thread context bound to the shared process context.
//!
//! From any runtime thread, [`current`] finds the thread context by masking a stack address.

mod area;
mod blockmap;
mod errorstrings;
mod mm;
mod objectcache;
mod pagecache;
mod subsystem;
mod sysuser;
mod valuecache;

pub mod arena;
pub mod config;
pub mod error;
pub mod process;
pub mod startup;
pub mod thread;
pub mod thread_context;

pub use self::{
    blockmap::{BlockMap, BlockMapError},
    config::{RuntimeConfig, Topology},
    error::RtError,
    errorstrings::ErrorStrings,
    mm::{MM_ALIGN, Mm},
    objectcache::ObjectCache,
    pagecache::PageCache,
    process::ProcessContext,
    startup::{MainArgs, UserMain},
    subsystem::Subsystem,
    sysuser::SysUser,
    thread::current,
    thread_context::ThreadContext,
    valuecache::ValueCache,
};

use exo_svc::error::ResultCode;

/// Runs `user_main` with the process arguments and the configuration from the environment.
pub fn run_main(user_main: UserMain) -> ResultCode {
    startup::start(std::env::args().collect(), RuntimeConfig::from_env(), user_main)
}
