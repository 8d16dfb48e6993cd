//! # exo-cpu
//!
//! CPU-level primitives used by every other layer of the exo runtime:
//!
//! - [`atomic`]: the typed atomic operations through which all lock-free shared state mutates
//! - [`stack`]: probing the current stack address

#![cfg_attr(not(test), no_std)]

pub mod atomic;
pub mod stack;
