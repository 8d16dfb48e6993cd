//! # exo-task
//!
//! Stackless cooperative tasks ("exothreads") and their run-list scheduler.
//!
//! An exothread is a resumable state machine. Each call to its step function runs until the
//! task yields, finishes or fails, and records where the next call resumes. Two resume points
//! always exist: *init*, where a fresh task starts, and *free*, the cleanup path taken after an
//! error while the task holds a resource.
//!
//! ```text
//!            step -> 0                    step -> err, holding
//!   INIT ───────────────► At(label) ──────────────────────────► FREE ──► FINISHED
//!     │                     │  ▲                                          ▲
//!     │                     └──┘ yield                                    │
//!     └──────────────── step -> err, not holding / finish() ──────────────┘
//! ```
//!
//! The [`ExoScheduler`] keeps registered tasks in an intrusive FIFO run list. One
//! [`ExoScheduler::run`] pass steps every unfinished task once and unlinks the finished ones.

#![cfg_attr(not(test), no_std)]

mod exothread;
mod scheduler;

pub use self::{exothread::*, scheduler::*};
