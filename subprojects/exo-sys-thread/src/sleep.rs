//! Thread sleeping and yielding
//!
//! This module is an idiomatic wrapper around the `exo_svc::thread` module.

use core::time::Duration;

use exo_svc::thread as svc;

/// Puts the current thread to sleep for at least `duration`.
///
/// Signal interruptions do not shorten the sleep.
pub fn sleep(duration: Duration) {
    svc::sleep(duration);
}

/// Yields execution to another runnable thread.
#[inline]
pub fn yield_now() {
    svc::yield_now();
}
