//! Suspending and resuming threads.
//!
//! Each thread has a one-shot latch in its [`ThreadVars`]. [`resume`] sets the latch and wakes
//! the thread; [`suspend`] blocks until the latch is set and then consumes it. A resume that
//! happens before the matching suspend is not lost: the suspend returns immediately.
//!
//! Callers must re-check their wakeup condition after [`suspend`] returns, because the latch may
//! have been set by an unrelated resume.

use exo_cpu::atomic::Atomic;
use exo_svc::thread as svc;
use exo_sys_thread_tls::ThreadVars;

const LATCH_CLEAR: u32 = 0;
const LATCH_SET: u32 = 1;

/// Blocks the calling runtime thread until it is resumed.
pub fn suspend() {
    let latch = crate::current().latch();
    loop {
        if latch.compare_swap(LATCH_SET, LATCH_CLEAR) == LATCH_SET {
            return;
        }
        if let Err(err) = svc::futex_wait(latch, LATCH_CLEAR) {
            log::warn!("suspend: futex wait failed: {err}");
        }
    }
}

/// Consumes a pending resume of the calling runtime thread without blocking.
///
/// Returns `true` if a resume was pending.
pub fn try_suspend() -> bool {
    crate::current().latch().compare_swap(LATCH_SET, LATCH_CLEAR) == LATCH_SET
}

/// Resumes `thread` if it is suspended, or makes its next [`suspend`] return immediately.
pub fn resume(thread: &ThreadVars) {
    let latch = thread.latch();
    latch.write(LATCH_SET);
    svc::futex_wake(latch, 1);
}
