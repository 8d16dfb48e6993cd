//! Spawning and joining threads on TLS blocks.

use core::{ffi::c_void, ptr};

use exo_svc::{
    error::{ResultCode, ToRawResultCode},
    signal,
    thread::{self as svc, CreateThreadError, JoinThreadError, RawThread},
};
use exo_sys_thread_tls::{MainTask, ThreadLocalBlock, ThreadVars, TlsFreeError, TlsInitError};

/// A running (or finished, not yet joined) thread.
///
/// The thread owns its TLS block until [`Thread::join`] releases it. Dropping a `Thread` without
/// joining leaks the block and the OS thread.
#[derive(Debug)]
#[must_use = "threads must be joined to release their TLS block"]
pub struct Thread {
    block: ThreadLocalBlock,
    raw: RawThread,
}

impl Thread {
    /// The thread's TLS block.
    pub fn block(&self) -> ThreadLocalBlock {
        self.block
    }

    /// The thread's [`ThreadVars`].
    pub fn vars(&self) -> &'static ThreadVars {
        self.block.thread_vars()
    }

    /// Waits for the thread to exit, releases its TLS block and returns the main task's return
    /// code.
    pub fn join(self) -> Result<ResultCode, JoinError> {
        svc::join(self.raw)?;
        let rc = self.vars().return_code();

        // SAFETY: The thread has exited; nothing runs on or references the block anymore.
        unsafe { self.block.free() }?;
        log::trace!("thread: joined, rc={rc}");
        Ok(rc)
    }
}

/// Starts a new OS thread running `task(arg)` on a fresh TLS block.
///
/// Before `task` runs, the thread records its kernel thread id and registers the block's signal
/// segment as its alternate signal stack. The task's return value is stored in the thread's
/// [`ThreadVars`] and returned by [`Thread::join`].
///
/// `task` must not unwind.
pub fn spawn(task: MainTask, arg: *mut c_void) -> Result<Thread, SpawnError> {
    let block = ThreadLocalBlock::init()?;

    // SAFETY: The block was just created; no other party can see it yet.
    unsafe { block.thread_vars().set_main_task(Some(task), arg) };

    let (stack, stack_size) = block.thread_stack();
    // SAFETY: The thread stack stays mapped until `Thread::join` frees the block.
    let created =
        unsafe { svc::create(thread_entry, block.base() as *mut c_void, stack, stack_size) };
    let raw = match created {
        Ok(raw) => raw,
        Err(err) => {
            // SAFETY: The thread was never started.
            let _ = unsafe { block.free() };
            return Err(err.into());
        }
    };

    log::trace!(
        "thread: spawned stack_id={} at {:#x}",
        block.thread_vars().stack_id(),
        block.base()
    );
    Ok(Thread { block, raw })
}

/// Runs the main task of the block passed in `arg`.
extern "C" fn thread_entry(arg: *mut c_void) -> *mut c_void {
    // SAFETY: `spawn` passes the base of a live block.
    let block = unsafe { ThreadLocalBlock::from_addr(arg as usize) };
    let vars = block.thread_vars();
    vars.set_tid(svc::current_tid());

    let (sigstack, sigstack_size) = block.signal_stack();
    // SAFETY: The signal segment lives as long as the block, which outlives this thread.
    let prev_sigstack = match unsafe { signal::set_alt_stack(sigstack, sigstack_size) } {
        Ok(prev) => Some(prev),
        Err(err) => {
            log::warn!("thread: alternate signal stack not installed: {err}");
            None
        }
    };

    vars.lock();
    // SAFETY: The lock flag is held.
    let (task, task_arg) = unsafe { vars.main_task() };
    vars.unlock();

    let rc = match task {
        Some(task) => task(task_arg),
        None => 0,
    };
    vars.set_return_code(rc);

    if let Some(prev) = prev_sigstack {
        if let Err(err) = signal::restore_alt_stack(prev) {
            log::warn!("thread: failed to restore alternate signal stack: {err}");
        }
    }
    ptr::null_mut()
}

/// Error type for [`spawn`].
#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    /// The TLS block could not be allocated.
    #[error("TLS allocation failed: {0}")]
    Tls(#[from] TlsInitError),
    /// The OS refused to create the thread.
    #[error("Thread creation failed: {0}")]
    Create(#[from] CreateThreadError),
}

impl ToRawResultCode for SpawnError {
    fn to_rc(self) -> ResultCode {
        match self {
            Self::Tls(err) => err.to_rc(),
            Self::Create(err) => err.to_rc(),
        }
    }
}

/// Error type for [`Thread::join`].
#[derive(Debug, thiserror::Error)]
pub enum JoinError {
    /// Waiting for the thread failed.
    #[error("Join failed: {0}")]
    Join(#[from] JoinThreadError),
    /// The TLS block could not be released.
    #[error("TLS release failed: {0}")]
    Free(#[from] TlsFreeError),
}

impl ToRawResultCode for JoinError {
    fn to_rc(self) -> ResultCode {
        match self {
            Self::Join(err) => err.to_rc(),
            Self::Free(err) => err.to_rc(),
        }
    }
}

#[cfg(test)]
mod tests {
    use core::{
        sync::atomic::{AtomicBool, AtomicUsize, Ordering},
        time::Duration,
    };

    use super::*;
    use crate::{current, resume, sleep, suspend, try_suspend};

    fn report_current(arg: *mut c_void) -> ResultCode {
        let slot = unsafe { &*(arg as *const AtomicUsize) };
        slot.store(current() as *const ThreadVars as usize, Ordering::SeqCst);
        7
    }

    #[test]
    fn test_spawn_finds_own_vars_and_returns_rc() {
        let seen = AtomicUsize::new(0);

        let thread = spawn(report_current, &seen as *const _ as *mut c_void).expect("spawn");
        let expected = thread.vars() as *const ThreadVars as usize;
        let rc = thread.join().expect("join");

        assert_eq!(rc, 7);
        assert_eq!(seen.load(Ordering::SeqCst), expected);
    }

    struct Handshake {
        suspended: AtomicBool,
        resumed: AtomicBool,
    }

    fn wait_for_resume(arg: *mut c_void) -> ResultCode {
        let shake = unsafe { &*(arg as *const Handshake) };
        shake.suspended.store(true, Ordering::SeqCst);
        suspend();
        shake.resumed.store(true, Ordering::SeqCst);
        0
    }

    #[test]
    fn test_suspend_blocks_until_resume() {
        let shake = Handshake {
            suspended: AtomicBool::new(false),
            resumed: AtomicBool::new(false),
        };

        let thread = spawn(wait_for_resume, &shake as *const _ as *mut c_void).expect("spawn");
        while !shake.suspended.load(Ordering::SeqCst) {
            sleep(Duration::from_millis(1));
        }
        sleep(Duration::from_millis(20));
        assert!(!shake.resumed.load(Ordering::SeqCst));

        resume(thread.vars());
        thread.join().expect("join");
        assert!(shake.resumed.load(Ordering::SeqCst));
    }

    fn resume_self_first(_: *mut c_void) -> ResultCode {
        if try_suspend() {
            return 1;
        }
        resume(current());
        suspend();
        if try_suspend() {
            return 2;
        }
        0
    }

    #[test]
    fn test_resume_before_suspend_is_latched_once() {
        let thread = spawn(resume_self_first, ptr::null_mut()).expect("spawn");
        assert_eq!(thread.join().expect("join"), 0);
    }
}
