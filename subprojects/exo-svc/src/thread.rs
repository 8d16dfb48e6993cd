//! OS threads, futexes and scheduling hints.
//!
//! Threads created here run on a caller-provided stack. The stack is never freed by this module;
//! the caller owns it and must keep it mapped until [`join`] returns.

use core::{
    ffi::c_void,
    mem::MaybeUninit,
    ptr::{self, NonNull},
    sync::atomic::AtomicU32,
    time::Duration,
};

use crate::error::{Errno, ErrorKind, ResultCode, ToRawResultCode};

/// Kernel thread id.
pub type Tid = libc::pid_t;

/// Entry point of an OS thread.
pub type ThreadEntry = extern "C" fn(*mut c_void) -> *mut c_void;

/// Handle of a joinable OS thread.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(transparent)]
pub struct RawThread(libc::pthread_t);

/// Returns the kernel thread id of the calling thread.
#[inline]
pub fn current_tid() -> Tid {
    // SAFETY: `gettid` cannot fail and has no preconditions.
    unsafe { libc::syscall(libc::SYS_gettid) as Tid }
}

/// Gives up the CPU to another runnable thread.
#[inline]
pub fn yield_now() {
    // SAFETY: `sched_yield` has no preconditions.
    unsafe {
        libc::sched_yield();
    }
}

/// Sleeps for at least `duration`, restarting after signal interruptions.
pub fn sleep(duration: Duration) {
    let mut req = libc::timespec {
        tv_sec: duration.as_secs().min(libc::time_t::MAX as u64) as libc::time_t,
        tv_nsec: duration.subsec_nanos() as libc::c_long,
    };
    loop {
        let mut rem = MaybeUninit::<libc::timespec>::uninit();
        // SAFETY: Both pointers reference valid timespec storage.
        let rc = unsafe { libc::nanosleep(&req, rem.as_mut_ptr()) };
        if rc == 0 || Errno::last() != Errno::INTR {
            return;
        }
        // SAFETY: `nanosleep` filled `rem` because it failed with EINTR.
        req = unsafe { rem.assume_init() };
    }
}

/// Blocks while `*futex == expected`.
///
/// Returns `Ok(())` after a wakeup, a spurious return or when the value already differs.
/// The caller must re-check its condition in every case.
pub fn futex_wait(futex: &AtomicU32, expected: u32) -> Result<(), FutexError> {
    // SAFETY: `futex` is a valid, aligned 32-bit word for the duration of the call.
    let rc = unsafe {
        libc::syscall(
            libc::SYS_futex,
            futex.as_ptr(),
            libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
            expected,
            ptr::null::<libc::timespec>(),
        )
    };
    if rc == 0 {
        return Ok(());
    }

    match Errno::last().to_raw() {
        libc::EAGAIN | libc::EINTR => Ok(()),
        libc::ETIMEDOUT => Err(FutexError::TimedOut),
        raw => Err(FutexError::Unknown(Errno::from_raw(raw))),
    }
}

/// Wakes at most `count` threads blocked in [`futex_wait`] on `futex`.
///
/// Returns the number of woken threads.
pub fn futex_wake(futex: &AtomicU32, count: u32) -> usize {
    let count = count.min(i32::MAX as u32) as i32;
    // SAFETY: `futex` is a valid, aligned 32-bit word for the duration of the call.
    let rc = unsafe {
        libc::syscall(
            libc::SYS_futex,
            futex.as_ptr(),
            libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
            count,
        )
    };
    if rc < 0 { 0 } else { rc as usize }
}

/// Error type for [`futex_wait`].
#[derive(Debug, thiserror::Error)]
pub enum FutexError {
    /// A deadline expired.
    #[error("Futex wait timed out")]
    TimedOut,
    /// Any other errno.
    #[error("Unknown error: {0}")]
    Unknown(Errno),
}

impl ToRawResultCode for FutexError {
    fn to_rc(self) -> ResultCode {
        match self {
            Self::TimedOut => ErrorKind::Timeout.to_rc(),
            Self::Unknown(err) => err.to_rc(),
        }
    }
}

/// Creates a joinable OS thread that runs `entry(arg)` on the given stack.
///
/// The stack must be at least `PTHREAD_STACK_MIN` bytes. No guard page is added by the
/// system; the caller's layout is expected to provide one.
///
/// # Safety
///
/// `stack..stack + stack_size` must be mapped read/write and stay mapped, and unused by
/// anything else, until the thread has been joined. `arg` must be valid for whatever `entry`
/// does with it.
pub unsafe fn create(
    entry: ThreadEntry,
    arg: *mut c_void,
    stack: NonNull<u8>,
    stack_size: usize,
) -> Result<RawThread, CreateThreadError> {
    let mut attr = MaybeUninit::<libc::pthread_attr_t>::uninit();

    // SAFETY: `attr` is valid storage and is destroyed on every path below.
    let rc = unsafe { libc::pthread_attr_init(attr.as_mut_ptr()) };
    if rc != 0 {
        return Err(CreateThreadError::from_errno(rc));
    }

    // SAFETY: `attr` was initialized above; the stack contract is upheld by the caller.
    let rc = unsafe {
        let attr = attr.as_mut_ptr();
        let mut rc = libc::pthread_attr_setstack(attr, stack.as_ptr().cast::<c_void>(), stack_size);
        if rc == 0 {
            let mut thread = MaybeUninit::<libc::pthread_t>::uninit();
            rc = libc::pthread_create(thread.as_mut_ptr(), attr, entry, arg);
            if rc == 0 {
                libc::pthread_attr_destroy(attr);
                return Ok(RawThread(thread.assume_init()));
            }
        }
        libc::pthread_attr_destroy(attr);
        rc
    };

    Err(CreateThreadError::from_errno(rc))
}

/// Error type for [`create`].
#[derive(Debug, thiserror::Error)]
pub enum CreateThreadError {
    /// The system lacks resources to create another thread.
    #[error("Out of thread resources")]
    OutOfResource,
    /// The stack is too small or misaligned.
    #[error("Invalid thread stack")]
    InvalidStack,
    /// Any other errno.
    #[error("Unknown error: {0}")]
    Unknown(Errno),
}

impl CreateThreadError {
    fn from_errno(rc: i32) -> Self {
        match rc {
            libc::EAGAIN | libc::ENOMEM => Self::OutOfResource,
            libc::EINVAL => Self::InvalidStack,
            raw => Self::Unknown(Errno::from_raw(raw)),
        }
    }
}

impl ToRawResultCode for CreateThreadError {
    fn to_rc(self) -> ResultCode {
        match self {
            Self::OutOfResource => ErrorKind::OutOfMemory.to_rc(),
            Self::InvalidStack => ErrorKind::InvalidArgument.to_rc(),
            Self::Unknown(err) => err.to_rc(),
        }
    }
}

/// Waits for `thread` to exit.
pub fn join(thread: RawThread) -> Result<(), JoinThreadError> {
    let mut ret = ptr::null_mut::<c_void>();
    // SAFETY: `thread` came from `create` and is joined at most once since `RawThread` is
    // consumed by value by the owning handle.
    let rc = unsafe { libc::pthread_join(thread.0, &mut ret) };
    match rc {
        0 => Ok(()),
        libc::EDEADLK => Err(JoinThreadError::JoinSelf),
        libc::EINVAL | libc::ESRCH => Err(JoinThreadError::NotJoinable),
        raw => Err(JoinThreadError::Unknown(Errno::from_raw(raw))),
    }
}

/// Error type for [`join`].
#[derive(Debug, thiserror::Error)]
pub enum JoinThreadError {
    /// A thread tried to join itself.
    #[error("Thread cannot join itself")]
    JoinSelf,
    /// The thread was already joined or is not joinable.
    #[error("Thread is not joinable")]
    NotJoinable,
    /// Any other errno.
    #[error("Unknown error: {0}")]
    Unknown(Errno),
}

impl ToRawResultCode for JoinThreadError {
    fn to_rc(self) -> ResultCode {
        match self {
            Self::JoinSelf => ErrorKind::Deadlock.to_rc(),
            Self::NotJoinable => ErrorKind::InvalidState.to_rc(),
            Self::Unknown(err) => err.to_rc(),
        }
    }
}

#[cfg(test)]
mod tests {
    use core::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::mem;

    static SEEN: AtomicUsize = AtomicUsize::new(0);

    extern "C" fn record_arg(arg: *mut c_void) -> *mut c_void {
        SEEN.store(arg as usize, Ordering::SeqCst);
        ptr::null_mut()
    }

    #[test]
    fn test_create_join_on_mapped_stack() {
        let size = mem::round_up_to_page(libc::PTHREAD_STACK_MIN.max(128 * 1024));
        let stack = mem::map(size).expect("map stack");

        // SAFETY: The stack stays mapped until after the join below.
        let thread = unsafe { create(record_arg, 0x5A as *mut c_void, stack, size) }.expect("create");
        join(thread).expect("join");

        assert_eq!(SEEN.load(Ordering::SeqCst), 0x5A);
        // SAFETY: The thread has exited.
        unsafe { mem::unmap(stack, size) }.expect("unmap");
    }

    #[test]
    fn test_futex_wait_value_mismatch_returns() {
        let futex = AtomicU32::new(1);
        assert!(futex_wait(&futex, 0).is_ok());
        assert_eq!(futex_wake(&futex, 1), 0);
    }

    #[test]
    fn test_current_tid_positive() {
        assert!(current_tid() > 0);
    }
}
