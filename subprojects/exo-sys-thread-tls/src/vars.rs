//! The per-thread handle record stored at the start of every TLS block.

use core::{
    cell::UnsafeCell,
    ffi::c_void,
    ptr,
    sync::atomic::{AtomicI32, AtomicPtr, AtomicU8, AtomicU32, Ordering},
};

use exo_cpu::atomic::{self, Atomic};
use exo_svc::error::ResultCode;

/// Magic value marking an initialized [`ThreadVars`].
///
/// The value `0x24565845` corresponds to the ASCII string "EXV$" (little-endian).
pub const THREAD_VARS_MAGIC: u32 = 0x2456_5845;

/// Offset of the user area inside the variables segment.
///
/// The user area follows [`ThreadVars`] and is where the runtime places the thread context and,
/// on the main thread, the process context's static arena.
pub const USER_AREA_OFFSET: usize = (size_of::<ThreadVars>() + 63) & !63;

/// A thread's main task: a function and an opaque argument.
///
/// On spawn it is the thread body. A thread woken from a wait list receives a new task from its
/// waker.
pub type MainTask = fn(arg: *mut c_void) -> ResultCode;

static NEXT_STACK_ID: AtomicU32 = AtomicU32::new(1);

/// Per-thread record living at offset 0 of the thread's TLS block.
///
/// Fields written by other threads are atomics. The main task pair is guarded by the thread's
/// lock flag ([`ThreadVars::lock`]).
#[repr(C)]
pub struct ThreadVars {
    /// Set to [`THREAD_VARS_MAGIC`] once initialized.
    magic: u32,
    /// Incrementing id of the block; wraps, but a live id is never handed out twice in practice.
    stack_id: u32,
    /// Kernel thread id, `0` until the thread runs.
    tid: AtomicI32,
    /// Spin lock byte guarding the main task and wakeup handoff.
    lock_flag: AtomicU8,
    /// One-shot suspend/resume latch (futex word).
    latch: AtomicU32,
    /// Wait-list back-reference, null while not queued.
    next_wait: AtomicPtr<ThreadVars>,
    main_task: UnsafeCell<Option<MainTask>>,
    main_arg: UnsafeCell<*mut c_void>,
    return_code: AtomicI32,
    /// Owning process context (opaque at this layer).
    process: AtomicPtr<c_void>,
    /// The thread's context (opaque at this layer).
    context: AtomicPtr<c_void>,
}

static_assertions::const_assert!(USER_AREA_OFFSET >= size_of::<ThreadVars>());
static_assertions::const_assert_eq!(USER_AREA_OFFSET % 64, 0);
static_assertions::assert_impl_all!(ThreadVars: Sync);

// SAFETY: The non-atomic fields are only accessed under `lock_flag` or by the owning thread
// before the thread is published.
unsafe impl Sync for ThreadVars {}
unsafe impl Send for ThreadVars {}

impl ThreadVars {
    /// Creates a record with a fresh stack id.
    pub(crate) fn new() -> Self {
        Self {
            magic: THREAD_VARS_MAGIC,
            stack_id: NEXT_STACK_ID.fetch_add(1, Ordering::Relaxed),
            tid: AtomicI32::new(0),
            lock_flag: AtomicU8::new(0),
            latch: AtomicU32::new(0),
            next_wait: AtomicPtr::new(ptr::null_mut()),
            main_task: UnsafeCell::new(None),
            main_arg: UnsafeCell::new(ptr::null_mut()),
            return_code: AtomicI32::new(0),
            process: AtomicPtr::new(ptr::null_mut()),
            context: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Returns `true` if the record carries [`THREAD_VARS_MAGIC`].
    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.magic == THREAD_VARS_MAGIC
    }

    /// The block's stack id.
    #[inline]
    pub fn stack_id(&self) -> u32 {
        self.stack_id
    }

    /// Kernel thread id of the thread running on this block, `0` before it started.
    #[inline]
    pub fn tid(&self) -> i32 {
        self.tid.read()
    }

    /// Records the kernel thread id. Called by the thread itself when it starts.
    #[inline]
    pub fn set_tid(&self, tid: i32) {
        self.tid.write(tid);
    }

    /// Acquires the thread's lock flag, yielding the CPU between attempts.
    pub fn lock(&self) {
        while atomic::set_flag(&self.lock_flag) {
            exo_svc::thread::yield_now();
        }
    }

    /// Releases the thread's lock flag.
    #[inline]
    pub fn unlock(&self) {
        atomic::clear_flag(&self.lock_flag);
    }

    /// The one-shot suspend/resume latch word.
    #[inline]
    pub fn latch(&self) -> &AtomicU32 {
        &self.latch
    }

    /// The wait-list link.
    #[inline]
    pub fn next_wait(&self) -> &AtomicPtr<ThreadVars> {
        &self.next_wait
    }

    /// Installs a new main task.
    ///
    /// # Safety
    ///
    /// The caller must hold this thread's lock flag, or be the only party with access to the
    /// record (before the thread starts).
    #[inline]
    pub unsafe fn set_main_task(&self, task: Option<MainTask>, arg: *mut c_void) {
        // SAFETY: Exclusive access is guaranteed by the caller.
        unsafe {
            *self.main_task.get() = task;
            *self.main_arg.get() = arg;
        }
    }

    /// Reads the current main task.
    ///
    /// # Safety
    ///
    /// The caller must hold this thread's lock flag, or be the thread itself at a point where no
    /// other party writes the task.
    #[inline]
    pub unsafe fn main_task(&self) -> (Option<MainTask>, *mut c_void) {
        // SAFETY: No concurrent writer per the caller contract.
        unsafe { (*self.main_task.get(), *self.main_arg.get()) }
    }

    /// Return code of the main task, valid after it returned.
    #[inline]
    pub fn return_code(&self) -> ResultCode {
        self.return_code.read()
    }

    /// Stores the main task's return code.
    #[inline]
    pub fn set_return_code(&self, rc: ResultCode) {
        self.return_code.write(rc);
    }

    /// Opaque pointer to the owning process context.
    #[inline]
    pub fn process(&self) -> *mut c_void {
        self.process.read()
    }

    /// Sets the owning process context.
    #[inline]
    pub fn set_process(&self, process: *mut c_void) {
        self.process.write(process);
    }

    /// Opaque pointer to the thread's context.
    #[inline]
    pub fn context(&self) -> *mut c_void {
        self.context.read()
    }

    /// Sets the thread's context.
    #[inline]
    pub fn set_context(&self, context: *mut c_void) {
        self.context.write(context);
    }
}

impl core::fmt::Debug for ThreadVars {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ThreadVars")
            .field("stack_id", &self.stack_id)
            .field("tid", &self.tid())
            .field("waiting", &!self.next_wait.read().is_null())
            .field("return_code", &self.return_code())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn double(arg: *mut c_void) -> ResultCode {
        arg as usize as ResultCode * 2
    }

    #[test]
    fn test_new_vars_have_unique_stack_ids() {
        let a = ThreadVars::new();
        let b = ThreadVars::new();
        assert!(a.is_initialized());
        assert_ne!(a.stack_id(), b.stack_id());
    }

    #[test]
    fn test_main_task_roundtrip_under_lock() {
        let vars = ThreadVars::new();

        vars.lock();
        // SAFETY: The lock flag is held.
        unsafe { vars.set_main_task(Some(double), 21 as *mut c_void) };
        vars.unlock();

        vars.lock();
        // SAFETY: The lock flag is held.
        let (task, arg) = unsafe { vars.main_task() };
        vars.unlock();

        assert_eq!(task.map(|task| task(arg)), Some(42));
    }
}
