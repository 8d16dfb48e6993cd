//! Runtime threads.
//!
//! A runtime thread is an OS thread on its own TLS block that owns a [`ThreadContext`] bound to
//! the spawning thread's process context. Only available with [`Topology::PerThread`].

use core::{ffi::c_void, ptr, ptr::NonNull};
use std::panic::{self, AssertUnwindSafe};

use exo_svc::error::{ErrorKind, ResultCode, ToRawResultCode};

use crate::{
    area::UserArea, config::Topology, error::RtError, process::ProcessContext,
    thread_context::ThreadContext,
};

type ThreadBody = Box<dyn FnOnce(&ThreadContext) -> ResultCode + Send>;

struct StartRecord {
    process: NonNull<ProcessContext>,
    body: ThreadBody,
}

/// Handle to a runtime thread.
#[derive(Debug)]
#[must_use = "runtime threads must be joined"]
pub struct RtThread {
    inner: exo_sys_thread::Thread,
}

impl RtThread {
    /// Stack id of the thread.
    pub fn stack_id(&self) -> u32 {
        self.inner.vars().stack_id()
    }

    /// Waits for the thread and returns its body's return code.
    pub fn join(self) -> Result<ResultCode, RtError> {
        Ok(self.inner.join()?)
    }
}

/// Returns the calling runtime thread's context, or `None` if it has none.
///
/// Must be called on a runtime thread: one started by [`spawn`] or by
/// [`startup::start`](crate::startup::start).
pub fn current() -> Option<&'static ThreadContext> {
    let ctx = exo_sys_thread::current().context() as *const ThreadContext;
    // SAFETY: A non-null context pointer is set only while the context is initialized.
    unsafe { ctx.as_ref() }
}

/// Starts a runtime thread running `body` with its own thread context.
///
/// Fails with `InvalidState` if the caller has no thread context or the process runs
/// [`Topology::Shared`].
pub fn spawn<F>(body: F) -> Result<RtThread, RtError>
where
    F: FnOnce(&ThreadContext) -> ResultCode + Send + 'static,
{
    let process = current().ok_or(ErrorKind::InvalidState)?.process()?;
    if process.config().topology == Topology::Shared {
        return Err(ErrorKind::InvalidState.into());
    }

    let record = Box::into_raw(Box::new(StartRecord {
        process: NonNull::from(process),
        body: Box::new(body),
    }));
    match exo_sys_thread::spawn(thread_main, record.cast()) {
        Ok(inner) => Ok(RtThread { inner }),
        Err(err) => {
            // SAFETY: The thread never started; the record is still ours.
            drop(unsafe { Box::from_raw(record) });
            Err(err.into())
        }
    }
}

fn thread_main(arg: *mut c_void) -> ResultCode {
    // SAFETY: `spawn` hands over a leaked `StartRecord`.
    let StartRecord { process, body } = *unsafe { Box::from_raw(arg.cast::<StartRecord>()) };
    let vars = exo_sys_thread::current();

    // SAFETY: The user area of a fresh block holds no context yet.
    let ctx = unsafe { UserArea::current().place_thread_context() };
    // SAFETY: The process context outlives every runtime thread.
    let process = unsafe { process.as_ref() };
    if let Err(err) = ctx.init(process, vars.stack_id()) {
        log::error!("thread: context init failed: {err}");
        return err.to_rc();
    }
    vars.set_process(ptr::from_ref(process).cast_mut().cast());
    vars.set_context(ptr::from_mut(ctx).cast());

    let rc = match panic::catch_unwind(AssertUnwindSafe(|| body(ctx))) {
        Ok(rc) => rc,
        Err(_) => {
            log::error!("thread: body panicked");
            ErrorKind::Cancelled.to_rc()
        }
    };

    vars.set_context(ptr::null_mut());
    vars.set_process(ptr::null_mut());
    match ctx.free() {
        Ok(()) => rc,
        Err(err) => {
            log::error!("thread: context free failed: {err}");
            if rc == 0 { err.to_rc() } else { rc }
        }
    }
}
