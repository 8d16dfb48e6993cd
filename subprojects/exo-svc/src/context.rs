//! User-level execution contexts.
//!
//! A [`UserContext`] wraps the platform `ucontext_t`. It is used to move the calling thread onto
//! a different stack and to come back once the entry function returns.
//!
//! A captured context stores pointers into itself, so a `UserContext` must not be moved between
//! [`UserContext::capture`]/[`UserContext::prepare`] and the last [`switch`] that uses it.

use core::{mem::MaybeUninit, ptr::NonNull};

use crate::error::{Errno, ResultCode, ToRawResultCode};

/// Entry function of a prepared context. It receives no arguments.
pub type ContextEntry = extern "C" fn();

unsafe extern "C" {
    fn getcontext(ucp: *mut libc::ucontext_t) -> libc::c_int;
    fn makecontext(ucp: *mut libc::ucontext_t, func: ContextEntry, argc: libc::c_int, ...);
    fn swapcontext(oucp: *mut libc::ucontext_t, ucp: *const libc::ucontext_t) -> libc::c_int;
}

/// Saved CPU state of a user-level execution context.
pub struct UserContext {
    raw: MaybeUninit<libc::ucontext_t>,
}

impl Default for UserContext {
    fn default() -> Self {
        Self::new()
    }
}

impl UserContext {
    /// Creates an empty (all-zero) context.
    pub const fn new() -> Self {
        Self {
            raw: MaybeUninit::zeroed(),
        }
    }

    /// Saves the calling thread's current state into `self`.
    pub fn capture(&mut self) -> Result<(), ContextError> {
        // SAFETY: `raw` is valid, writable storage for a `ucontext_t`.
        let rc = unsafe { getcontext(self.raw.as_mut_ptr()) };
        if rc != 0 {
            return Err(ContextError::Capture(Errno::last()));
        }
        Ok(())
    }

    /// Prepares `self` to run `entry` on `stack..stack + stack_size`.
    ///
    /// When `entry` returns, execution continues in `link`.
    ///
    /// # Safety
    ///
    /// The stack must be mapped read/write and unused while the context runs. `link` must stay
    /// valid, and unmoved, until `entry` returns. `entry` must not unwind.
    pub unsafe fn prepare(
        &mut self,
        stack: NonNull<u8>,
        stack_size: usize,
        link: &mut UserContext,
        entry: ContextEntry,
    ) -> Result<(), ContextError> {
        self.capture()?;

        let raw = self.raw.as_mut_ptr();
        // SAFETY: `raw` was initialized by `capture`; the stack and link contracts are upheld
        // by the caller.
        unsafe {
            (*raw).uc_stack.ss_sp = stack.as_ptr().cast();
            (*raw).uc_stack.ss_size = stack_size;
            (*raw).uc_stack.ss_flags = 0;
            (*raw).uc_link = link.raw.as_mut_ptr();
            makecontext(raw, entry, 0);
        }
        Ok(())
    }
}

/// Saves the current state into `from` and resumes `to`.
///
/// Returns once something switches back to `from`, or once the entry function of a context
/// linked to `from` returns.
///
/// # Safety
///
/// `to` must have been captured or prepared and must still be valid, including its stack.
pub unsafe fn switch(from: &mut UserContext, to: &UserContext) -> Result<(), ContextError> {
    // SAFETY: Both contexts are valid storage; `to` is initialized per the caller contract.
    let rc = unsafe { swapcontext(from.raw.as_mut_ptr(), to.raw.as_ptr()) };
    if rc != 0 {
        return Err(ContextError::Switch(Errno::last()));
    }
    Ok(())
}

/// Error type for context operations.
#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    /// `getcontext` failed.
    #[error("Failed to capture context: {0}")]
    Capture(Errno),
    /// `swapcontext` failed.
    #[error("Failed to switch context: {0}")]
    Switch(Errno),
}

impl ToRawResultCode for ContextError {
    fn to_rc(self) -> ResultCode {
        match self {
            Self::Capture(err) | Self::Switch(err) => err.to_rc(),
        }
    }
}

#[cfg(test)]
mod tests {
    use core::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::mem;

    static STACK_PROBE: AtomicUsize = AtomicUsize::new(0);

    extern "C" fn probe_stack() {
        let local = 0u8;
        STACK_PROBE.store(core::ptr::addr_of!(local) as usize, Ordering::SeqCst);
    }

    #[test]
    fn test_switch_runs_entry_on_given_stack() {
        let size = 64 * 1024;
        let stack = mem::map(size).expect("map");
        let mut caller = UserContext::new();
        let mut callee = UserContext::new();

        // SAFETY: The stack stays mapped and `caller` stays in place until the switch returns.
        unsafe {
            callee.prepare(stack, size, &mut caller, probe_stack).expect("prepare");
            switch(&mut caller, &callee).expect("switch");
        }

        let probe = STACK_PROBE.load(Ordering::SeqCst);
        let base = stack.as_ptr() as usize;
        assert!(probe >= base && probe < base + size);

        // SAFETY: The context finished running.
        unsafe { mem::unmap(stack, size) }.expect("unmap");
    }
}
