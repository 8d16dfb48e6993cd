//! Alternate signal stack registration.
//!
//! The alternate signal stack is a per-thread setting. Handlers installed with `SA_ONSTACK` run
//! on it, which keeps stack-overflow faults in the primary stack diagnosable.

use core::{
    ffi::c_void,
    mem::MaybeUninit,
    ptr::{self, NonNull},
};

use crate::error::{Errno, ErrorKind, ResultCode, ToRawResultCode};

/// Smallest accepted alternate signal stack, in bytes.
pub const MIN_SIGNAL_STACK_SIZE: usize = if libc::MINSIGSTKSZ > libc::SIGSTKSZ {
    libc::MINSIGSTKSZ
} else {
    libc::SIGSTKSZ
};

/// A previously registered alternate signal stack, returned by [`set_alt_stack`].
#[derive(Copy, Clone)]
pub struct AltStack(libc::stack_t);

impl AltStack {
    /// Returns `true` if no alternate stack was registered.
    pub fn is_disabled(&self) -> bool {
        self.0.ss_flags & libc::SS_DISABLE != 0
    }
}

impl core::fmt::Debug for AltStack {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AltStack")
            .field("base", &self.0.ss_sp)
            .field("size", &self.0.ss_size)
            .field("disabled", &self.is_disabled())
            .finish()
    }
}

/// Registers `base..base + size` as the calling thread's alternate signal stack.
///
/// Returns the registration it replaced so it can be put back with [`restore_alt_stack`].
///
/// # Safety
///
/// The region must be mapped read/write and stay mapped until the registration is replaced.
pub unsafe fn set_alt_stack(base: NonNull<u8>, size: usize) -> Result<AltStack, SigAltStackError> {
    if size < MIN_SIGNAL_STACK_SIZE {
        return Err(SigAltStackError::TooSmall);
    }

    let new = libc::stack_t {
        ss_sp: base.as_ptr().cast::<c_void>(),
        ss_flags: 0,
        ss_size: size,
    };
    let mut old = MaybeUninit::<libc::stack_t>::uninit();

    // SAFETY: Both pointers reference valid `stack_t` storage.
    let rc = unsafe { libc::sigaltstack(&new, old.as_mut_ptr()) };
    if rc != 0 {
        return Err(SigAltStackError::from_errno(Errno::last()));
    }

    // SAFETY: `sigaltstack` succeeded and wrote the old registration.
    Ok(AltStack(unsafe { old.assume_init() }))
}

/// Restores a registration previously returned by [`set_alt_stack`].
pub fn restore_alt_stack(prev: AltStack) -> Result<(), SigAltStackError> {
    let mut stack = prev.0;
    if prev.is_disabled() {
        stack.ss_sp = ptr::null_mut();
        stack.ss_size = 0;
        stack.ss_flags = libc::SS_DISABLE;
    }

    // SAFETY: `stack` is a valid `stack_t`; the old value is not requested.
    let rc = unsafe { libc::sigaltstack(&stack, ptr::null_mut()) };
    if rc != 0 {
        return Err(SigAltStackError::from_errno(Errno::last()));
    }

    Ok(())
}

/// Error type for [`set_alt_stack`] and [`restore_alt_stack`].
#[derive(Debug, thiserror::Error)]
pub enum SigAltStackError {
    /// The region is smaller than [`MIN_SIGNAL_STACK_SIZE`].
    #[error("Signal stack too small")]
    TooSmall,
    /// The thread is currently executing on its alternate stack.
    #[error("Alternate signal stack in use")]
    InUse,
    /// Any other errno.
    #[error("Unknown error: {0}")]
    Unknown(Errno),
}

impl SigAltStackError {
    fn from_errno(err: Errno) -> Self {
        match err.to_raw() {
            libc::ENOMEM => Self::TooSmall,
            libc::EPERM => Self::InUse,
            _ => Self::Unknown(err),
        }
    }
}

impl ToRawResultCode for SigAltStackError {
    fn to_rc(self) -> ResultCode {
        match self {
            Self::TooSmall => ErrorKind::InvalidArgument.to_rc(),
            Self::InUse => ErrorKind::Busy.to_rc(),
            Self::Unknown(err) => err.to_rc(),
        }
    }
}
