//! Process identity and termination.

/// A user id.
pub type Uid = libc::uid_t;

/// Returns the real user id of the process.
#[inline]
pub fn real_uid() -> Uid {
    // SAFETY: `getuid` cannot fail.
    unsafe { libc::getuid() }
}

/// Returns the effective user id of the process.
#[inline]
pub fn effective_uid() -> Uid {
    // SAFETY: `geteuid` cannot fail.
    unsafe { libc::geteuid() }
}

/// Terminates the process abnormally.
pub fn abort() -> ! {
    // SAFETY: `abort` does not return and has no preconditions.
    unsafe { libc::abort() }
}
