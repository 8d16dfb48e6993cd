//! Error taxonomy and raw result codes.
//!
//! Errors travel as typed `Result`s inside Rust code. Wherever an integer code is required
//! (exothread return values, user main exit codes, startup diagnostics) they are lowered with
//! [`ToRawResultCode::to_rc`]. Codes are errno values, `0` is success.

use core::fmt;

/// The raw representation of a result code. `0` means success.
pub type ResultCode = i32;

/// Successful result code.
pub const SUCCESS: ResultCode = 0;

/// Lowers an error into its raw [`ResultCode`].
pub trait ToRawResultCode {
    /// Returns the raw, non-zero result code for this error.
    fn to_rc(self) -> ResultCode;
}

/// A raw `errno` value reported by the host.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
#[repr(transparent)]
pub struct Errno(i32);

impl Errno {
    /// Interrupted by a signal.
    pub const INTR: Errno = Errno(libc::EINTR);
    /// Resource temporarily unavailable.
    pub const AGAIN: Errno = Errno(libc::EAGAIN);
    /// Timer expired.
    pub const TIMEDOUT: Errno = Errno(libc::ETIMEDOUT);

    /// Wraps a raw errno value.
    #[inline]
    pub const fn from_raw(value: i32) -> Self {
        Self(value)
    }

    /// Returns the raw errno value.
    #[inline]
    pub const fn to_raw(self) -> i32 {
        self.0
    }

    /// Reads the calling thread's `errno`.
    #[inline]
    pub fn last() -> Self {
        // SAFETY: `__errno_location` always returns a valid pointer to the thread's errno.
        Self(unsafe { *libc::__errno_location() })
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match ErrorKind::from_rc(self.0) {
            Some(kind) => write!(f, "errno {} ({})", self.0, kind),
            None => write!(f, "errno {}", self.0),
        }
    }
}

impl fmt::Debug for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Errno").field(&self.0).finish()
    }
}

impl core::error::Error for Errno {}

impl ToRawResultCode for Errno {
    fn to_rc(self) -> ResultCode {
        self.0
    }
}

/// The abstract error kinds shared by every layer of the runtime.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, thiserror::Error)]
pub enum ErrorKind {
    /// An allocation could not be satisfied.
    #[error("Out of memory")]
    OutOfMemory,
    /// A precondition on an argument does not hold.
    #[error("Invalid argument")]
    InvalidArgument,
    /// The object is finished, not yet initialized, or otherwise in the wrong state.
    #[error("Invalid state")]
    InvalidState,
    /// The object is in use.
    #[error("Resource busy")]
    Busy,
    /// A counter would exceed its maximum.
    #[error("Value overflow")]
    Overflow,
    /// The calling thread already owns the lock.
    #[error("Deadlock detected")]
    Deadlock,
    /// The calling thread does not own the lock.
    #[error("Operation not permitted")]
    Permission,
    /// Nothing to operate on.
    #[error("Empty")]
    Empty,
    /// The operation was cancelled from outside.
    #[error("Operation cancelled")]
    Cancelled,
    /// Output did not fit and was truncated.
    #[error("Output truncated")]
    IoTruncated,
    /// A deadline expired.
    #[error("Timed out")]
    Timeout,
    /// Changing page protection failed.
    #[error("Page protection failed")]
    ProtectFailed,
}

impl ErrorKind {
    /// Every kind, in declaration order.
    pub const ALL: [ErrorKind; 12] = [
        ErrorKind::OutOfMemory,
        ErrorKind::InvalidArgument,
        ErrorKind::InvalidState,
        ErrorKind::Busy,
        ErrorKind::Overflow,
        ErrorKind::Deadlock,
        ErrorKind::Permission,
        ErrorKind::Empty,
        ErrorKind::Cancelled,
        ErrorKind::IoTruncated,
        ErrorKind::Timeout,
        ErrorKind::ProtectFailed,
    ];

    /// Returns the errno used as this kind's raw result code.
    pub const fn to_errno(self) -> Errno {
        Errno(match self {
            Self::OutOfMemory => libc::ENOMEM,
            Self::InvalidArgument => libc::EINVAL,
            Self::InvalidState => libc::EPROTO,
            Self::Busy => libc::EBUSY,
            Self::Overflow => libc::EOVERFLOW,
            Self::Deadlock => libc::EDEADLK,
            Self::Permission => libc::EPERM,
            Self::Empty => libc::ENODATA,
            Self::Cancelled => libc::ECANCELED,
            Self::IoTruncated => libc::EMSGSIZE,
            Self::Timeout => libc::ETIME,
            Self::ProtectFailed => libc::EACCES,
        })
    }

    /// Maps a raw result code back to its kind, if it belongs to the taxonomy.
    pub fn from_rc(rc: ResultCode) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.to_errno().to_raw() == rc)
    }
}

impl ToRawResultCode for ErrorKind {
    fn to_rc(self) -> ResultCode {
        self.to_errno().to_raw()
    }
}

impl From<ErrorKind> for Errno {
    fn from(value: ErrorKind) -> Self {
        value.to_errno()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_codes_distinct() {
        let kinds = [
            ErrorKind::OutOfMemory,
            ErrorKind::InvalidArgument,
            ErrorKind::InvalidState,
            ErrorKind::Busy,
            ErrorKind::Overflow,
            ErrorKind::Deadlock,
            ErrorKind::Permission,
            ErrorKind::Empty,
            ErrorKind::Cancelled,
            ErrorKind::IoTruncated,
            ErrorKind::Timeout,
            ErrorKind::ProtectFailed,
        ];

        for (i, a) in kinds.iter().enumerate() {
            assert_ne!(a.to_rc(), SUCCESS);
            assert_eq!(ErrorKind::from_rc(a.to_rc()), Some(*a));
            for b in &kinds[i + 1..] {
                assert_ne!(a.to_rc(), b.to_rc(), "{a} and {b} share a code");
            }
        }
    }

    #[test]
    fn test_from_rc_foreign_errno() {
        assert_eq!(ErrorKind::from_rc(libc::ENOENT), None);
        assert_eq!(ErrorKind::from_rc(SUCCESS), None);
    }

    #[test]
    fn test_errno_display_names_kind() {
        let text = format!("{}", Errno::from(ErrorKind::Busy));
        assert!(text.contains("Resource busy"), "{text}");
    }
}
