//! Descriptor writes that survive signal interruptions.

use crate::error::{Errno, ErrorKind, ResultCode, ToRawResultCode};

/// A raw file descriptor.
pub type Fd = libc::c_int;

/// The standard error descriptor.
pub const STDERR: Fd = libc::STDERR_FILENO;

/// Writes all of `bytes` to `fd`.
///
/// Short writes are continued, `EINTR` and `EAGAIN` are retried. Any other error aborts the
/// write; bytes written before it stay written.
pub fn write_all(fd: Fd, mut bytes: &[u8]) -> Result<(), WriteError> {
    while !bytes.is_empty() {
        // SAFETY: `bytes` is a valid, readable slice for its length.
        let written = unsafe { libc::write(fd, bytes.as_ptr().cast(), bytes.len()) };
        if written < 0 {
            let err = Errno::last();
            if err == Errno::INTR || err == Errno::AGAIN {
                continue;
            }
            return Err(match err.to_raw() {
                libc::EBADF => WriteError::BadDescriptor,
                libc::EPIPE => WriteError::Closed,
                _ => WriteError::Unknown(err),
            });
        }
        if written == 0 {
            return Err(WriteError::Closed);
        }
        bytes = &bytes[written as usize..];
    }
    Ok(())
}

/// Error type for [`write_all`].
#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    /// The descriptor is not open for writing.
    #[error("Bad file descriptor")]
    BadDescriptor,
    /// The reading end went away.
    #[error("Sink closed")]
    Closed,
    /// Any other errno.
    #[error("Unknown error: {0}")]
    Unknown(Errno),
}

impl ToRawResultCode for WriteError {
    fn to_rc(self) -> ResultCode {
        match self {
            Self::BadDescriptor => ErrorKind::InvalidArgument.to_rc(),
            Self::Closed => ErrorKind::InvalidState.to_rc(),
            Self::Unknown(err) => err.to_rc(),
        }
    }
}
