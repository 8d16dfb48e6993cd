//! The fatal diagnostic path.

use core::fmt::{self, Write};

use crate::{io, process};

/// Size of the on-stack buffer a fatal diagnostic is formatted into.
const FATAL_BUF_SIZE: usize = 512;

/// Writes `Fatal error: <args>` to standard error and aborts the process.
///
/// Used for conditions the runtime cannot recover from: a fail-fast lock wrapper that failed,
/// an init count out of bounds, or state that should be unreachable. The message is formatted
/// into a fixed buffer, so it works without an allocator and from any stack.
#[cold]
pub fn fatal(args: fmt::Arguments<'_>) -> ! {
    let mut buf = StackBuf {
        data: [0; FATAL_BUF_SIZE],
        len: 0,
    };
    let _ = buf.write_str("Fatal error: ");
    let _ = buf.write_fmt(args);
    buf.push_newline();

    let _ = io::write_all(io::STDERR, buf.as_bytes());
    process::abort()
}

/// Calls [`fatal`] with `format_args!` syntax.
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)*) => {
        $crate::debug::fatal(format_args!($($arg)*))
    };
}

/// A bounded, truncating `fmt::Write` sink.
struct StackBuf {
    data: [u8; FATAL_BUF_SIZE],
    len: usize,
}

impl StackBuf {
    /// The last byte is always kept free for this.
    fn push_newline(&mut self) {
        self.data[self.len] = b'\n';
        self.len += 1;
    }

    fn as_bytes(&self) -> &[u8] {
        &self.data[..self.len]
    }
}

impl Write for StackBuf {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let room = FATAL_BUF_SIZE - 1 - self.len;
        let n = s.len().min(room);
        self.data[self.len..self.len + n].copy_from_slice(&s.as_bytes()[..n]);
        self.len += n;
        if n < s.len() { Err(fmt::Error) } else { Ok(()) }
    }
}
