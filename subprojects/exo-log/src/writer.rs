//! Page-mapped buffered log writer.

use core::{fmt, ptr::NonNull};

use exo_svc::{
    error::{ErrorKind, ResultCode, ToRawResultCode},
    io::{self, Fd, WriteError},
    mem::{self, MapError},
};

use crate::entry::Entry;

/// A byte buffer of whole pages that accumulates log entries and writes them to a sink.
///
/// The buffer is always NUL-terminated: one byte of the mapping is reserved, so
/// [`capacity`](Self::capacity) is the mapping size minus one.
pub struct LogWriter {
    mem: NonNull<u8>,
    mapped: usize,
    size: usize,
    sink: Fd,
}

// SAFETY: The writer exclusively owns its mapping.
unsafe impl Send for LogWriter {}

impl LogWriter {
    /// Maps a buffer of `pages` pages writing to `sink`.
    pub fn new(pages: usize, sink: Fd) -> Result<Self, LogError> {
        if pages == 0 {
            return Err(LogError::InvalidSize);
        }
        let mapped = pages
            .checked_mul(mem::page_size())
            .ok_or(LogError::InvalidSize)?;
        let mem = mem::map(mapped)?;

        let mut writer = Self {
            mem,
            mapped,
            size: 0,
            sink,
        };
        writer.clear();
        Ok(writer)
    }

    /// Number of bytes the buffer can hold.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.mapped - 1
    }

    /// Number of buffered bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// The output sink.
    #[inline]
    pub fn sink(&self) -> Fd {
        self.sink
    }

    /// Appends a formatted entry.
    ///
    /// The buffer is flushed first if the entry does not fit into the remaining space. An entry
    /// longer than [`PRINTF_MAX`](crate::PRINTF_MAX) is cut and marked with
    /// [`TRUNCATION_MARKER`](crate::TRUNCATION_MARKER); the marked entry is stored and
    /// [`LogError::Truncated`] is returned.
    pub fn print(&mut self, args: fmt::Arguments<'_>) -> Result<(), LogError> {
        let entry = Entry::format(args);
        let bytes = entry.as_bytes();

        if bytes.len() > self.capacity() - self.size {
            self.flush()?;
        }

        // SAFETY: `size + len <= capacity < mapped`, both ranges are inside the mapping.
        unsafe {
            let tail = self.mem.as_ptr().add(self.size);
            core::ptr::copy_nonoverlapping(bytes.as_ptr(), tail, bytes.len());
            tail.add(bytes.len()).write(0);
        }
        self.size += bytes.len();

        if entry.is_truncated() {
            return Err(LogError::Truncated);
        }
        Ok(())
    }

    /// Writes the buffered bytes to the sink and empties the buffer.
    ///
    /// The buffer is cleared even if the write fails.
    pub fn flush(&mut self) -> Result<(), LogError> {
        let result = io::write_all(self.sink, self.buffer());
        self.clear();
        result.map_err(LogError::from)
    }

    /// Discards the buffered bytes.
    pub fn clear(&mut self) {
        self.size = 0;
        // SAFETY: The mapping is at least one page long.
        unsafe { self.mem.as_ptr().write(0) };
    }

    /// The buffered bytes, without the terminating NUL.
    pub fn buffer(&self) -> &[u8] {
        // SAFETY: The first `size` bytes of the mapping are initialized.
        unsafe { core::slice::from_raw_parts(self.mem.as_ptr(), self.size) }
    }
}

impl Drop for LogWriter {
    fn drop(&mut self) {
        // SAFETY: The mapping is owned by this writer and no longer referenced.
        if let Err(err) = unsafe { mem::unmap(self.mem, self.mapped) } {
            crate::static_log().print(format_args!("log: unmap failed: {err}\n"));
        }
    }
}

impl fmt::Debug for LogWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogWriter")
            .field("capacity", &self.capacity())
            .field("size", &self.size)
            .field("sink", &self.sink)
            .finish()
    }
}

/// Error type for log operations.
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    /// The entry exceeded the per-entry limit and was stored truncated.
    #[error("Log entry truncated")]
    Truncated,
    /// Zero pages, or a size that overflows.
    #[error("Invalid log buffer size")]
    InvalidSize,
    /// The thread already owns a log writer.
    #[error("Thread log already initialized")]
    AlreadyInitialized,
    /// The buffer could not be mapped.
    #[error("Failed to map log buffer: {0}")]
    Map(#[from] MapError),
    /// The sink rejected the write.
    #[error("Failed to write log: {0}")]
    Write(#[from] WriteError),
}

impl ToRawResultCode for LogError {
    fn to_rc(self) -> ResultCode {
        match self {
            Self::Truncated => ErrorKind::IoTruncated.to_rc(),
            Self::InvalidSize => ErrorKind::InvalidArgument.to_rc(),
            Self::AlreadyInitialized => ErrorKind::InvalidState.to_rc(),
            Self::Map(err) => err.to_rc(),
            Self::Write(err) => err.to_rc(),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{PRINTF_MAX, TRUNCATION_MARKER};

    pub(crate) struct Pipe {
        pub(crate) read: Fd,
        pub(crate) write: Fd,
    }

    impl Pipe {
        pub(crate) fn new() -> Self {
            let mut fds = [0; 2];
            // SAFETY: `fds` has room for two descriptors.
            assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
            // SAFETY: Non-blocking reads let tests probe an empty pipe.
            unsafe { libc::fcntl(fds[0], libc::F_SETFL, libc::O_NONBLOCK) };
            Self {
                read: fds[0],
                write: fds[1],
            }
        }

        /// Drains everything currently in the pipe.
        pub(crate) fn drain(&self) -> Vec<u8> {
            let mut out = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                // SAFETY: `buf` is valid for its length.
                let n = unsafe { libc::read(self.read, buf.as_mut_ptr().cast(), buf.len()) };
                if n <= 0 {
                    return out;
                }
                out.extend_from_slice(&buf[..n as usize]);
            }
        }
    }

    impl Drop for Pipe {
        fn drop(&mut self) {
            // SAFETY: Both descriptors are owned by the pipe.
            unsafe {
                libc::close(self.read);
                libc::close(self.write);
            }
        }
    }

    fn raw_buffer(writer: &LogWriter, len: usize) -> &[u8] {
        // SAFETY: `len` stays within the mapping in the tests below.
        unsafe { core::slice::from_raw_parts(writer.mem.as_ptr(), len) }
    }

    #[test]
    fn test_new_rejects_zero_pages() {
        assert!(matches!(
            LogWriter::new(0, io::STDERR),
            Err(LogError::InvalidSize)
        ));
    }

    #[test]
    fn test_print_appends_and_terminates() {
        let pipe = Pipe::new();
        let mut writer = LogWriter::new(1, pipe.write).expect("log writer");
        assert_eq!(writer.capacity(), mem::page_size() - 1);

        writer.print(format_args!("a={} ", 1)).unwrap();
        writer.print(format_args!("b={}", 2)).unwrap();

        assert_eq!(writer.buffer(), b"a=1 b=2");
        assert_eq!(raw_buffer(&writer, 8)[7], 0);
        assert!(pipe.drain().is_empty());
    }

    #[test]
    fn test_flush_sends_exact_bytes_and_clears() {
        let pipe = Pipe::new();
        let mut writer = LogWriter::new(1, pipe.write).expect("log writer");

        writer.print(format_args!("first\n")).unwrap();
        writer.print(format_args!("second\n")).unwrap();
        writer.flush().unwrap();

        assert_eq!(pipe.drain(), b"first\nsecond\n");
        assert_eq!(writer.size(), 0);
        assert_eq!(raw_buffer(&writer, 1)[0], 0);

        writer.flush().unwrap();
        assert!(pipe.drain().is_empty());
    }

    #[test]
    fn test_exact_fit_fills_buffer_without_flush() {
        let pipe = Pipe::new();
        let mut writer = LogWriter::new(1, pipe.write).expect("log writer");
        let chunk = "c".repeat(PRINTF_MAX);

        while writer.capacity() - writer.size() >= PRINTF_MAX {
            writer.print(format_args!("{chunk}")).unwrap();
        }
        let rest = "r".repeat(writer.capacity() - writer.size());
        writer.print(format_args!("{rest}")).unwrap();

        assert_eq!(writer.size(), writer.capacity());
        assert!(pipe.drain().is_empty());
        assert_eq!(raw_buffer(&writer, writer.mapped)[writer.capacity()], 0);

        writer.print(format_args!("x")).unwrap();
        let flushed = pipe.drain();
        assert_eq!(flushed.len(), writer.capacity());
        assert_eq!(flushed.last(), Some(&b'r'));
        assert_eq!(writer.buffer(), b"x");
    }

    #[test]
    fn test_truncated_entry_stored_with_marker() {
        let pipe = Pipe::new();
        let mut writer = LogWriter::new(1, pipe.write).expect("log writer");
        let long = "z".repeat(PRINTF_MAX * 2);

        let result = writer.print(format_args!("{long}"));

        assert!(matches!(result, Err(LogError::Truncated)));
        assert_eq!(writer.size(), PRINTF_MAX);
        assert!(writer.buffer().ends_with(TRUNCATION_MARKER));
    }

    #[test]
    fn test_flush_to_closed_descriptor_still_clears() {
        let mut writer = LogWriter::new(1, -1).expect("log writer");
        writer.print(format_args!("lost")).unwrap();

        assert!(matches!(
            writer.flush(),
            Err(LogError::Write(WriteError::BadDescriptor))
        ));
        assert_eq!(writer.size(), 0);
    }
}
