//! Process-global fallback log.

use core::fmt;

use exo_svc::io::{self, Fd};

use crate::entry::Entry;

static STATIC_LOG: StaticLog = StaticLog { sink: io::STDERR };

/// An unbuffered log writing each entry straight to standard error.
///
/// Usable from any thread at any time, including before the runtime is initialized and after it
/// has been torn down. Concurrent entries may interleave.
#[derive(Debug)]
pub struct StaticLog {
    sink: Fd,
}

impl StaticLog {
    /// Writes one entry, bounded like a buffered entry. Write errors are dropped.
    pub fn print(&self, args: fmt::Arguments<'_>) {
        let entry = Entry::format(args);
        let _ = io::write_all(self.sink, entry.as_bytes());
    }

    /// The output sink.
    pub fn sink(&self) -> Fd {
        self.sink
    }
}

/// The process-global fallback log.
#[inline]
pub fn static_log() -> &'static StaticLog {
    &STATIC_LOG
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::tests::Pipe;

    #[test]
    fn test_static_log_writes_immediately() {
        let pipe = Pipe::new();
        let log = StaticLog { sink: pipe.write };

        log.print(format_args!("early {}\n", 1));

        assert_eq!(pipe.drain(), b"early 1\n");
        assert_eq!(static_log().sink(), io::STDERR);
    }
}
