//! Bounded formatting of a single log entry.

use core::fmt::{self, Write};

/// Maximum number of bytes a single log entry may occupy.
pub const PRINTF_MAX: usize = 511;

/// Appended to an entry that was cut at [`PRINTF_MAX`] bytes.
pub const TRUNCATION_MARKER: &[u8] = b" <truncated>\n";

static_assertions::const_assert!(TRUNCATION_MARKER.len() < PRINTF_MAX);

/// A formatted entry of at most [`PRINTF_MAX`] bytes.
pub(crate) struct Entry {
    data: [u8; PRINTF_MAX],
    len: usize,
    truncated: bool,
}

impl Entry {
    /// Formats `args`. If the output exceeds [`PRINTF_MAX`] bytes, it is cut so that the
    /// [`TRUNCATION_MARKER`] fits and the marker is appended.
    pub(crate) fn format(args: fmt::Arguments<'_>) -> Self {
        let mut entry = Self {
            data: [0; PRINTF_MAX],
            len: 0,
            truncated: false,
        };
        if entry.write_fmt(args).is_err() || entry.truncated {
            entry.truncated = true;
            let keep = PRINTF_MAX - TRUNCATION_MARKER.len();
            entry.data[keep..].copy_from_slice(TRUNCATION_MARKER);
            entry.len = PRINTF_MAX;
        }
        entry
    }

    pub(crate) fn as_bytes(&self) -> &[u8] {
        &self.data[..self.len]
    }

    pub(crate) fn is_truncated(&self) -> bool {
        self.truncated
    }
}

impl Write for Entry {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let room = PRINTF_MAX - self.len;
        if s.len() > room {
            self.data[self.len..].copy_from_slice(&s.as_bytes()[..room]);
            self.len = PRINTF_MAX;
            self.truncated = true;
            return Err(fmt::Error);
        }
        self.data[self.len..self.len + s.len()].copy_from_slice(s.as_bytes());
        self.len += s.len();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_entry_kept_verbatim() {
        let entry = Entry::format(format_args!("value={}", 42));
        assert_eq!(entry.as_bytes(), b"value=42");
        assert!(!entry.is_truncated());
    }

    #[test]
    fn test_entry_of_exactly_max_not_truncated() {
        let text = "x".repeat(PRINTF_MAX);
        let entry = Entry::format(format_args!("{text}"));
        assert_eq!(entry.as_bytes().len(), PRINTF_MAX);
        assert!(!entry.is_truncated());
    }

    #[test]
    fn test_long_entry_ends_with_marker() {
        let text = "y".repeat(PRINTF_MAX + 1);
        let entry = Entry::format(format_args!("{text}"));

        assert!(entry.is_truncated());
        assert_eq!(entry.as_bytes().len(), PRINTF_MAX);
        assert!(entry.as_bytes().ends_with(TRUNCATION_MARKER));
        assert!(entry.as_bytes()[..PRINTF_MAX - TRUNCATION_MARKER.len()]
            .iter()
            .all(|&b| b == b'y'));
    }
}
