//! Human-readable descriptions of result codes.

use exo_svc::error::{ErrorKind, ResultCode, SUCCESS, ToRawResultCode};

const UNKNOWN: &str = "Unknown error";

/// Maps result codes to short descriptions.
#[derive(Debug)]
pub struct ErrorStrings {
    table: [(ResultCode, &'static str); ErrorKind::ALL.len() + 1],
}

impl ErrorStrings {
    pub fn new() -> Self {
        let mut table = [(SUCCESS, "Success"); ErrorKind::ALL.len() + 1];
        for (slot, kind) in table[1..].iter_mut().zip(ErrorKind::ALL) {
            *slot = (kind.to_rc(), describe_kind(kind));
        }
        Self { table }
    }

    /// Describes `rc`, or returns a generic text for codes outside the taxonomy.
    pub fn describe(&self, rc: ResultCode) -> &'static str {
        self.table
            .iter()
            .find(|(code, _)| *code == rc)
            .map_or(UNKNOWN, |(_, text)| text)
    }
}

impl Default for ErrorStrings {
    fn default() -> Self {
        Self::new()
    }
}

fn describe_kind(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::OutOfMemory => "Out of memory",
        ErrorKind::InvalidArgument => "Invalid argument",
        ErrorKind::InvalidState => "Invalid state",
        ErrorKind::Busy => "Resource busy",
        ErrorKind::Overflow => "Value overflow",
        ErrorKind::Deadlock => "Deadlock detected",
        ErrorKind::Permission => "Operation not permitted",
        ErrorKind::Empty => "Empty",
        ErrorKind::Cancelled => "Operation cancelled",
        ErrorKind::IoTruncated => "Output truncated",
        ErrorKind::Timeout => "Timed out",
        ErrorKind::ProtectFailed => "Page protection failed",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe_known_and_unknown_codes() {
        let strings = ErrorStrings::new();
        assert_eq!(strings.describe(SUCCESS), "Success");
        assert_eq!(strings.describe(ErrorKind::Busy.to_rc()), "Resource busy");
        assert_eq!(strings.describe(ErrorKind::Timeout.to_rc()), "Timed out");
        assert_eq!(strings.describe(-12345), UNKNOWN);
    }
}
