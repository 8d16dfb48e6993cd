//! Segment layout of a TLS block.

use exo_svc::{mem, signal::MIN_SIGNAL_STACK_SIZE};

/// Size and alignment of a TLS block in bytes.
///
/// Large enough for every segment plus three guard pages on 4 KiB and 16 KiB page systems.
pub const TLS_SIZE: usize = 1 << 20;

/// Minimum size of the variables segment.
pub const VARS_MIN_SIZE: usize = 16 * 1024;

/// Minimum size of the primary thread stack.
pub const THREAD_STACK_MIN_SIZE: usize = 256 * 1024;

static_assertions::const_assert!(TLS_SIZE.is_power_of_two());

/// Byte offsets and sizes of the segments of a TLS block.
///
/// All values are multiples of the page size the layout was computed for.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TlsLayout {
    /// Page size the layout was computed for.
    pub page_size: usize,
    /// Size of the variables segment, which starts at offset 0.
    pub vars_size: usize,
    /// Offset of the alternate signal stack.
    pub signal_stack_offset: usize,
    /// Size of the alternate signal stack.
    pub signal_stack_size: usize,
    /// Offset of the primary thread stack.
    pub thread_stack_offset: usize,
    /// Size of the primary thread stack.
    pub thread_stack_size: usize,
}

impl TlsLayout {
    /// Returns the layout for the running system's page size.
    pub fn current() -> Self {
        Self::for_page_size(mem::page_size())
    }

    /// Computes the layout for `page_size`.
    ///
    /// `page_size` must be a power of two small enough for all segments to fit into
    /// [`TLS_SIZE`].
    pub const fn for_page_size(page_size: usize) -> Self {
        let vars_size = round_up(VARS_MIN_SIZE, page_size);
        let signal_stack_offset = vars_size + page_size;
        let signal_stack_size = round_up(MIN_SIGNAL_STACK_SIZE, page_size);
        let thread_stack_offset = signal_stack_offset + signal_stack_size + page_size;
        let min_stack = if libc::PTHREAD_STACK_MIN > THREAD_STACK_MIN_SIZE {
            libc::PTHREAD_STACK_MIN
        } else {
            THREAD_STACK_MIN_SIZE
        };
        let thread_stack_size = round_up(min_stack, page_size);

        Self {
            page_size,
            vars_size,
            signal_stack_offset,
            signal_stack_size,
            thread_stack_offset,
            thread_stack_size,
        }
    }

    /// Offset of the first byte after the thread stack. Everything from here to
    /// [`TLS_SIZE`] is the trailing guard.
    pub const fn thread_stack_end(&self) -> usize {
        self.thread_stack_offset + self.thread_stack_size
    }

    /// The three guard ranges as `(offset, size)`, lowest first.
    pub const fn guards(&self) -> [(usize, usize); 3] {
        [
            (self.vars_size, self.page_size),
            (
                self.signal_stack_offset + self.signal_stack_size,
                self.page_size,
            ),
            (self.thread_stack_end(), TLS_SIZE - self.thread_stack_end()),
        ]
    }

    /// Returns `true` if every segment and a non-empty trailing guard fit into [`TLS_SIZE`].
    pub const fn fits(&self) -> bool {
        self.thread_stack_end() + self.page_size <= TLS_SIZE
    }
}

const fn round_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_fits_common_page_sizes() {
        for page in [4096, 16 * 1024, 64 * 1024] {
            let layout = TlsLayout::for_page_size(page);
            assert!(layout.fits(), "page size {page}: {layout:?}");
            assert!(layout.vars_size >= VARS_MIN_SIZE);
            assert!(layout.signal_stack_size >= MIN_SIGNAL_STACK_SIZE);
            assert!(layout.thread_stack_size >= THREAD_STACK_MIN_SIZE);
            assert!(layout.thread_stack_size >= libc::PTHREAD_STACK_MIN);
        }
    }

    #[test]
    fn test_layout_segments_ordered_with_guards() {
        let layout = TlsLayout::current();
        let [g1, g2, g3] = layout.guards();

        assert_eq!(g1.0, layout.vars_size);
        assert_eq!(g1.0 + g1.1, layout.signal_stack_offset);
        assert_eq!(g2.0 + g2.1, layout.thread_stack_offset);
        assert_eq!(g3.0 + g3.1, TLS_SIZE);
        for (offset, size) in layout.guards() {
            assert_eq!(offset % layout.page_size, 0);
            assert!(size >= layout.page_size);
        }
    }
}
