//! Placement of runtime records in a TLS user area.
//!
//! ```text
//! user area start
//! ├── ThreadContext          every runtime thread
//! ├── ProcessContext         main thread only
//! └── static arena           main thread only, up to the end of the user area
//! ```

use core::ptr::NonNull;

use exo_sys_thread_tls::ThreadLocalBlock;

use crate::{
    arena::StaticArena,
    config::{AREA_ALIGN, contexts_size, round_up},
    process::ProcessContext,
    thread_context::ThreadContext,
};

static_assertions::const_assert!(align_of::<ThreadContext>() <= AREA_ALIGN);
static_assertions::const_assert!(align_of::<ProcessContext>() <= AREA_ALIGN);

/// The user area of one TLS block.
#[derive(Debug, Copy, Clone)]
pub(crate) struct UserArea {
    start: NonNull<u8>,
    size: usize,
}

impl UserArea {
    pub(crate) fn of(block: ThreadLocalBlock) -> Self {
        let (start, size) = block.user_area();
        Self { start, size }
    }

    /// The user area of the calling runtime thread.
    pub(crate) fn current() -> Self {
        // SAFETY: Only called from runtime threads, which run on their TLS block.
        Self::of(unsafe { ThreadLocalBlock::current() })
    }

    /// Writes a static [`ThreadContext`] at the start of the area.
    ///
    /// # Safety
    ///
    /// No live context may occupy the slot. The returned reference is valid until the block is
    /// freed.
    pub(crate) unsafe fn place_thread_context(&self) -> &'static mut ThreadContext {
        let ptr = self.start.cast::<ThreadContext>();
        // SAFETY: The slot is aligned, inside the area and unoccupied.
        unsafe {
            ptr.write(ThreadContext::new_static());
            &mut *ptr.as_ptr()
        }
    }

    /// Writes a static [`ProcessContext`] after the thread context slot.
    ///
    /// # Safety
    ///
    /// As for [`place_thread_context`](Self::place_thread_context).
    pub(crate) unsafe fn place_process_context(&self) -> &'static mut ProcessContext {
        let offset = round_up(size_of::<ThreadContext>(), AREA_ALIGN);
        // SAFETY: The slot is aligned, inside the area and unoccupied.
        unsafe {
            let ptr = self.start.add(offset).cast::<ProcessContext>();
            ptr.write(ProcessContext::new_static());
            &mut *ptr.as_ptr()
        }
    }

    /// An arena over the rest of the area, at most `size` bytes.
    ///
    /// # Safety
    ///
    /// The arena region must not be handed out twice.
    pub(crate) unsafe fn arena(&self, size: usize) -> StaticArena {
        let offset = contexts_size();
        let size = size.min(self.size.saturating_sub(offset));
        // SAFETY: The region lies inside the user area, after both context slots.
        unsafe { StaticArena::new(self.start.add(offset), size) }
    }
}
