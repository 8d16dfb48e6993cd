//! Per-thread page-granular block allocation.

use core::{cell::RefCell, ptr::NonNull};

use exo_svc::{error::ErrorKind, mem};

use crate::{blockmap::BlockMap, error::RtError};

#[derive(Debug, Copy, Clone)]
struct Block {
    addr: NonNull<u8>,
    size: usize,
}

/// Maps whole pages for one thread and registers each block in the process block map.
#[derive(Debug)]
pub struct PageCache {
    owner: u32,
    map: NonNull<BlockMap>,
    blocks: RefCell<Vec<Block>>,
}

impl PageCache {
    /// A page cache for the thread with stack id `owner`.
    ///
    /// `map` must outlive the page cache.
    pub(crate) fn new(owner: u32, map: &BlockMap) -> Self {
        Self {
            owner,
            map: NonNull::from(map),
            blocks: RefCell::new(Vec::new()),
        }
    }

    fn map(&self) -> &BlockMap {
        // SAFETY: The process context outlives every thread context.
        unsafe { self.map.as_ref() }
    }

    /// Maps `pages` zeroed pages.
    pub fn alloc_pages(&self, pages: usize) -> Result<NonNull<u8>, RtError> {
        if pages == 0 {
            return Err(ErrorKind::InvalidArgument.into());
        }
        let size = pages
            .checked_mul(mem::page_size())
            .ok_or(ErrorKind::Overflow)?;
        let addr = mem::map(size)?;

        if let Err(err) = self.map().insert(addr.as_ptr() as usize, self.owner) {
            // SAFETY: The block was mapped above and never handed out.
            let _ = unsafe { mem::unmap(addr, size) };
            return Err(err.into());
        }
        self.blocks.borrow_mut().push(Block { addr, size });
        Ok(addr)
    }

    /// Unmaps a block returned by [`alloc_pages`](Self::alloc_pages).
    ///
    /// # Safety
    ///
    /// Nothing may access the block afterwards.
    pub unsafe fn free_pages(&self, addr: NonNull<u8>) -> Result<(), RtError> {
        let block = {
            let mut blocks = self.blocks.borrow_mut();
            let index = blocks
                .iter()
                .position(|b| b.addr == addr)
                .ok_or(ErrorKind::InvalidArgument)?;
            blocks.swap_remove(index)
        };
        // SAFETY: Forwarded from the caller.
        unsafe { self.release(block) }
    }

    /// Number of blocks currently mapped.
    pub fn num_blocks(&self) -> usize {
        self.blocks.borrow().len()
    }

    /// Unmaps every block. Returns the last error.
    pub(crate) fn release_all(&self) -> Result<(), RtError> {
        let blocks = core::mem::take(&mut *self.blocks.borrow_mut());
        if !blocks.is_empty() {
            log::debug!("pagecache: releasing {} leftover blocks", blocks.len());
        }
        let mut result = Ok(());
        for block in blocks {
            // SAFETY: The owning thread context is being torn down.
            if let Err(err) = unsafe { self.release(block) } {
                result = Err(err);
            }
        }
        result
    }

    unsafe fn release(&self, block: Block) -> Result<(), RtError> {
        let owner = self.map().remove(block.addr.as_ptr() as usize);
        // SAFETY: Forwarded from the caller.
        unsafe { mem::unmap(block.addr, block.size) }?;
        let owner = owner?;
        if owner != self.owner {
            log::warn!("pagecache: block owned by {owner}, released by {}", self.owner);
        }
        Ok(())
    }
}
