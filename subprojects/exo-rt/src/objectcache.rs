//! Per-thread reusable I/O page.

use core::{cell::Cell, ptr::NonNull};

use exo_svc::{error::ErrorKind, mem};

use crate::{error::RtError, pagecache::PageCache};

/// One page borrowed from the thread's page cache, lent out as scratch I/O space.
#[derive(Debug)]
pub struct ObjectCache {
    page: NonNull<u8>,
    size: usize,
    in_use: Cell<bool>,
}

impl ObjectCache {
    pub(crate) fn new(pagecache: &PageCache) -> Result<Self, RtError> {
        Ok(Self {
            page: pagecache.alloc_pages(1)?,
            size: mem::page_size(),
            in_use: Cell::new(false),
        })
    }

    /// Size of the I/O page.
    pub fn io_size(&self) -> usize {
        self.size
    }

    /// Lends the I/O page to `f`. Fails with `Busy` if the page is already lent.
    pub fn with_io_page<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> Result<R, RtError> {
        if self.in_use.replace(true) {
            return Err(ErrorKind::Busy.into());
        }
        // SAFETY: The page is mapped and `in_use` guarantees exclusive access.
        let page = unsafe { core::slice::from_raw_parts_mut(self.page.as_ptr(), self.size) };
        let result = f(page);
        self.in_use.set(false);
        Ok(result)
    }

    /// Returns the page to `pagecache`.
    pub(crate) fn release(self, pagecache: &PageCache) -> Result<(), RtError> {
        // SAFETY: `self` is consumed; the page is no longer reachable.
        unsafe { pagecache.free_pages(self.page) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockmap::BlockMap;

    #[test]
    fn test_io_page_lent_exclusively() {
        let map = BlockMap::new();
        let pagecache = PageCache::new(3, &map);
        let cache = ObjectCache::new(&pagecache).unwrap();
        assert_eq!(pagecache.num_blocks(), 1);

        let nested = cache
            .with_io_page(|page| {
                page[0] = 0xAB;
                cache.with_io_page(|_| ()).is_err()
            })
            .unwrap();
        assert!(nested);
        assert_eq!(cache.with_io_page(|page| page[0]).unwrap(), 0xAB);

        cache.release(&pagecache).unwrap();
        assert_eq!(pagecache.num_blocks(), 0);
        assert!(map.is_empty());
    }
}
