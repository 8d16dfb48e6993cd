//! Process-wide map of page-cache blocks to their owning threads.

use core::cell::UnsafeCell;
use std::collections::BTreeMap;

use exo_svc::error::{ErrorKind, ResultCode, ToRawResultCode};
use exo_sys_sync::Mutex;

/// `(block address, owner stack id)` pairs, one per live page-cache block.
///
/// The map grows with the number of blocks; it puts no bound on the number of threads.
pub struct BlockMap {
    mutex: Mutex,
    blocks: UnsafeCell<BTreeMap<usize, u32>>,
}

// SAFETY: `blocks` is only accessed with `mutex` held.
unsafe impl Sync for BlockMap {}
unsafe impl Send for BlockMap {}

impl Default for BlockMap {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockMap {
    pub const fn new() -> Self {
        Self {
            mutex: Mutex::new(),
            blocks: UnsafeCell::new(BTreeMap::new()),
        }
    }

    /// Records that `owner` owns the block at `addr`.
    pub fn insert(&self, addr: usize, owner: u32) -> Result<(), BlockMapError> {
        self.with_blocks(|blocks| {
            if blocks.contains_key(&addr) {
                return Err(BlockMapError::Duplicate);
            }
            blocks.insert(addr, owner);
            Ok(())
        })
    }

    /// Forgets the block at `addr` and returns its owner.
    pub fn remove(&self, addr: usize) -> Result<u32, BlockMapError> {
        self.with_blocks(|blocks| blocks.remove(&addr).ok_or(BlockMapError::NotFound))
    }

    /// The owner of the block at `addr`.
    pub fn owner_of(&self, addr: usize) -> Option<u32> {
        self.with_blocks(|blocks| blocks.get(&addr).copied())
    }

    /// Number of tracked blocks.
    pub fn len(&self) -> usize {
        self.with_blocks(|blocks| blocks.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn with_blocks<R>(&self, f: impl FnOnce(&mut BTreeMap<usize, u32>) -> R) -> R {
        self.mutex.slock();
        // SAFETY: The mutex is held.
        let result = f(unsafe { &mut *self.blocks.get() });
        self.mutex.sunlock();
        result
    }
}

impl core::fmt::Debug for BlockMap {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BlockMap").field("len", &self.len()).finish()
    }
}

/// Error type for [`BlockMap`] operations.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BlockMapError {
    #[error("Block already registered")]
    Duplicate,
    #[error("Block not registered")]
    NotFound,
}

impl ToRawResultCode for BlockMapError {
    fn to_rc(self) -> ResultCode {
        match self {
            Self::Duplicate => ErrorKind::Busy.to_rc(),
            Self::NotFound => ErrorKind::InvalidArgument.to_rc(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread};

    use super::*;

    #[test]
    fn test_insert_lookup_remove() {
        let map = BlockMap::new();

        map.insert(0x1000, 7).unwrap();
        map.insert(0x2000, 9).unwrap();
        assert_eq!(map.insert(0x1000, 8), Err(BlockMapError::Duplicate));

        assert_eq!(map.owner_of(0x2000), Some(9));
        assert_eq!(map.remove(0x1000), Ok(7));
        assert_eq!(map.remove(0x1000), Err(BlockMapError::NotFound));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_map_grows_past_many_blocks() {
        let map = BlockMap::new();
        for i in 0..1_000usize {
            map.insert(0x1000 * (i + 1), i as u32).unwrap();
        }
        assert_eq!(map.len(), 1_000);
        assert_eq!(map.owner_of(0x1000 * 700), Some(699));
    }

    #[test]
    fn test_concurrent_owners_tracked() {
        let map = Arc::new(BlockMap::new());
        let workers: Vec<_> = (0..4u32)
            .map(|owner| {
                let map = Arc::clone(&map);
                thread::spawn(move || {
                    for i in 0..8usize {
                        let addr = (owner as usize + 1) * 0x10_0000 + i * 0x1000;
                        map.insert(addr, owner).unwrap();
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        assert_eq!(map.len(), 32);
        assert_eq!(map.owner_of(3 * 0x10_0000 + 0x1000), Some(2));
    }
}
