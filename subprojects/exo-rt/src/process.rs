//! The process context.
//!
//! Process-wide sub-objects are brought up in manifest order, leaf first:
//!
//! | # | Subsystem      | Contents                                           |
//! |---|----------------|----------------------------------------------------|
//! | 0 | `valuecache`   | page size, its log2, TLS block size                |
//! | 1 | `errorstrings` | result code descriptions                           |
//! | 2 | `sysuser`      | real and effective user id                         |
//! | 3 | `blockmap`     | page-cache block ownership, shared by all threads  |
//!
//! All four live in the static arena. `init_count` is the number of manifest steps that
//! completed; [`ProcessContext::free`] undoes exactly those, in reverse order.

use core::fmt;

use exo_svc::error::{ErrorKind, ResultCode};

use crate::{
    arena::{ArenaBox, StaticArena},
    blockmap::BlockMap,
    config::RuntimeConfig,
    error::RtError,
    errorstrings::ErrorStrings,
    subsystem::Subsystem,
    sysuser::SysUser,
    valuecache::ValueCache,
};

type Step = fn(&mut ProcessContext) -> Result<(), RtError>;

/// One manifest entry: how to bring a subsystem up and down.
struct ManifestEntry {
    name: &'static str,
    init: Step,
    free: Step,
}

const MANIFEST: [ManifestEntry; 4] = [
    ManifestEntry {
        name: "valuecache",
        init: |ctx| activate(&mut ctx.arena, &mut ctx.valuecache, ValueCache::query()),
        free: |ctx| release(&mut ctx.arena, &mut ctx.valuecache),
    },
    ManifestEntry {
        name: "errorstrings",
        init: |ctx| activate(&mut ctx.arena, &mut ctx.errorstrings, ErrorStrings::new()),
        free: |ctx| release(&mut ctx.arena, &mut ctx.errorstrings),
    },
    ManifestEntry {
        name: "sysuser",
        init: |ctx| activate(&mut ctx.arena, &mut ctx.sysuser, SysUser::capture()),
        free: |ctx| release(&mut ctx.arena, &mut ctx.sysuser),
    },
    ManifestEntry {
        name: "blockmap",
        init: |ctx| activate(&mut ctx.arena, &mut ctx.blockmap, BlockMap::new()),
        free: |ctx| {
            let registered = match &ctx.blockmap {
                Subsystem::Active(map) => map.len(),
                Subsystem::Static => 0,
            };
            release(&mut ctx.arena, &mut ctx.blockmap)?;
            if registered != 0 {
                log::warn!("process: {registered} page-cache blocks still registered");
                return Err(ErrorKind::Busy.into());
            }
            Ok(())
        },
    },
];

fn activate<T>(
    arena: &mut StaticArena,
    slot: &mut Subsystem<ArenaBox<T>>,
    value: T,
) -> Result<(), RtError> {
    if !slot.is_static() {
        return Err(RtError::invalid_state());
    }
    let value = arena.alloc_value(value)?;
    slot.activate(value)?;
    Ok(())
}

/// Returns the slot to static. A value the arena refuses is leaked; the whole arena is detached
/// at the end of [`ProcessContext::free`] anyway.
fn release<T>(arena: &mut StaticArena, slot: &mut Subsystem<ArenaBox<T>>) -> Result<(), RtError> {
    match slot.take() {
        None => Ok(()),
        Some(value) => arena.release(value).map_err(|(err, _leaked)| err.into()),
    }
}

/// Process-wide runtime state.
///
/// A context starts out static. [`init`](Self::init) brings up the subsystems; [`free`](Self::free)
/// returns it to the static state. Runtime threads reach the context through their thread
/// context; it must outlive them.
pub struct ProcessContext {
    config: RuntimeConfig,
    arena: StaticArena,
    init_count: usize,
    valuecache: Subsystem<ArenaBox<ValueCache>>,
    errorstrings: Subsystem<ArenaBox<ErrorStrings>>,
    sysuser: Subsystem<ArenaBox<SysUser>>,
    blockmap: Subsystem<ArenaBox<BlockMap>>,
}

static_assertions::assert_impl_all!(ProcessContext: Send, Sync);

impl Default for ProcessContext {
    fn default() -> Self {
        Self::new_static()
    }
}

impl ProcessContext {
    /// A context with every subsystem static.
    pub const fn new_static() -> Self {
        Self {
            config: RuntimeConfig {
                topology: crate::config::Topology::PerThread,
                log_level: log::LevelFilter::Info,
                log_pages: 1,
                arena_size: crate::config::DEFAULT_ARENA_SIZE,
            },
            arena: StaticArena::empty(),
            init_count: 0,
            valuecache: Subsystem::Static,
            errorstrings: Subsystem::Static,
            sysuser: Subsystem::Static,
            blockmap: Subsystem::Static,
        }
    }

    /// Brings up every subsystem, allocating from `arena`.
    ///
    /// On failure the steps that succeeded are undone and the first error is returned. Fails
    /// with `InvalidState` if the context is not static.
    pub fn init(&mut self, config: RuntimeConfig, arena: StaticArena) -> Result<(), RtError> {
        if !self.is_static() {
            return Err(RtError::invalid_state());
        }
        config.validate()?;
        self.config = config;
        self.arena = arena;

        for (index, step) in MANIFEST.iter().enumerate() {
            if let Err(err) = (step.init)(self) {
                log::error!("process: init step {index} ({}) failed: {err}", step.name);
                if let Err(free_err) = self.free() {
                    log::warn!("process: rollback incomplete: {free_err}");
                }
                return Err(err);
            }
            log::trace!("process: init step {index} ({}) done", step.name);
            self.init_count = index + 1;
        }
        Ok(())
    }

    /// Tears down every initialized subsystem in reverse order and detaches the arena.
    ///
    /// Every step runs even if an earlier one fails; the last error is returned. The context is
    /// static afterwards either way. A no-op on a static context.
    pub fn free(&mut self) -> Result<(), RtError> {
        if self.init_count > MANIFEST.len() {
            exo_svc::fatal!("process: init count {} out of bounds", self.init_count);
        }

        let mut last_err = None;
        while self.init_count > 0 {
            let index = self.init_count - 1;
            let step = &MANIFEST[index];
            match (step.free)(self) {
                Ok(()) => log::trace!("process: free step {index} ({}) done", step.name),
                Err(err) => {
                    log::error!("process: free step {index} ({}) failed: {err}", step.name);
                    last_err = Some(err);
                }
            }
            self.init_count = index;
        }

        self.arena = StaticArena::empty();
        last_err.map_or(Ok(()), Err)
    }

    /// Returns `true` if no subsystem is initialized and no arena is attached.
    pub fn is_static(&self) -> bool {
        self.init_count == 0
            && self.arena.is_static()
            && self.valuecache.is_static()
            && self.errorstrings.is_static()
            && self.sysuser.is_static()
            && self.blockmap.is_static()
    }

    /// Number of initialized subsystems.
    #[inline]
    pub fn init_count(&self) -> usize {
        self.init_count
    }

    #[inline]
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    #[inline]
    pub fn arena(&self) -> &StaticArena {
        &self.arena
    }

    pub fn value_cache(&self) -> Result<&ValueCache, RtError> {
        self.valuecache.get().map(|v| &**v)
    }

    pub fn error_strings(&self) -> Result<&ErrorStrings, RtError> {
        self.errorstrings.get().map(|v| &**v)
    }

    pub fn sys_user(&self) -> Result<&SysUser, RtError> {
        self.sysuser.get().map(|v| &**v)
    }

    pub fn block_map(&self) -> Result<&BlockMap, RtError> {
        self.blockmap.get().map(|v| &**v)
    }

    /// Describes `rc`. Returns `"Unavailable"` while `errorstrings` is static.
    pub fn describe(&self, rc: ResultCode) -> &'static str {
        match self.error_strings() {
            Ok(strings) => strings.describe(rc),
            Err(_) => "Unavailable",
        }
    }
}

impl fmt::Debug for ProcessContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessContext")
            .field("config", &self.config)
            .field("arena", &self.arena)
            .field("init_count", &self.init_count)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use core::ptr::NonNull;

    use exo_svc::error::ToRawResultCode;

    use super::*;
    use crate::arena::ARENA_ALIGN;

    #[repr(align(16))]
    struct Region([u8; 4096]);

    fn arena_of(region: &mut Region, size: usize) -> StaticArena {
        assert!(size <= region.0.len());
        // SAFETY: The region outlives the context in each test.
        unsafe { StaticArena::new(NonNull::from(&mut region.0).cast(), size) }
    }

    #[test]
    fn test_init_then_free_restores_static() {
        let mut region = Region([0; 4096]);
        let mut ctx = ProcessContext::new_static();
        assert!(ctx.is_static());

        ctx.init(RuntimeConfig::default(), arena_of(&mut region, 4096))
            .unwrap();
        assert_eq!(ctx.init_count(), MANIFEST.len());
        assert!(!ctx.is_static());
        assert_eq!(ctx.value_cache().unwrap().page_size, exo_svc::mem::page_size());
        assert_eq!(ctx.describe(ErrorKind::Busy.to_rc()), "Resource busy");
        assert!(ctx.block_map().unwrap().is_empty());
        assert!(ctx.arena().high_water() > 0);

        ctx.free().unwrap();
        assert!(ctx.is_static());
        ctx.free().unwrap();
        assert!(ctx.is_static());
    }

    #[test]
    fn test_static_subsystems_reject_use() {
        let ctx = ProcessContext::new_static();
        assert!(matches!(
            ctx.block_map(),
            Err(RtError::Kind(ErrorKind::InvalidState))
        ));
        assert!(ctx.sys_user().is_err());
    }

    #[test]
    fn test_init_twice_rejected() {
        let mut region = Region([0; 4096]);
        let mut ctx = ProcessContext::new_static();
        ctx.init(RuntimeConfig::default(), arena_of(&mut region, 4096))
            .unwrap();

        let second = ctx.init(RuntimeConfig::default(), StaticArena::empty());
        assert!(matches!(second, Err(RtError::Kind(ErrorKind::InvalidState))));
        assert_eq!(ctx.init_count(), MANIFEST.len());
        ctx.free().unwrap();
    }

    #[test]
    fn test_arena_exhaustion_rolls_back_earlier_steps() {
        let mut region = Region([0; 4096]);
        // Room for `valuecache` only.
        let size = size_of::<ValueCache>().next_multiple_of(ARENA_ALIGN);
        let mut ctx = ProcessContext::new_static();

        let err = ctx
            .init(RuntimeConfig::default(), arena_of(&mut region, size))
            .unwrap_err();

        assert!(matches!(err, RtError::Arena(crate::arena::ArenaError::Exhausted)));
        assert_eq!(ctx.init_count(), 0);
        assert!(ctx.is_static());
    }

    #[test]
    fn test_free_with_registered_block_reports_busy_and_goes_static() {
        let mut region = Region([0; 4096]);
        let mut ctx = ProcessContext::new_static();
        ctx.init(RuntimeConfig::default(), arena_of(&mut region, 4096))
            .unwrap();
        ctx.block_map().unwrap().insert(0x1000, 9).unwrap();

        let err = ctx.free().unwrap_err();

        assert!(matches!(err, RtError::Kind(ErrorKind::Busy)));
        assert_eq!(ctx.init_count(), 0);
        assert!(ctx.is_static());
        assert!(ctx.block_map().is_err());

        ctx.init(RuntimeConfig::default(), arena_of(&mut region, 4096))
            .unwrap();
        assert!(ctx.block_map().unwrap().is_empty());
        ctx.free().unwrap();
    }

    #[test]
    fn test_re_init_after_free() {
        let mut region = Region([0; 4096]);
        let mut ctx = ProcessContext::new_static();
        for _ in 0..2 {
            ctx.init(RuntimeConfig::default(), arena_of(&mut region, 4096))
                .unwrap();
            ctx.free().unwrap();
        }
        assert!(ctx.is_static());
    }
}
