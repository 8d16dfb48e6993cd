//! The thread context.
//!
//! Per-thread sub-objects, manifest order:
//!
//! | # | Subsystem     | Contents                                                  |
//! |---|---------------|-----------------------------------------------------------|
//! | 0 | `pagecache`   | page blocks, registered in the process block map          |
//! | 1 | `mm`          | byte allocation with accounting                           |
//! | 2 | `objectcache` | one I/O page borrowed from `pagecache`                    |
//! | 3 | `syncrun`     | the thread's exothread scheduler                          |
//! | 4 | `log`         | buffered thread log; static fallback outside init..free   |
//!
//! A thread context belongs to one OS thread and is not `Sync`.

use core::{
    cell::{RefCell, RefMut},
    fmt,
    ptr::NonNull,
};

use exo_log::LogHandle;
use exo_svc::error::{ErrorKind, ResultCode};
use exo_task::ExoScheduler;

use crate::{
    error::RtError, mm::Mm, objectcache::ObjectCache, pagecache::PageCache,
    process::ProcessContext, subsystem::Subsystem,
};

type Step = fn(&mut ThreadContext) -> Result<(), RtError>;

struct ManifestEntry {
    name: &'static str,
    init: Step,
    free: Step,
}

const MANIFEST: [ManifestEntry; 5] = [
    ManifestEntry {
        name: "pagecache",
        init: |ctx| {
            let map = ctx.process()?.block_map()?;
            let pagecache = PageCache::new(ctx.stack_id, map);
            ctx.pagecache.activate(pagecache)?;
            Ok(())
        },
        free: |ctx| match ctx.pagecache.take() {
            Some(pagecache) => pagecache.release_all(),
            None => Ok(()),
        },
    },
    ManifestEntry {
        name: "mm",
        init: |ctx| {
            ctx.mm.activate(Mm::new())?;
            Ok(())
        },
        free: |ctx| match ctx.mm.take() {
            Some(mm) if mm.live_allocs() != 0 => {
                log::warn!(
                    "thread: {} allocations ({} bytes) leaked",
                    mm.live_allocs(),
                    mm.live_bytes()
                );
                Err(ErrorKind::Busy.into())
            }
            _ => Ok(()),
        },
    },
    ManifestEntry {
        name: "objectcache",
        init: |ctx| {
            let objectcache = ObjectCache::new(ctx.pagecache.get()?)?;
            ctx.objectcache.activate(objectcache)?;
            Ok(())
        },
        free: |ctx| match ctx.objectcache.take() {
            Some(objectcache) => objectcache.release(ctx.pagecache.get()?),
            None => Ok(()),
        },
    },
    ManifestEntry {
        name: "syncrun",
        init: |ctx| {
            ctx.syncrun.activate(RefCell::new(ExoScheduler::new()))?;
            Ok(())
        },
        free: |ctx| {
            if let Some(syncrun) = ctx.syncrun.take() {
                let mut sched = syncrun.into_inner();
                if !sched.is_empty() {
                    log::warn!("thread: dropping {} unfinished exothreads", sched.size());
                }
                sched.free();
            }
            Ok(())
        },
    },
    ManifestEntry {
        name: "log",
        init: |ctx| {
            let pages = ctx.process()?.config().log_pages;
            ctx.log.init_thread_log(pages)?;
            // SAFETY: The context stays in place until `free` uninstalls the handle.
            exo_log::install_current(unsafe { &*(&raw const ctx.log) });
            Ok(())
        },
        free: |ctx| {
            exo_log::uninstall_current();
            ctx.log.free_thread_log()?;
            Ok(())
        },
    },
];

/// Per-thread runtime state.
///
/// A context starts out static. [`init`](Self::init) binds it to a process context and brings up
/// the subsystems; [`free`](Self::free) returns it to the static state. A context must not move
/// between `init` and `free`.
pub struct ThreadContext {
    process: Option<NonNull<ProcessContext>>,
    stack_id: u32,
    init_count: usize,
    pagecache: Subsystem<PageCache>,
    mm: Subsystem<Mm>,
    objectcache: Subsystem<ObjectCache>,
    syncrun: Subsystem<RefCell<ExoScheduler>>,
    log: LogHandle,
}

static_assertions::assert_not_impl_any!(ThreadContext: Sync);

impl Default for ThreadContext {
    fn default() -> Self {
        Self::new_static()
    }
}

impl ThreadContext {
    /// A context with every subsystem static and logging to the static log.
    pub const fn new_static() -> Self {
        Self {
            process: None,
            stack_id: 0,
            init_count: 0,
            pagecache: Subsystem::Static,
            mm: Subsystem::Static,
            objectcache: Subsystem::Static,
            syncrun: Subsystem::Static,
            log: LogHandle::new_static(),
        }
    }

    /// Binds the context to `process` for the thread with stack id `stack_id` and brings up
    /// every subsystem.
    ///
    /// On failure the steps that succeeded are undone and the first error is returned. Fails
    /// with `InvalidState` if the context is not static.
    pub fn init(&mut self, process: &ProcessContext, stack_id: u32) -> Result<(), RtError> {
        if !self.is_static() {
            return Err(RtError::invalid_state());
        }
        self.process = Some(NonNull::from(process));
        self.stack_id = stack_id;

        for (index, step) in MANIFEST.iter().enumerate() {
            if let Err(err) = (step.init)(self) {
                log::error!("thread: init step {index} ({}) failed: {err}", step.name);
                if let Err(free_err) = self.free() {
                    log::warn!("thread: rollback incomplete: {free_err}");
                }
                return Err(err);
            }
            self.init_count = index + 1;
        }
        log::trace!("thread: context {stack_id} up");
        Ok(())
    }

    /// Tears down every initialized subsystem in reverse order and unbinds the process.
    ///
    /// Every step runs even if an earlier one fails; the last error is returned. A no-op on a
    /// static context.
    pub fn free(&mut self) -> Result<(), RtError> {
        if self.init_count > MANIFEST.len() {
            exo_svc::fatal!("thread: init count {} out of bounds", self.init_count);
        }

        let mut last_err = None;
        while self.init_count > 0 {
            let index = self.init_count - 1;
            let step = &MANIFEST[index];
            if let Err(err) = (step.free)(self) {
                log::error!("thread: free step {index} ({}) failed: {err}", step.name);
                last_err = Some(err);
            }
            self.init_count = index;
        }

        self.process = None;
        last_err.map_or(Ok(()), Err)
    }

    /// Returns `true` if no subsystem is initialized.
    pub fn is_static(&self) -> bool {
        self.init_count == 0
            && self.process.is_none()
            && self.pagecache.is_static()
            && self.mm.is_static()
            && self.objectcache.is_static()
            && self.syncrun.is_static()
            && self.log.is_static()
    }

    #[inline]
    pub fn init_count(&self) -> usize {
        self.init_count
    }

    /// Stack id of the owning thread.
    #[inline]
    pub fn stack_id(&self) -> u32 {
        self.stack_id
    }

    /// The process context this thread belongs to.
    pub fn process(&self) -> Result<&ProcessContext, RtError> {
        let process = self.process.ok_or(ErrorKind::InvalidState)?;
        // SAFETY: The process context outlives its thread contexts.
        Ok(unsafe { process.as_ref() })
    }

    pub fn page_cache(&self) -> Result<&PageCache, RtError> {
        self.pagecache.get()
    }

    pub fn mm(&self) -> Result<&Mm, RtError> {
        self.mm.get()
    }

    pub fn object_cache(&self) -> Result<&ObjectCache, RtError> {
        self.objectcache.get()
    }

    /// The thread's exothread scheduler. Fails with `Busy` if it is already borrowed.
    pub fn scheduler(&self) -> Result<RefMut<'_, ExoScheduler>, RtError> {
        self.syncrun
            .get()?
            .try_borrow_mut()
            .map_err(|_| ErrorKind::Busy.into())
    }

    /// The thread's log.
    #[inline]
    pub fn log(&self) -> &LogHandle {
        &self.log
    }

    /// Describes `rc` using the process error strings.
    pub fn describe(&self, rc: ResultCode) -> &'static str {
        self.process().map_or("Unavailable", |p| p.describe(rc))
    }
}

impl fmt::Debug for ThreadContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadContext")
            .field("stack_id", &self.stack_id)
            .field("init_count", &self.init_count)
            .field("log", &self.log)
            .finish()
    }
}
