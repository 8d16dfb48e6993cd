//! Platform startup.
//!
//! [`start`] moves the calling thread onto a fresh TLS block and runs the user main there:
//!
//! 1. allocate the main thread's TLS block and install its guard pages
//! 2. register the block's signal segment as the alternate signal stack
//! 3. capture the caller's context
//! 4. prepare a context on the block's thread stack, linked back to the caller
//! 5. switch to it: bring up the process and thread contexts, run the user main, tear down
//! 6. back on the caller's stack, restore the previous signal stack and free the block
//!
//! A failure in any startup step is reported on standard error as
//! `Error NNNN in startup at <file>:LLLL` and its result code is returned without running the
//! user main.

use core::{ffi::c_void, ptr};
use std::panic::{self, AssertUnwindSafe};

use exo_svc::{
    context::{self, UserContext},
    error::{ErrorKind, ResultCode, SUCCESS, ToRawResultCode},
    signal,
    thread as svc,
};
use exo_sys_thread_tls::ThreadLocalBlock;

use crate::{area::UserArea, config::RuntimeConfig, error::RtError, thread_context::ThreadContext};

/// Entry point of a runtime program.
pub type UserMain = fn(&MainArgs<'_>) -> ResultCode;

/// What the user main receives.
#[derive(Debug)]
pub struct MainArgs<'a> {
    args: &'a [String],
    thread: &'a ThreadContext,
}

impl<'a> MainArgs<'a> {
    /// Command-line arguments, program name first.
    pub fn args(&self) -> &'a [String] {
        self.args
    }

    pub fn argc(&self) -> usize {
        self.args.len()
    }

    /// The main thread's context.
    pub fn thread_context(&self) -> &'a ThreadContext {
        self.thread
    }
}

/// A failed startup step and where it happened.
#[derive(Debug)]
struct StartupFailure {
    err: RtError,
    file: &'static str,
    line: u32,
}

macro_rules! startup_try {
    ($expr:expr) => {
        match $expr {
            Ok(value) => value,
            Err(err) => {
                return Err(StartupFailure {
                    err: RtError::from(err),
                    file: file!(),
                    line: line!(),
                })
            }
        }
    };
}

/// State shared between the caller's stack and the user main's stack.
struct Startup<'a> {
    args: &'a [String],
    config: RuntimeConfig,
    user_main: UserMain,
    failure: Option<StartupFailure>,
}

/// Runs `user_main` on a runtime main thread and returns its result code.
///
/// A panic in `user_main` is contained and reported as `Cancelled`.
pub fn start(args: Vec<String>, config: RuntimeConfig, user_main: UserMain) -> ResultCode {
    let mut startup = Startup {
        args: &args,
        config,
        user_main,
        failure: None,
    };
    match start_on_block(&mut startup) {
        Ok(rc) => rc,
        Err(StartupFailure { err, file, line }) => {
            let rc = err.to_rc();
            exo_log::static_log().print(format_args!(
                "Error {rc:04} in startup at {file}:{line:04}\n"
            ));
            rc
        }
    }
}

fn start_on_block(startup: &mut Startup<'_>) -> Result<ResultCode, StartupFailure> {
    startup_try!(startup.config.validate());
    let block = startup_try!(ThreadLocalBlock::init());

    let result = run_with_signal_stack(block, startup);

    // SAFETY: Execution is back on the caller's stack and nothing references the block.
    let freed = unsafe { block.free() };
    let rc = result?;
    startup_try!(freed);
    Ok(rc)
}

fn run_with_signal_stack(
    block: ThreadLocalBlock,
    startup: &mut Startup<'_>,
) -> Result<ResultCode, StartupFailure> {
    block.thread_vars().set_tid(svc::current_tid());

    let (sigstack, sigstack_size) = block.signal_stack();
    // SAFETY: The signal segment stays mapped until the previous stack is restored below.
    let prev = startup_try!(unsafe { signal::set_alt_stack(sigstack, sigstack_size) });

    let result = switch_to_block(block, startup);

    if let Err(err) = signal::restore_alt_stack(prev) {
        log::warn!("startup: failed to restore alternate signal stack: {err}");
    }
    result
}

fn switch_to_block(
    block: ThreadLocalBlock,
    startup: &mut Startup<'_>,
) -> Result<ResultCode, StartupFailure> {
    let vars = block.thread_vars();
    // SAFETY: The block is not visible to any other thread.
    unsafe { vars.set_main_task(Some(main_trampoline), ptr::from_mut(startup).cast()) };

    let mut caller = UserContext::new();
    let mut callee = UserContext::new();
    let (stack, stack_size) = block.thread_stack();
    // SAFETY: The thread stack is unused; `caller` outlives the switch below.
    startup_try!(unsafe { callee.prepare(stack, stack_size, &mut caller, context_entry) });
    log::trace!("startup: switching to stack at {:#x}", stack.as_ptr() as usize);
    // SAFETY: `callee` was prepared above; its entry returns into `caller`.
    startup_try!(unsafe { context::switch(&mut caller, &callee) });

    if let Some(failure) = startup.failure.take() {
        return Err(failure);
    }
    Ok(vars.return_code())
}

/// First frame on the main thread's TLS stack.
extern "C" fn context_entry() {
    let vars = exo_sys_thread::current();
    vars.lock();
    // SAFETY: The lock flag is held.
    let (task, arg) = unsafe { vars.main_task() };
    vars.unlock();

    let rc = task.map_or(SUCCESS, |task| task(arg));
    vars.set_return_code(rc);
}

fn main_trampoline(arg: *mut c_void) -> ResultCode {
    // SAFETY: `switch_to_block` passes its `Startup`, which outlives the context switch.
    let startup = unsafe { &mut *arg.cast::<Startup<'_>>() };
    match run_user_main(startup) {
        Ok(rc) => rc,
        Err(failure) => {
            startup.failure = Some(failure);
            ErrorKind::InvalidState.to_rc()
        }
    }
}

fn run_user_main(startup: &Startup<'_>) -> Result<ResultCode, StartupFailure> {
    exo_log::init(startup.config.log_level);
    let vars = exo_sys_thread::current();
    let area = UserArea::current();

    // SAFETY: The block was just created; its user area is empty.
    let process = unsafe { area.place_process_context() };
    // SAFETY: The arena region follows both context slots and is handed out once.
    let arena = unsafe { area.arena(startup.config.arena_size) };
    startup_try!(process.init(startup.config, arena));
    vars.set_process(ptr::from_mut(process).cast());

    // SAFETY: As above.
    let thread = unsafe { area.place_thread_context() };
    if let Err(err) = thread.init(process, vars.stack_id()) {
        vars.set_process(ptr::null_mut());
        if let Err(free_err) = process.free() {
            log::warn!("startup: process teardown failed: {free_err}");
        }
        return Err(StartupFailure {
            err,
            file: file!(),
            line: line!(),
        });
    }
    vars.set_context(ptr::from_mut(thread).cast());
    log::debug!("startup: running user main");

    let main_args = MainArgs {
        args: startup.args,
        thread,
    };
    let rc = match panic::catch_unwind(AssertUnwindSafe(|| (startup.user_main)(&main_args))) {
        Ok(rc) => rc,
        Err(_) => {
            log::error!("startup: user main panicked");
            ErrorKind::Cancelled.to_rc()
        }
    };
    log::debug!("startup: user main returned {rc}");

    vars.set_context(ptr::null_mut());
    if let Err(err) = thread.free() {
        log::error!("startup: thread teardown failed: {err}");
    }
    vars.set_process(ptr::null_mut());
    if let Err(err) = process.free() {
        log::error!("startup: process teardown failed: {err}");
    }
    Ok(rc)
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            Arc,
            atomic::{AtomicBool, AtomicU32, Ordering},
        },
        time::Duration,
    };

    use super::*;
    use crate::config::Topology;

    fn args() -> Vec<String> {
        vec!["exo-test".to_string(), "--flag".to_string()]
    }

    fn inspect_main(main: &MainArgs<'_>) -> ResultCode {
        let ctx = main.thread_context();
        if main.argc() != 2 || main.args()[1] != "--flag" {
            return 1;
        }
        match crate::current() {
            Some(current) if ptr::eq(current, ctx) => {}
            _ => return 2,
        }
        if ctx.stack_id() != exo_sys_thread::current().stack_id() {
            return 3;
        }
        match ctx.process() {
            Ok(process) if process.init_count() == 4 && process.sys_user().is_ok() => {}
            _ => return 4,
        }
        if ctx.log().is_static() {
            return 5;
        }
        42
    }

    #[test]
    fn test_start_runs_user_main_with_contexts() {
        assert_eq!(start(args(), RuntimeConfig::default(), inspect_main), 42);
    }

    fn spawn_main(_: &MainArgs<'_>) -> ResultCode {
        let seen = Arc::new(AtomicU32::new(0));
        let seen_in_thread = Arc::clone(&seen);

        let thread = match crate::thread::spawn(move |ctx| {
            let own = crate::current().is_some_and(|current| ptr::eq(current, ctx));
            seen_in_thread.store(ctx.stack_id(), Ordering::SeqCst);
            if own && ctx.page_cache().is_ok() { 7 } else { 1 }
        }) {
            Ok(thread) => thread,
            Err(err) => return err.to_rc(),
        };
        let stack_id = thread.stack_id();

        match thread.join() {
            Ok(7) if seen.load(Ordering::SeqCst) == stack_id => 0,
            Ok(rc) => rc + 100,
            Err(err) => err.to_rc(),
        }
    }

    #[test]
    fn test_runtime_thread_gets_own_context() {
        assert_eq!(start(args(), RuntimeConfig::default(), spawn_main), 0);
    }

    const MANY_THREADS: u32 = 70;

    fn many_threads_main(_: &MainArgs<'_>) -> ResultCode {
        let started = Arc::new(AtomicU32::new(0));
        let release = Arc::new(AtomicBool::new(false));

        let mut threads = Vec::new();
        for _ in 0..MANY_THREADS {
            let started = Arc::clone(&started);
            let release = Arc::clone(&release);
            match crate::thread::spawn(move |_| {
                started.fetch_add(1, Ordering::SeqCst);
                while !release.load(Ordering::SeqCst) {
                    exo_sys_thread::sleep(Duration::from_millis(1));
                }
                0
            }) {
                Ok(thread) => threads.push(thread),
                Err(err) => return err.to_rc(),
            }
        }

        for _ in 0..5_000 {
            if started.load(Ordering::SeqCst) == MANY_THREADS {
                break;
            }
            exo_sys_thread::sleep(Duration::from_millis(1));
        }
        let all_started = started.load(Ordering::SeqCst) == MANY_THREADS;
        release.store(true, Ordering::SeqCst);

        let mut failed = 0;
        for thread in threads {
            if !matches!(thread.join(), Ok(0)) {
                failed += 1;
            }
        }
        if all_started && failed == 0 { 0 } else { 1 }
    }

    #[test]
    fn test_many_concurrent_runtime_threads_get_contexts() {
        assert_eq!(start(args(), RuntimeConfig::default(), many_threads_main), 0);
    }

    fn shared_spawn_main(_: &MainArgs<'_>) -> ResultCode {
        match crate::thread::spawn(|_| 0) {
            Err(RtError::Kind(ErrorKind::InvalidState)) => 0,
            Err(err) => err.to_rc(),
            Ok(thread) => {
                let _ = thread.join();
                1
            }
        }
    }

    #[test]
    fn test_shared_topology_rejects_spawn() {
        let config = RuntimeConfig {
            topology: Topology::Shared,
            ..Default::default()
        };
        assert_eq!(start(args(), config, shared_spawn_main), 0);
    }

    fn panicking_main(_: &MainArgs<'_>) -> ResultCode {
        panic!("user main failure");
    }

    #[test]
    fn test_panic_in_user_main_contained() {
        let rc = start(args(), RuntimeConfig::default(), panicking_main);
        assert_eq!(rc, ErrorKind::Cancelled.to_rc());
    }

    static INVALID_CONFIG_MAIN_RAN: AtomicBool = AtomicBool::new(false);

    fn never_main(_: &MainArgs<'_>) -> ResultCode {
        INVALID_CONFIG_MAIN_RAN.store(true, Ordering::SeqCst);
        0
    }

    #[test]
    fn test_invalid_config_fails_before_user_main() {
        let config = RuntimeConfig {
            log_pages: 0,
            ..Default::default()
        };

        let rc = start(args(), config, never_main);

        assert_eq!(rc, ErrorKind::InvalidArgument.to_rc());
        assert!(rc > 0);
        assert!(!INVALID_CONFIG_MAIN_RAN.load(Ordering::SeqCst));
    }
}
