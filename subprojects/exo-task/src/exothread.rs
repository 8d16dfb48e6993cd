//! The exothread frame and its state machine.

use core::{cell::Cell, fmt, ptr::NonNull};

use exo_svc::error::{ErrorKind, ResultCode, SUCCESS, ToRawResultCode};
use intrusive_collections::LinkedListLink;

/// Returned by a step that yielded or completed normally.
pub const CONTINUE: ResultCode = SUCCESS;

bitflags::bitflags! {
    /// Exothread status bits.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct ExoFlags: u8 {
        /// An error must route the task through its free path.
        const HOLDING_RESOURCE = 1 << 0;
        /// The task will never be stepped again.
        const FINISHED = 1 << 1;
        /// The task has been stepped at least once.
        const STARTED = 1 << 2;
    }
}

/// A resume label.
///
/// Labels are plain integers chosen by the task; [`exo_label!`](crate::exo_label) derives one
/// from the source line. `0` and `u32::MAX` are reserved for the init and free entry points.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct StateId(u32);

impl StateId {
    /// Entry point of a fresh task.
    pub const INIT: StateId = StateId(0);
    /// Entry point of the cleanup path.
    pub const FREE: StateId = StateId(u32::MAX);

    /// A user label.
    ///
    /// # Panics
    ///
    /// Panics (at compile time in const context) if `id` is one of the reserved values.
    pub const fn new(id: u32) -> Self {
        assert!(id != 0 && id != u32::MAX, "reserved exothread label");
        Self(id)
    }

    /// The raw label value.
    pub const fn get(self) -> u32 {
        self.0
    }
}

/// Where a step resumes.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ResumePoint {
    /// First step of the task.
    Init,
    /// Cleanup after an error while holding a resource.
    Free,
    /// A label recorded by the previous step.
    At(StateId),
}

/// Step function of an exothread. Receives the frame it belongs to.
pub type ExoMain = unsafe fn(NonNull<ExoThread>) -> ResultCode;

/// The scheduler-visible part of a stackless task.
///
/// Embedded as the first field of a task frame (see [`ExoTaskFrame`]); the step function is
/// handed a pointer to it and recovers the enclosing frame from there. An exothread is not
/// thread-safe and must not move while linked into a scheduler.
#[repr(C)]
pub struct ExoThread {
    pub(crate) link: LinkedListLink,
    main: ExoMain,
    state: Cell<StateId>,
    return_code: Cell<ResultCode>,
    flags: Cell<ExoFlags>,
}

static_assertions::assert_not_impl_any!(ExoThread: Sync);

impl ExoThread {
    /// Creates a fresh exothread driven by `main`.
    pub const fn new(main: ExoMain) -> Self {
        Self {
            link: LinkedListLink::new(),
            main,
            state: Cell::new(StateId::INIT),
            return_code: Cell::new(SUCCESS),
            flags: Cell::new(ExoFlags::empty()),
        }
    }

    /// The point the current step starts from.
    pub fn resume_point(&self) -> ResumePoint {
        match self.state.get() {
            StateId::FREE => ResumePoint::Free,
            StateId::INIT if self.is_holding_resource() => ResumePoint::Free,
            StateId::INIT => ResumePoint::Init,
            label => ResumePoint::At(label),
        }
    }

    /// Records `label` as the resume point without leaving the step.
    #[inline]
    pub fn set_state(&self, label: StateId) {
        self.state.set(label);
    }

    /// The recorded resume label.
    #[inline]
    pub fn state(&self) -> StateId {
        self.state.get()
    }

    /// Marks the task as holding a resource; an error will take the free path.
    pub fn set_holding_resource(&self) {
        self.insert_flags(ExoFlags::HOLDING_RESOURCE);
    }

    /// Clears the holding-resource mark.
    pub fn clear_holding_resource(&self) {
        self.remove_flags(ExoFlags::HOLDING_RESOURCE);
    }

    /// Marks the task finished. The scheduler never steps it again.
    pub fn finish(&self) {
        self.insert_flags(ExoFlags::FINISHED);
    }

    #[inline]
    pub fn flags(&self) -> ExoFlags {
        self.flags.get()
    }

    #[inline]
    pub fn is_finished(&self) -> bool {
        self.flags().contains(ExoFlags::FINISHED)
    }

    #[inline]
    pub fn is_holding_resource(&self) -> bool {
        self.flags().contains(ExoFlags::HOLDING_RESOURCE)
    }

    /// Returns `true` once the task has failed.
    #[inline]
    pub fn is_error(&self) -> bool {
        self.return_code.get() != SUCCESS
    }

    /// The first error the task reported, or `0`.
    #[inline]
    pub fn return_code(&self) -> ResultCode {
        self.return_code.get()
    }

    /// Returns `true` while the frame is linked into a scheduler.
    #[inline]
    pub fn is_linked(&self) -> bool {
        self.link.is_linked()
    }

    /// Fails the task from outside as if its step had returned
    /// [`ErrorKind::Cancelled`].
    pub fn abort(&self) {
        self.escalate(ErrorKind::Cancelled.to_rc());
    }

    /// Checks that the frame may be dropped.
    ///
    /// Fails with [`ExoFreeError::Busy`] if the task started but did not finish, or is still
    /// linked into a scheduler. Calling it again is harmless.
    pub fn free(&self) -> Result<(), ExoFreeError> {
        let started = self.flags().contains(ExoFlags::STARTED);
        if self.is_linked() || (started && !self.is_finished()) {
            return Err(ExoFreeError::Busy);
        }
        Ok(())
    }

    /// Runs one step of the task behind `this`.
    ///
    /// Errors returned by the step are not surfaced here: they are recorded in
    /// [`return_code`](Self::return_code) and escalate the task towards its free path or
    /// finished state.
    ///
    /// # Safety
    ///
    /// `this` must point to a live exothread whose `main` accepts it.
    pub unsafe fn run_raw(this: NonNull<ExoThread>) -> Result<(), ExoRunError> {
        // SAFETY: The caller guarantees `this` is live.
        let exo = unsafe { this.as_ref() };
        if exo.is_finished() {
            return Err(ExoRunError::Finished);
        }

        let entered = exo.resume_point();
        exo.insert_flags(ExoFlags::STARTED);
        // SAFETY: The caller guarantees `main` accepts `this`.
        let rc = unsafe { (exo.main)(this) };
        exo.escalate(rc);

        if entered == ResumePoint::Free && !exo.is_finished() {
            exo.finish();
        }
        Ok(())
    }

    fn escalate(&self, rc: ResultCode) {
        if rc == SUCCESS || self.is_finished() {
            return;
        }
        if self.return_code.get() == SUCCESS {
            self.return_code.set(rc);
        }
        if self.is_holding_resource() {
            self.state.set(StateId::FREE);
            self.clear_holding_resource();
        } else {
            self.finish();
        }
    }

    fn insert_flags(&self, flags: ExoFlags) {
        self.flags.set(self.flags.get() | flags);
    }

    fn remove_flags(&self, flags: ExoFlags) {
        self.flags.set(self.flags.get() - flags);
    }
}

impl fmt::Debug for ExoThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExoThread")
            .field("state", &self.state.get())
            .field("flags", &self.flags.get())
            .field("return_code", &self.return_code.get())
            .field("linked", &self.is_linked())
            .finish()
    }
}

/// A stackless task body.
///
/// `step` dispatches on [`ExoThread::resume_point`], does some work and returns
/// [`CONTINUE`] or an error code. Any state that must survive a yield lives in `self`.
pub trait ExoTask {
    fn step(&mut self, exo: &ExoThread) -> ResultCode;
}

/// An exothread frame bundling the scheduler header with a task body.
#[repr(C)]
pub struct ExoTaskFrame<T> {
    exo: ExoThread,
    task: T,
}

impl<T: ExoTask> ExoTaskFrame<T> {
    pub const fn new(task: T) -> Self {
        Self {
            exo: ExoThread::new(step_frame::<T>),
            task,
        }
    }

    /// Runs one step. Fails with [`ExoRunError::Finished`] once the task has finished.
    pub fn run(&mut self) -> Result<(), ExoRunError> {
        // SAFETY: The frame is live and `main` is `step_frame::<T>`.
        unsafe { ExoThread::run_raw(self.header_ptr()) }
    }

    /// The scheduler header.
    pub fn exo(&self) -> &ExoThread {
        &self.exo
    }

    /// The task body.
    pub fn task(&self) -> &T {
        &self.task
    }

    pub(crate) fn header_ptr(&mut self) -> NonNull<ExoThread> {
        NonNull::from(self).cast()
    }
}

/// Step function of an [`ExoTaskFrame<T>`].
///
/// # Safety
///
/// `exo` must be the header of a live `ExoTaskFrame<T>`.
unsafe fn step_frame<T: ExoTask>(exo: NonNull<ExoThread>) -> ResultCode {
    let frame = exo.cast::<ExoTaskFrame<T>>().as_ptr();
    // SAFETY: `exo` is the first field of a `#[repr(C)]` frame; the fields are disjoint.
    let (header, task) = unsafe { (&*(&raw const (*frame).exo), &mut *(&raw mut (*frame).task)) };
    task.step(header)
}

/// Error type for [`ExoThread::run_raw`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExoRunError {
    /// The task has already finished.
    #[error("Exothread already finished")]
    Finished,
}

impl ToRawResultCode for ExoRunError {
    fn to_rc(self) -> ResultCode {
        match self {
            Self::Finished => ErrorKind::InvalidState.to_rc(),
        }
    }
}

/// Error type for [`ExoThread::free`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExoFreeError {
    /// The task is still running or linked.
    #[error("Exothread still in use")]
    Busy,
}

impl ToRawResultCode for ExoFreeError {
    fn to_rc(self) -> ResultCode {
        match self {
            Self::Busy => ErrorKind::Busy.to_rc(),
        }
    }
}

/// A [`StateId`] unique to the source line it appears on.
#[macro_export]
macro_rules! exo_label {
    () => {
        $crate::StateId::new(line!())
    };
}

/// Records `label` as the resume point and returns [`CONTINUE`] from the step.
#[macro_export]
macro_rules! exo_yield {
    ($exo:expr, $label:expr) => {{
        $exo.set_state($label);
        return $crate::CONTINUE;
    }};
}

/// A loop that yields after every iteration.
///
/// The resume point is recorded before the condition test, so resuming at `label`
/// re-evaluates `cond`. Falls through once `cond` is false.
#[macro_export]
macro_rules! exo_yield_while {
    ($exo:expr, $label:expr, $cond:expr, $body:block) => {{
        $exo.set_state($label);
        if $cond {
            $body
            return $crate::CONTINUE;
        }
    }};
}

/// A `for`-style loop that yields after every iteration.
///
/// `init` runs when the loop is entered by falling through; a step resuming at `label` runs
/// `post` instead. Then `cond` is tested as in [`exo_yield_while!`].
#[macro_export]
macro_rules! exo_yield_for {
    ($exo:expr, $label:expr, $init:stmt; $cond:expr; $post:stmt, $body:block) => {{
        if $exo.state() == $label {
            $post;
        } else {
            $init;
            $exo.set_state($label);
        }
        if $cond {
            $body
            return $crate::CONTINUE;
        }
    }};
}
