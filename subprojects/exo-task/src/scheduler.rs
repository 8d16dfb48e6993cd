//! FIFO run list of exothreads.

use core::{pin::Pin, ptr::NonNull};

use exo_svc::error::{ErrorKind, ResultCode, ToRawResultCode};
use intrusive_collections::{LinkedList, LinkedListLink, UnsafeRef, intrusive_adapter};

use crate::exothread::{ExoTask, ExoTaskFrame, ExoThread};

intrusive_adapter!(RunListAdapter = UnsafeRef<ExoThread>: ExoThread { link: LinkedListLink });

/// A cooperative single-threaded scheduler.
///
/// The scheduler never owns its tasks: frames are linked in place and must outlive their
/// registration. There is no unregister for a running task; [`ExoThread::abort`] followed by a
/// [`run`](Self::run) pass is the way to retire one early.
pub struct ExoScheduler {
    list: LinkedList<RunListAdapter>,
    size: usize,
}

impl Default for ExoScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl ExoScheduler {
    pub fn new() -> Self {
        Self {
            list: LinkedList::new(RunListAdapter::new()),
            size: 0,
        }
    }

    /// Number of linked tasks.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Appends the exothread at `exo` to the run list.
    ///
    /// # Safety
    ///
    /// `exo` must stay alive, and must not move, until it is unlinked by [`run`](Self::run) or
    /// [`free`](Self::free).
    pub unsafe fn register(&mut self, exo: NonNull<ExoThread>) -> Result<(), ExoRegisterError> {
        // SAFETY: The caller guarantees `exo` is live.
        if unsafe { exo.as_ref() }.is_linked() {
            return Err(ExoRegisterError::AlreadyLinked);
        }
        // SAFETY: The caller guarantees the frame outlives its registration.
        self.list
            .push_back(unsafe { UnsafeRef::from_raw(exo.as_ptr()) });
        self.size += 1;
        Ok(())
    }

    /// Appends a task frame to the run list.
    ///
    /// # Safety
    ///
    /// The frame must stay alive until it is unlinked by [`run`](Self::run) or
    /// [`free`](Self::free).
    pub unsafe fn register_frame<T: ExoTask>(
        &mut self,
        frame: Pin<&mut ExoTaskFrame<T>>,
    ) -> Result<(), ExoRegisterError> {
        // SAFETY: The frame is pinned; it is never moved out of the reference.
        let exo = unsafe { frame.get_unchecked_mut() }.header_ptr();
        // SAFETY: Forwarded from the caller.
        unsafe { self.register(exo) }
    }

    /// Steps every unfinished task once, in registration order, and unlinks finished tasks.
    pub fn run(&mut self) {
        let mut cursor = self.list.front_mut();
        // The pointer is taken from the list's own `UnsafeRef` so that it still covers the whole
        // task frame the step function writes to.
        while let Some(linked) = cursor.as_cursor().clone_pointer() {
            let Some(exo_ptr) = NonNull::new(UnsafeRef::into_raw(linked)) else {
                break;
            };

            // SAFETY: Linked frames are live by the registration contract.
            if !unsafe { exo_ptr.as_ref() }.is_finished() {
                // SAFETY: Linked frames are live by the registration contract. The task is
                // unfinished, so the step cannot fail.
                let _ = unsafe { ExoThread::run_raw(exo_ptr) };
            }

            // SAFETY: As above.
            let exo = unsafe { exo_ptr.as_ref() };
            if exo.is_finished() {
                if exo.is_error() {
                    log::debug!("exo: task finished with rc={}", exo.return_code());
                }
                cursor.remove();
                self.size -= 1;
            } else {
                cursor.move_next();
            }
        }
    }

    /// Unlinks every task without running it.
    pub fn free(&mut self) {
        if self.size != 0 {
            log::trace!("exo: freeing scheduler with {} tasks", self.size);
        }
        self.list.clear();
        self.size = 0;
    }
}

impl Drop for ExoScheduler {
    fn drop(&mut self) {
        self.free();
    }
}

impl core::fmt::Debug for ExoScheduler {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ExoScheduler")
            .field("size", &self.size)
            .finish()
    }
}

/// Error type for [`ExoScheduler::register`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExoRegisterError {
    /// The exothread is already in a run list.
    #[error("Exothread already registered")]
    AlreadyLinked,
}

impl ToRawResultCode for ExoRegisterError {
    fn to_rc(self) -> ResultCode {
        match self {
            Self::AlreadyLinked => ErrorKind::InvalidState.to_rc(),
        }
    }
}

#[cfg(test)]
mod tests {
    use core::pin::pin;

    use super::*;
    use crate::{CONTINUE, ResumePoint, StateId};

    struct OneShot {
        calls: u32,
    }

    impl ExoTask for OneShot {
        fn step(&mut self, exo: &ExoThread) -> ResultCode {
            self.calls += 1;
            exo.finish();
            CONTINUE
        }
    }

    const AGAIN: StateId = StateId::new(7);

    struct Repeat {
        left: u32,
        calls: u32,
    }

    impl ExoTask for Repeat {
        fn step(&mut self, exo: &ExoThread) -> ResultCode {
            self.calls += 1;
            if let ResumePoint::Init = exo.resume_point() {
                exo.set_state(AGAIN);
            }
            self.left -= 1;
            if self.left == 0 {
                exo.finish();
            }
            CONTINUE
        }
    }

    #[test]
    fn test_run_completes_one_shot_tasks_in_one_pass() {
        let mut frames: Vec<_> = (0..100)
            .map(|_| Box::pin(ExoTaskFrame::new(OneShot { calls: 0 })))
            .collect();
        let mut sched = ExoScheduler::new();

        for frame in &mut frames {
            unsafe { sched.register_frame(frame.as_mut()) }.unwrap();
        }
        assert_eq!(sched.size(), 100);

        sched.run();

        assert_eq!(sched.size(), 0);
        assert!(sched.is_empty());
        for frame in &frames {
            assert_eq!(frame.task().calls, 1);
            assert!(!frame.exo().is_linked());
            assert_eq!(frame.exo().free(), Ok(()));
        }
    }

    #[test]
    fn test_run_steps_each_task_at_most_once_per_pass() {
        let mut short = pin!(ExoTaskFrame::new(Repeat { left: 1, calls: 0 }));
        let mut long = pin!(ExoTaskFrame::new(Repeat { left: 3, calls: 0 }));
        let mut sched = ExoScheduler::new();
        unsafe {
            sched.register_frame(short.as_mut()).unwrap();
            sched.register_frame(long.as_mut()).unwrap();
        }

        sched.run();
        assert_eq!(sched.size(), 1);
        assert_eq!(short.task().calls, 1);
        assert_eq!(long.task().calls, 1);

        sched.run();
        sched.run();
        assert!(sched.is_empty());
        assert_eq!(short.task().calls, 1);
        assert_eq!(long.task().calls, 3);
    }

    #[test]
    fn test_register_twice_rejected() {
        let mut frame = pin!(ExoTaskFrame::new(OneShot { calls: 0 }));
        let mut sched = ExoScheduler::new();

        unsafe { sched.register_frame(frame.as_mut()) }.unwrap();
        assert_eq!(
            unsafe { sched.register_frame(frame.as_mut()) },
            Err(ExoRegisterError::AlreadyLinked)
        );
        assert_eq!(sched.size(), 1);
        sched.free();
        assert!(!frame.exo().is_linked());
    }

    #[test]
    fn test_aborted_task_unlinked_without_running() {
        let mut frame = pin!(ExoTaskFrame::new(OneShot { calls: 0 }));
        let mut sched = ExoScheduler::new();
        unsafe { sched.register_frame(frame.as_mut()) }.unwrap();

        frame.exo().abort();
        sched.run();

        assert!(sched.is_empty());
        assert_eq!(frame.task().calls, 0);
        assert!(frame.exo().is_error());
    }

    #[test]
    fn test_free_unlinks_without_running() {
        let mut frame = pin!(ExoTaskFrame::new(Repeat { left: 2, calls: 0 }));
        let mut sched = ExoScheduler::new();
        unsafe { sched.register_frame(frame.as_mut()) }.unwrap();

        sched.free();
        sched.free();

        assert!(sched.is_empty());
        assert_eq!(frame.task().calls, 0);
        assert_eq!(frame.exo().free(), Ok(()));
    }
}
