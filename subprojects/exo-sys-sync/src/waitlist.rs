//! FIFO list of suspended threads with task handoff.
//!
//! Threads queue themselves with [`WaitList::wait`] and sleep. A waker calls
//! [`WaitList::try_wakeup`] with a task and argument; the thread at the head of the list is
//! detached, receives that task as its new main task, and is resumed.
//!
//! ## Structure
//!
//! The list is circular and singly linked through each thread's
//! [`next_wait`](ThreadVars::next_wait) field. Only the tail is stored; `tail.next_wait` is the
//! head. A single queued thread links to itself. The list never owns the threads: each queued
//! thread keeps its own TLS block alive because it is blocked inside `wait` until it is
//! detached.
//!
//! ## Handoff
//!
//! The waker detaches the head while holding both the list lock and the head thread's own lock
//! flag, then writes the task and resumes the thread before releasing the thread lock. The woken
//! thread takes its own lock flag before checking its `next_wait` link, so the task written by
//! the waker happens-before the woken thread sees itself detached.

use core::{
    ffi::c_void,
    ptr,
    sync::atomic::{AtomicPtr, AtomicU8, AtomicUsize},
};

use exo_cpu::atomic::{self, Atomic, AtomicInt};
use exo_svc::error::{ErrorKind, ResultCode, ToRawResultCode};
use exo_sys_thread::tls::{MainTask, ThreadVars};

/// A FIFO of waiting threads.
///
/// A `WaitList` must not be moved while threads wait on it.
#[repr(C)]
pub struct WaitList {
    last: AtomicPtr<ThreadVars>,
    nr_waiting: AtomicUsize,
    lock: AtomicU8,
}

static_assertions::assert_impl_all!(WaitList: Send, Sync);

impl Default for WaitList {
    fn default() -> Self {
        Self::new()
    }
}

impl WaitList {
    /// Creates an empty list.
    pub const fn new() -> Self {
        Self {
            last: AtomicPtr::new(ptr::null_mut()),
            nr_waiting: AtomicUsize::new(0),
            lock: AtomicU8::new(0),
        }
    }

    /// Appends the calling runtime thread and suspends it until a waker detaches it.
    ///
    /// On return, the thread's main task holds whatever the waker passed to
    /// [`try_wakeup`](Self::try_wakeup).
    pub fn wait(&self) {
        let me = exo_sys_thread::current();
        let me_ptr = me as *const ThreadVars as *mut ThreadVars;

        self.lock_list();
        let last = self.last.read();
        if last.is_null() {
            me.next_wait().write(me_ptr);
        } else {
            // SAFETY: Queued threads stay alive while linked; the list lock is held.
            let last = unsafe { &*last };
            me.next_wait().write(last.next_wait().read());
            last.next_wait().write(me_ptr);
        }
        self.last.write(me_ptr);
        self.nr_waiting.add(1);
        self.unlock_list();

        loop {
            exo_sys_thread::suspend();

            me.lock();
            let detached = me.next_wait().read().is_null();
            me.unlock();

            if detached {
                return;
            }
        }
    }

    /// Detaches the longest-waiting thread, hands it `task(arg)` as its main task and resumes it.
    ///
    /// Returns [`WaitListEmpty`] if no thread is waiting. Can be called from any thread.
    pub fn try_wakeup(&self, task: Option<MainTask>, arg: *mut c_void) -> Result<(), WaitListEmpty> {
        self.lock_list();

        let last = self.last.read();
        if last.is_null() {
            self.unlock_list();
            return Err(WaitListEmpty);
        }

        // SAFETY: Queued threads stay alive while linked; the list lock is held.
        let last_ref = unsafe { &*last };
        let head_ptr = last_ref.next_wait().read();
        // SAFETY: As above; the head is linked.
        let head = unsafe { &*head_ptr };

        head.lock();
        if head_ptr == last {
            self.last.write(ptr::null_mut());
        } else {
            last_ref.next_wait().write(head.next_wait().read());
        }
        head.next_wait().write(ptr::null_mut());
        self.nr_waiting.sub(1);
        self.unlock_list();

        // SAFETY: The head's lock flag is held.
        unsafe { head.set_main_task(task, arg) };
        exo_sys_thread::resume(head);
        head.unlock();

        Ok(())
    }

    /// Wakes every waiting thread with no task.
    pub fn free(&self) {
        let mut woken = 0usize;
        while self.try_wakeup(None, ptr::null_mut()).is_ok() {
            woken += 1;
        }
        if woken != 0 {
            log::debug!("waitlist: freed with {woken} waiting threads");
        }
    }

    /// Returns `true` if no thread is waiting.
    pub fn is_empty(&self) -> bool {
        self.last.read().is_null()
    }

    /// Number of waiting threads.
    pub fn num_waiting(&self) -> usize {
        self.nr_waiting.read()
    }

    fn lock_list(&self) {
        while atomic::set_flag(&self.lock) {
            exo_sys_thread::yield_now();
        }
    }

    fn unlock_list(&self) {
        atomic::clear_flag(&self.lock);
    }
}

impl core::fmt::Debug for WaitList {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("WaitList")
            .field("num_waiting", &self.num_waiting())
            .finish()
    }
}

/// Returned by [`WaitList::try_wakeup`] when no thread is waiting.
///
/// Not a failure: it tells the waker there was nothing to do.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Wait list is empty")]
pub struct WaitListEmpty;

impl ToRawResultCode for WaitListEmpty {
    fn to_rc(self) -> ResultCode {
        ErrorKind::Empty.to_rc()
    }
}

#[cfg(test)]
mod tests {
    use core::{
        sync::atomic::{AtomicI32, Ordering},
        time::Duration,
    };

    use exo_sys_thread::sleep;

    use super::*;

    const NOT_RUN: i32 = -1;
    const NO_TASK: i32 = -2;

    struct Waiter<'a> {
        list: &'a WaitList,
        result: AtomicI32,
    }

    fn waiter_body(arg: *mut c_void) -> ResultCode {
        let waiter = unsafe { &*(arg as *const Waiter<'_>) };
        waiter.list.wait();

        // SAFETY: The thread has been detached; nobody else writes its main task now.
        let (task, task_arg) = unsafe { exo_sys_thread::current().main_task() };
        let result = match task {
            Some(task) => task(task_arg),
            None => NO_TASK,
        };
        waiter.result.store(result, Ordering::SeqCst);
        0
    }

    fn times_ten(arg: *mut c_void) -> ResultCode {
        arg as usize as ResultCode * 10
    }

    fn times_ten_plus_one(arg: *mut c_void) -> ResultCode {
        arg as usize as ResultCode * 10 + 1
    }

    fn count_linked(list: &WaitList) -> usize {
        list.lock_list();
        let last = list.last.read();
        let mut count = 0;
        if !last.is_null() {
            let mut node = last;
            loop {
                count += 1;
                node = unsafe { &*node }.next_wait().read();
                if node == last {
                    break;
                }
            }
        }
        list.unlock_list();
        count
    }

    fn wait_until_queued(list: &WaitList, count: usize) {
        while list.num_waiting() != count {
            sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_try_wakeup_on_empty_list() {
        let list = WaitList::new();
        assert_eq!(list.try_wakeup(None, ptr::null_mut()), Err(WaitListEmpty));
        assert!(list.is_empty());
        assert_eq!(list.num_waiting(), 0);
    }

    #[test]
    fn test_single_waiter_receives_task_and_list_empties() {
        let list = WaitList::new();
        let waiter = Waiter {
            list: &list,
            result: AtomicI32::new(NOT_RUN),
        };

        let thread =
            exo_sys_thread::spawn(waiter_body, &waiter as *const _ as *mut c_void).expect("spawn");
        wait_until_queued(&list, 1);
        assert_eq!(count_linked(&list), 1);

        list.try_wakeup(Some(times_ten), 4 as *mut c_void).unwrap();
        assert!(list.is_empty());
        assert_eq!(list.num_waiting(), 0);

        thread.join().expect("join");
        assert_eq!(waiter.result.load(Ordering::SeqCst), 40);
    }

    #[test]
    fn test_unrelated_resume_keeps_waiter_queued() {
        let list = WaitList::new();
        let waiter = Waiter {
            list: &list,
            result: AtomicI32::new(NOT_RUN),
        };

        let thread =
            exo_sys_thread::spawn(waiter_body, &waiter as *const _ as *mut c_void).expect("spawn");
        wait_until_queued(&list, 1);

        for _ in 0..3 {
            exo_sys_thread::resume(thread.vars());
            sleep(Duration::from_millis(10));
            assert_eq!(list.num_waiting(), 1);
            assert_eq!(count_linked(&list), 1);
            assert_eq!(waiter.result.load(Ordering::SeqCst), NOT_RUN);
        }

        list.try_wakeup(Some(times_ten), 5 as *mut c_void).unwrap();
        thread.join().expect("join");
        assert_eq!(waiter.result.load(Ordering::SeqCst), 50);
    }

    #[test]
    fn test_wakeups_follow_fifo_order() {
        const N: usize = 6;
        let list = WaitList::new();
        let waiters: [Waiter<'_>; N] = core::array::from_fn(|_| Waiter {
            list: &list,
            result: AtomicI32::new(NOT_RUN),
        });

        let mut threads = Vec::new();
        for (i, waiter) in waiters.iter().enumerate() {
            threads.push(
                exo_sys_thread::spawn(waiter_body, waiter as *const _ as *mut c_void)
                    .expect("spawn"),
            );
            wait_until_queued(&list, i + 1);
        }
        assert_eq!(count_linked(&list), N);

        for i in 0..N {
            let task: MainTask = if i % 2 == 0 { times_ten } else { times_ten_plus_one };
            list.try_wakeup(Some(task), (i + 1) as *mut c_void).unwrap();
            assert_eq!(list.num_waiting(), N - i - 1);
            assert_eq!(count_linked(&list), N - i - 1);
        }
        for thread in threads {
            thread.join().expect("join");
        }

        for (i, waiter) in waiters.iter().enumerate() {
            let expected = (i as i32 + 1) * 10 + (i % 2) as i32;
            assert_eq!(waiter.result.load(Ordering::SeqCst), expected, "waiter {i}");
        }
    }

    #[test]
    fn test_free_wakes_all_without_task() {
        let list = WaitList::new();
        let waiters: [Waiter<'_>; 3] = core::array::from_fn(|_| Waiter {
            list: &list,
            result: AtomicI32::new(NOT_RUN),
        });

        let threads: Vec<_> = waiters
            .iter()
            .map(|waiter| {
                exo_sys_thread::spawn(waiter_body, waiter as *const _ as *mut c_void)
                    .expect("spawn")
            })
            .collect();
        wait_until_queued(&list, 3);

        list.free();
        assert!(list.is_empty());
        for thread in threads {
            thread.join().expect("join");
        }
        for waiter in &waiters {
            assert_eq!(waiter.result.load(Ordering::SeqCst), NO_TASK);
        }
    }
}
