//! A FIFO mutual-exclusion primitive for fibers (component I), generalized
//! from the original's single-waiter `Latch` into an explicit waiter queue
//! so that [`SchedulerConfig`](crate::scheduler::SchedulerConfig)'s ordering
//! guarantee ("waiters are granted the lock in the order they blocked") is
//! an invariant of the data structure rather than an accident of the OS
//! scheduler.
//!
//! A mutex built with [`Mutex::builder`]`.cross_thread(true)` may be shared
//! (behind an `Arc`) between fibers running on different scheduler threads;
//! unlocking on one thread wakes a waiter on another via the same
//! `mio::Waker` mechanism `io_stop()` uses.

use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use crossbeam_queue::SegQueue;
use mio::Waker;

use crate::error::{Error, Result};
use crate::scheduler::{self, FiberId};

enum WakeMethod {
    /// The waiter lives on this same scheduler thread; waking it is a
    /// direct `fiber_ready` call.
    Local,
    /// The waiter may live on a different thread: push its id onto the
    /// shared inbox and nudge that scheduler's reactor awake.
    Cross {
        queue: Arc<SegQueue<FiberId>>,
        waker: Arc<Waker>,
    },
}

struct Waiter {
    fiber: FiberId,
    /// Set to `true` by `unlock()` the instant ownership is handed to this
    /// waiter, so that the waiter can distinguish "I was granted the lock"
    /// from "my timeout fired" after being resumed — both look the same
    /// from `fiber_switch`'s point of view.
    granted: Arc<AtomicBool>,
    wake: WakeMethod,
}

impl Waiter {
    fn notify(&self) {
        self.granted.store(true, Ordering::Release);
        match &self.wake {
            WakeMethod::Local => {
                scheduler::try_with_current(|s| s.fiber_ready(self.fiber));
            }
            WakeMethod::Cross { queue, waker } => {
                queue.push(self.fiber);
                let _ = waker.wake();
            }
        }
    }
}

struct State {
    locked: bool,
    waiters: VecDeque<Waiter>,
}

/// A mutex that fiber code can `lock()`, suspending the calling fiber
/// instead of blocking the OS thread.
pub struct Mutex<T: ?Sized> {
    state: StdMutex<State>,
    cross_thread: bool,
    default_timeout: Option<Duration>,
    data: UnsafeCell<T>,
}

// SAFETY: access to `data` is always gated by `state`, which every lock
// acquisition (including cross-thread ones) goes through.
unsafe impl<T: ?Sized + Send> Send for Mutex<T> {}
unsafe impl<T: ?Sized + Send> Sync for Mutex<T> {}

/// Configures a [`Mutex`] before construction. See [`Mutex::builder`].
pub struct MutexBuilder {
    cross_thread: bool,
    default_timeout: Option<Duration>,
}

impl MutexBuilder {
    /// Allows the built mutex to be shared across scheduler threads (via
    /// `Arc`). Costs an extra I/O-driver round trip on the cross-thread
    /// wakeup path; leave `false` for same-thread-only use.
    pub fn cross_thread(mut self, yes: bool) -> Self {
        self.cross_thread = yes;
        self
    }

    /// Sets the timeout [`Mutex::lock`] uses by default; individual calls
    /// can still override it with [`Mutex::lock_timeout`].
    pub fn timeout(mut self, d: Duration) -> Self {
        self.default_timeout = Some(d);
        self
    }

    pub fn build<T>(self, value: T) -> Mutex<T> {
        Mutex {
            state: StdMutex::new(State {
                locked: false,
                waiters: VecDeque::new(),
            }),
            cross_thread: self.cross_thread,
            default_timeout: self.default_timeout,
            data: UnsafeCell::new(value),
        }
    }
}

impl<T> Mutex<T> {
    /// Creates a same-thread-only mutex with no default timeout.
    pub fn new(value: T) -> Self {
        Mutex::builder().build(value)
    }

    pub fn builder() -> MutexBuilder {
        MutexBuilder {
            cross_thread: false,
            default_timeout: None,
        }
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> Mutex<T> {
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    /// Acquires the mutex, suspending the calling fiber while it's held by
    /// someone else, using the builder's default timeout (if any).
    pub fn lock(&self) -> Result<MutexGuard<'_, T>> {
        self.lock_timeout(self.default_timeout)
    }

    /// Acquires the mutex, overriding the builder's default timeout for
    /// this call only. `None` waits indefinitely.
    pub fn lock_timeout(&self, timeout: Option<Duration>) -> Result<MutexGuard<'_, T>> {
        {
            let mut state = self.state.lock().unwrap();
            if !state.locked {
                state.locked = true;
                return Ok(MutexGuard { mutex: self });
            }
        }

        let me = scheduler::try_with_current(|s| s.current())
            .flatten()
            .expect("Mutex::lock called outside a fiber");

        let granted = Arc::new(AtomicBool::new(false));
        let wake = if self.cross_thread {
            let (queue, waker) = crate::io::external_handle()?;
            WakeMethod::Cross { queue, waker }
        } else {
            WakeMethod::Local
        };
        self.state.lock().unwrap().waiters.push_back(Waiter {
            fiber: me,
            granted: Arc::clone(&granted),
            wake,
        });

        if let Some(d) = timeout {
            crate::io::register_timeout(me, d)?;
        }
        scheduler::with_current(|s| s.fiber_switch())?;

        if granted.load(Ordering::Acquire) {
            if timeout.is_some() {
                crate::io::cancel_timeout(me);
            }
            Ok(MutexGuard { mutex: self })
        } else {
            self.state.lock().unwrap().waiters.retain(|w| w.fiber != me);
            Err(Error::Timeout)
        }
    }

    /// Acquires the mutex without suspending; fails immediately if it's
    /// already held.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        let mut state = self.state.lock().unwrap();
        if state.locked {
            None
        } else {
            state.locked = true;
            Some(MutexGuard { mutex: self })
        }
    }

    /// Equivalent to dropping `guard`, but self-documenting at the call
    /// site.
    pub fn unlock(guard: MutexGuard<'_, T>) {
        drop(guard);
    }

    /// Hands the lock directly to the next FIFO waiter, if any, or marks it
    /// free.
    fn release(&self) {
        let mut state = self.state.lock().unwrap();
        match state.waiters.pop_front() {
            Some(w) => {
                drop(state);
                w.notify();
            }
            None => state.locked = false,
        }
    }
}

impl<T> From<T> for Mutex<T> {
    fn from(value: T) -> Self {
        Mutex::new(value)
    }
}

impl<T: ?Sized + Default> Default for Mutex<T> {
    fn default() -> Mutex<T> {
        Mutex::new(Default::default())
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for Mutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("Mutex");
        match self.try_lock() {
            Some(guard) => {
                d.field("data", &&*guard);
            }
            None => {
                d.field("data", &"<locked>");
            }
        }
        d.finish_non_exhaustive()
    }
}

/// RAII guard returned by [`Mutex::lock`]; releases the mutex to the next
/// FIFO waiter (or marks it free) on drop.
pub struct MutexGuard<'a, T: ?Sized + 'a> {
    mutex: &'a Mutex<T>,
}

impl<T: ?Sized> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.release();
    }
}

impl<T: ?Sized> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T: ?Sized> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for MutexGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

impl<T: ?Sized + fmt::Display> fmt::Display for MutexGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&**self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::Scheduler;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn waiters_are_granted_in_fifo_order() {
        let mut sched = Scheduler::default();
        let mutex = Rc::new(Mutex::new(()));
        let order = Rc::new(RefCell::new(Vec::new()));

        let first = mutex.lock().unwrap();
        for label in ["a", "b", "c", "d", "e"] {
            let mutex = Rc::clone(&mutex);
            let order = Rc::clone(&order);
            sched.spawn(move || {
                let _guard = mutex.lock().unwrap();
                order.borrow_mut().push(label);
            });
        }
        drop(first);
        sched.run();

        assert_eq!(*order.borrow(), vec!["a", "b", "c", "d", "e"]);
    }

    #[test]
    fn try_lock_fails_while_held() {
        let mutex = Mutex::new(0);
        let guard = mutex.try_lock().unwrap();
        assert!(mutex.try_lock().is_none());
        drop(guard);
        assert!(mutex.try_lock().is_some());
    }

    #[test]
    fn lock_timeout_fails_while_held_and_releases_waiter_slot() {
        let mut sched = Scheduler::default();
        let mutex = Rc::new(Mutex::new(0));
        let outcome = Rc::new(RefCell::new(None));

        let held = mutex.lock().unwrap();
        {
            let mutex = Rc::clone(&mutex);
            let outcome = Rc::clone(&outcome);
            sched.spawn(move || {
                *outcome.borrow_mut() =
                    Some(mutex.lock_timeout(Some(Duration::from_millis(10))).is_ok());
                // Nothing else will spawn more work; tell the I/O fiber to
                // wind down once it notices there's nothing left to do.
                scheduler::try_with_current(|s| s.io_stop());
            });
        }
        sched.run();
        drop(held);

        assert_eq!(*outcome.borrow(), Some(false));
        // The lock is free again and the timed-out waiter was cleaned up.
        assert!(mutex.try_lock().is_some());
    }
}
