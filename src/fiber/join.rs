//! Join handles for fibers spawned with [`spawn_joinable`]/[`try_spawn_joinable`]
//! (generalized from the original's `JoinHandle`/`UnitJoinHandle` pair, which
//! blocked via `ffi::fiber_join` on the underlying Tarantool fiber, into a
//! single generic `JoinHandle<T>` that blocks by suspending on the scheduler
//! like every other wait primitive in this crate).

use std::cell::RefCell;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;

use crate::error::Result;
use crate::scheduler::{self, panic_message, FiberId};

struct Shared<T> {
    result: Option<std::thread::Result<T>>,
    waiter: Option<FiberId>,
}

/// An owned permission to join on a fiber spawned with
/// [`spawn_joinable`]/[`try_spawn_joinable`]: blocks the calling fiber until
/// the spawned one finishes, then hands back its return value or, if it
/// panicked, the same payload `std::panic::catch_unwind` would have
/// produced — mirroring `std::thread::JoinHandle::join`'s
/// `Result<T, Box<dyn Any + Send>>` contract.
pub struct JoinHandle<T> {
    shared: Rc<RefCell<Shared<T>>>,
    fiber: FiberId,
}

impl<T> JoinHandle<T> {
    /// The id of the fiber this handle joins.
    pub fn id(&self) -> FiberId {
        self.fiber
    }

    /// True if the fiber has already finished ([`join`](Self::join) would
    /// not block).
    pub fn is_finished(&self) -> bool {
        self.shared.borrow().result.is_some()
    }

    /// Blocks the calling fiber until the joined fiber finishes.
    ///
    /// # Panics
    /// Panics if called outside a fiber while the joined fiber hasn't
    /// finished yet (a finished result can be collected from anywhere).
    pub fn join(self) -> std::thread::Result<T> {
        if self.shared.borrow().result.is_none() {
            let me = scheduler::try_with_current(|s| s.current())
                .flatten()
                .expect("JoinHandle::join called outside a fiber");
            self.shared.borrow_mut().waiter = Some(me);
            scheduler::with_current(|s| s.fiber_switch())
                .expect("JoinHandle::join called without a running scheduler");
        }
        self.shared
            .borrow_mut()
            .result
            .take()
            .expect("join woke with no result recorded")
    }
}

/// Spawns a joinable fiber with an explicit stack size.
pub(crate) fn try_spawn_joinable<F, T>(stack_size: usize, f: F) -> Result<JoinHandle<T>>
where
    F: FnOnce() -> T + 'static,
    T: 'static,
{
    let shared = Rc::new(RefCell::new(Shared {
        result: None,
        waiter: None,
    }));
    let entry_shared = Rc::clone(&shared);

    let fiber = scheduler::with_current(|s| {
        s.try_spawn(stack_size, move || {
            let outcome = panic::catch_unwind(AssertUnwindSafe(f));
            if let Err(payload) = &outcome {
                log::error!("joinable fiber panicked: {}", panic_message(payload.as_ref()));
            }
            let waiter = {
                let mut shared = entry_shared.borrow_mut();
                shared.result = Some(outcome);
                shared.waiter.take()
            };
            if let Some(w) = waiter {
                scheduler::try_with_current(|s| s.fiber_ready(w));
            }
        })
    })??;

    Ok(JoinHandle { shared, fiber })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::Scheduler;

    #[test]
    fn join_returns_the_fibers_value() {
        let mut sched = Scheduler::default();
        let handle = Rc::new(RefCell::new(None));
        {
            let handle = Rc::clone(&handle);
            sched.spawn(move || {
                *handle.borrow_mut() =
                    Some(try_spawn_joinable(32 * 1024, || 40 + 2).unwrap());
            });
        }
        sched.run();

        // The spawning fiber already exited; join from a fresh run so the
        // already-finished result is simply handed back without blocking.
        let handle = handle.borrow_mut().take().unwrap();
        assert!(handle.is_finished());
        assert_eq!(handle.join().unwrap(), 42);
    }

    #[test]
    fn join_blocks_until_the_child_finishes() {
        let mut sched = Scheduler::default();
        let order = Rc::new(RefCell::new(Vec::new()));
        {
            let order = Rc::clone(&order);
            sched.spawn(move || {
                let child = try_spawn_joinable(32 * 1024, {
                    let order = Rc::clone(&order);
                    move || {
                        order.borrow_mut().push("child");
                        7
                    }
                })
                .unwrap();
                let result = child.join().unwrap();
                order.borrow_mut().push("joined");
                assert_eq!(result, 7);
            });
        }
        sched.run();
        assert_eq!(*order.borrow(), vec!["child", "joined"]);
    }

    #[test]
    fn join_resurfaces_a_panic() {
        let mut sched = Scheduler::default();
        let observed = Rc::new(RefCell::new(false));
        {
            let observed = Rc::clone(&observed);
            sched.spawn(move || {
                let child = try_spawn_joinable(32 * 1024, || -> i32 { panic!("boom") }).unwrap();
                *observed.borrow_mut() = child.join().is_err();
            });
        }
        sched.run();
        assert!(*observed.borrow());
    }
}
