//! Cooperative multitasking: the fiber-facing free-function API.
//!
//! These functions operate on whichever [`crate::scheduler::Scheduler`] is
//! currently running on the calling OS thread; they panic if called
//! without one (matching the original's assumption that the hooked API is
//! only ever invoked from inside a fiber or the I/O loop it drives).

use std::time::Duration;

use crate::error::Result;
use crate::scheduler::{self, FiberId};

pub mod channel;
pub mod csw;
pub mod join;
pub mod mutex;

pub use channel::{bounded, RecvError, SendError, TryRecvError, TrySendError};
pub use channel::{Receiver, Sender};
pub use csw::{check_yield, csw, YieldResult};
pub use join::JoinHandle;
pub use mutex::Mutex;

/// Spawns a new fiber on the scheduler currently running on this thread,
/// with the scheduler's configured default stack size.
///
/// # Panics
/// Panics if no scheduler is running on the calling thread.
pub fn spawn<F>(f: F) -> FiberId
where
    F: FnOnce() + 'static,
{
    scheduler::with_current(|s| s.spawn(f)).expect("fiber::spawn called without a running scheduler")
}

/// The id of the fiber calling this function, or `None` if called from the
/// scheduler's own stack (not from inside any fiber).
pub fn id() -> Option<FiberId> {
    scheduler::try_with_current(|s| s.current()).flatten()
}

/// Spawns a fiber with the scheduler's default stack size and returns a
/// [`JoinHandle`] that can retrieve its return value, or resurface its
/// panic, once it finishes.
///
/// # Panics
/// Panics if no scheduler is running on the calling thread.
pub fn spawn_joinable<F, T>(f: F) -> JoinHandle<T>
where
    F: FnOnce() -> T + 'static,
    T: 'static,
{
    let stack_size = scheduler::with_current(|s| s.config().default_stack_size)
        .expect("fiber::spawn_joinable called without a running scheduler");
    join::try_spawn_joinable(stack_size, f).expect("default fiber stack allocation should not fail")
}

/// Like [`spawn_joinable`] but with an explicit stack size.
pub fn try_spawn_joinable<F, T>(stack_size: usize, f: F) -> Result<JoinHandle<T>>
where
    F: FnOnce() -> T + 'static,
    T: 'static,
{
    join::try_spawn_joinable(stack_size, f)
}

/// Marks the calling fiber ready and yields control to the scheduler.
/// Returns the number of other fibers that ran before this one was resumed.
///
/// # Panics
/// Panics if called outside a fiber.
pub fn yield_now() -> u64 {
    scheduler::with_current(|s| s.fiber_yield()).expect("fiber::yield_now called outside a fiber")
}

/// Terminates the calling fiber immediately; never returns.
///
/// Rust destructors for values already constructed on the fiber's stack
/// frame have already run by the time this is reached from normal control
/// flow (it's typically the last statement of the fiber's entry closure);
/// a panic propagating through the closure is caught at the trampoline
/// instead and never reaches here.
///
/// # Panics
/// Panics if called outside a fiber.
pub fn exit(_code: i32) -> ! {
    scheduler::try_with_current(|s| s.exit_current())
        .unwrap_or_else(|| panic!("fiber::exit called outside a fiber"))
}

/// Suspends the calling fiber for at least `d`, returning how much longer
/// than `d` it actually slept (clamped at zero).
///
/// # Panics
/// Panics if called outside a fiber.
pub fn delay(d: Duration) -> Duration {
    crate::io::delay(d)
}

/// Thin wrapper around [`delay`] taking whole seconds, mirroring the
/// original's `sleep(unsigned int)`.
pub fn sleep(seconds: u64) -> u64 {
    delay(Duration::from_secs(seconds)).as_secs()
}

/// Fiber-callable equivalent of [`crate::Scheduler::io_stop`]: tells the
/// scheduler running on this thread to wind down once no user fibers are
/// left. A fiber has no `&mut Scheduler` of its own, so this is how one
/// asks for a clean shutdown from the inside instead of relying on an
/// external caller holding the scheduler value.
///
/// # Panics
/// Panics if called outside a fiber.
pub fn request_stop() {
    scheduler::with_current(|s| s.io_stop()).expect("fiber::request_stop called outside a fiber")
}

/// A voluntary, cooperative cancellation flag.
///
/// The core scheduler has no cross-fiber cancellation primitive (`exit` is
/// the only fiber-initiated termination); this is the opt-in supplement
/// spec 5 allows implementers to add. A fiber must check
/// [`CancelToken::is_cancelled`] itself at its own suspension points —
/// nothing forces it to.
#[derive(Clone, Default)]
pub struct CancelToken {
    flag: std::rc::Rc<std::cell::Cell<bool>>,
}

impl CancelToken {
    pub fn new() -> Self {
        CancelToken::default()
    }

    /// Requests cancellation. Has no effect unless the target fiber
    /// cooperates by checking [`is_cancelled`](Self::is_cancelled).
    pub fn cancel(&self) {
        self.flag.set(true);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.get()
    }
}
