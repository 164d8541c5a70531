//! A stackful, single-threaded coroutine ("fiber") runtime.
//!
//! A [`Scheduler`](scheduler::Scheduler) multiplexes any number of fibers
//! onto the OS thread that drives it; fibers cooperate by explicitly
//! yielding ([`fiber::yield_now`]), sleeping ([`fiber::delay`]), waiting on
//! a [`fiber::Mutex`] or [`fiber::channel`], or blocking on I/O through
//! [`coio`] — never by preemption. Context switches are hand-rolled
//! assembly (`context`), not OS threads or `async`/`await`.
//!
//! - [Fibers: spawning, yielding, sleeping, channels, mutexes](fiber)
//! - [Cooperative I/O syscall wrappers](coio)
//! - [The scheduler and its configuration](scheduler)
//! - [Error handling](error)
//! - [Logging](logging) (see <https://docs.rs/log/>)
//! - [Monotonic/wall clock helpers](clock)

pub mod clock;
pub mod coio;
mod context;
pub mod error;
pub mod fiber;
pub mod logging;
mod reactor;
pub mod scheduler;
mod timer;

mod io;

pub use error::{Error, Result};
pub use scheduler::{FiberId, LifecycleState, Scheduler, SchedulerBuilder, SchedulerConfig};
