//! The system I/O fiber (component F): owns the reactor and timer list and
//! runs the invariant loop described in spec 4.C.

use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_queue::SegQueue;
use mio::Waker;

use crate::error::Result;
use crate::reactor::Reactor;
use crate::scheduler::{self, FiberId};
use crate::timer::TimerList;

pub(crate) struct IoDriver {
    reactor: Reactor,
    timers: TimerList,
    /// Fiber ids readied from a different OS thread (cross-thread mutex
    /// handoff, component I); drained into the ready queue every loop
    /// iteration alongside ordinary reactor/timer readiness.
    external: Arc<SegQueue<FiberId>>,
}

impl IoDriver {
    pub(crate) fn new(max_fds: usize) -> Result<Self> {
        Ok(IoDriver {
            reactor: Reactor::new(max_fds)?,
            timers: TimerList::new(),
            external: Arc::new(SegQueue::new()),
        })
    }

    pub(crate) fn wake(&self) {
        let _ = self.reactor.waker().wake();
    }

    pub(crate) fn timers_mut(&mut self) -> &mut TimerList {
        &mut self.timers
    }

    pub(crate) fn reactor_mut(&mut self) -> &mut Reactor {
        &mut self.reactor
    }

    /// A handle other threads can push ready fiber ids onto, paired with
    /// the waker that makes this driver's `poll()` notice them promptly.
    pub(crate) fn external_handle(&self) -> (Arc<SegQueue<FiberId>>, Arc<Waker>) {
        (Arc::clone(&self.external), self.reactor.waker())
    }
}

/// Suspends the calling fiber until `fd` is readable.
pub(crate) fn wait_readable(fd: RawFd) -> Result<()> {
    scheduler::with_current(|s| -> Result<()> {
        s.ensure_io_started()?;
        let me = s.current().expect("wait_readable called outside a fiber");
        s.io_mut().reactor_mut().wait_readable(fd, me)?;
        Ok(())
    })??;
    scheduler::with_current(|s| s.fiber_switch())
}

/// Suspends the calling fiber until `fd` is writable.
pub(crate) fn wait_writable(fd: RawFd) -> Result<()> {
    scheduler::with_current(|s| -> Result<()> {
        s.ensure_io_started()?;
        let me = s.current().expect("wait_writable called outside a fiber");
        s.io_mut().reactor_mut().wait_writable(fd, me)?;
        Ok(())
    })??;
    scheduler::with_current(|s| s.fiber_switch())
}

/// Suspends the calling fiber for `d`, returning the overshoot past `d`
/// (clamped at zero), per spec 4.D.
pub(crate) fn delay(d: Duration) -> Duration {
    let start = Instant::now();
    let when = start + d;
    scheduler::with_current(|s| {
        s.ensure_io_started().expect("failed to start io driver");
        let me = s.current().expect("delay called outside a fiber");
        s.io_mut().timers_mut().insert(me, when);
        s.fiber_switch();
    })
    .expect("delay called without an active scheduler");
    start.elapsed().saturating_sub(d)
}

/// Registers a one-shot timer that readies `fiber` after `d`, without
/// suspending the caller. Used by the fiber mutex (component I) to race a
/// timeout against a lock grant; pair with [`cancel_timeout`] once the
/// caller knows which of the two actually happened.
pub(crate) fn register_timeout(fiber: FiberId, d: Duration) -> Result<()> {
    scheduler::with_current(|s| {
        s.ensure_io_started()?;
        s.io_mut().timers_mut().insert(fiber, Instant::now() + d);
        Ok(())
    })?
}

/// Cancels a timer registered with [`register_timeout`], if it hasn't
/// fired yet.
pub(crate) fn cancel_timeout(fiber: FiberId) {
    scheduler::try_with_current(|s| s.io_mut().timers_mut().cancel(fiber));
}

/// A handle other OS threads can use to ready a fiber that lives on this
/// scheduler, for cross-thread-safe synchronization primitives.
pub(crate) fn external_handle() -> Result<(Arc<SegQueue<FiberId>>, Arc<mio::Waker>)> {
    scheduler::with_current(|s| {
        s.ensure_io_started()?;
        Ok(s.io_mut().external_handle())
    })?
}

/// The I/O fiber's entry point (spawned once, lazily, by
/// `Scheduler::ensure_io_started`).
pub(crate) fn io_loop() {
    scheduler::with_current(|s| s.make_current_sys()).ok();

    loop {
        // Step 1: drain every currently-ready user fiber before sleeping.
        loop {
            let ran = scheduler::with_current(|s| s.fiber_yield()).unwrap_or(0);
            if ran == 0 {
                break;
            }
        }

        // Step 2: compute the reactor timeout from the earliest timer.
        let timeout = scheduler::with_current(|s| {
            s.io_mut().timers_mut().next_deadline().map(|when| {
                let now = Instant::now();
                if now >= when {
                    Duration::ZERO
                } else {
                    // +1ms guards against waking just before the deadline,
                    // mirroring the original's "deviation of epoll_wait" margin.
                    (when - now) + Duration::from_millis(1)
                }
            })
        })
        .unwrap_or(None);

        // Step 3+4: poll the reactor and ready any fibers it woke.
        let poll_result =
            scheduler::with_current(|s| s.io_mut().reactor_mut().poll(timeout)).unwrap();
        match poll_result {
            Ok(ready) => {
                for rf in ready {
                    scheduler::with_current(|s| s.fiber_ready(rf.fiber)).ok();
                }
            }
            Err(e) => log::warn!("io reactor poll failed: {e}"),
        }

        // Drain cross-thread readiness (component I's mutex handoff) too.
        scheduler::with_current(|s| {
            let external = Arc::clone(&s.io_mut().external);
            while let Some(fid) = external.pop() {
                s.fiber_ready(fid);
            }
        })
        .ok();

        // Step 5: stop once drained and requested.
        let (user_count, stop) =
            scheduler::with_current(|s| (s.user_fiber_count(), s.stop_requested())).unwrap();
        if user_count == 0 && stop {
            break;
        }

        // Step 6: expire due timers.
        let now = Instant::now();
        let expired = scheduler::with_current(|s| s.io_mut().timers_mut().expire(now)).unwrap();
        for fid in expired {
            scheduler::with_current(|s| s.fiber_ready(fid)).ok();
        }
    }
}
