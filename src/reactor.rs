//! Level-triggered readiness multiplexer over file descriptors (component D).
//!
//! Built on `mio::Poll`, which gives us an epoll/kqueue-backed reactor for
//! free along with a `Waker` that's eventfd-backed on Linux — exactly the
//! cross-thread wakeup primitive the fiber mutex (component I) and
//! `io_stop()` (component F/H) need.

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};

use crate::scheduler::FiberId;

/// Token reserved for the cross-thread wakeup source; `RawFd`s are assumed
/// to fit comfortably below this on any sane process fd limit (the default
/// `max_fds` is 1024, see `SchedulerConfig`).
const WAKE_TOKEN: Token = Token(usize::MAX);

/// Which directions are currently awaited on one fd.
#[derive(Default)]
struct FdWaiters {
    read: Option<FiberId>,
    write: Option<FiberId>,
}

impl FdWaiters {
    fn interest(&self) -> Option<Interest> {
        match (self.read.is_some(), self.write.is_some()) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }
}

/// Readiness events observed by one `poll()` pass.
pub struct ReadyFiber {
    pub fiber: FiberId,
}

/// The scheduler's I/O reactor.
pub struct Reactor {
    poll: Poll,
    events: Events,
    waiters: HashMap<RawFd, FdWaiters>,
    waker: Arc<Waker>,
}

impl Reactor {
    pub fn new(max_fds: usize) -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);
        Ok(Reactor {
            poll,
            events: Events::with_capacity(max_fds.max(64)),
            waiters: HashMap::with_capacity(max_fds),
            waker,
        })
    }

    /// A handle that can wake a blocked `poll()` from any thread.
    pub fn waker(&self) -> Arc<Waker> {
        Arc::clone(&self.waker)
    }

    /// Registers `fiber` to be woken the next time `fd` becomes readable.
    pub fn wait_readable(&mut self, fd: RawFd, fiber: FiberId) -> io::Result<()> {
        self.wait(fd, fiber, true)
    }

    /// Registers `fiber` to be woken the next time `fd` becomes writable.
    pub fn wait_writable(&mut self, fd: RawFd, fiber: FiberId) -> io::Result<()> {
        self.wait(fd, fiber, false)
    }

    fn wait(&mut self, fd: RawFd, fiber: FiberId, readable: bool) -> io::Result<()> {
        let had_entry = self.waiters.contains_key(&fd);
        let entry = self.waiters.entry(fd).or_default();
        if readable {
            entry.read = Some(fiber);
        } else {
            entry.write = Some(fiber);
        }
        let interest = entry.interest().expect("just inserted a waiter");

        let token = Token(fd as usize);
        if had_entry {
            self.poll
                .registry()
                .reregister(&mut SourceFd(&fd), token, interest)
        } else {
            self.poll
                .registry()
                .register(&mut SourceFd(&fd), token, interest)
        }
    }

    /// Removes any pending wait on `fd`, for both directions. Used when a
    /// fiber abandons a wait because a competing timer fired first.
    pub fn cancel(&mut self, fd: RawFd) {
        if self.waiters.remove(&fd).is_some() {
            let _ = self.poll.registry().deregister(&mut SourceFd(&fd));
        }
    }

    /// Number of fds currently being waited on, in either direction.
    pub fn waiting_count(&self) -> usize {
        self.waiters.len()
    }

    /// Blocks for up to `timeout` (or indefinitely if `None`) waiting for
    /// readiness on any registered fd or a cross-thread wakeup, then
    /// returns the fibers that should be marked ready.
    pub fn poll(&mut self, timeout: Option<Duration>) -> io::Result<Vec<ReadyFiber>> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(Vec::new()),
            Err(e) => return Err(e),
        }

        let mut ready = Vec::new();
        for event in self.events.iter() {
            if event.token() == WAKE_TOKEN {
                continue;
            }
            let fd = event.token().0 as RawFd;
            let Some(waiters) = self.waiters.get_mut(&fd) else {
                continue;
            };

            let mut remaining = FdWaiters::default();
            if event.is_readable() {
                if let Some(fiber) = waiters.read.take() {
                    ready.push(ReadyFiber { fiber });
                }
            } else {
                remaining.read = waiters.read;
            }
            if event.is_writable() {
                if let Some(fiber) = waiters.write.take() {
                    ready.push(ReadyFiber { fiber });
                }
            } else {
                remaining.write = waiters.write;
            }

            match remaining.interest() {
                Some(interest) => {
                    *waiters = remaining;
                    let _ = self
                        .poll
                        .registry()
                        .reregister(&mut SourceFd(&fd), Token(fd as usize), interest);
                }
                None => {
                    self.waiters.remove(&fd);
                    let _ = self.poll.registry().deregister(&mut SourceFd(&fd));
                }
            }
        }

        Ok(ready)
    }
}
