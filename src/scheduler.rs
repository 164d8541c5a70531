//! The fiber arena, ready queue, and run loop (components B and C).
//!
//! Global mutable state in the original (process-wide statics for the
//! reactor, ready queue, and running fiber) is replaced with an explicit
//! [`Scheduler`] value plus a thread-local pointer to whichever scheduler is
//! currently running on this OS thread, so free functions like
//! [`crate::fiber::yield_now`] can reach it without threading `&mut
//! Scheduler` through every call site. Each OS thread owns at most one
//! running scheduler at a time.

use std::cell::Cell;
use std::collections::{HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::ptr;

use slab::Slab;

use crate::context::{Context, Stack};
use crate::error::{Error, Result};
use crate::io::IoDriver;

/// A fiber's identity, stable for the lifetime of the scheduler instance
/// that created it. Unlike the arena slot it occupies, ids are never
/// reused, satisfying spec invariant 4.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct FiberId(u64);

impl FiberId {
    #[cfg(test)]
    pub(crate) fn from_raw(n: u64) -> Self {
        FiberId(n)
    }

    /// The raw numeric id, for logging/diagnostics only.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for FiberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "fiber#{}", self.0)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum FiberStatus {
    Ready,
    Running,
    Suspended,
    Exiting,
}

struct FiberSlot {
    id: FiberId,
    status: FiberStatus,
    context: Context,
    #[allow(dead_code)]
    stack: Stack,
    entry: Option<Box<dyn FnOnce()>>,
    sys: bool,
    panic: Option<Box<dyn std::any::Any + Send + 'static>>,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum LifecycleState {
    Idle,
    Running,
    Stopping,
    Stopped,
}

/// Tunable limits for a [`Scheduler`], set before the first [`Scheduler::run`].
#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    /// Maximum number of file descriptors the reactor tracks concurrently.
    pub max_fds: usize,
    /// Stack size used by [`crate::fiber::spawn`] when no explicit size is given.
    pub default_stack_size: usize,
    /// Stack size for the system I/O fiber (component F).
    pub io_fiber_stack_size: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            max_fds: 1024,
            default_stack_size: 32 * 1024,
            io_fiber_stack_size: 800 * 1024,
        }
    }
}

/// Builder for [`SchedulerConfig`] / [`Scheduler`].
#[derive(Default)]
pub struct SchedulerBuilder {
    config: SchedulerConfig,
}

impl SchedulerBuilder {
    pub fn new() -> Self {
        SchedulerBuilder::default()
    }

    pub fn max_fds(mut self, n: usize) -> Self {
        self.config.max_fds = n;
        self
    }

    pub fn default_stack_size(mut self, n: usize) -> Self {
        self.config.default_stack_size = n;
        self
    }

    pub fn io_fiber_stack_size(mut self, n: usize) -> Self {
        self.config.io_fiber_stack_size = n;
        self
    }

    pub fn build(self) -> Scheduler {
        Scheduler::new(self.config)
    }
}

/// A single-threaded cooperative fiber scheduler.
///
/// Create one per OS thread that wants to host fibers, spawn some work with
/// [`Scheduler::spawn`], then call [`Scheduler::run`].
pub struct Scheduler {
    arena: Slab<FiberSlot>,
    index: HashMap<FiberId, usize>,
    ready: VecDeque<FiberId>,
    running: Option<FiberId>,
    scheduler_context: Context,
    next_id: u64,
    user_fiber_count: usize,
    switched: u64,
    stop_requested: bool,
    state: LifecycleState,
    config: SchedulerConfig,
    io: Option<IoDriver>,
    io_fiber: Option<FiberId>,
}

thread_local! {
    static CURRENT: Cell<*mut Scheduler> = Cell::new(ptr::null_mut());
}

/// Runs `f` with the scheduler currently active on this thread, or `None`
/// if no [`Scheduler::run`] call is on the stack.
pub(crate) fn try_with_current<R>(f: impl FnOnce(&mut Scheduler) -> R) -> Option<R> {
    let ptr = CURRENT.with(|c| c.get());
    if ptr.is_null() {
        None
    } else {
        Some(f(unsafe { &mut *ptr }))
    }
}

/// Like [`try_with_current`] but returns [`Error::NotRunning`] instead of
/// `None`, for the public fiber-only API surface.
pub(crate) fn with_current<R>(f: impl FnOnce(&mut Scheduler) -> R) -> Result<R> {
    try_with_current(f).ok_or(Error::NotRunning)
}

extern "C" fn fiber_trampoline() -> ! {
    CURRENT.with(|c| {
        let ptr = c.get();
        assert!(!ptr.is_null(), "fiber trampoline entered with no active scheduler");
        let scheduler = unsafe { &mut *ptr };
        scheduler.run_current_entry();
    });
    unreachable!("run_current_entry must not return")
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Scheduler {
            arena: Slab::new(),
            index: HashMap::new(),
            ready: VecDeque::new(),
            running: None,
            scheduler_context: Context::empty(),
            next_id: 1,
            user_fiber_count: 0,
            switched: 0,
            stop_requested: false,
            state: LifecycleState::Idle,
            config,
            io: None,
            io_fiber: None,
        }
    }

    pub fn builder() -> SchedulerBuilder {
        SchedulerBuilder::new()
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Spawns a fiber with the default stack size. Panics only if the
    /// allocator is exhausted badly enough that `Stack::new` itself panics
    /// (it doesn't; see [`Scheduler::try_spawn`] for the fallible form).
    pub fn spawn<F>(&mut self, f: F) -> FiberId
    where
        F: FnOnce() + 'static,
    {
        self.try_spawn(self.config.default_stack_size, f)
            .expect("default fiber stack allocation should not fail")
    }

    /// Spawns a fiber with an explicit stack size.
    pub fn try_spawn<F>(&mut self, stack_size: usize, f: F) -> Result<FiberId>
    where
        F: FnOnce() + 'static,
    {
        self.spawn_internal(stack_size, false, f)
    }

    pub(crate) fn spawn_sys<F>(&mut self, stack_size: usize, f: F) -> Result<FiberId>
    where
        F: FnOnce() + 'static,
    {
        self.spawn_internal(stack_size, true, f)
    }

    fn spawn_internal<F>(&mut self, stack_size: usize, sys: bool, f: F) -> Result<FiberId>
    where
        F: FnOnce() + 'static,
    {
        let stack = Stack::new(stack_size)?;
        let context = unsafe { Context::new(&stack, fiber_trampoline) };
        let id = FiberId(self.next_id);
        self.next_id += 1;

        let slot = FiberSlot {
            id,
            status: FiberStatus::Suspended,
            context,
            stack,
            entry: Some(Box::new(f)),
            sys,
            panic: None,
        };
        let key = self.arena.insert(slot);
        self.index.insert(id, key);
        if !sys {
            self.user_fiber_count += 1;
        }
        log::trace!("{id} created (sys={sys}, stack={stack_size})");
        self.fiber_ready(id);
        Ok(id)
    }

    /// The currently-running fiber, if any (`None` on the scheduler's own
    /// stack, e.g. inside `Scheduler::run`'s loop body).
    pub fn current(&self) -> Option<FiberId> {
        self.running
    }

    /// Marks `id` ready and appends it to the back of the ready queue.
    ///
    /// Tail insertion is used uniformly, a deliberate deviation from the
    /// original's head-insertion `fiber_ready` (see DESIGN.md) chosen for
    /// straightforward FIFO fairness.
    pub(crate) fn fiber_ready(&mut self, id: FiberId) {
        // A stale id (already exited, e.g. a timer that raced a mutex grant)
        // must not be queued: nothing will ever remove it again.
        if !self.index.contains_key(&id) {
            return;
        }
        self.set_status(id, FiberStatus::Ready);
        self.ready.push_back(id);
    }

    fn set_status(&mut self, id: FiberId, status: FiberStatus) {
        if let Some(&key) = self.index.get(&id) {
            self.arena[key].status = status;
        }
    }

    pub(crate) fn status(&self, id: FiberId) -> Option<FiberStatus> {
        self.index.get(&id).map(|&key| self.arena[key].status)
    }

    /// Suspends the calling fiber and returns control to the scheduler.
    /// The caller is responsible for having linked itself onto some wait
    /// list (ready queue, timer list, channel/mutex waiter list) first,
    /// unless it intends to never be resumed automatically (i.e. `exit`).
    pub(crate) fn fiber_switch(&mut self) {
        self.suspend_current();
    }

    /// Marks the current fiber ready and switches out, returning the
    /// number of other fibers that ran before it was resumed.
    pub(crate) fn fiber_yield(&mut self) -> u64 {
        let id = self
            .running
            .expect("fiber_yield called with no fiber running");
        let before = self.switched;
        self.fiber_ready(id);
        self.fiber_switch();
        self.switched.saturating_sub(before).saturating_sub(1)
    }

    /// The total number of context switches performed by this scheduler so
    /// far, including switches into and out of system fibers.
    pub(crate) fn switch_count(&self) -> u64 {
        self.switched
    }

    pub(crate) fn is_sys(&self, id: FiberId) -> bool {
        self.index.get(&id).map_or(false, |&key| self.arena[key].sys)
    }

    /// Promotes the calling fiber to a system fiber (excluded from the
    /// live-user-fiber termination count). Used once by the I/O fiber.
    pub(crate) fn make_current_sys(&mut self) {
        let id = self.running.expect("make_current_sys outside a fiber");
        if let Some(&key) = self.index.get(&id) {
            if !self.arena[key].sys {
                self.arena[key].sys = true;
                self.user_fiber_count -= 1;
            }
        }
    }

    pub(crate) fn user_fiber_count(&self) -> usize {
        self.user_fiber_count
    }

    pub(crate) fn stop_requested(&self) -> bool {
        self.stop_requested
    }

    /// Requests that the scheduler stop once no user fibers remain.
    /// Safe to call from another thread if the scheduler's I/O driver has
    /// started (it wakes a blocked `poll()` via the shared waker).
    pub fn io_stop(&mut self) {
        self.stop_requested = true;
        if self.state == LifecycleState::Running {
            self.state = LifecycleState::Stopping;
        }
        if let Some(io) = &self.io {
            io.wake();
        }
    }

    /// Lazily creates the I/O system fiber and its reactor/timer list, the
    /// first time anything needs to wait on I/O or a timer.
    pub(crate) fn ensure_io_started(&mut self) -> Result<()> {
        if self.io.is_some() {
            return Ok(());
        }
        let driver = IoDriver::new(self.config.max_fds)?;
        self.io = Some(driver);
        let stack_size = self.config.io_fiber_stack_size;
        let id = self.spawn_sys(stack_size, crate::io::io_loop)?;
        self.io_fiber = Some(id);
        Ok(())
    }

    pub(crate) fn io_mut(&mut self) -> &mut IoDriver {
        self.io.as_mut().expect("ensure_io_started was not called")
    }

    /// Runs the scheduler until the ready queue is empty.
    ///
    /// Per spec 4.H, this terminates only once the ready queue is drained
    /// AND no live (non-system) fiber slots remain in the arena AND
    /// `io_stop()` was called — which the I/O fiber itself enforces by not
    /// returning from its loop until that holds, so in practice `run`
    /// simply drains the queue: the I/O fiber keeps re-enqueuing itself
    /// (indirectly, via `fiber_ready`'d waiters) as long as work remains.
    pub fn run(&mut self) {
        assert!(
            CURRENT.with(|c| c.get().is_null()),
            "fiber-rt: nested Scheduler::run on the same thread"
        );
        CURRENT.with(|c| c.set(self as *mut Scheduler));
        self.state = LifecycleState::Running;
        log::debug!("scheduler starting");

        loop {
            let next = match self.ready.pop_front() {
                Some(id) => id,
                None => break,
            };
            self.running = Some(next);
            self.set_status(next, FiberStatus::Running);
            self.switched += 1;
            self.resume(next);
            self.running = None;

            if self.status(next) == Some(FiberStatus::Exiting) {
                self.cleanup_exited(next);
            }
        }

        self.state = LifecycleState::Stopped;
        CURRENT.with(|c| c.set(ptr::null_mut()));
        log::debug!("scheduler stopped");
    }

    fn cleanup_exited(&mut self, id: FiberId) {
        let key = self
            .index
            .remove(&id)
            .expect("exiting fiber missing from index");
        let slot = self.arena.remove(key);
        if !slot.sys {
            self.user_fiber_count -= 1;
        }
        if self.io_fiber == Some(id) {
            self.io_fiber = None;
        }
        if let Some(payload) = slot.panic {
            let msg = panic_message(&payload);
            log::error!("{id} panicked: {msg}");
        }
        log::trace!("{id} exited and was freed");
    }

    fn run_current_entry(&mut self) {
        let id = self
            .running
            .expect("fiber trampoline entered with no running fiber");
        let key = self.index[&id];
        let entry = self.arena[key]
            .entry
            .take()
            .expect("fiber entry already consumed");
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(entry)) {
            self.arena[key].panic = Some(payload);
        }
        self.exit_current();
    }

    pub(crate) fn exit_current(&mut self) -> ! {
        let id = self.running.expect("exit_current with no running fiber");
        self.set_status(id, FiberStatus::Exiting);
        self.suspend_current();
        unreachable!("a fiber resumed after reaching Exiting status")
    }

    /// Scheduler -> fiber: resumes `target`, blocking until it suspends.
    fn resume(&mut self, target: FiberId) {
        let key = self.index[&target];
        let to_ctx: *const Context = &self.arena[key].context;
        let from_ctx: *mut Context = &mut self.scheduler_context;
        // SAFETY: `to_ctx`/`from_ctx` point at disjoint `Context` values
        // owned by `self`; the swap only ever touches the stack pointer
        // fields and the two fibers' own stacks.
        unsafe { Context::swap(&mut *from_ctx, &*to_ctx) }
    }

    /// Fiber -> scheduler: returns control without marking self ready.
    fn suspend_current(&mut self) {
        let id = self
            .running
            .expect("suspend_current called with no fiber running");
        let key = self.index[&id];
        let from_ctx: *mut Context = &mut self.arena[key].context;
        let to_ctx: *const Context = &self.scheduler_context;
        // SAFETY: see `resume`.
        unsafe { Context::swap(&mut *from_ctx, &*to_ctx) }
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "Box<dyn Any>"
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Scheduler::new(SchedulerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn spawned_fibers_run_in_fifo_order() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut sched = Scheduler::default();
        for i in 0..3 {
            let log = Rc::clone(&log);
            sched.spawn(move || log.borrow_mut().push(i));
        }
        sched.run();
        assert_eq!(*log.borrow(), vec![0, 1, 2]);
    }

    #[test]
    fn yield_gives_other_fibers_a_turn() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut sched = Scheduler::default();
        {
            let log = Rc::clone(&log);
            sched.spawn(move || {
                log.borrow_mut().push("a1");
                crate::fiber::yield_now();
                log.borrow_mut().push("a2");
            });
        }
        {
            let log = Rc::clone(&log);
            sched.spawn(move || {
                log.borrow_mut().push("b1");
            });
        }
        sched.run();
        assert_eq!(*log.borrow(), vec!["a1", "b1", "a2"]);
    }

    #[test]
    fn panicking_fiber_does_not_crash_scheduler() {
        let mut sched = Scheduler::default();
        sched.spawn(|| panic!("boom"));
        let ran = Rc::new(RefCell::new(false));
        {
            let ran = Rc::clone(&ran);
            sched.spawn(move || *ran.borrow_mut() = true);
        }
        sched.run();
        assert!(*ran.borrow());
    }

    #[test]
    fn fiber_ids_are_monotonic_and_not_reused() {
        let mut sched = Scheduler::default();
        let a = sched.spawn(|| {});
        sched.run();
        let b = sched.spawn(|| {});
        assert!(b.as_u64() > a.as_u64());
    }
}
