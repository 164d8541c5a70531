//! A typed, bounded, blocking channel between fibers on the same scheduler
//! (component H).
//!
//! Capacity 0 means every send rendezvous directly with a receiver; the
//! internal buffer is never populated in that case. Senders and receivers
//! are served in FIFO order on their respective wait lists, and per spec 3
//! the two wait lists are never simultaneously non-empty: a send only
//! queues when the buffer is full *and* no receiver is waiting, and a recv
//! only queues when the buffer is empty *and* no sender is waiting.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use crate::scheduler::{self, FiberId};

struct Waiter<T> {
    fiber: FiberId,
    slot: Rc<RefCell<Option<T>>>,
}

struct Inner<T> {
    capacity: usize,
    buffer: VecDeque<T>,
    send_waiters: VecDeque<Waiter<T>>,
    recv_waiters: VecDeque<Waiter<T>>,
    tx_count: usize,
    rx_count: usize,
}

/// Creates a bounded channel. `capacity == 0` makes every send a direct
/// hand-off to a waiting receiver.
pub fn bounded<T>(capacity: usize) -> (Sender<T>, Receiver<T>) {
    let inner = Rc::new(RefCell::new(Inner {
        capacity,
        buffer: VecDeque::with_capacity(capacity),
        send_waiters: VecDeque::new(),
        recv_waiters: VecDeque::new(),
        tx_count: 1,
        rx_count: 1,
    }));
    (
        Sender { inner: inner.clone() },
        Receiver { inner },
    )
}

/// The sending half of a channel. Cloning it adds another logical sender;
/// the channel only half-closes once every clone is dropped.
pub struct Sender<T> {
    inner: Rc<RefCell<Inner<T>>>,
}

/// The receiving half of a channel. See [`Sender`] for clone semantics.
pub struct Receiver<T> {
    inner: Rc<RefCell<Inner<T>>>,
}

/// Error returned by [`Sender::send`].
#[derive(Debug, PartialEq, Eq)]
pub enum SendError<T> {
    /// Every `Receiver` was dropped; the value is handed back unsent.
    Disconnected(T),
}

/// Error returned by [`Receiver::recv`].
#[derive(Debug, PartialEq, Eq)]
pub enum RecvError {
    /// Every `Sender` was dropped and the buffer has been drained.
    Disconnected,
}

/// Error returned by [`Sender::try_send`].
#[derive(Debug, PartialEq, Eq)]
pub enum TrySendError<T> {
    /// The buffer is full and no receiver is currently waiting.
    Full(T),
    /// Every `Receiver` was dropped.
    Disconnected(T),
}

/// Error returned by [`Receiver::try_recv`].
#[derive(Debug, PartialEq, Eq)]
pub enum TryRecvError {
    /// Nothing is available right now.
    Empty,
    /// Every `Sender` was dropped and the buffer has been drained.
    Disconnected,
}

fn current_fiber(what: &str) -> FiberId {
    scheduler::try_with_current(|s| s.current())
        .flatten()
        .unwrap_or_else(|| panic!("{what} called outside a fiber"))
}

impl<T> Sender<T> {
    /// Sends `value`, blocking the calling fiber if the buffer is full and
    /// no receiver is waiting. See the module docs for the rendezvous
    /// contract at capacity 0.
    pub fn send(&self, value: T) -> Result<(), SendError<T>> {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.rx_count == 0 {
                return Err(SendError::Disconnected(value));
            }
            if let Some(w) = inner.recv_waiters.pop_front() {
                *w.slot.borrow_mut() = Some(value);
                drop(inner);
                scheduler::try_with_current(|s| s.fiber_ready(w.fiber));
                return Ok(());
            }
            if inner.buffer.len() < inner.capacity {
                inner.buffer.push_back(value);
                return Ok(());
            }
        }

        let me = current_fiber("Sender::send");
        let slot = Rc::new(RefCell::new(Some(value)));
        self.inner.borrow_mut().send_waiters.push_back(Waiter {
            fiber: me,
            slot: slot.clone(),
        });
        scheduler::with_current(|s| s.fiber_switch()).expect("scheduler vanished mid-send");

        match Rc::try_unwrap(slot).ok().and_then(|c| c.into_inner()) {
            Some(value) => Err(SendError::Disconnected(value)),
            None => Ok(()),
        }
    }

    /// Non-blocking send: fails instead of suspending the fiber.
    pub fn try_send(&self, value: T) -> Result<(), TrySendError<T>> {
        let mut inner = self.inner.borrow_mut();
        if inner.rx_count == 0 {
            return Err(TrySendError::Disconnected(value));
        }
        if let Some(w) = inner.recv_waiters.pop_front() {
            *w.slot.borrow_mut() = Some(value);
            drop(inner);
            scheduler::try_with_current(|s| s.fiber_ready(w.fiber));
            return Ok(());
        }
        if inner.buffer.len() < inner.capacity {
            inner.buffer.push_back(value);
            return Ok(());
        }
        Err(TrySendError::Full(value))
    }
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        self.inner.borrow_mut().tx_count += 1;
        Sender { inner: self.inner.clone() }
    }
}

impl<T> Drop for Sender<T> {
    fn drop(&mut self) {
        let mut inner = self.inner.borrow_mut();
        inner.tx_count -= 1;
        if inner.tx_count == 0 {
            let waiters = std::mem::take(&mut inner.recv_waiters);
            drop(inner);
            for w in waiters {
                scheduler::try_with_current(|s| s.fiber_ready(w.fiber));
            }
        }
    }
}

impl<T> Receiver<T> {
    /// Receives a value, blocking the calling fiber if the buffer is empty
    /// and no sender is waiting.
    pub fn recv(&self) -> Result<T, RecvError> {
        {
            let mut inner = self.inner.borrow_mut();
            if let Some(value) = inner.buffer.pop_front() {
                if let Some(w) = inner.send_waiters.pop_front() {
                    if let Some(v) = w.slot.borrow_mut().take() {
                        inner.buffer.push_back(v);
                    }
                    drop(inner);
                    scheduler::try_with_current(|s| s.fiber_ready(w.fiber));
                }
                return Ok(value);
            }
            if let Some(w) = inner.send_waiters.pop_front() {
                let value = w
                    .slot
                    .borrow_mut()
                    .take()
                    .expect("blocked sender's slot was already empty");
                drop(inner);
                scheduler::try_with_current(|s| s.fiber_ready(w.fiber));
                return Ok(value);
            }
            if inner.tx_count == 0 {
                return Err(RecvError::Disconnected);
            }
        }

        let me = current_fiber("Receiver::recv");
        let slot = Rc::new(RefCell::new(None));
        self.inner.borrow_mut().recv_waiters.push_back(Waiter {
            fiber: me,
            slot: slot.clone(),
        });
        scheduler::with_current(|s| s.fiber_switch()).expect("scheduler vanished mid-recv");

        match Rc::try_unwrap(slot).ok().and_then(|c| c.into_inner()) {
            Some(value) => Ok(value),
            None => Err(RecvError::Disconnected),
        }
    }

    /// Non-blocking receive: fails instead of suspending the fiber.
    pub fn try_recv(&self) -> Result<T, TryRecvError> {
        let mut inner = self.inner.borrow_mut();
        if let Some(value) = inner.buffer.pop_front() {
            if let Some(w) = inner.send_waiters.pop_front() {
                if let Some(v) = w.slot.borrow_mut().take() {
                    inner.buffer.push_back(v);
                }
                drop(inner);
                scheduler::try_with_current(|s| s.fiber_ready(w.fiber));
            }
            return Ok(value);
        }
        if inner.tx_count == 0 {
            return Err(TryRecvError::Disconnected);
        }
        Err(TryRecvError::Empty)
    }
}

impl<T> Clone for Receiver<T> {
    fn clone(&self) -> Self {
        self.inner.borrow_mut().rx_count += 1;
        Receiver { inner: self.inner.clone() }
    }
}

impl<T> Drop for Receiver<T> {
    fn drop(&mut self) {
        let mut inner = self.inner.borrow_mut();
        inner.rx_count -= 1;
        if inner.rx_count == 0 {
            let waiters = std::mem::take(&mut inner.send_waiters);
            drop(inner);
            for w in waiters {
                scheduler::try_with_current(|s| s.fiber_ready(w.fiber));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::Scheduler;
    use std::cell::RefCell as StdRefCell;
    use std::rc::Rc as StdRc;

    #[test]
    fn rendezvous_ping_pong() {
        let mut sched = Scheduler::default();
        let (tx, rx) = bounded::<i32>(0);
        let received = StdRc::new(StdRefCell::new(Vec::new()));

        sched.spawn(move || {
            tx.send(1).unwrap();
            tx.send(2).unwrap();
            tx.send(3).unwrap();
        });
        {
            let received = StdRc::clone(&received);
            sched.spawn(move || {
                for _ in 0..3 {
                    received.borrow_mut().push(rx.recv().unwrap());
                }
            });
        }
        sched.run();
        assert_eq!(*received.borrow(), vec![1, 2, 3]);
    }

    #[test]
    fn dropping_all_senders_wakes_receiver() {
        let mut sched = Scheduler::default();
        let (tx, rx) = bounded::<i32>(0);
        let got = StdRc::new(StdRefCell::new(None));
        {
            let got = StdRc::clone(&got);
            sched.spawn(move || {
                *got.borrow_mut() = Some(rx.recv());
            });
        }
        sched.spawn(move || {
            drop(tx);
        });
        sched.run();
        assert_eq!(*got.borrow(), Some(Err(RecvError::Disconnected)));
    }

    #[test]
    fn dropping_all_receivers_wakes_sender() {
        let mut sched = Scheduler::default();
        let (tx, rx) = bounded::<i32>(0);
        let got = StdRc::new(StdRefCell::new(None));
        {
            let got = StdRc::clone(&got);
            sched.spawn(move || {
                *got.borrow_mut() = Some(tx.send(42));
            });
        }
        sched.spawn(move || {
            drop(rx);
        });
        sched.run();
        assert_eq!(*got.borrow(), Some(Err(SendError::Disconnected(42))));
    }

    #[test]
    fn buffered_channel_does_not_block_until_full() {
        let mut sched = Scheduler::default();
        let (tx, rx) = bounded::<i32>(2);
        sched.spawn(move || {
            tx.send(1).unwrap();
            tx.send(2).unwrap();
            assert_eq!(tx.try_send(3), Err(TrySendError::Full(3)));
        });
        sched.run();
        drop(rx);
    }
}
