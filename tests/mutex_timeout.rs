//! End-to-end scenario 5: a waiter configured with a timeout gives up
//! while the mutex is still held, and is not woken by a later release.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use fiber_rt::error::Error;
use fiber_rt::fiber::{self, Mutex};
use fiber_rt::Scheduler;

#[test]
fn timed_out_waiter_is_dropped_from_the_queue() {
    fiber_rt::logging::init_for_tests();

    let mut sched = Scheduler::default();
    let mutex = Rc::new(Mutex::new(0));
    let timeout_result = Rc::new(RefCell::new(None));
    let second_waiter_got_lock_at = Rc::new(RefCell::new(None));
    let start = Instant::now();

    {
        let mutex = Rc::clone(&mutex);
        sched.spawn(move || {
            let guard = mutex.lock().unwrap();
            fiber::delay(Duration::from_millis(500));
            drop(guard);
        });
    }
    {
        let mutex = Rc::clone(&mutex);
        let timeout_result = Rc::clone(&timeout_result);
        sched.spawn(move || {
            let res = mutex.lock_timeout(Some(Duration::from_millis(200)));
            let is_timeout = matches!(res, Err(Error::Timeout));
            *timeout_result.borrow_mut() = Some((is_timeout, start.elapsed()));
        });
    }
    {
        let mutex = Rc::clone(&mutex);
        let second_waiter_got_lock_at = Rc::clone(&second_waiter_got_lock_at);
        sched.spawn(move || {
            let _guard = mutex.lock().unwrap();
            *second_waiter_got_lock_at.borrow_mut() = Some(start.elapsed());
            fiber::request_stop();
        });
    }

    sched.run();

    let (was_timeout, elapsed) = timeout_result.borrow().expect("timeout fiber ran");
    assert!(was_timeout, "lock_timeout should report Error::Timeout specifically");
    assert!(elapsed >= Duration::from_millis(200));
    assert!(elapsed < Duration::from_millis(400));

    let second_elapsed = second_waiter_got_lock_at
        .borrow()
        .expect("second waiter eventually got the lock");
    assert!(second_elapsed >= Duration::from_millis(500));

    // The already-timed-out waiter must not have been handed the lock: the
    // only two fibers that ever observed a successful acquisition are the
    // holder and the untimed second waiter.
}
