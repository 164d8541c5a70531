//! End-to-end scenario 6: a writer stalls on backpressure while another
//! fiber keeps making progress.
//!
//! One end of a `socketpair(2)` is never read from; a writer fiber issues
//! repeated `co_write` calls of a sizable buffer until the kernel socket
//! buffer fills and `co_write` has to suspend on writability. Meanwhile a
//! second fiber calls `fiber::delay(10ms)` in a loop. Their timestamps are
//! later checked for interleaving, proving the writer's suspension really
//! yielded the thread rather than spinning.

use std::cell::{Cell, RefCell};
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::{Duration, Instant};

use fiber_rt::coio::co_write;
use fiber_rt::fiber;
use fiber_rt::Scheduler;

fn nonblocking_socketpair() -> (RawFd, RawFd) {
    let mut fds = [0 as RawFd; 2];
    let rc = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
    assert_eq!(
        rc,
        0,
        "socketpair failed: {}",
        std::io::Error::last_os_error()
    );
    for fd in fds {
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
        assert!(flags >= 0);
        let rc = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
        assert_eq!(rc, 0);
    }
    (fds[0], fds[1])
}

const CHUNK: usize = 64 * 1024;
const ITERATIONS: usize = 64;

#[test]
fn writer_yields_to_other_fibers_while_blocked_on_backpressure() {
    fiber_rt::logging::init_for_tests();

    let (writer_fd, reader_fd) = nonblocking_socketpair();
    // The peer end is deliberately never drained; once its receive buffer
    // and the writer's send buffer both fill, co_write has no choice but
    // to suspend on writability.
    let _never_read = reader_fd;

    let mut sched = Scheduler::default();
    let start = Instant::now();
    let writer_ticks = Rc::new(RefCell::new(Vec::<Duration>::new()));
    let delay_ticks = Rc::new(RefCell::new(Vec::<Duration>::new()));
    let writer_done = Rc::new(Cell::new(false));

    {
        let writer_ticks = Rc::clone(&writer_ticks);
        let writer_done = Rc::clone(&writer_done);
        sched.spawn(move || {
            let buf = vec![0xABu8; CHUNK];
            for _ in 0..ITERATIONS {
                co_write(writer_fd, &buf).expect("co_write");
                writer_ticks.borrow_mut().push(start.elapsed());
            }
            writer_done.set(true);
            unsafe { libc::close(writer_fd) };
        });
    }

    {
        let delay_ticks = Rc::clone(&delay_ticks);
        let writer_done = Rc::clone(&writer_done);
        sched.spawn(move || {
            while !writer_done.get() {
                fiber::delay(Duration::from_millis(10));
                delay_ticks.borrow_mut().push(start.elapsed());
            }
            fiber::request_stop();
            unsafe { libc::close(reader_fd) };
        });
    }

    sched.run();

    let writer_ticks = writer_ticks.borrow();
    let delay_ticks = delay_ticks.borrow();
    assert_eq!(writer_ticks.len(), ITERATIONS);
    assert!(
        !delay_ticks.is_empty(),
        "the delay fiber should have made progress while the writer was stalled"
    );

    let first_write = writer_ticks.first().copied().unwrap();
    let last_write = writer_ticks.last().copied().unwrap();
    let interleaved = delay_ticks
        .iter()
        .any(|t| *t > first_write && *t < last_write);
    assert!(
        interleaved,
        "expected at least one delay tick between the writer's first and last \
         completed write, proving the writer actually yielded instead of \
         monopolizing the thread"
    );
}
