//! End-to-end scenario 3: a loopback echo server.
//!
//! A listener fiber accepts connections over a loopback `TcpListener`; each
//! connection spawns an echo fiber (16 KiB stack) that reads one line at a
//! time and writes it straight back until the peer closes. At full scale
//! this scenario is 100 concurrent clients issuing 10 requests apiece; the
//! integration test below scales that down to keep CI runtime bounded.

use std::cell::Cell;
use std::io::{Read, Write};
use std::net::SocketAddr;
use std::rc::Rc;

use fiber_rt::coio::{CoIoListener, CoIoStream};
use fiber_rt::fiber;
use fiber_rt::Scheduler;

const NUM_CLIENTS: usize = 4;
const REQUESTS_PER_CLIENT: usize = 3;

fn handle_echo(mut stream: CoIoStream) {
    let mut pending = Vec::new();
    let mut tmp = [0u8; 256];
    loop {
        if let Some(pos) = pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = pending.drain(..=pos).collect();
            stream.write_all(&line).expect("echo write");
            continue;
        }
        let n = stream.read(&mut tmp).expect("echo read");
        if n == 0 {
            break;
        }
        pending.extend_from_slice(&tmp[..n]);
    }
}

fn run_client(addr: SocketAddr, id: usize) {
    let mut stream = CoIoStream::connect(addr).expect("client connect");
    for req in 0..REQUESTS_PER_CLIENT {
        let msg = format!("client{}-req{}\n", id, req);
        stream.write_all(msg.as_bytes()).expect("client write");

        let mut buf = vec![0u8; msg.len()];
        let mut read = 0;
        while read < buf.len() {
            let n = stream.read(&mut buf[read..]).expect("client read");
            assert!(n > 0, "server closed mid-response");
            read += n;
        }
        assert_eq!(buf, msg.as_bytes());
    }
}

#[test]
fn echoes_every_line_back_to_every_client() {
    fiber_rt::logging::init_for_tests();

    let mut sched = Scheduler::default();
    let listener = Rc::new(CoIoListener::bind("127.0.0.1:0").expect("bind"));
    let addr = listener.local_addr().expect("local_addr for the bound listener");

    {
        let listener = Rc::clone(&listener);
        sched.spawn(move || {
            for accepted in 0..NUM_CLIENTS {
                let (stream, _peer) = listener.accept().expect("accept");
                fiber::spawn(move || handle_echo(stream));
                if accepted + 1 == NUM_CLIENTS {
                    fiber::request_stop();
                }
            }
        });
    }

    let done = Rc::new(Cell::new(0usize));
    for id in 0..NUM_CLIENTS {
        let done = Rc::clone(&done);
        sched.spawn(move || {
            run_client(addr, id);
            done.set(done.get() + 1);
        });
    }

    sched.run();

    assert_eq!(done.get(), NUM_CLIENTS);
}
