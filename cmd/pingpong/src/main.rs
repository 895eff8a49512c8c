//! Mailbox ping-pong
//!
//! Two workers bounce a boxed counter through the fabric: worker 0
//! sends 1, worker 1 increments and sends it back, and so on until the
//! configured number of rounds. Exercises the SPSC rings and the
//! sleep/wake handshake on every hop, then prints the round-trip rate.
//!
//! Usage:
//!     cargo run --release -p weft-pingpong -- [rounds]

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::time::Instant;
use weft_core::winfo;
use weft_reactor::{make_reactor, wake_up, Reactor};

const DEFAULT_ROUNDS: u64 = 100_000;

fn boxed(v: u64) -> *mut () {
    Box::into_raw(Box::new(v)) as *mut ()
}

unsafe fn unbox(p: *mut ()) -> u64 {
    *Box::from_raw(p as *mut u64)
}

fn player(
    thread_id: usize,
    peer: usize,
    rounds: u64,
    start: Arc<Barrier>,
    shutdown: Arc<AtomicBool>,
) {
    // The on-message callback needs the reactor that is built after it;
    // park the handle in a slot the closure shares.
    let slot: Rc<RefCell<Option<Rc<Reactor>>>> = Rc::new(RefCell::new(None));
    let cb_slot = Rc::clone(&slot);
    let cb_shutdown = Arc::clone(&shutdown);

    let reactor = make_reactor(
        Reactor::default_backend(),
        thread_id,
        2,
        Box::new(move |p| {
            let n = unsafe { unbox(p) };
            if n >= rounds {
                cb_shutdown.store(true, Ordering::Release);
                let _ = wake_up(peer);
                return;
            }
            let slot = cb_slot.borrow();
            let reactor = slot.as_ref().expect("reactor published before run");
            // A full cell leaves ownership with us; retry the same
            // pointer rather than allocating per attempt.
            let msg = boxed(n + 1);
            loop {
                match reactor.send_msg(peer, msg) {
                    Ok(true) => break,
                    Ok(false) => std::thread::yield_now(),
                    Err(e) => panic!("send_msg: {}", e),
                }
            }
        }),
    )
    .expect("reactor setup");
    *slot.borrow_mut() = Some(Rc::clone(&reactor));

    // Both identities must be published before the first hop.
    start.wait();

    if thread_id == 0 {
        let msg = boxed(1);
        while !reactor.send_msg(peer, msg).expect("first hop") {
            std::thread::yield_now();
        }
    }

    reactor.run(&shutdown).expect("reactor loop");
}

fn main() {
    weft_core::wprint::init();

    let rounds: u64 = std::env::args()
        .nth(1)
        .map(|a| a.parse().expect("rounds must be a number"))
        .unwrap_or(DEFAULT_ROUNDS);

    let start = Arc::new(Barrier::new(2));
    let shutdown = Arc::new(AtomicBool::new(false));
    let began = Instant::now();

    let mut handles = Vec::new();
    for thread_id in 0..2 {
        let start = Arc::clone(&start);
        let shutdown = Arc::clone(&shutdown);
        handles.push(
            std::thread::Builder::new()
                .name(format!("weft-pingpong-{}", thread_id))
                .spawn(move || player(thread_id, 1 - thread_id, rounds, start, shutdown))
                .expect("spawn player"),
        );
    }
    for handle in handles {
        let _ = handle.join();
    }

    let elapsed = began.elapsed();
    winfo!(
        "pingpong: {} hops in {:.3}s ({:.0} hops/s)",
        rounds,
        elapsed.as_secs_f64(),
        rounds as f64 / elapsed.as_secs_f64()
    );
}
