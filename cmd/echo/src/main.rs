//! Weft echo server
//!
//! Shared-nothing TCP/UDP echo: every worker thread owns a reactor and
//! its own REUSEPORT listener on the same port, so the kernel spreads
//! connections across workers with no cross-thread handoff.
//!
//! Usage:
//!     cargo run --release -p weft-echo -- [port] [workers]
//!
//! Test with:
//!     echo hello | nc localhost 7777
//!     echo ping  | nc -u -q1 localhost 7777
//!
//! Stop with ^C.

use std::rc::Rc;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use weft_core::{winfo, wwarn};
use weft_reactor::{
    make_reactor, make_tcp_listener, make_udp_socket, Reactor, Socket, TcpSocket,
};

const DEFAULT_PORT: u16 = 7777;

fn worker(thread_id: usize, nr_threads: usize, port: u16, shutdown: Arc<AtomicBool>) {
    let reactor = make_reactor(
        Reactor::default_backend(),
        thread_id,
        nr_threads,
        Box::new(|_| {}),
    )
    .expect("reactor setup");

    let accept_reactor = Rc::downgrade(&reactor);
    let listener = make_tcp_listener(
        "0.0.0.0",
        port,
        1024,
        Box::new(move |fd| {
            let Some(reactor) = accept_reactor.upgrade() else {
                return;
            };
            let conn_reactor = Rc::downgrade(&reactor);
            let sock = TcpSocket::from_raw_parts(
                fd,
                Box::new(move |s, payload| {
                    if payload.is_empty() {
                        // Peer closed or reset; drop our registration.
                        if let Some(reactor) = conn_reactor.upgrade() {
                            let _ = reactor.deregister(s.as_ref());
                        }
                        return;
                    }
                    if let Err(e) = s.send(payload) {
                        wwarn!("echo: fd {}: {}", s.sockfd(), e);
                    }
                }),
            );
            if let Err(e) = sock.set_tcp_nodelay(true) {
                wwarn!("echo: fd {}: {}", fd, e);
            }
            if let Err(e) = reactor.register(sock) {
                wwarn!("echo: register fd {}: {}", fd, e);
            }
        }),
    )
    .expect("tcp listener");

    let udp = make_udp_socket(
        "0.0.0.0",
        port,
        Box::new(move |s, payload, src| {
            let Some(src) = src else { return };
            if payload.is_empty() {
                return;
            }
            if let Err(e) = s.send(payload, src) {
                wwarn!("echo: udp {:?}: {}", src, e);
            }
        }),
    )
    .expect("udp socket");

    reactor
        .register(Rc::clone(&listener) as Rc<dyn Socket>)
        .expect("register listener");
    reactor
        .register(Rc::clone(&udp) as Rc<dyn Socket>)
        .expect("register udp");

    winfo!("echo: worker {} listening on port {}", thread_id, port);
    reactor.run(&shutdown).expect("reactor loop");
}

fn main() {
    weft_core::wprint::init();

    let mut args = std::env::args().skip(1);
    let port: u16 = args
        .next()
        .map(|a| a.parse().expect("port must be a number"))
        .unwrap_or(DEFAULT_PORT);
    let nr_threads: usize = args
        .next()
        .map(|a| a.parse().expect("workers must be a number"))
        .unwrap_or(4);

    winfo!("echo: {} workers on port {}", nr_threads, port);
    let shutdown = Arc::new(AtomicBool::new(false));

    let mut handles = Vec::with_capacity(nr_threads);
    for thread_id in 0..nr_threads {
        let shutdown = Arc::clone(&shutdown);
        handles.push(
            std::thread::Builder::new()
                .name(format!("weft-echo-{}", thread_id))
                .spawn(move || worker(thread_id, nr_threads, port, shutdown))
                .expect("spawn worker"),
        );
    }
    for handle in handles {
        let _ = handle.join();
    }
}
