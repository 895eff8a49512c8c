//! # weft-reactor
//!
//! The per-thread I/O and inter-thread messaging core of a shared-nothing
//! network server. A fixed set of worker threads each own an independent
//! event loop; sockets are pinned to one worker; workers coordinate only
//! through bounded SPSC mailboxes plus a signal-based wake.
//!
//! ## Modules
//!
//! - `registry` - process-wide thread table and mailbox fabric
//! - `signal` - wake-signal handler, mask, and delivery
//! - `net` - socket handles (`TcpListener`, `TcpSocket`, `UdpSocket`)
//!   and the listener/datagram factories
//! - `epoll` - the `ReadinessBackend` contract and its epoll
//!   implementation
//! - `reactor` - the `Reactor` event loop and messaging operations
//!
//! Linux-only: epoll, `pthread_kill`, and `accept4` are load-bearing.

pub mod epoll;
pub mod net;
pub mod reactor;
pub mod registry;
pub mod signal;

pub use epoll::{EpollBackend, ReadinessBackend};
pub use net::{
    make_tcp_listener, make_udp_socket, SockAddr, Socket, TcpAcceptFn, TcpListener, TcpRecvFn,
    TcpSocket, UdpRecvFn, UdpSocket,
};
pub use reactor::{make_reactor, wake_up, OnMessageFn, Reactor};

#[inline]
pub(crate) fn last_errno() -> i32 {
    unsafe { *libc::__errno_location() }
}
