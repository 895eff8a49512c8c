//! Socket handles and factories.
//!
//! All sockets are raw-libc, IPv4, non-blocking, and close-on-exec.
//! A handle owns exactly one descriptor and closes it exactly once on
//! drop. Handles are shared with `Rc` and pinned to the worker thread
//! that created them; the reactor's registration table and a callback
//! invocation each hold a share for the duration of the call.
//!
//! The three handle flavors implement [`Socket`]:
//!
//! - [`TcpListener`] accepts inbound connections and hands the raw
//!   descriptor to the accept callback.
//! - [`TcpSocket`] does edge-triggered stream receive and best-effort
//!   non-blocking send.
//! - [`UdpSocket`] does datagram I/O with a per-message source address.

use crate::last_errno;
use std::cell::RefCell;
use std::ffi::CString;
use std::fmt;
use std::net::SocketAddrV4;
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};
use weft_core::constants::RX_BUF_SIZE;
use weft_core::{Error, Result};

/// Callback handed each freshly accepted connection descriptor. The
/// callee wraps it in a [`TcpSocket`] and registers it with a reactor.
pub type TcpAcceptFn = Box<dyn FnMut(RawFd)>;

/// Stream receive callback. An empty payload means the peer closed or
/// reset the connection.
pub type TcpRecvFn = Box<dyn FnMut(&Rc<TcpSocket>, &[u8])>;

/// Datagram receive callback. An empty payload with no source address
/// means the socket observed a reset.
pub type UdpRecvFn = Box<dyn FnMut(&Rc<UdpSocket>, &[u8], Option<&SockAddr>)>;

// ── SockAddr ─────────────────────────────────────────────────────────

/// An IPv4 endpoint: opaque address storage plus its effective length.
/// Immutable after construction; carries no ownership.
#[derive(Clone, Copy)]
pub struct SockAddr {
    addr: libc::sockaddr_storage,
    len: libc::socklen_t,
}

impl SockAddr {
    pub fn new(addr: libc::sockaddr_storage, len: libc::socklen_t) -> Self {
        Self { addr, len }
    }

    pub(crate) fn as_ptr(&self) -> *const libc::sockaddr {
        &self.addr as *const libc::sockaddr_storage as *const libc::sockaddr
    }

    pub(crate) fn addr_len(&self) -> libc::socklen_t {
        self.len
    }

    /// Port in host byte order, if the stored address is IPv4.
    pub fn port(&self) -> Option<u16> {
        self.to_ipv4().map(|v4| v4.port())
    }

    /// IPv4 view of the stored address.
    pub fn to_ipv4(&self) -> Option<SocketAddrV4> {
        if self.addr.ss_family != libc::AF_INET as libc::sa_family_t {
            return None;
        }
        let sin = unsafe {
            &*(&self.addr as *const libc::sockaddr_storage as *const libc::sockaddr_in)
        };
        Some(SocketAddrV4::new(
            u32::from_be(sin.sin_addr.s_addr).into(),
            u16::from_be(sin.sin_port),
        ))
    }
}

impl From<SocketAddrV4> for SockAddr {
    fn from(v4: SocketAddrV4) -> Self {
        let mut addr: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let sin = libc::sockaddr_in {
            sin_family: libc::AF_INET as libc::sa_family_t,
            sin_port: v4.port().to_be(),
            sin_addr: libc::in_addr {
                s_addr: u32::from(*v4.ip()).to_be(),
            },
            sin_zero: [0; 8],
        };
        unsafe {
            std::ptr::write(
                &mut addr as *mut libc::sockaddr_storage as *mut libc::sockaddr_in,
                sin,
            );
        }
        Self {
            addr,
            len: std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        }
    }
}

impl fmt::Debug for SockAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_ipv4() {
            Some(v4) => write!(f, "{}", v4),
            None => write!(f, "<non-ipv4 family {}>", self.addr.ss_family),
        }
    }
}

// ── Socket trait ─────────────────────────────────────────────────────

/// A readiness-dispatched handle. The reactor's registration table holds
/// these behind `Rc<dyn Socket>` keyed by descriptor.
pub trait Socket {
    /// The owned descriptor.
    fn sockfd(&self) -> RawFd;

    /// Invoked by the reactor when the descriptor reports read
    /// readiness. Registration is edge-triggered, so implementations
    /// drain the descriptor until the syscall reports it would block.
    fn on_read_event(&self) -> Result<()>;
}

fn local_addr_of(sockfd: RawFd) -> Result<SockAddr> {
    let mut addr: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockname(
            sockfd,
            &mut addr as *mut libc::sockaddr_storage as *mut libc::sockaddr,
            &mut len,
        )
    };
    if rc < 0 {
        return Err(Error::Syscall {
            op: "getsockname",
            errno: last_errno(),
        });
    }
    Ok(SockAddr::new(addr, len))
}

// ── TcpListener ──────────────────────────────────────────────────────

/// A listening stream socket. Stays in listening state for its whole
/// life; accepted descriptors are handed raw to the accept callback.
pub struct TcpListener {
    sockfd: RawFd,
    accept_fn: RefCell<TcpAcceptFn>,
}

impl std::fmt::Debug for TcpListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpListener")
            .field("sockfd", &self.sockfd)
            .finish()
    }
}

impl TcpListener {
    /// Wrap a descriptor already bound and listening.
    pub fn new(sockfd: RawFd, accept_fn: TcpAcceptFn) -> Rc<Self> {
        Rc::new(Self {
            sockfd,
            accept_fn: RefCell::new(accept_fn),
        })
    }

    /// The bound address; the way to learn the port after binding to 0.
    pub fn local_addr(&self) -> Result<SockAddr> {
        local_addr_of(self.sockfd)
    }
}

impl Socket for TcpListener {
    fn sockfd(&self) -> RawFd {
        self.sockfd
    }

    fn on_read_event(&self) -> Result<()> {
        // One edge can cover a whole burst of handshakes; accept until
        // the backlog is dry.
        loop {
            let connfd = unsafe {
                libc::accept4(
                    self.sockfd,
                    std::ptr::null_mut(),
                    std::ptr::null_mut(),
                    libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                )
            };
            if connfd < 0 {
                let errno = last_errno();
                if errno == libc::EAGAIN || errno == libc::EWOULDBLOCK {
                    return Ok(());
                }
                return Err(Error::Syscall {
                    op: "accept4",
                    errno,
                });
            }
            (self.accept_fn.borrow_mut())(connfd);
        }
    }
}

impl Drop for TcpListener {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.sockfd);
        }
    }
}

// ── TcpSocket ────────────────────────────────────────────────────────

/// One TCP connection. Created from a descriptor produced by a
/// listener's accept or by an outbound connect performed elsewhere.
pub struct TcpSocket {
    sockfd: RawFd,
    recv_fn: RefCell<TcpRecvFn>,
    this: Weak<TcpSocket>,
}

impl TcpSocket {
    /// Wrap a connected non-blocking descriptor.
    pub fn from_raw_parts(sockfd: RawFd, recv_fn: TcpRecvFn) -> Rc<Self> {
        Rc::new_cyclic(|this| Self {
            sockfd,
            recv_fn: RefCell::new(recv_fn),
            this: this.clone(),
        })
    }

    /// Best-effort non-blocking send. A vanished peer (`ECONNRESET`,
    /// `EPIPE`) is not an error to the caller; a short write is.
    pub fn send(&self, msg: &[u8]) -> Result<()> {
        let nr = unsafe {
            libc::send(
                self.sockfd,
                msg.as_ptr() as *const libc::c_void,
                msg.len(),
                libc::MSG_NOSIGNAL | libc::MSG_DONTWAIT,
            )
        };
        if nr < 0 {
            let errno = last_errno();
            if errno == libc::ECONNRESET || errno == libc::EPIPE {
                return Ok(());
            }
            return Err(Error::Syscall { op: "send", errno });
        }
        if nr as usize != msg.len() {
            return Err(Error::PartialSend {
                sent: nr as usize,
                len: msg.len(),
            });
        }
        Ok(())
    }

    /// Toggle Nagle's algorithm.
    pub fn set_tcp_nodelay(&self, nodelay: bool) -> Result<()> {
        let value: libc::c_int = nodelay as libc::c_int;
        let rc = unsafe {
            libc::setsockopt(
                self.sockfd,
                libc::IPPROTO_TCP,
                libc::TCP_NODELAY,
                &value as *const libc::c_int as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(Error::Syscall {
                op: "setsockopt",
                errno: last_errno(),
            });
        }
        Ok(())
    }
}

impl Socket for TcpSocket {
    fn sockfd(&self) -> RawFd {
        self.sockfd
    }

    fn on_read_event(&self) -> Result<()> {
        let Some(me) = self.this.upgrade() else {
            return Ok(());
        };
        // Edge-triggered: read until the socket is dry. A close
        // indication ends the drain.
        let mut rx_buf = [0u8; RX_BUF_SIZE];
        loop {
            let nr = unsafe {
                libc::recv(
                    self.sockfd,
                    rx_buf.as_mut_ptr() as *mut libc::c_void,
                    rx_buf.len(),
                    libc::MSG_DONTWAIT,
                )
            };
            if nr < 0 {
                let errno = last_errno();
                if errno == libc::EAGAIN || errno == libc::EWOULDBLOCK {
                    return Ok(());
                }
                if errno == libc::ECONNRESET {
                    // Close indication: reset is delivered as an empty
                    // payload.
                    (self.recv_fn.borrow_mut())(&me, &[]);
                    return Ok(());
                }
                return Err(Error::Syscall { op: "recv", errno });
            }
            // nr == 0 is orderly shutdown, likewise an empty payload.
            (self.recv_fn.borrow_mut())(&me, &rx_buf[..nr as usize]);
            if nr == 0 {
                return Ok(());
            }
        }
    }
}

impl Drop for TcpSocket {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.sockfd);
        }
    }
}

// ── UdpSocket ────────────────────────────────────────────────────────

/// A bound datagram socket. Each receive carries the sender's address.
pub struct UdpSocket {
    sockfd: RawFd,
    recv_fn: RefCell<UdpRecvFn>,
    this: Weak<UdpSocket>,
}

impl UdpSocket {
    /// Wrap a bound non-blocking datagram descriptor.
    pub fn from_raw_parts(sockfd: RawFd, recv_fn: UdpRecvFn) -> Rc<Self> {
        Rc::new_cyclic(|this| Self {
            sockfd,
            recv_fn: RefCell::new(recv_fn),
            this: this.clone(),
        })
    }

    /// Send one datagram to `dst`. Error policy matches
    /// [`TcpSocket::send`].
    pub fn send(&self, msg: &[u8], dst: &SockAddr) -> Result<()> {
        let nr = unsafe {
            libc::sendto(
                self.sockfd,
                msg.as_ptr() as *const libc::c_void,
                msg.len(),
                libc::MSG_NOSIGNAL | libc::MSG_DONTWAIT,
                dst.as_ptr(),
                dst.addr_len(),
            )
        };
        if nr < 0 {
            let errno = last_errno();
            if errno == libc::ECONNRESET || errno == libc::EPIPE {
                return Ok(());
            }
            return Err(Error::Syscall { op: "sendto", errno });
        }
        if nr as usize != msg.len() {
            return Err(Error::PartialSend {
                sent: nr as usize,
                len: msg.len(),
            });
        }
        Ok(())
    }

    pub fn local_addr(&self) -> Result<SockAddr> {
        local_addr_of(self.sockfd)
    }
}

impl Socket for UdpSocket {
    fn sockfd(&self) -> RawFd {
        self.sockfd
    }

    fn on_read_event(&self) -> Result<()> {
        let Some(me) = self.this.upgrade() else {
            return Ok(());
        };
        // Edge-triggered: one edge can cover several queued datagrams;
        // read them all.
        let mut rx_buf = [0u8; RX_BUF_SIZE];
        loop {
            let mut src: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
            let mut src_len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
            let nr = unsafe {
                libc::recvfrom(
                    self.sockfd,
                    rx_buf.as_mut_ptr() as *mut libc::c_void,
                    rx_buf.len(),
                    libc::MSG_DONTWAIT,
                    &mut src as *mut libc::sockaddr_storage as *mut libc::sockaddr,
                    &mut src_len,
                )
            };
            if nr < 0 {
                let errno = last_errno();
                if errno == libc::EAGAIN || errno == libc::EWOULDBLOCK {
                    return Ok(());
                }
                if errno == libc::ECONNRESET {
                    (self.recv_fn.borrow_mut())(&me, &[], None);
                    return Ok(());
                }
                return Err(Error::Syscall {
                    op: "recvfrom",
                    errno,
                });
            }
            let src = SockAddr::new(src, src_len);
            (self.recv_fn.borrow_mut())(&me, &rx_buf[..nr as usize], Some(&src));
        }
    }
}

impl Drop for UdpSocket {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.sockfd);
        }
    }
}

// ── Factories ────────────────────────────────────────────────────────

/// Owned getaddrinfo result list.
struct AddrInfoList {
    head: *mut libc::addrinfo,
}

impl Drop for AddrInfoList {
    fn drop(&mut self) {
        unsafe {
            libc::freeaddrinfo(self.head);
        }
    }
}

/// Resolve `iface:port` as passive IPv4 endpoints of the given type.
fn lookup(iface: &str, port: u16, socktype: libc::c_int) -> Result<AddrInfoList> {
    let node =
        CString::new(iface).map_err(|_| Error::InvalidArgument("interface contains NUL"))?;
    let service = CString::new(port.to_string())
        .map_err(|_| Error::InvalidArgument("port rendering contains NUL"))?;

    let mut hints: libc::addrinfo = unsafe { std::mem::zeroed() };
    hints.ai_family = libc::AF_INET;
    hints.ai_socktype = socktype;
    hints.ai_flags = libc::AI_PASSIVE | libc::AI_ADDRCONFIG;

    let mut head: *mut libc::addrinfo = std::ptr::null_mut();
    let rc = unsafe { libc::getaddrinfo(node.as_ptr(), service.as_ptr(), &hints, &mut head) };
    if rc != 0 {
        return Err(Error::Lookup {
            iface: iface.to_string(),
            code: rc,
        });
    }
    Ok(AddrInfoList { head })
}

fn set_reuse(sockfd: RawFd) {
    let one: libc::c_int = 1;
    let len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    unsafe {
        libc::setsockopt(
            sockfd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const libc::c_int as *const libc::c_void,
            len,
        );
        libc::setsockopt(
            sockfd,
            libc::SOL_SOCKET,
            libc::SO_REUSEPORT,
            &one as *const libc::c_int as *const libc::c_void,
            len,
        );
    }
}

/// Walk the candidate list: socket, reuse options, bind, and for stream
/// sockets listen. First success wins.
fn bind_first(
    iface: &str,
    port: u16,
    socktype: libc::c_int,
    listen_backlog: Option<i32>,
) -> Result<RawFd> {
    let addresses = lookup(iface, port, socktype)?;
    let mut rp = addresses.head;
    while !rp.is_null() {
        let ai = unsafe { &*rp };
        let sockfd = unsafe {
            libc::socket(
                ai.ai_family,
                ai.ai_socktype | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                ai.ai_protocol,
            )
        };
        if sockfd >= 0 {
            set_reuse(sockfd);
            let mut ok = unsafe { libc::bind(sockfd, ai.ai_addr, ai.ai_addrlen) } == 0;
            if ok {
                if let Some(backlog) = listen_backlog {
                    ok = unsafe { libc::listen(sockfd, backlog) } == 0;
                }
            }
            if ok {
                return Ok(sockfd);
            }
            unsafe {
                libc::close(sockfd);
            }
        }
        rp = ai.ai_next;
    }
    Err(Error::BindFailed {
        iface: iface.to_string(),
    })
}

/// Bind a listening stream socket on `iface:port` and wrap it.
pub fn make_tcp_listener(
    iface: &str,
    port: u16,
    backlog: i32,
    accept_fn: TcpAcceptFn,
) -> Result<Rc<TcpListener>> {
    let sockfd = bind_first(iface, port, libc::SOCK_STREAM, Some(backlog))?;
    Ok(TcpListener::new(sockfd, accept_fn))
}

/// Bind a datagram socket on `iface:port` and wrap it.
pub fn make_udp_socket(iface: &str, port: u16, recv_fn: UdpRecvFn) -> Result<Rc<UdpSocket>> {
    let sockfd = bind_first(iface, port, libc::SOCK_DGRAM, None)?;
    Ok(UdpSocket::from_raw_parts(sockfd, recv_fn))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn fd_is_open(fd: RawFd) -> bool {
        unsafe { libc::fcntl(fd, libc::F_GETFD) >= 0 }
    }

    #[test]
    fn listener_binds_ephemeral_port() {
        let listener = make_tcp_listener("127.0.0.1", 0, 128, Box::new(|_| {})).unwrap();
        let addr = listener.local_addr().unwrap();
        let port = addr.port().unwrap();
        assert_ne!(port, 0);
        assert_eq!(*addr.to_ipv4().unwrap().ip(), Ipv4Addr::LOCALHOST);
    }

    #[test]
    fn udp_socket_binds_ephemeral_port() {
        let sock = make_udp_socket("127.0.0.1", 0, Box::new(|_, _, _| {})).unwrap();
        assert_ne!(sock.local_addr().unwrap().port().unwrap(), 0);
    }

    #[test]
    fn bind_to_foreign_address_fails() {
        // TEST-NET-3, not assigned to any local interface.
        let err = make_tcp_listener("203.0.113.1", 0, 16, Box::new(|_| {})).unwrap_err();
        assert!(matches!(err,
            Error::BindFailed { ref iface } if iface == "203.0.113.1"));
    }

    #[test]
    fn interface_with_nul_is_rejected() {
        let err = make_tcp_listener("127.0.0.1\0x", 0, 16, Box::new(|_| {})).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn last_reference_closes_descriptor_once() {
        let raw = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
        assert!(raw >= 0);
        // Park the descriptor high up so a concurrent test cannot recycle
        // the number between our close and the liveness probe.
        let fd = unsafe { libc::fcntl(raw, libc::F_DUPFD_CLOEXEC, 700) };
        assert!(fd >= 700);
        unsafe { libc::close(raw) };
        let sock = TcpSocket::from_raw_parts(fd, Box::new(|_, _| {}));
        let other = Rc::clone(&sock);
        assert!(fd_is_open(fd));
        drop(sock);
        assert!(fd_is_open(fd));
        drop(other);
        assert!(!fd_is_open(fd));
        assert_eq!(crate::last_errno(), libc::EBADF);
    }

    #[test]
    fn sockaddr_roundtrip() {
        let v4 = SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), 11211);
        let addr = SockAddr::from(v4);
        assert_eq!(addr.port(), Some(11211));
        assert_eq!(addr.to_ipv4(), Some(v4));
        assert_eq!(format!("{:?}", addr), "127.0.0.1:11211");
    }

    #[test]
    fn accept_drains_pending_backlog() {
        let accepted: Rc<RefCell<Vec<RawFd>>> = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&accepted);
        let listener = make_tcp_listener(
            "127.0.0.1",
            0,
            16,
            Box::new(move |fd| sink.borrow_mut().push(fd)),
        )
        .unwrap();
        let port = listener.local_addr().unwrap().port().unwrap();

        // Both handshakes complete against the backlog before any accept
        // runs, so they land inside a single readiness edge.
        let c1 = std::net::TcpStream::connect((Ipv4Addr::LOCALHOST, port)).unwrap();
        let c2 = std::net::TcpStream::connect((Ipv4Addr::LOCALHOST, port)).unwrap();

        listener.on_read_event().unwrap();
        assert_eq!(accepted.borrow().len(), 2);
        for fd in accepted.borrow().iter() {
            unsafe { libc::close(*fd) };
        }
        drop((c1, c2));
    }

    #[test]
    fn udp_read_drains_all_queued_datagrams() {
        let got: Rc<RefCell<Vec<Vec<u8>>>> = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&got);
        let sock = make_udp_socket(
            "127.0.0.1",
            0,
            Box::new(move |_, payload, src| {
                assert!(src.is_some());
                sink.borrow_mut().push(payload.to_vec());
            }),
        )
        .unwrap();
        let port = sock.local_addr().unwrap().port().unwrap();

        let client = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        client.send_to(b"one", ("127.0.0.1", port)).unwrap();
        client.send_to(b"two", ("127.0.0.1", port)).unwrap();

        // Give loopback delivery a moment to queue both datagrams, then
        // require a single readiness edge to surface them all.
        let mut pfd = libc::pollfd {
            fd: sock.sockfd(),
            events: libc::POLLIN,
            revents: 0,
        };
        assert!(unsafe { libc::poll(&mut pfd, 1, 2000) } > 0);
        std::thread::sleep(std::time::Duration::from_millis(20));

        sock.on_read_event().unwrap();
        assert_eq!(*got.borrow(), vec![b"one".to_vec(), b"two".to_vec()]);
    }
}
