//! The per-worker reactor.
//!
//! One reactor per worker thread. It owns the registration table of
//! active handles, drives readiness dispatch through its backend, and
//! exposes the cross-worker messaging operations over the registry's
//! fabric.
//!
//! # Sleep/wake handshake
//!
//! The producer's algorithm is: enqueue, load the recipient's sleep
//! flag, and if set win the compare-exchange and signal. The consumer's
//! algorithm is: drain, store the flag, re-check the mailboxes, and
//! only then park. Both the flag and the ring publish are sequentially
//! consistent, so either the producer sees the flag and signals or the
//! consumer sees the new element and re-loops without sleeping.

use crate::epoll::{EpollBackend, ReadinessBackend};
use crate::net::Socket;
use crate::{registry, signal};
use std::cell::RefCell;
use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use weft_core::constants::MAX_THREADS;
use weft_core::{wdebug, wwarn, Error, Result};

/// Callback invoked on the owning worker for each delivered mailbox
/// entry. The payload is opaque to the core; the callee recovers the
/// type (typically through a tagged envelope).
pub type OnMessageFn = Box<dyn FnMut(*mut ())>;

pub struct Reactor {
    thread_id: usize,
    nr_threads: usize,
    on_message: RefCell<OnMessageFn>,
    handles: RefCell<HashMap<RawFd, Rc<dyn Socket>>>,
    backend: Box<dyn ReadinessBackend>,
}

impl std::fmt::Debug for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reactor")
            .field("thread_id", &self.thread_id)
            .field("nr_threads", &self.nr_threads)
            .finish()
    }
}

impl Reactor {
    /// Build a reactor owned by the calling thread: install the wake
    /// handler, block the wake signal in this thread's mask, publish the
    /// thread identity, and clear the sleep flag.
    pub fn new(
        backend: Box<dyn ReadinessBackend>,
        thread_id: usize,
        nr_threads: usize,
        on_message: OnMessageFn,
    ) -> Result<Rc<Self>> {
        if nr_threads > MAX_THREADS {
            return Err(Error::InvalidArgument("nr_threads exceeds MAX_THREADS"));
        }
        if thread_id >= nr_threads {
            return Err(Error::InvalidArgument("thread_id out of range"));
        }
        signal::install_wake_handler()?;
        signal::block_wake_signal()?;
        registry::publish_current(thread_id);
        Ok(Rc::new(Self {
            thread_id,
            nr_threads,
            on_message: RefCell::new(on_message),
            handles: RefCell::new(HashMap::new()),
            backend,
        }))
    }

    pub fn thread_id(&self) -> usize {
        self.thread_id
    }

    pub fn nr_threads(&self) -> usize {
        self.nr_threads
    }

    pub fn default_backend() -> &'static str {
        "epoll"
    }

    /// Enrol a handle for edge-triggered read readiness. Idempotent per
    /// descriptor.
    pub fn register(&self, handle: Rc<dyn Socket>) -> Result<()> {
        let fd = handle.sockfd();
        self.backend.add(fd)?;
        self.handles.borrow_mut().insert(fd, handle);
        Ok(())
    }

    /// Remove a handle from the readiness set. Events still queued for
    /// the descriptor are discarded at dispatch.
    pub fn deregister(&self, handle: &dyn Socket) -> Result<()> {
        let fd = handle.sockfd();
        self.handles.borrow_mut().remove(&fd);
        self.backend.remove(fd)
    }

    /// Enqueue an opaque message for worker `remote`.
    ///
    /// `Ok(false)` means the cell is full; the caller keeps ownership of
    /// `msg` and decides. On success, a sleeping recipient is signalled
    /// awake by whichever sender wins the flag retraction.
    pub fn send_msg(&self, remote: usize, msg: *mut ()) -> Result<bool> {
        if remote == self.thread_id {
            return Err(Error::InvalidArgument("send_msg to self"));
        }
        if remote >= self.nr_threads {
            return Err(Error::InvalidArgument("send_msg recipient out of range"));
        }
        if !registry::cell(remote, self.thread_id).try_push(msg) {
            return Ok(false);
        }
        if registry::is_sleeping(remote) && registry::clear_sleeping(remote) {
            self.wake_up(remote)?;
        }
        Ok(true)
    }

    /// Signal worker `remote` out of its readiness wait.
    pub fn wake_up(&self, remote: usize) -> Result<()> {
        wake_up(remote)
    }

    /// Non-destructive: is anything queued for this worker? Any number
    /// of calls consumes and reorders nothing.
    pub fn has_messages(&self) -> bool {
        for other in 0..self.nr_threads {
            if other == self.thread_id {
                continue;
            }
            if registry::cell(self.thread_id, other).peek().is_some() {
                return true;
            }
        }
        false
    }

    /// Drain every peer cell, round-robin by peer index, delivering each
    /// message to the on-message callback. Messages from one producer
    /// arrive in that producer's enqueue order; there is no order across
    /// producers. Returns whether anything was delivered.
    pub fn poll_messages(&self) -> bool {
        let mut delivered = false;
        let mut on_message = self.on_message.borrow_mut();
        for other in 0..self.nr_threads {
            if other == self.thread_id {
                continue;
            }
            let cell = registry::cell(self.thread_id, other);
            while let Some(msg) = cell.peek() {
                delivered = true;
                on_message(msg);
                cell.pop();
            }
        }
        delivered
    }

    /// Drive the event loop until `shutdown` is observed true.
    ///
    /// A parked worker only notices the flag after a wake, so the
    /// stopping thread sets it and then calls [`wake_up`].
    pub fn run(&self, shutdown: &AtomicBool) -> Result<()> {
        wdebug!("reactor[{}]: running", self.thread_id);
        let mut ready: Vec<RawFd> = Vec::new();
        while !shutdown.load(Ordering::Acquire) {
            ready.clear();
            if self.poll_messages() {
                // Messages were delivered: pick up readiness that is
                // already pending but do not block this iteration.
                self.backend.poll(&mut ready)?;
            } else {
                if self.has_messages() {
                    // A message landed after the drain; go around.
                    continue;
                }
                registry::set_sleeping(self.thread_id, true);
                if self.has_messages() {
                    // A message slipped in between the drain and the
                    // flag store; retract and rescan instead of parking.
                    registry::set_sleeping(self.thread_id, false);
                    continue;
                }
                self.backend.wait(&mut ready)?;
                registry::set_sleeping(self.thread_id, false);
            }
            self.dispatch(&ready);
        }
        wdebug!("reactor[{}]: stopped", self.thread_id);
        Ok(())
    }

    fn dispatch(&self, ready: &[RawFd]) {
        for &fd in ready {
            // Clone the handle out so the callback is free to register
            // and deregister; a missing entry is a descriptor that was
            // deregistered with events still queued.
            let handle = self.handles.borrow().get(&fd).cloned();
            let Some(handle) = handle else {
                continue;
            };
            if let Err(e) = handle.on_read_event() {
                wwarn!("reactor[{}]: fd {}: {}", self.thread_id, fd, e);
            }
        }
    }
}

/// Build a reactor on the calling thread with the named readiness
/// backend. Unknown names are rejected.
pub fn make_reactor(
    backend: &str,
    thread_id: usize,
    nr_threads: usize,
    on_message: OnMessageFn,
) -> Result<Rc<Reactor>> {
    let backend: Box<dyn ReadinessBackend> = match backend {
        "epoll" => Box::new(EpollBackend::new()?),
        name => {
            return Err(Error::UnknownBackend {
                name: name.to_string(),
            })
        }
    };
    Reactor::new(backend, thread_id, nr_threads, on_message)
}

/// Signal a worker out of its readiness wait from any thread; the
/// shutdown path for parked workers.
pub fn wake_up(thread_id: usize) -> Result<()> {
    let thread = registry::pthread_of(thread_id);
    if thread == 0 {
        return Err(Error::InvalidArgument("worker identity not published"));
    }
    signal::notify(thread)
}
