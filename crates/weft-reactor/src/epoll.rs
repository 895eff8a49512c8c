//! Readiness backend abstraction and the epoll implementation.
//!
//! A `ReadinessBackend` owns the OS event-notification state for one
//! worker: enrol a descriptor for edge-triggered read readiness, drop
//! it, and fetch the set of ready descriptors either without blocking
//! or by parking until the kernel reports readiness or the wake signal
//! interrupts.
//!
//! # Implementors
//!
//! - [`EpollBackend`] (default, name `"epoll"`): `epoll_create1` +
//!   `EPOLLIN | EPOLLET`, blocking via `epoll_pwait` with the wake
//!   signal unblocked only for the duration of the wait.
//!
//! Additional backends slot in behind `make_reactor`'s name lookup.

use crate::signal;
use crate::last_errno;
use std::cell::RefCell;
use std::os::unix::io::RawFd;
use weft_core::{Error, Result};

/// OS readiness notification for one worker.
///
/// **Contract:** `add`, `remove`, and `poll` never block. `wait` blocks
/// with no timeout and treats interruption by the wake signal as an
/// empty ready set, not an error.
pub trait ReadinessBackend {
    /// Register a descriptor for edge-triggered read readiness.
    /// Idempotent per descriptor.
    fn add(&self, fd: RawFd) -> Result<()>;

    /// Remove a descriptor. Events already harvested for it are the
    /// caller's problem; events still queued in the kernel are dropped.
    fn remove(&self, fd: RawFd) -> Result<()>;

    /// Drain currently-ready descriptors without blocking.
    fn poll(&self, ready: &mut Vec<RawFd>) -> Result<()>;

    /// Block until at least one descriptor is ready or the wake signal
    /// interrupts; `ready` is left empty on interrupt.
    fn wait(&self, ready: &mut Vec<RawFd>) -> Result<()>;
}

const MAX_EVENTS: usize = 128;

/// The default backend.
pub struct EpollBackend {
    epollfd: RawFd,
    /// Thread mask with the wake signal deleted; installed by the kernel
    /// for exactly the duration of `epoll_pwait`.
    wait_mask: libc::sigset_t,
    events: RefCell<Vec<libc::epoll_event>>,
}

impl EpollBackend {
    pub fn new() -> Result<Self> {
        let wait_mask = signal::wait_sigmask()?;
        let epollfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epollfd < 0 {
            return Err(Error::Syscall {
                op: "epoll_create1",
                errno: last_errno(),
            });
        }
        Ok(Self {
            epollfd,
            wait_mask,
            events: RefCell::new(vec![
                libc::epoll_event { events: 0, u64: 0 };
                MAX_EVENTS
            ]),
        })
    }

    fn harvest(&self, nr: i32, ready: &mut Vec<RawFd>) {
        let events = self.events.borrow();
        for ev in events.iter().take(nr as usize) {
            ready.push(ev.u64 as RawFd);
        }
    }
}

impl ReadinessBackend for EpollBackend {
    fn add(&self, fd: RawFd) -> Result<()> {
        let mut ev = libc::epoll_event {
            events: (libc::EPOLLIN | libc::EPOLLET) as u32,
            u64: fd as u64,
        };
        let rc = unsafe { libc::epoll_ctl(self.epollfd, libc::EPOLL_CTL_ADD, fd, &mut ev) };
        if rc < 0 {
            let errno = last_errno();
            if errno == libc::EEXIST {
                return Ok(());
            }
            return Err(Error::Syscall {
                op: "epoll_ctl",
                errno,
            });
        }
        Ok(())
    }

    fn remove(&self, fd: RawFd) -> Result<()> {
        let mut ev = libc::epoll_event { events: 0, u64: 0 };
        let rc = unsafe { libc::epoll_ctl(self.epollfd, libc::EPOLL_CTL_DEL, fd, &mut ev) };
        if rc < 0 {
            let errno = last_errno();
            if errno == libc::ENOENT {
                return Ok(());
            }
            return Err(Error::Syscall {
                op: "epoll_ctl",
                errno,
            });
        }
        Ok(())
    }

    fn poll(&self, ready: &mut Vec<RawFd>) -> Result<()> {
        let nr = {
            let mut events = self.events.borrow_mut();
            unsafe {
                libc::epoll_wait(self.epollfd, events.as_mut_ptr(), MAX_EVENTS as i32, 0)
            }
        };
        if nr < 0 {
            let errno = last_errno();
            if errno == libc::EINTR {
                return Ok(());
            }
            return Err(Error::Syscall {
                op: "epoll_wait",
                errno,
            });
        }
        self.harvest(nr, ready);
        Ok(())
    }

    fn wait(&self, ready: &mut Vec<RawFd>) -> Result<()> {
        let nr = {
            let mut events = self.events.borrow_mut();
            unsafe {
                libc::epoll_pwait(
                    self.epollfd,
                    events.as_mut_ptr(),
                    MAX_EVENTS as i32,
                    -1,
                    &self.wait_mask,
                )
            }
        };
        if nr < 0 {
            let errno = last_errno();
            if errno == libc::EINTR {
                // The wake path, not an error.
                return Ok(());
            }
            return Err(Error::Syscall {
                op: "epoll_pwait",
                errno,
            });
        }
        self.harvest(nr, ready);
        Ok(())
    }
}

impl Drop for EpollBackend {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epollfd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_is_idempotent() {
        let backend = EpollBackend::new().unwrap();
        let mut fds = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        backend.add(fds[0]).unwrap();
        backend.add(fds[0]).unwrap();
        backend.remove(fds[0]).unwrap();
        backend.remove(fds[0]).unwrap();
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }

    #[test]
    fn poll_reports_readable_pipe() {
        let backend = EpollBackend::new().unwrap();
        let mut fds = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        backend.add(fds[0]).unwrap();

        let mut ready = Vec::new();
        backend.poll(&mut ready).unwrap();
        assert!(ready.is_empty());

        let one = [1u8];
        assert_eq!(
            unsafe { libc::write(fds[1], one.as_ptr() as *const libc::c_void, 1) },
            1
        );
        backend.poll(&mut ready).unwrap();
        assert_eq!(ready, vec![fds[0]]);

        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }
}
