//! Wake-signal discipline.
//!
//! The wake signal's only job is to knock a parked worker out of the
//! readiness wait with `EINTR`. The handler is deliberately empty; the
//! signal is blocked in each worker's mask except while the backend sits
//! in `epoll_pwait`, which atomically installs a mask with the signal
//! deleted for the duration of the wait.

use crate::last_errno;
use std::sync::atomic::{AtomicBool, Ordering};
use weft_core::{Error, Result};

/// Signal used to interrupt a parked worker.
pub const WAKE_SIGNAL: libc::c_int = libc::SIGUSR1;

static HANDLER_INSTALLED: AtomicBool = AtomicBool::new(false);

extern "C" fn wake_handler(
    _sig: libc::c_int,
    _info: *mut libc::siginfo_t,
    _ctx: *mut libc::c_void,
) {
}

/// Install the empty wake-signal handler. Process-wide, idempotent.
pub fn install_wake_handler() -> Result<()> {
    if HANDLER_INSTALLED.swap(true, Ordering::SeqCst) {
        return Ok(());
    }
    let handler: extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void) =
        wake_handler;
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = handler as usize;
        libc::sigemptyset(&mut sa.sa_mask);
        sa.sa_flags = libc::SA_SIGINFO | libc::SA_RESTART;
        if libc::sigaction(WAKE_SIGNAL, &sa, std::ptr::null_mut()) < 0 {
            return Err(Error::Syscall {
                op: "sigaction",
                errno: last_errno(),
            });
        }
    }
    Ok(())
}

/// Block the wake signal in the calling thread's mask. It stays pending
/// while blocked and is delivered the moment the wait unblocks it.
pub fn block_wake_signal() -> Result<()> {
    unsafe {
        let mut mask: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut mask);
        libc::sigaddset(&mut mask, WAKE_SIGNAL);
        let rc = libc::pthread_sigmask(libc::SIG_BLOCK, &mask, std::ptr::null_mut());
        if rc != 0 {
            return Err(Error::Syscall {
                op: "pthread_sigmask",
                errno: rc,
            });
        }
    }
    Ok(())
}

/// The calling thread's mask with the wake signal deleted — the set the
/// backend installs for the duration of its blocking wait.
pub fn wait_sigmask() -> Result<libc::sigset_t> {
    unsafe {
        let mut mask: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut mask);
        let rc = libc::pthread_sigmask(libc::SIG_BLOCK, std::ptr::null(), &mut mask);
        if rc != 0 {
            return Err(Error::Syscall {
                op: "pthread_sigmask",
                errno: rc,
            });
        }
        libc::sigdelset(&mut mask, WAKE_SIGNAL);
        Ok(mask)
    }
}

/// Deliver the wake signal to a worker's OS thread.
pub fn notify(thread: libc::pthread_t) -> Result<()> {
    let rc = unsafe { libc::pthread_kill(thread, WAKE_SIGNAL) };
    if rc != 0 {
        return Err(Error::Syscall {
            op: "pthread_kill",
            errno: rc,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_is_idempotent() {
        install_wake_handler().unwrap();
        install_wake_handler().unwrap();
    }

    #[test]
    fn wait_mask_excludes_wake_signal() {
        install_wake_handler().unwrap();
        block_wake_signal().unwrap();
        let mask = wait_sigmask().unwrap();
        let member = unsafe { libc::sigismember(&mask, WAKE_SIGNAL) };
        assert_eq!(member, 0);
    }
}
