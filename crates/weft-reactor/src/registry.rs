//! Process-wide worker registry: thread identities, sleep flags, and the
//! N×N mailbox fabric.
//!
//! Every slot has exactly one writer. A worker publishes its own pthread
//! identity and flips its own sleep flag; peers only read the identity
//! and compare-exchange the flag on the wake path. No locks are needed.
//!
//! The fabric is indexed `[recipient][sender]`: thread `sender` is the
//! sole producer of that cell and thread `recipient` its sole consumer.
//! Slots are initialised once per worker at reactor construction and
//! torn down at process exit.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::OnceLock;
use weft_core::constants::{MAX_THREADS, MSG_QUEUE_SIZE};
use weft_core::spsc::SpscRing;

/// One mailbox cell: a bounded ring of opaque message pointers.
pub type MsgRing = SpscRing<MSG_QUEUE_SIZE>;

#[allow(clippy::declare_interior_mutable_const)]
const NO_THREAD: AtomicU64 = AtomicU64::new(0);
#[allow(clippy::declare_interior_mutable_const)]
const AWAKE: AtomicBool = AtomicBool::new(false);

/// OS thread identity of worker i, written by worker i during reactor
/// construction. Zero means not yet published.
static PTHREAD_IDS: [AtomicU64; MAX_THREADS] = [NO_THREAD; MAX_THREADS];

/// True iff worker i is parked, or about to park, in the readiness wait.
static SLEEPING: [AtomicBool; MAX_THREADS] = [AWAKE; MAX_THREADS];

#[repr(C)]
struct Fabric {
    cells: [[MsgRing; MAX_THREADS]; MAX_THREADS],
}

impl Fabric {
    fn new_boxed() -> Box<Self> {
        // Safety: a ring is atomics plus null pointer slots throughout;
        // the all-zero bit pattern is a valid empty ring.
        unsafe {
            let layout = std::alloc::Layout::new::<Self>();
            let ptr = std::alloc::alloc_zeroed(layout) as *mut Self;
            if ptr.is_null() {
                std::alloc::handle_alloc_error(layout);
            }
            Box::from_raw(ptr)
        }
    }
}

static FABRIC: OnceLock<Box<Fabric>> = OnceLock::new();

fn fabric() -> &'static Fabric {
    FABRIC.get_or_init(Fabric::new_boxed)
}

/// Mailbox cell produced by `sender` and drained by `recipient`.
pub fn cell(recipient: usize, sender: usize) -> &'static MsgRing {
    &fabric().cells[recipient][sender]
}

/// Publish the calling thread as worker `thread_id` and mark it awake.
pub fn publish_current(thread_id: usize) {
    let me = unsafe { libc::pthread_self() };
    PTHREAD_IDS[thread_id].store(me as u64, Ordering::Release);
    SLEEPING[thread_id].store(false, Ordering::SeqCst);
}

/// The published identity of worker `thread_id`; zero if never started.
pub fn pthread_of(thread_id: usize) -> libc::pthread_t {
    PTHREAD_IDS[thread_id].load(Ordering::Acquire) as libc::pthread_t
}

/// Owner-side flag store: set before entering the blocking wait, cleared
/// after it returns.
pub fn set_sleeping(thread_id: usize, sleeping: bool) {
    SLEEPING[thread_id].store(sleeping, Ordering::SeqCst);
}

pub fn is_sleeping(thread_id: usize) -> bool {
    SLEEPING[thread_id].load(Ordering::SeqCst)
}

/// Sender-side retraction. Returns true for exactly one caller per sleep
/// cycle: the one that must deliver the wake signal.
pub fn clear_sleeping(thread_id: usize) -> bool {
    SLEEPING[thread_id]
        .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_records_calling_thread() {
        // Slot 63 is reserved for this test; reactor tests allocate ids
        // upward from zero.
        publish_current(MAX_THREADS - 1);
        let me = unsafe { libc::pthread_self() };
        assert_eq!(pthread_of(MAX_THREADS - 1), me);
        assert!(!is_sleeping(MAX_THREADS - 1));
    }

    #[test]
    fn clear_sleeping_wins_once() {
        let id = MAX_THREADS - 2;
        set_sleeping(id, true);
        assert!(clear_sleeping(id));
        assert!(!clear_sleeping(id));
        assert!(!is_sleeping(id));
    }

    #[test]
    fn cells_are_distinct_per_direction() {
        let a = MAX_THREADS - 3;
        let b = MAX_THREADS - 4;
        let p = Box::into_raw(Box::new(1u64)) as *mut ();
        assert!(cell(a, b).try_push(p));
        assert!(cell(b, a).peek().is_none());
        assert_eq!(cell(a, b).peek(), Some(p));
        cell(a, b).pop();
        unsafe { drop(Box::from_raw(p as *mut u64)) };
    }
}
