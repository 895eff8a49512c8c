//! `SpscRing` — bounded single-producer/single-consumer pointer ring.
//!
//! One cell of the cross-worker mailbox fabric. Exactly one thread ever
//! pushes into a given ring and exactly one thread ever pops it; under
//! that contract every operation is wait-free.
//!
//! # Index scheme
//!
//! `head` and `tail` are u64 monotonically increasing. Actual slot =
//! val & (N - 1). Ring is empty when head == tail.
//! Ring is full when (tail - head) >= N.
//!
//! # Atomics
//!
//! The producer publishes `tail` with a sequentially-consistent store
//! after writing the slot; the consumer's emptiness check loads `tail`
//! sequentially consistent. Those two operations take part in the same
//! total order as the per-worker sleep flag, which is what rules out the
//! enqueue-vs-park lost wakeup. `head` uses release/acquire only: the
//! consumer releases a slot after reading it, the producer acquires
//! before reusing it.

use crossbeam_utils::CachePadded;
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};

pub struct SpscRing<const N: usize> {
    /// Consumer position. Consumer writes, producer reads.
    head: CachePadded<AtomicU64>,
    /// Producer position. Producer writes, consumer reads.
    tail: CachePadded<AtomicU64>,
    slots: [AtomicPtr<()>; N],
}

impl<const N: usize> SpscRing<N> {
    const NULL_SLOT: AtomicPtr<()> = AtomicPtr::new(std::ptr::null_mut());

    pub const fn new() -> Self {
        assert!(N.is_power_of_two(), "ring capacity must be a power of two");
        Self {
            head: CachePadded::new(AtomicU64::new(0)),
            tail: CachePadded::new(AtomicU64::new(0)),
            slots: [Self::NULL_SLOT; N],
        }
    }

    /// Producer side: enqueue one pointer.
    ///
    /// Returns `false` when the ring is full; the caller keeps ownership
    /// of `msg` and decides whether to retry or drop.
    pub fn try_push(&self, msg: *mut ()) -> bool {
        let tail = self.tail.load(Ordering::Relaxed); // sole producer
        let head = self.head.load(Ordering::Acquire);
        if tail.wrapping_sub(head) >= N as u64 {
            return false;
        }
        self.slots[(tail as usize) & (N - 1)].store(msg, Ordering::Relaxed);
        // Publish. SeqCst so this store orders against the producer's
        // subsequent sleep-flag load.
        self.tail.store(tail.wrapping_add(1), Ordering::SeqCst);
        true
    }

    /// Consumer side: read the front entry without consuming it.
    pub fn peek(&self) -> Option<*mut ()> {
        let head = self.head.load(Ordering::Relaxed); // sole consumer
        let tail = self.tail.load(Ordering::SeqCst);
        if head == tail {
            return None;
        }
        Some(self.slots[(head as usize) & (N - 1)].load(Ordering::Relaxed))
    }

    /// Consumer side: drop the front entry after a successful `peek`.
    pub fn pop(&self) {
        let head = self.head.load(Ordering::Relaxed);
        debug_assert_ne!(head, self.tail.load(Ordering::SeqCst), "pop on empty ring");
        // Release so the producer's fullness check sees the slot freed
        // only after we are done reading it.
        self.head.store(head.wrapping_add(1), Ordering::Release);
    }

    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Relaxed) == self.tail.load(Ordering::SeqCst)
    }

    /// Number of entries currently queued.
    pub fn len(&self) -> usize {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::SeqCst);
        tail.wrapping_sub(head) as usize
    }

    pub const fn capacity(&self) -> usize {
        N
    }
}
