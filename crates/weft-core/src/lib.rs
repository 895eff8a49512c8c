//! # weft-core
//!
//! Core types for the weft shared-nothing reactor: the bounded SPSC
//! pointer ring that backs the cross-worker mailbox fabric, the error
//! types, tunable constants, and logging macros.
//!
//! This crate is platform-agnostic and contains no OS-specific code.
//! Everything that talks to the kernel lives in `weft-reactor`.
//!
//! ## Modules
//!
//! - `spsc` - bounded single-producer/single-consumer pointer ring
//! - `error` - error types
//! - `wprint` - leveled stderr logging macros

pub mod error;
pub mod spsc;
pub mod wprint;

pub use error::{Error, Result};
pub use spsc::SpscRing;

/// Compile-time sizing of the worker set and its mailboxes.
pub mod constants {
    /// Maximum workers (OS threads).
    pub const MAX_THREADS: usize = 64;

    /// Mailbox cell capacity in messages. Power of two.
    pub const MSG_QUEUE_SIZE: usize = 512;

    /// Receive buffer size per socket read event.
    pub const RX_BUF_SIZE: usize = 256 * 1024;

    /// Cache line size for alignment.
    pub const CACHE_LINE_SIZE: usize = 64;
}
