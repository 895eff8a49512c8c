//! Weft error types.

use std::fmt;

#[derive(Debug)]
pub enum Error {
    /// A syscall failed and no softer handling applies.
    Syscall { op: &'static str, errno: i32 },
    /// Non-blocking send wrote fewer bytes than requested. The core does
    /// not buffer; the caller decides how to continue.
    PartialSend { sent: usize, len: usize },
    /// No candidate endpoint for the interface could be bound.
    BindFailed { iface: String },
    /// Address lookup rejected the interface/port pair (getaddrinfo code).
    Lookup { iface: String, code: i32 },
    /// Backend name not recognized by the reactor factory.
    UnknownBackend { name: String },
    /// Caller misuse: send to self, id out of range, bad worker counts.
    InvalidArgument(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Syscall { op, errno } => write!(f, "{}: errno {}", op, errno),
            Self::PartialSend { sent, len } => {
                write!(f, "partial send: {} of {} bytes", sent, len)
            }
            Self::BindFailed { iface } => {
                write!(f, "failed to bind interface '{}'", iface)
            }
            Self::Lookup { iface, code } => {
                write!(f, "address lookup for '{}' failed: code {}", iface, code)
            }
            Self::UnknownBackend { name } => write!(f, "unrecognized '{}' backend", name),
            Self::InvalidArgument(what) => write!(f, "invalid argument: {}", what),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_carries_op_and_errno() {
        let e = Error::Syscall { op: "recv", errno: 104 };
        assert_eq!(e.to_string(), "recv: errno 104");
    }

    #[test]
    fn display_partial_send() {
        let e = Error::PartialSend { sent: 3, len: 10 };
        assert_eq!(e.to_string(), "partial send: 3 of 10 bytes");
    }
}
