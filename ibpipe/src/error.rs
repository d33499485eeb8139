//! Error types for ibpipe.

use std::{fmt, io};

/// Transport errors.
///
/// Errors are sticky per connection: the first one is retained and every
/// pending and subsequent operation callback receives a clone of it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A syscall failed; carries the operation name and errno.
    System { op: &'static str, errno: i32 },
    /// The bootstrap record could not be read in a single call.
    ShortRead { expected: usize, got: usize },
    /// The bootstrap record could not be written in a single call.
    ShortWrite { expected: usize, got: usize },
    /// Control-socket end of file or hangup.
    Eof,
    /// A verbs work request completed with a non-success status.
    Ibv(u32),
    /// The connection was closed locally.
    Closed,
    /// An object read could not be decoded.
    Serde(String),
}

impl Error {
    pub(crate) fn system(op: &'static str, err: &io::Error) -> Self {
        Error::System {
            op,
            errno: err.raw_os_error().unwrap_or(0),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::System { op, errno } => {
                write!(f, "{} failed: {}", op, io::Error::from_raw_os_error(*errno))
            }
            Error::ShortRead { expected, got } => {
                write!(f, "short read: expected {} bytes, got {}", expected, got)
            }
            Error::ShortWrite { expected, got } => {
                write!(f, "short write: expected {} bytes, got {}", expected, got)
            }
            Error::Eof => write!(f, "unexpected end of file on control socket"),
            Error::Ibv(status) => {
                write!(f, "work completion failed: {}", verbs::wc_status_str(*status))
            }
            Error::Closed => write!(f, "connection closed"),
            Error::Serde(msg) => write!(f, "object decode failed: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

/// Result type for ibpipe operations.
pub type Result<T> = std::result::Result<T, Error>;
