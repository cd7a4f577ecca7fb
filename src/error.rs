//! Per-connection error type.
//!
//! Every way a connection can end is an explicit variant, so the handler
//! and the client reader decide what to do instead of catching everything.

use std::fmt;
use std::io;

/// Why a line could not be read from, or written to, a connection.
#[derive(Debug)]
pub enum ConnError {
    /// The peer closed the stream. A trailing partial line is discarded.
    Closed,
    /// Transport failure.
    Io(io::Error),
    /// More than `limit` bytes arrived without a newline.
    LineTooLong { limit: usize },
    /// A complete line was not valid UTF-8.
    InvalidUtf8,
    /// No complete line arrived within the idle timeout.
    IdleTimeout,
}

impl ConnError {
    /// Orderly end of the connection rather than a fault.
    pub fn is_closed(&self) -> bool {
        matches!(self, ConnError::Closed)
    }
}

impl fmt::Display for ConnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnError::Closed => write!(f, "connection closed by peer"),
            ConnError::Io(e) => write!(f, "I/O error: {e}"),
            ConnError::LineTooLong { limit } => {
                write!(f, "line exceeds maximum length of {limit} bytes")
            }
            ConnError::InvalidUtf8 => write!(f, "line is not valid UTF-8"),
            ConnError::IdleTimeout => write!(f, "idle timeout"),
        }
    }
}

impl std::error::Error for ConnError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConnError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for ConnError {
    fn from(e: io::Error) -> Self {
        ConnError::Io(e)
    }
}
