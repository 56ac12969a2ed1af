//! Buffered non-blocking stream connections.
//!
//! A [`Connection`] wraps a connected socket in non-blocking mode and
//! layers buffering on both directions: writes land in an output buffer
//! that is drained opportunistically, reads accumulate in an input buffer
//! that the framed read operations consume from. Framed reads never
//! block; they return `None` until a complete frame is available.
//!
//! A connection can be driven two ways:
//!
//! - **Polled**: [`Connection::register`] attaches it to an
//!   [`fdset::FdSet`]; the poller drains pending output and refills input
//!   in the background, invoking a user callback whenever new input
//!   arrives.
//! - **Direct**: [`Connection::wait`] blocks the calling thread until the
//!   socket makes progress in whichever direction matters.
//!
//! Read errors and EOF are sticky: once observed they stay observable via
//! [`Connection::read_error`] and [`Connection::eof`] and the connection
//! stops polling for input, but it remains safe to use and drop.

mod buffer;
mod connection;
pub mod metrics;
mod sys;

pub use buffer::Buffer;
pub use connection::{Config, ConnCallback, Connection, Flush, Progress, Wait};

use std::fmt;
use std::io;

/// Errors returned by connection operations.
#[derive(Debug)]
pub enum Error {
    /// Fatal socket error; the connection is effectively dead.
    Io(io::Error),
    /// The connection is already registered with a different fdset.
    AlreadyRegistered,
    /// A length-prefixed frame exceeds the representable length.
    FrameTooLarge,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {e}"),
            Error::AlreadyRegistered => write!(f, "already registered with another fdset"),
            Error::FrameTooLarge => write!(f, "frame length exceeds 2^31-1 bytes"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}
