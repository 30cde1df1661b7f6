//! The connection layer: non-blocking sockets, per-connection send queues,
//! the worker pool and the application callback pool.

pub mod buffer;
pub mod connection;
pub mod handler;
pub mod job;
pub mod pool;

use std::fmt;
use std::io;

pub type NetworkResult<T> = Result<T, NetworkError>;

/// Errors raised by the connection layer. `Wait` is the would-block signal
/// and never fatal; everything else costs the connection.
#[derive(Debug, Eq, PartialEq)]
pub enum NetworkError {
    Wait,
    Fatal(ErrorKind),
}

#[derive(Debug, Eq, PartialEq)]
pub enum ErrorKind {
    /// Orderly close by the remote end.
    PeerClosed,
    /// The per-connection buffer cap was exceeded.
    Backpressure,
    /// The connection was already shut down.
    Shutdown,
    Io(io::ErrorKind),
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ErrorKind::PeerClosed => write!(f, "peer closed the connection"),
            ErrorKind::Backpressure => write!(f, "buffer too long"),
            ErrorKind::Shutdown => write!(f, "connection shut down"),
            ErrorKind::Io(kind) => write!(f, "socket error: {:?}", kind),
        }
    }
}

impl From<io::Error> for NetworkError {
    #[inline]
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::WouldBlock => NetworkError::Wait,
            kind => NetworkError::Fatal(ErrorKind::Io(kind)),
        }
    }
}

pub trait ErrorUtils {
    /// True when the result is neither success nor a plain would-block.
    fn has_failed(&self) -> bool;
}

impl<T> ErrorUtils for NetworkResult<T> {
    fn has_failed(&self) -> bool {
        !matches!(self, Ok(_) | Err(NetworkError::Wait))
    }
}
