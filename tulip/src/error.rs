//! Error taxonomy shared by every component of the runtime.
//!
//! Synchronization primitives report a timed-out or cancelled wait as a plain
//! `false`; the variants below are reserved for conditions the caller has to
//! distinguish from "did not get it in time".

use std::io;
use std::sync::Arc;
use thiserror::Error;

/// Errors produced by futures, primitives, transports and the event loop.
///
/// `Error` is cheap to clone: I/O payloads are shared through an [`Arc`], so a
/// resolved [`Future`](crate::Future) can hand the same error to every reader.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// The operation is not valid in the current state of the object.
    #[error("illegal state: {0}")]
    IllegalState(&'static str),

    /// An argument or resulting value is out of the permitted range.
    #[error("illegal value: {0}")]
    IllegalValue(&'static str),

    /// The future was cancelled, either explicitly or by its timeout.
    #[error("operation cancelled")]
    Cancelled,

    /// The peer reset the connection.
    #[error("connection reset: {0}")]
    ConnectionReset(#[source] Arc<io::Error>),

    /// The connection was aborted locally.
    #[error("connection aborted: {0}")]
    ConnectionAborted(#[source] Arc<io::Error>),

    /// Any other operating system failure.
    #[error("I/O error: {0}")]
    Io(#[source] Arc<io::Error>),
}

impl Error {
    /// Returns `true` for [`Error::Cancelled`].
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// Returns `true` for [`Error::ConnectionReset`].
    pub fn is_connection_reset(&self) -> bool {
        matches!(self, Error::ConnectionReset(_))
    }

    /// Returns `true` for [`Error::ConnectionAborted`].
    pub fn is_connection_aborted(&self) -> bool {
        matches!(self, Error::ConnectionAborted(_))
    }
}

impl From<io::Error> for Error {
    /// Classifies an OS error into the transport-relevant variants.
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe => {
                Error::ConnectionReset(Arc::new(err))
            }
            io::ErrorKind::ConnectionAborted => Error::ConnectionAborted(Arc::new(err)),
            _ => Error::Io(Arc::new(err)),
        }
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_are_classified_by_kind() {
        let reset: Error = io::Error::from(io::ErrorKind::ConnectionReset).into();
        let pipe: Error = io::Error::from(io::ErrorKind::BrokenPipe).into();
        let aborted: Error = io::Error::from(io::ErrorKind::ConnectionAborted).into();
        let other: Error = io::Error::from(io::ErrorKind::PermissionDenied).into();

        assert!(reset.is_connection_reset());
        assert!(pipe.is_connection_reset());
        assert!(aborted.is_connection_aborted());
        assert!(matches!(other, Error::Io(_)));
    }

    #[test]
    fn display_carries_the_reason() {
        let err = Error::IllegalState("lock is not acquired");
        assert_eq!(err.to_string(), "illegal state: lock is not acquired");
    }
}
