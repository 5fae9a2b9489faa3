//! Completion-based I/O.
//!
//! A [`Proactor`] accepts socket operations, performs them in the
//! background and resolves one [`Future`] per operation with its outcome.
//! The event loop only ever waits on [`Proactor::poll`].
//!
//! The concrete implementation is selected at compile time depending on
//! the target operating system.

use crate::future::Future;
use crate::net::Socket;
use crate::runtime::Handle;

use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::time::Duration;

#[cfg(target_os = "linux")]
mod epoll;

pub(crate) mod sys;

#[cfg(target_os = "linux")]
pub use epoll::EpollProactor;

/// The I/O completion engine driven by the event loop.
///
/// Submission methods never block: they return a pending future, or one
/// already resolved when the operation failed up front. Futures are
/// resolved from inside [`poll`](Self::poll), so their callbacks always
/// run on a later loop step.
///
/// Operations whose future is cancelled before they complete are
/// abandoned without side effects on the returned data.
pub trait Proactor {
    /// A short name used in diagnostics.
    fn name(&self) -> &'static str;

    /// Receives up to `nbytes`; an empty buffer means end of stream.
    fn recv(&mut self, handle: &Handle, sock: &Socket, nbytes: usize) -> Future<Vec<u8>>;

    /// Sends all of `data`.
    fn send(&mut self, handle: &Handle, sock: &Socket, data: Vec<u8>) -> Future<()>;

    /// Connects `sock` to `address`.
    fn connect(&mut self, handle: &Handle, sock: &Socket, address: SocketAddr) -> Future<()>;

    /// Accepts one connection on a listening socket.
    fn accept(&mut self, handle: &Handle, listener: &Socket) -> Future<(Socket, SocketAddr)>;

    /// Waits up to `timeout` for completions and resolves their futures.
    ///
    /// `None` waits indefinitely; `Some(Duration::ZERO)` only collects
    /// what is already complete. Interruption by a signal is not an error.
    fn poll(&mut self, timeout: Option<Duration>) -> io::Result<()>;

    /// Forgets every operation pending on `fd`, cancelling their futures.
    fn unregister(&mut self, fd: RawFd);

    /// Cancels every pending operation and releases OS resources.
    fn close(&mut self);
}

/// Creates the proactor for the current platform.
#[cfg(target_os = "linux")]
pub(crate) fn platform(max_events: usize) -> io::Result<Box<dyn Proactor>> {
    Ok(Box::new(EpollProactor::new(max_events)?))
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn platform(_max_events: usize) -> io::Result<Box<dyn Proactor>> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "no proactor available on this platform",
    ))
}
