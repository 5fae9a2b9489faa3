use crate::proactor::sys::{
    domain_of, sys_bind, sys_close, sys_listen, sys_peername, sys_set_reuseaddr, sys_socket,
    sys_socketpair, sys_sockname,
};

use std::cell::Cell;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};
use std::rc::{Rc, Weak};
use std::str::FromStr;

struct Inner {
    /// The owned descriptor, or `-1` once closed.
    fd: Cell<RawFd>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let fd = self.fd.replace(-1);
        if fd >= 0 {
            sys_close(fd);
        }
    }
}

/// A non-owning reference to a [`Socket`].
///
/// Tells apart the socket it was taken from and a later socket that was
/// handed the same descriptor number.
#[derive(Clone)]
pub(crate) struct WeakSocket {
    inner: Weak<Inner>,
}

impl WeakSocket {
    /// Returns `true` if `sock` is the socket this reference was taken from.
    pub(crate) fn refers_to(&self, sock: &Socket) -> bool {
        self.inner.as_ptr() == Rc::as_ptr(&sock.inner)
    }

    /// Returns `true` while the socket is alive and its descriptor open.
    pub(crate) fn is_open(&self) -> bool {
        self.inner
            .upgrade()
            .is_some_and(|inner| inner.fd.get() >= 0)
    }
}

/// A non-blocking stream socket.
///
/// `Socket` owns its descriptor and releases it exactly once: either on an
/// explicit [`close`](Self::close) or when the last clone is dropped. Clones
/// share the descriptor, which lets in-flight proactor operations refer to
/// the socket they were submitted on.
#[derive(Clone)]
pub struct Socket {
    inner: Rc<Inner>,
}

impl Socket {
    /// Takes ownership of a non-blocking descriptor.
    pub(crate) fn from_raw(fd: RawFd) -> Self {
        Self {
            inner: Rc::new(Inner { fd: Cell::new(fd) }),
        }
    }

    /// Creates a connected pair of Unix stream sockets.
    pub fn pair() -> io::Result<(Self, Self)> {
        let (a, b) = sys_socketpair()?;

        Ok((Self::from_raw(a), Self::from_raw(b)))
    }

    /// Creates an unconnected TCP socket whose family matches `address`.
    ///
    /// Pass the result to [`Handle::sock_connect`](crate::Handle::sock_connect).
    pub fn stream(address: &SocketAddr) -> io::Result<Self> {
        Ok(Self::from_raw(sys_socket(domain_of(address))?))
    }

    /// Binds a listening TCP socket to `address`.
    ///
    /// The address must be a valid socket address string, such as
    /// `"127.0.0.1:8080"` or `"[::1]:8080"`. Port `0` picks a free port;
    /// see [`local_addr`](Self::local_addr).
    ///
    /// This function:
    /// - creates a non-blocking socket,
    /// - enables `SO_REUSEADDR`,
    /// - binds and starts listening.
    pub fn bind_listener(address: &str) -> io::Result<Self> {
        let address = SocketAddr::from_str(address)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid socket addr"))?;

        let socket = Self::stream(&address)?;
        let fd = socket.as_raw_fd();

        sys_set_reuseaddr(fd)?;
        sys_bind(fd, &address)?;
        sys_listen(fd)?;

        Ok(socket)
    }

    /// Returns the local address of this socket.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        sys_sockname(self.as_raw_fd())
    }

    /// Returns the address of the connected peer.
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        sys_peername(self.as_raw_fd())
    }

    /// Closes the descriptor now rather than when the last clone drops.
    ///
    /// Idempotent. Operations on a closed socket fail with `EBADF`.
    pub fn close(&self) {
        let fd = self.inner.fd.replace(-1);
        if fd >= 0 {
            sys_close(fd);
        }
    }

    /// Returns `true` once [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.fd.get() < 0
    }

    pub(crate) fn downgrade(&self) -> WeakSocket {
        WeakSocket {
            inner: Rc::downgrade(&self.inner),
        }
    }
}

impl AsRawFd for Socket {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.fd.get()
    }
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socket").field("fd", &self.as_raw_fd()).finish()
    }
}
