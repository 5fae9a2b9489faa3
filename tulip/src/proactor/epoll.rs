//! Linux `epoll`-based proactor.
//!
//! `epoll` reports readiness, not completion. This backend bridges the two:
//! every operation is attempted as soon as it is submitted, and only when
//! the kernel answers `EWOULDBLOCK` is it queued on its descriptor, which
//! is then armed with `EPOLLONESHOT`. When the descriptor becomes ready the
//! queued operations are retried in submission order, and the descriptor is
//! re-armed for whatever is still waiting.
//!
//! Each descriptor keeps two queues: reads (`recv`, `accept`) and writes
//! (`send`, `connect`). The queues belong to the socket that submitted them;
//! when a closed socket's descriptor number is handed to a new socket, the
//! old operations are cancelled instead of inheriting the new socket's I/O.

use super::Proactor;
use super::sys::{sys_accept, sys_close, sys_connect, sys_recv, sys_send, sys_socket_error};
use crate::error::Error;
use crate::future::Future;
use crate::net::{Socket, WeakSocket};
use crate::runtime::Handle;

use libc::{
    EPOLL_CLOEXEC, EPOLL_CTL_ADD, EPOLL_CTL_DEL, EPOLL_CTL_MOD, EPOLLERR, EPOLLHUP, EPOLLIN,
    EPOLLONESHOT, EPOLLOUT, EPOLLRDHUP, epoll_create1, epoll_ctl, epoll_event, epoll_wait,
};
use log::trace;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};
use std::time::Duration;

/// A submitted operation waiting for its descriptor to become ready.
enum Op {
    Recv {
        nbytes: usize,
        future: Future<Vec<u8>>,
    },
    Send {
        data: Vec<u8>,
        offset: usize,
        future: Future<()>,
    },
    Connect {
        future: Future<()>,
    },
    Accept {
        future: Future<(Socket, SocketAddr)>,
    },
}

/// What an attempt left behind.
enum Progress {
    /// Resolved (or abandoned because its future was already done).
    Done,
    /// The kernel would block; retry once the descriptor is ready.
    Blocked(Op),
}

impl Op {
    fn abandoned(&self) -> bool {
        match self {
            Op::Recv { future, .. } => future.done(),
            Op::Send { future, .. } | Op::Connect { future } => future.done(),
            Op::Accept { future } => future.done(),
        }
    }

    fn cancel(&self) {
        match self {
            Op::Recv { future, .. } => future.cancel(),
            Op::Send { future, .. } | Op::Connect { future } => future.cancel(),
            Op::Accept { future } => future.cancel(),
        };
    }

    fn fail(&self, err: io::Error) {
        let err = Error::from(err);

        let _ = match self {
            Op::Recv { future, .. } => future.set_error(err),
            Op::Send { future, .. } | Op::Connect { future } => future.set_error(err),
            Op::Accept { future } => future.set_error(err),
        };
    }

    /// Performs as much of the operation as the kernel allows right now.
    fn attempt(self, fd: RawFd) -> Progress {
        if self.abandoned() {
            return Progress::Done;
        }

        match self {
            Op::Recv { nbytes, future } => {
                let mut buffer = vec![0u8; nbytes];

                loop {
                    match sys_recv(fd, &mut buffer) {
                        Ok(n) => {
                            buffer.truncate(n);
                            let _ = future.set_result(buffer);
                            return Progress::Done;
                        }
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                            return Progress::Blocked(Op::Recv { nbytes, future });
                        }
                        Err(e) => {
                            let _ = future.set_error(e.into());
                            return Progress::Done;
                        }
                    }
                }
            }

            Op::Send {
                data,
                mut offset,
                future,
            } => {
                while offset < data.len() {
                    match sys_send(fd, &data[offset..]) {
                        Ok(n) => offset += n,
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                            return Progress::Blocked(Op::Send {
                                data,
                                offset,
                                future,
                            });
                        }
                        Err(e) => {
                            let _ = future.set_error(e.into());
                            return Progress::Done;
                        }
                    }
                }

                let _ = future.set_result(());
                Progress::Done
            }

            // Only reached once the socket became writable.
            Op::Connect { future } => {
                let _ = match sys_socket_error(fd) {
                    Ok(None) => future.set_result(()),
                    Ok(Some(e)) | Err(e) => future.set_error(e.into()),
                };

                Progress::Done
            }

            Op::Accept { future } => loop {
                match sys_accept(fd) {
                    Ok((client, address)) => {
                        let _ = future.set_result((Socket::from_raw(client), address));
                        return Progress::Done;
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        return Progress::Blocked(Op::Accept { future });
                    }
                    Err(e) => {
                        let _ = future.set_error(e.into());
                        return Progress::Done;
                    }
                }
            },
        }
    }
}

/// Operations pending on one descriptor.
struct Registration {
    /// The socket the operations were submitted on.
    owner: WeakSocket,
    readers: VecDeque<Op>,
    writers: VecDeque<Op>,
}

impl Registration {
    fn new(owner: &Socket) -> Self {
        Self {
            owner: owner.downgrade(),
            readers: VecDeque::new(),
            writers: VecDeque::new(),
        }
    }

    fn interest(&self) -> u32 {
        let mut flags = 0;

        if !self.readers.is_empty() {
            flags |= EPOLLIN | EPOLLRDHUP;
        }
        if !self.writers.is_empty() {
            flags |= EPOLLOUT;
        }

        flags as u32
    }

    fn drain(&mut self) -> impl Iterator<Item = Op> + '_ {
        self.readers.drain(..).chain(self.writers.drain(..))
    }
}

/// Which queue of a [`Registration`] an operation waits in.
#[derive(Clone, Copy)]
enum Direction {
    Read,
    Write,
}

/// Linux `epoll` proactor.
///
/// This proactor owns:
/// - an `epoll` instance,
/// - the pending operations of every descriptor it was handed,
/// - a reusable event buffer.
///
/// Descriptors stay registered with `epoll` between operations; with
/// `EPOLLONESHOT` they are silent unless an operation is waiting.
pub struct EpollProactor {
    /// Epoll file descriptor, or `-1` once closed.
    epoll: RawFd,

    /// Pending operations, keyed by descriptor.
    registrations: HashMap<RawFd, Registration>,

    /// Reusable buffer for epoll events.
    events: Vec<epoll_event>,
}

impl EpollProactor {
    /// Creates a proactor collecting at most `max_events` events per poll.
    pub fn new(max_events: usize) -> io::Result<Self> {
        let epoll = unsafe { epoll_create1(EPOLL_CLOEXEC) };
        if epoll < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(Self {
            epoll,
            registrations: HashMap::new(),
            events: Vec::with_capacity(max_events.max(1)),
        })
    }

    /// The registration of `sock`, replacing one left behind by a closed
    /// socket that had the same descriptor number.
    fn registration(&mut self, sock: &Socket) -> &mut Registration {
        let fd = sock.as_raw_fd();

        let stale = self
            .registrations
            .get(&fd)
            .is_some_and(|registration| !registration.owner.refers_to(sock));
        if stale {
            trace!("fd {fd} was reused, dropping the previous owner's operations");
            self.unregister(fd);
        }

        self.registrations
            .entry(fd)
            .or_insert_with(|| Registration::new(sock))
    }

    /// Attempts `op` right away, unless earlier operations in the same
    /// direction are still waiting; queues it otherwise.
    fn submit(&mut self, sock: &Socket, direction: Direction, op: Op) {
        let fd = sock.as_raw_fd();
        let registration = self.registration(sock);
        let queue = match direction {
            Direction::Read => &mut registration.readers,
            Direction::Write => &mut registration.writers,
        };

        if queue.is_empty() {
            match op.attempt(fd) {
                Progress::Done => return,
                Progress::Blocked(op) => queue.push_back(op),
            }
        } else {
            queue.push_back(op);
        }

        self.arm(fd);
    }

    /// Retries the queued operations of `fd` after a readiness event.
    fn dispatch(&mut self, fd: RawFd, readable: bool, writable: bool) {
        let Some(registration) = self.registrations.get_mut(&fd) else {
            return;
        };

        if readable {
            retry(fd, &mut registration.readers);
        }
        if writable {
            retry(fd, &mut registration.writers);
        }

        self.arm(fd);
    }

    /// Re-arms `fd` for the operations still queued on it.
    fn arm(&mut self, fd: RawFd) {
        let Some(registration) = self.registrations.get_mut(&fd) else {
            return;
        };

        if !registration.owner.is_open() {
            self.unregister(fd);
            return;
        }

        registration.readers.retain(|op| !op.abandoned());
        registration.writers.retain(|op| !op.abandoned());

        let interest = registration.interest();
        if interest == 0 {
            return;
        }

        let mut event = epoll_event {
            events: interest | EPOLLONESHOT as u32,
            u64: fd as u64,
        };

        let mut rc = unsafe { epoll_ctl(self.epoll, EPOLL_CTL_MOD, fd, &mut event) };
        if rc < 0 && io::Error::last_os_error().raw_os_error() == Some(libc::ENOENT) {
            rc = unsafe { epoll_ctl(self.epoll, EPOLL_CTL_ADD, fd, &mut event) };
        }

        if rc < 0 {
            let err = io::Error::last_os_error();

            if let Some(mut registration) = self.registrations.remove(&fd) {
                for op in registration.drain() {
                    op.fail(io::Error::new(err.kind(), err.to_string()));
                }
            }
        }
    }
}

/// Runs queued operations in order until one would block.
fn retry(fd: RawFd, queue: &mut VecDeque<Op>) {
    while let Some(op) = queue.pop_front() {
        if let Progress::Blocked(op) = op.attempt(fd) {
            queue.push_front(op);
            break;
        }
    }
}

/// Rounds `timeout` up to whole milliseconds for `epoll_wait`.
fn timeout_millis(timeout: Option<Duration>) -> i32 {
    match timeout {
        None => -1,
        Some(timeout) => {
            let millis = timeout.as_nanos().div_ceil(1_000_000);
            millis.min(i32::MAX as u128) as i32
        }
    }
}

impl Proactor for EpollProactor {
    fn name(&self) -> &'static str {
        "epoll"
    }

    fn recv(&mut self, handle: &Handle, sock: &Socket, nbytes: usize) -> Future<Vec<u8>> {
        let future = Future::new(handle);

        self.submit(
            sock,
            Direction::Read,
            Op::Recv {
                nbytes,
                future: future.clone(),
            },
        );

        future
    }

    fn send(&mut self, handle: &Handle, sock: &Socket, data: Vec<u8>) -> Future<()> {
        let future = Future::new(handle);

        self.submit(
            sock,
            Direction::Write,
            Op::Send {
                data,
                offset: 0,
                future: future.clone(),
            },
        );

        future
    }

    fn connect(&mut self, handle: &Handle, sock: &Socket, address: SocketAddr) -> Future<()> {
        let future = Future::new(handle);
        let fd = sock.as_raw_fd();

        match sys_connect(fd, &address) {
            Ok(()) => {
                let _ = future.set_result(());
            }
            Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {
                self.registration(sock).writers.push_back(Op::Connect {
                    future: future.clone(),
                });
                self.arm(fd);
            }
            Err(e) => {
                let _ = future.set_error(e.into());
            }
        }

        future
    }

    fn accept(&mut self, handle: &Handle, listener: &Socket) -> Future<(Socket, SocketAddr)> {
        let future = Future::new(handle);

        self.submit(
            listener,
            Direction::Read,
            Op::Accept {
                future: future.clone(),
            },
        );

        future
    }

    fn poll(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        if self.epoll < 0 {
            return Err(io::Error::other("proactor is closed"));
        }

        unsafe {
            self.events.set_len(0);
        }

        let n = unsafe {
            epoll_wait(
                self.epoll,
                self.events.as_mut_ptr(),
                self.events.capacity() as i32,
                timeout_millis(timeout),
            )
        };

        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(err);
        }

        unsafe {
            self.events.set_len(n as usize);
        }

        let ready: Vec<(RawFd, u32)> = self
            .events
            .iter()
            .map(|ev| (ev.u64 as RawFd, ev.events))
            .collect();

        for (fd, flags) in ready {
            let failed = flags & (EPOLLERR | EPOLLHUP) as u32 != 0;
            let readable = failed || flags & (EPOLLIN | EPOLLRDHUP) as u32 != 0;
            let writable = failed || flags & EPOLLOUT as u32 != 0;

            trace!("fd {fd} ready (readable: {readable}, writable: {writable})");
            self.dispatch(fd, readable, writable);
        }

        Ok(())
    }

    fn unregister(&mut self, fd: RawFd) {
        let Some(mut registration) = self.registrations.remove(&fd) else {
            return;
        };

        unsafe {
            epoll_ctl(self.epoll, EPOLL_CTL_DEL, fd, std::ptr::null_mut());
        }

        for op in registration.drain() {
            op.cancel();
        }
    }

    fn close(&mut self) {
        if self.epoll < 0 {
            return;
        }

        for (_, mut registration) in self.registrations.drain() {
            for op in registration.drain() {
                op.cancel();
            }
        }

        sys_close(self.epoll);
        self.epoll = -1;
    }
}

impl Drop for EpollProactor {
    fn drop(&mut self) {
        self.close();
    }
}
