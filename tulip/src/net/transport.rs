use super::{Protocol, Socket};
use crate::error::Error;
use crate::future::Future;
use crate::runtime::Handle;

use log::{debug, error, warn};
use std::cell::RefCell;
use std::fmt;
use std::mem;
use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::rc::Rc;

/// Lifecycle of a [`Transport`]. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Open,
    Closing,
    Closed,
}

struct State {
    status: Status,

    /// Bytes accepted by `write` and not yet submitted.
    buffer: Vec<u8>,

    /// The outstanding `recv`, if any.
    read_fut: Option<Future<Vec<u8>>>,

    /// The outstanding `send`, if any.
    write_fut: Option<Future<()>>,

    /// Non-zero once the connection is (being) lost; counts writes
    /// dropped since then.
    conn_lost: usize,

    /// Set once `connection_lost` has been scheduled.
    lost_scheduled: bool,
}

struct Inner {
    handle: Handle,
    sock: Socket,
    peer_addr: Option<SocketAddr>,

    /// Taken when the connection is lost, which also breaks the
    /// transport/protocol reference cycle.
    protocol: RefCell<Option<Box<dyn Protocol>>>,

    state: RefCell<State>,
}

/// Options for [`Transport::with_options`].
#[derive(Default)]
pub struct TransportOptions {
    /// Remote address, when known by whoever created the socket.
    pub peer_addr: Option<SocketAddr>,

    /// Resolved once the transport is set up.
    pub waiter: Option<Future<()>>,

    /// Do not start the read loop.
    pub write_only: bool,
}

/// Drives a socket's read and write loops on top of the proactor and
/// reports to a [`Protocol`].
///
/// The read loop keeps exactly one `recv` outstanding and hands every
/// chunk to [`Protocol::data_received`]. Writes are buffered; while a
/// `send` is in flight, further writes are coalesced into the next one.
///
/// A transport moves from open to closing to closed. [`close`](Self::close)
/// lets buffered data drain first; [`abort`](Self::abort) and fatal I/O
/// errors discard it. Either way [`Protocol::connection_lost`] is called
/// exactly once, after which the socket is closed.
///
/// `Transport` is a cheap handle; clones refer to the same connection.
#[derive(Clone)]
pub struct Transport {
    inner: Rc<Inner>,
}

impl Transport {
    /// Creates a transport that reads and writes `sock`.
    pub fn new(handle: &Handle, sock: Socket, protocol: Box<dyn Protocol>) -> Self {
        Self::with_options(handle, sock, protocol, TransportOptions::default())
    }

    /// Creates a transport that only writes `sock`.
    pub fn new_write_only(handle: &Handle, sock: Socket, protocol: Box<dyn Protocol>) -> Self {
        Self::with_options(
            handle,
            sock,
            protocol,
            TransportOptions {
                write_only: true,
                ..TransportOptions::default()
            },
        )
    }

    /// Creates a transport.
    ///
    /// [`Protocol::connection_made`], the first read and the waiter are
    /// scheduled in that order; none of them runs before this returns.
    pub fn with_options(
        handle: &Handle,
        sock: Socket,
        protocol: Box<dyn Protocol>,
        options: TransportOptions,
    ) -> Self {
        let peer_addr = options.peer_addr.or_else(|| sock.peer_addr().ok());

        let transport = Self {
            inner: Rc::new(Inner {
                handle: handle.clone(),
                sock,
                peer_addr,
                protocol: RefCell::new(Some(protocol)),
                state: RefCell::new(State {
                    status: Status::Open,
                    buffer: Vec::new(),
                    read_fut: None,
                    write_fut: None,
                    conn_lost: 0,
                    lost_scheduled: false,
                }),
            }),
        };

        let this = transport.clone();
        handle.call_soon(move || {
            let made = this.clone();
            this.with_protocol(|protocol| protocol.connection_made(made));
        });

        if !options.write_only {
            let this = transport.clone();
            handle.call_soon(move || this.loop_reading(None));
        }

        if let Some(waiter) = options.waiter {
            handle.call_soon(move || {
                let _ = waiter.set_result(());
            });
        }

        transport
    }

    /// Queues `data` for sending.
    ///
    /// Once the connection is closing or lost, the data is dropped and
    /// counted in [`lost_writes`](Self::lost_writes).
    pub fn write(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }

        {
            let mut state = self.inner.state.borrow_mut();

            if state.conn_lost > 0 {
                drop(state);
                self.record_lost_write();
                return;
            }

            state.buffer.extend_from_slice(data);

            if state.write_fut.is_some() {
                return;
            }
        }

        self.loop_writing(None);
    }

    /// Closes the transport once buffered data has been sent.
    ///
    /// Incoming data is ignored from now on. Idempotent.
    pub fn close(&self) {
        let mut state = self.inner.state.borrow_mut();
        if state.status != Status::Open {
            return;
        }

        state.status = Status::Closing;
        state.conn_lost += 1;

        if state.buffer.is_empty() && state.write_fut.is_none() {
            drop(state);
            self.schedule_connection_lost(None);
        }
    }

    /// Closes the transport immediately, discarding buffered data.
    pub fn abort(&self) {
        self.force_close(None);
    }

    /// Returns `true` once [`close`](Self::close) or [`abort`](Self::abort)
    /// was called, or the connection was lost.
    pub fn is_closing(&self) -> bool {
        self.inner.state.borrow().status != Status::Open
    }

    /// Returns `true` once the protocol has been told the connection is
    /// lost.
    pub fn is_closed(&self) -> bool {
        self.inner.state.borrow().status == Status::Closed
    }

    /// The loss counter: non-zero once closing, incremented by every write
    /// dropped since.
    pub fn lost_writes(&self) -> usize {
        self.inner.state.borrow().conn_lost
    }

    /// The remote address, if known.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.peer_addr
    }

    /// The underlying socket.
    pub fn socket(&self) -> &Socket {
        &self.inner.sock
    }

    fn with_protocol(&self, f: impl FnOnce(&mut dyn Protocol)) {
        let mut protocol = self.inner.protocol.borrow_mut();
        if let Some(protocol) = protocol.as_mut() {
            f(protocol.as_mut());
        }
    }

    /// Counts a dropped write, warning once when the count reaches the
    /// threshold.
    fn record_lost_write(&self) {
        let threshold = self.inner.handle.config().lost_write_threshold;

        let conn_lost = {
            let mut state = self.inner.state.borrow_mut();
            state.conn_lost += 1;
            state.conn_lost
        };

        if conn_lost == threshold {
            warn!("{self:?}: socket.send() raised exception.");
        }
    }

    /// Completion of the previous `recv` (if any); submits the next one.
    fn loop_reading(&self, completed: Option<&Future<Vec<u8>>>) {
        let mut data = None;

        if let Some(future) = completed {
            self.inner.state.borrow_mut().read_fut = None;

            match future.result() {
                Ok(bytes) => data = Some(bytes),
                Err(err) => {
                    self.read_failed(err);
                    return;
                }
            }
        }

        if self.inner.state.borrow().status != Status::Open {
            return;
        }

        if let Some(bytes) = data {
            if bytes.is_empty() {
                self.with_protocol(|protocol| protocol.end_of_stream());
                self.close();
                return;
            }

            self.with_protocol(|protocol| protocol.data_received(&bytes));

            if self.inner.state.borrow().status != Status::Open {
                return;
            }
        }

        let read_buffer_size = self.inner.handle.config().read_buffer_size;
        let future = self.inner.handle.sock_recv(&self.inner.sock, read_buffer_size);
        self.inner.state.borrow_mut().read_fut = Some(future.clone());

        let this = self.clone();
        future.add_done_callback(move |future| this.loop_reading(Some(future)));
    }

    /// Completion of the previous `send` (if any); submits the buffer.
    fn loop_writing(&self, completed: Option<&Future<()>>) {
        if let Some(future) = completed {
            self.inner.state.borrow_mut().write_fut = None;

            if let Err(err) = future.result() {
                self.write_failed(err);
                return;
            }
        }

        let mut state = self.inner.state.borrow_mut();
        let data = mem::take(&mut state.buffer);

        if data.is_empty() {
            let closing = state.status == Status::Closing;
            drop(state);

            if closing {
                self.schedule_connection_lost(None);
            }
            return;
        }

        drop(state);

        let future = self.inner.handle.sock_sendall(&self.inner.sock, data);
        self.inner.state.borrow_mut().write_fut = Some(future.clone());

        let this = self.clone();
        future.add_done_callback(move |future| this.loop_writing(Some(future)));
    }

    fn read_failed(&self, err: Error) {
        if err.is_cancelled() {
            return;
        }

        if err.is_connection_aborted() && self.is_closing() {
            return;
        }

        if err.is_connection_reset() {
            self.force_close(Some(err));
        } else {
            self.fatal_error(err);
        }
    }

    fn write_failed(&self, err: Error) {
        if err.is_cancelled() {
            return;
        }

        if err.is_connection_aborted() && self.is_closing() {
            self.force_close(None);
        } else if err.is_connection_reset() {
            self.force_close(Some(err));
        } else {
            self.fatal_error(err);
        }
    }

    fn fatal_error(&self, err: Error) {
        error!("Fatal error for {self:?}: {err}");
        self.force_close(Some(err));
    }

    /// Cancels in-flight I/O, discards the buffer and schedules
    /// `connection_lost`.
    ///
    /// Also finishes a graceful close whose buffer would otherwise never
    /// drain.
    fn force_close(&self, err: Option<Error>) {
        let (read_fut, write_fut) = {
            let mut state = self.inner.state.borrow_mut();
            if state.lost_scheduled {
                return;
            }

            if state.status == Status::Open {
                state.status = Status::Closing;
                state.conn_lost += 1;
            }

            state.buffer.clear();
            (state.read_fut.take(), state.write_fut.take())
        };

        if let Some(future) = write_fut {
            future.cancel();
        }
        if let Some(future) = read_fut {
            future.cancel();
        }

        self.schedule_connection_lost(err);
    }

    fn schedule_connection_lost(&self, err: Option<Error>) {
        {
            let mut state = self.inner.state.borrow_mut();
            if state.lost_scheduled {
                return;
            }
            state.lost_scheduled = true;
        }

        let this = self.clone();
        self.inner
            .handle
            .call_soon(move || this.call_connection_lost(err));
    }

    fn call_connection_lost(&self, err: Option<Error>) {
        self.inner.state.borrow_mut().status = Status::Closed;

        debug!("{self:?}: connection lost");

        let protocol = self.inner.protocol.borrow_mut().take();
        if let Some(mut protocol) = protocol {
            protocol.connection_lost(err);
        }

        self.inner.handle.forget_socket(&self.inner.sock);
        self.inner.sock.close();
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.try_borrow();

        let mut debug = f.debug_struct("Transport");
        debug.field("fd", &self.inner.sock.as_raw_fd());
        if let Ok(state) = state {
            debug.field("status", &state.status);
        }
        debug.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proactor::Proactor;
    use crate::{EventLoop, EventLoopBuilder};

    use std::io;
    use std::os::fd::RawFd;
    use std::time::Duration;

    #[derive(Default)]
    struct Script {
        recvs: Vec<(RawFd, Future<Vec<u8>>)>,
        sends: Vec<(RawFd, Vec<u8>, Future<()>)>,
    }

    /// A proactor whose operations complete only when the test says so.
    struct ScriptedProactor {
        script: Rc<RefCell<Script>>,
    }

    impl Proactor for ScriptedProactor {
        fn name(&self) -> &'static str {
            "scripted"
        }

        fn recv(&mut self, handle: &Handle, sock: &Socket, _nbytes: usize) -> Future<Vec<u8>> {
            let future = Future::new(handle);
            self.script
                .borrow_mut()
                .recvs
                .push((sock.as_raw_fd(), future.clone()));
            future
        }

        fn send(&mut self, handle: &Handle, sock: &Socket, data: Vec<u8>) -> Future<()> {
            let future = Future::new(handle);
            self.script
                .borrow_mut()
                .sends
                .push((sock.as_raw_fd(), data, future.clone()));
            future
        }

        fn connect(&mut self, handle: &Handle, _sock: &Socket, _address: SocketAddr) -> Future<()> {
            Future::new(handle)
        }

        fn accept(&mut self, handle: &Handle, _listener: &Socket) -> Future<(Socket, SocketAddr)> {
            Future::new(handle)
        }

        fn poll(&mut self, _timeout: Option<Duration>) -> io::Result<()> {
            Ok(())
        }

        fn unregister(&mut self, fd: RawFd) {
            let script = self.script.borrow();
            for (_, future) in script.recvs.iter().filter(|(owner, _)| *owner == fd) {
                future.cancel();
            }
            for (_, _, future) in script.sends.iter().filter(|(owner, _, _)| *owner == fd) {
                future.cancel();
            }
        }

        fn close(&mut self) {}
    }

    #[derive(Debug, PartialEq)]
    enum Seen {
        Made,
        Data(Vec<u8>),
        Eof,
        Lost(Option<String>),
    }

    struct Recorder {
        seen: Rc<RefCell<Vec<Seen>>>,
    }

    impl Protocol for Recorder {
        fn connection_made(&mut self, _transport: Transport) {
            self.seen.borrow_mut().push(Seen::Made);
        }

        fn data_received(&mut self, data: &[u8]) {
            self.seen.borrow_mut().push(Seen::Data(data.to_vec()));
        }

        fn end_of_stream(&mut self) {
            self.seen.borrow_mut().push(Seen::Eof);
        }

        fn connection_lost(&mut self, error: Option<Error>) {
            self.seen
                .borrow_mut()
                .push(Seen::Lost(error.map(|e| e.to_string())));
        }
    }

    struct Fixture {
        event_loop: EventLoop,
        script: Rc<RefCell<Script>>,
        transport: Transport,
        seen: Rc<RefCell<Vec<Seen>>>,
        fd: RawFd,
        _peer: Socket,
    }

    impl Fixture {
        fn new() -> Self {
            let script = Rc::new(RefCell::new(Script::default()));
            let event_loop = EventLoopBuilder::new()
                .lost_write_threshold(5)
                .proactor(Box::new(ScriptedProactor {
                    script: script.clone(),
                }))
                .build()
                .unwrap();

            let (sock, peer) = Socket::pair().unwrap();
            let fd = sock.as_raw_fd();
            let seen = Rc::new(RefCell::new(Vec::new()));

            let transport = Transport::new(
                &event_loop.handle(),
                sock,
                Box::new(Recorder { seen: seen.clone() }),
            );

            let fixture = Self {
                event_loop,
                script,
                transport,
                seen,
                fd,
                _peer: peer,
            };
            fixture.settle();
            fixture
        }

        fn settle(&self) {
            for _ in 0..4 {
                self.event_loop.run_once().unwrap();
            }
        }

        fn recvs(&self) -> Vec<Future<Vec<u8>>> {
            self.script
                .borrow()
                .recvs
                .iter()
                .filter(|(fd, _)| *fd == self.fd)
                .map(|(_, future)| future.clone())
                .collect()
        }

        fn sends(&self) -> Vec<(Vec<u8>, Future<()>)> {
            self.script
                .borrow()
                .sends
                .iter()
                .filter(|(fd, _, _)| *fd == self.fd)
                .map(|(_, data, future)| (data.clone(), future.clone()))
                .collect()
        }
    }

    #[test]
    fn data_is_delivered_and_the_read_is_resubmitted() {
        let fixture = Fixture::new();
        assert_eq!(fixture.recvs().len(), 1);

        fixture.recvs()[0].set_result(b"hello".to_vec()).unwrap();
        fixture.settle();

        assert_eq!(
            *fixture.seen.borrow(),
            vec![Seen::Made, Seen::Data(b"hello".to_vec())]
        );
        assert_eq!(fixture.recvs().len(), 2);
    }

    #[test]
    fn end_of_stream_closes_without_reading_again() {
        let fixture = Fixture::new();

        fixture.recvs()[0].set_result(Vec::new()).unwrap();
        fixture.settle();

        assert_eq!(
            *fixture.seen.borrow(),
            vec![Seen::Made, Seen::Eof, Seen::Lost(None)]
        );
        assert_eq!(fixture.recvs().len(), 1);
        assert!(fixture.transport.is_closed());
        assert!(fixture.transport.socket().is_closed());
    }

    #[test]
    fn closing_twice_loses_the_connection_once() {
        let fixture = Fixture::new();

        fixture.transport.close();
        fixture.transport.close();
        fixture.settle();
        fixture.transport.close();
        fixture.settle();

        let lost = fixture
            .seen
            .borrow()
            .iter()
            .filter(|seen| matches!(seen, Seen::Lost(_)))
            .count();
        assert_eq!(lost, 1);
    }

    #[test]
    fn connection_reset_force_closes_with_the_cause() {
        let fixture = Fixture::new();

        let reset = io::Error::from(io::ErrorKind::ConnectionReset);
        fixture.recvs()[0].set_error(reset.into()).unwrap();
        fixture.settle();

        let seen = fixture.seen.borrow();
        assert!(matches!(seen.last(), Some(Seen::Lost(Some(_)))));
        assert_eq!(fixture.recvs().len(), 1);
    }

    #[test]
    fn writes_coalesce_while_a_send_is_in_flight() {
        let fixture = Fixture::new();

        fixture.transport.write(b"a");
        fixture.transport.write(b"b");
        fixture.transport.write(b"c");

        let sends = fixture.sends();
        assert_eq!(sends.len(), 1);
        assert_eq!(sends[0].0, b"a");

        sends[0].1.set_result(()).unwrap();
        fixture.settle();

        let sends = fixture.sends();
        assert_eq!(sends.len(), 2);
        assert_eq!(sends[1].0, b"bc");
    }

    #[test]
    fn close_waits_for_buffered_data() {
        let fixture = Fixture::new();

        fixture.transport.write(b"bye");
        fixture.transport.close();
        fixture.settle();
        assert!(!fixture.seen.borrow().contains(&Seen::Lost(None)));

        fixture.sends()[0].1.set_result(()).unwrap();
        fixture.settle();
        assert!(fixture.seen.borrow().contains(&Seen::Lost(None)));
    }

    #[test]
    fn abort_discards_buffered_data() {
        let fixture = Fixture::new();

        fixture.transport.write(b"first");
        fixture.transport.write(b"second");
        fixture.transport.abort();
        fixture.settle();

        assert_eq!(fixture.sends().len(), 1);
        assert!(fixture.sends()[0].1.cancelled());
        assert!(fixture.recvs()[0].cancelled());
        assert_eq!(fixture.seen.borrow().last(), Some(&Seen::Lost(None)));
    }

    thread_local! {
        static WARNINGS: RefCell<Vec<String>> = const { RefCell::new(Vec::new()) };
    }

    /// Collects warnings logged on the current thread.
    struct WarningLog;

    impl log::Log for WarningLog {
        fn enabled(&self, metadata: &log::Metadata<'_>) -> bool {
            metadata.level() <= log::Level::Warn
        }

        fn log(&self, record: &log::Record<'_>) {
            if self.enabled(record.metadata()) {
                WARNINGS.with(|warnings| warnings.borrow_mut().push(record.args().to_string()));
            }
        }

        fn flush(&self) {}
    }

    static WARNING_LOG: WarningLog = WarningLog;

    fn lost_write_warnings() -> usize {
        WARNINGS.with(|warnings| {
            warnings
                .borrow()
                .iter()
                .filter(|message| message.contains("socket.send() raised exception"))
                .count()
        })
    }

    #[test]
    fn lost_writes_warn_once_at_the_threshold() {
        let _ = log::set_logger(&WARNING_LOG);
        log::set_max_level(log::LevelFilter::Warn);

        let fixture = Fixture::new();
        fixture.transport.abort();
        fixture.settle();
        assert_eq!(fixture.transport.lost_writes(), 1);

        for _ in 0..3 {
            fixture.transport.write(b"dropped");
        }
        assert_eq!(fixture.transport.lost_writes(), 4);
        assert_eq!(lost_write_warnings(), 0);

        fixture.transport.write(b"dropped");
        assert_eq!(fixture.transport.lost_writes(), 5);
        assert_eq!(lost_write_warnings(), 1);

        fixture.transport.write(b"dropped");
        fixture.transport.write(b"");
        assert_eq!(fixture.transport.lost_writes(), 6);
        assert_eq!(lost_write_warnings(), 1);
        assert!(fixture.sends().is_empty());
    }

    #[test]
    fn aborted_read_while_closing_is_ignored() {
        let fixture = Fixture::new();

        fixture.transport.write(b"tail");
        fixture.transport.close();

        let aborted = io::Error::from(io::ErrorKind::ConnectionAborted);
        fixture.recvs()[0].set_error(aborted.into()).unwrap();
        fixture.settle();

        assert_eq!(*fixture.seen.borrow(), vec![Seen::Made]);
        assert!(!fixture.sends()[0].1.done());

        fixture.sends()[0].1.set_result(()).unwrap();
        fixture.settle();

        assert_eq!(*fixture.seen.borrow(), vec![Seen::Made, Seen::Lost(None)]);
    }

    #[test]
    fn aborted_read_while_open_is_fatal() {
        let fixture = Fixture::new();

        let aborted = io::Error::from(io::ErrorKind::ConnectionAborted);
        fixture.recvs()[0].set_error(aborted.into()).unwrap();
        fixture.settle();

        assert!(matches!(fixture.seen.borrow().last(), Some(Seen::Lost(Some(_)))));
        assert!(fixture.transport.is_closed());
        assert_eq!(fixture.recvs().len(), 1);
    }

    #[test]
    fn read_error_cancels_the_send_in_flight() {
        let fixture = Fixture::new();

        fixture.transport.write(b"pending");
        fixture.recvs()[0]
            .set_error(io::Error::other("device gone").into())
            .unwrap();
        fixture.settle();

        assert!(fixture.sends()[0].1.cancelled());
        assert_eq!(
            fixture.seen.borrow().last(),
            Some(&Seen::Lost(Some("I/O error: device gone".to_string())))
        );
    }

    #[test]
    fn write_error_cancels_the_read_in_flight() {
        let fixture = Fixture::new();

        fixture.transport.write(b"doomed");
        fixture.sends()[0]
            .1
            .set_error(io::Error::other("device gone").into())
            .unwrap();
        fixture.settle();

        assert!(fixture.recvs()[0].cancelled());
        assert!(matches!(fixture.seen.borrow().last(), Some(Seen::Lost(Some(_)))));

        let lost = fixture
            .seen
            .borrow()
            .iter()
            .filter(|seen| matches!(seen, Seen::Lost(_)))
            .count();
        assert_eq!(lost, 1);
    }

    #[test]
    fn aborted_write_while_closing_finishes_quietly() {
        let fixture = Fixture::new();

        fixture.transport.write(b"unsent");
        fixture.transport.close();

        let aborted = io::Error::from(io::ErrorKind::ConnectionAborted);
        fixture.sends()[0].1.set_error(aborted.into()).unwrap();
        fixture.settle();

        assert_eq!(*fixture.seen.borrow(), vec![Seen::Made, Seen::Lost(None)]);
        assert!(fixture.recvs()[0].cancelled());
        assert!(fixture.transport.is_closed());
    }

    #[test]
    fn write_only_transports_never_read() {
        let script = Rc::new(RefCell::new(Script::default()));
        let event_loop = EventLoopBuilder::new()
            .proactor(Box::new(ScriptedProactor {
                script: script.clone(),
            }))
            .build()
            .unwrap();
        let handle = event_loop.handle();

        let (sock, _peer) = Socket::pair().unwrap();
        let fd = sock.as_raw_fd();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let waiter = Future::new(&handle);

        let transport = Transport::with_options(
            &handle,
            sock,
            Box::new(Recorder { seen: seen.clone() }),
            TransportOptions {
                waiter: Some(waiter.clone()),
                write_only: true,
                ..TransportOptions::default()
            },
        );

        for _ in 0..4 {
            event_loop.run_once().unwrap();
        }

        assert!(waiter.done());
        assert_eq!(*seen.borrow(), vec![Seen::Made]);
        assert!(script.borrow().recvs.iter().all(|(owner, _)| *owner != fd));

        transport.write(b"out");
        assert_eq!(script.borrow().sends.len(), 1);
    }
}
