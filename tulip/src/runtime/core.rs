use super::builder::Config;
use super::remote::{Remote, Shared};
use super::task::{self, Runnable, Task};
use super::timer::{TimerEntry, TimerHandle};
use crate::error::{Error, Result};
use crate::future::Future;
use crate::net::Socket;
use crate::proactor::Proactor;
use crate::utils::Slab;

use log::{debug, error, trace};
use std::cell::{Cell, RefCell};
use std::collections::{BinaryHeap, VecDeque};
use std::fmt;
use std::mem;
use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

type Callback = Box<dyn FnOnce()>;

/// The internal socket pair used to interrupt a blocking poll.
struct SelfPipe {
    reader: Socket,
    writer: Socket,
}

/// Scheduler state. Owned by the loop thread; reached through [`Handle`].
pub(crate) struct Inner {
    config: Config,

    /// Callbacks ready to run, in FIFO order.
    ready: RefCell<VecDeque<Callback>>,

    /// Timed callbacks, earliest deadline first.
    timers: RefCell<BinaryHeap<TimerEntry>>,

    /// Tie-breaker for timers sharing a deadline.
    sequence: Cell<u64>,

    /// Live tasks, indexed by the identifier their wakers carry.
    tasks: RefCell<Slab<Rc<dyn Runnable>>>,

    /// `None` once the loop is closed.
    proactor: RefCell<Option<Box<dyn Proactor>>>,

    shared: Arc<Shared>,
    self_pipe: RefCell<Option<SelfPipe>>,

    running: Cell<bool>,
    stopping: Cell<bool>,
    closed: Cell<bool>,
}

/// A single-threaded reference to an event loop.
///
/// Every future, primitive and transport is constructed with a `Handle`;
/// there is no ambient "current loop". Cloning is cheap.
#[derive(Clone)]
pub struct Handle {
    inner: Rc<Inner>,
}

impl Handle {
    /// Appends `callback` to the ready queue.
    ///
    /// Callbacks queued on a closed loop are dropped.
    pub fn call_soon(&self, callback: impl FnOnce() + 'static) {
        if self.inner.closed.get() {
            return;
        }

        self.inner.ready.borrow_mut().push_back(Box::new(callback));
    }

    /// Runs `callback` once `delay` has elapsed.
    pub fn call_later(&self, delay: Duration, callback: impl FnOnce() + 'static) -> TimerHandle {
        self.call_at(Instant::now() + delay, callback)
    }

    /// Runs `callback` once `deadline` is reached.
    ///
    /// Timers sharing a deadline fire in the order they were scheduled.
    pub fn call_at(&self, deadline: Instant, callback: impl FnOnce() + 'static) -> TimerHandle {
        let cancelled = Rc::new(Cell::new(false));
        let timer = TimerHandle::new(deadline, cancelled.clone());

        if self.inner.closed.get() {
            timer.cancel();
            return timer;
        }

        let sequence = self.inner.sequence.get();
        self.inner.sequence.set(sequence.wrapping_add(1));

        self.inner.timers.borrow_mut().push(TimerEntry {
            deadline,
            sequence,
            callback: Box::new(callback),
            cancelled,
        });

        timer
    }

    /// Returns a future resolved after `delay`.
    pub fn sleep(&self, delay: Duration) -> Future<()> {
        let future = Future::new(self);
        let resolve = future.clone();

        self.call_later(delay, move || {
            let _ = resolve.set_result(());
        });

        future
    }

    /// Spawns `computation` as a [`Task`].
    ///
    /// The task's first step runs on the next loop iteration. Spawning on
    /// a closed loop yields an already cancelled task.
    pub fn spawn<F>(&self, computation: F) -> Task<F::Output>
    where
        F: std::future::Future + 'static,
        F::Output: 'static,
    {
        task::spawn(self, computation)
    }

    /// Requests the running loop to return after its current step.
    pub fn stop(&self) {
        self.inner.stopping.set(true);
    }

    /// Returns a thread-safe handle to this loop.
    pub fn remote(&self) -> Remote {
        Remote {
            shared: self.inner.shared.clone(),
        }
    }

    /// Returns `true` once the loop has been closed.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.get()
    }

    /// Receives up to `nbytes` from `sock`.
    ///
    /// Resolves with an empty buffer at end of stream.
    pub fn sock_recv(&self, sock: &Socket, nbytes: usize) -> Future<Vec<u8>> {
        self.submit(|proactor, handle| proactor.recv(handle, sock, nbytes))
    }

    /// Sends all of `data` on `sock`.
    pub fn sock_sendall(&self, sock: &Socket, data: Vec<u8>) -> Future<()> {
        self.submit(|proactor, handle| proactor.send(handle, sock, data))
    }

    /// Connects `sock` to `address`.
    pub fn sock_connect(&self, sock: &Socket, address: SocketAddr) -> Future<()> {
        self.submit(|proactor, handle| proactor.connect(handle, sock, address))
    }

    /// Accepts one connection on the listening socket `sock`.
    pub fn sock_accept(&self, sock: &Socket) -> Future<(Socket, SocketAddr)> {
        self.submit(|proactor, handle| proactor.accept(handle, sock))
    }

    /// Drops every operation the proactor still holds for `sock`.
    ///
    /// Must be called before a socket is closed so that a recycled
    /// descriptor number never inherits stale operations.
    pub(crate) fn forget_socket(&self, sock: &Socket) {
        if let Some(proactor) = self.inner.proactor.borrow_mut().as_mut() {
            proactor.unregister(sock.as_raw_fd());
        }
    }

    pub(crate) fn config(&self) -> &Config {
        &self.inner.config
    }

    pub(crate) fn shared(&self) -> Arc<Shared> {
        self.inner.shared.clone()
    }

    pub(crate) fn register_task(&self, task: Rc<dyn Runnable>) -> Option<usize> {
        if self.inner.closed.get() {
            return None;
        }

        Some(self.inner.tasks.borrow_mut().insert(task))
    }

    pub(crate) fn release_task(&self, id: usize) {
        let task = self.inner.tasks.borrow_mut().remove(id);
        drop(task);
    }

    fn submit<T: 'static>(
        &self,
        operation: impl FnOnce(&mut dyn Proactor, &Handle) -> Future<T>,
    ) -> Future<T> {
        let mut proactor = self.inner.proactor.borrow_mut();

        match proactor.as_mut() {
            Some(proactor) => operation(proactor.as_mut(), self),
            None => {
                drop(proactor);

                let future = Future::new(self);
                let _ = future.set_error(Error::IllegalState("event loop is closed"));
                future
            }
        }
    }

    /// One iteration of the loop.
    ///
    /// Polls the proactor for completions (without blocking when work is
    /// already ready, otherwise until the nearest timer), moves expired
    /// timers and pending wakeups to the ready queue, then runs exactly the
    /// callbacks that were ready at that point.
    fn run_once(&self) -> Result<()> {
        if self.inner.closed.get() {
            return Err(Error::IllegalState("event loop is closed"));
        }

        self.collect_pending();

        let timeout = if !self.inner.ready.borrow().is_empty() || self.inner.stopping.get() {
            Some(Duration::ZERO)
        } else {
            self.next_timer_delay()
        };

        if let Some(proactor) = self.inner.proactor.borrow_mut().as_mut() {
            proactor.poll(timeout)?;
        }

        self.collect_expired_timers();
        self.collect_pending();

        let ntodo = self.inner.ready.borrow().len();
        for _ in 0..ntodo {
            let Some(callback) = self.inner.ready.borrow_mut().pop_front() else {
                break;
            };

            callback();
        }

        Ok(())
    }

    fn next_timer_delay(&self) -> Option<Duration> {
        let mut timers = self.inner.timers.borrow_mut();

        while let Some(timer) = timers.peek() {
            if !timer.cancelled.get() {
                return Some(timer.deadline.saturating_duration_since(Instant::now()));
            }

            timers.pop();
        }

        None
    }

    fn collect_expired_timers(&self) {
        let now = Instant::now();
        let mut timers = self.inner.timers.borrow_mut();
        let mut ready = self.inner.ready.borrow_mut();

        while let Some(timer) = timers.peek() {
            if timer.deadline > now {
                break;
            }

            let Some(timer) = timers.pop() else {
                break;
            };

            if !timer.cancelled.get() {
                ready.push_back(timer.callback);
            }
        }
    }

    /// Turns cross-thread requests and task wakeups into ready callbacks.
    fn collect_pending(&self) {
        let shared = &self.inner.shared;

        if shared.take_stop() {
            self.inner.stopping.set(true);
        }

        for callback in shared.take_callbacks() {
            let handle = self.clone();
            self.call_soon(move || callback(&handle));
        }

        for id in shared.take_woken() {
            let task = self.inner.tasks.borrow().get(id).cloned();
            if let Some(task) = task {
                task.schedule();
            }
        }
    }

    fn make_self_pipe(&self) -> Result<()> {
        let (reader, writer) = Socket::pair()?;

        self.inner.shared.set_wakeup_fd(writer.as_raw_fd());
        *self.inner.self_pipe.borrow_mut() = Some(SelfPipe { reader, writer });

        let handle = self.clone();
        self.call_soon(move || handle.loop_self_reading(None));

        Ok(())
    }

    /// Keeps one `recv` outstanding on the self-pipe, resubmitting it each
    /// time it completes.
    fn loop_self_reading(&self, completed: Option<&Future<Vec<u8>>>) {
        if let Some(future) = completed {
            match future.result() {
                Ok(_) => trace!("event loop woken through the self-pipe"),
                Err(err) if err.is_cancelled() => return,
                Err(err) => {
                    error!("self-pipe read failed: {err}");
                    return;
                }
            }
        }

        let reader = match self.inner.self_pipe.borrow().as_ref() {
            Some(pipe) => pipe.reader.clone(),
            None => return,
        };

        let handle = self.clone();
        self.sock_recv(&reader, self.inner.config.read_buffer_size)
            .add_done_callback(move |future| handle.loop_self_reading(Some(future)));
    }

    fn close_self_pipe(&self) {
        self.inner.shared.set_wakeup_fd(-1);

        let pipe = self.inner.self_pipe.borrow_mut().take();
        if let Some(pipe) = pipe {
            self.forget_socket(&pipe.reader);
            pipe.reader.close();
            pipe.writer.close();
        }
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("running", &self.inner.running.get())
            .field("closed", &self.inner.closed.get())
            .finish()
    }
}

/// A single-threaded, cooperative event loop.
///
/// The loop owns the ready queue, the timers, the task table and the
/// proactor. Dropping it closes it.
///
/// # Examples
///
/// ```rust,ignore
/// let event_loop = EventLoop::new()?;
/// let handle = event_loop.handle();
///
/// let answer = event_loop.run_until_complete(async move {
///     handle.sleep(Duration::from_millis(10)).await?;
///     Ok::<_, Error>(42)
/// })??;
/// ```
pub struct EventLoop {
    handle: Handle,
}

impl EventLoop {
    /// Creates an event loop with the default configuration and the
    /// platform proactor.
    pub fn new() -> Result<Self> {
        super::EventLoopBuilder::new().build()
    }

    pub(crate) fn with_proactor(config: Config, proactor: Box<dyn Proactor>) -> Result<Self> {
        debug!("Using proactor: {}", proactor.name());

        let handle = Handle {
            inner: Rc::new(Inner {
                config,
                ready: RefCell::new(VecDeque::new()),
                timers: RefCell::new(BinaryHeap::new()),
                sequence: Cell::new(0),
                tasks: RefCell::new(Slab::new(64)),
                proactor: RefCell::new(Some(proactor)),
                shared: Arc::new(Shared::new()),
                self_pipe: RefCell::new(None),
                running: Cell::new(false),
                stopping: Cell::new(false),
                closed: Cell::new(false),
            }),
        };

        handle.make_self_pipe()?;

        Ok(Self { handle })
    }

    /// Returns a handle to this loop.
    pub fn handle(&self) -> Handle {
        self.handle.clone()
    }

    /// Returns a thread-safe handle to this loop.
    pub fn remote(&self) -> Remote {
        self.handle.remote()
    }

    /// Runs a single iteration of the loop.
    ///
    /// # Errors
    ///
    /// Fails if the loop is closed or the proactor fails to poll.
    pub fn run_once(&self) -> Result<()> {
        self.handle.run_once()
    }

    /// Runs until [`stop`](Self::stop) is called.
    ///
    /// A stop requested before the call makes the loop run exactly one
    /// iteration.
    ///
    /// # Errors
    ///
    /// Fails if the loop is closed, already running, or the proactor fails.
    pub fn run_forever(&self) -> Result<()> {
        let inner = &self.handle.inner;

        if inner.closed.get() {
            return Err(Error::IllegalState("event loop is closed"));
        }
        if inner.running.get() {
            return Err(Error::IllegalState("event loop is already running"));
        }

        inner.running.set(true);

        let outcome = loop {
            if let Err(err) = self.handle.run_once() {
                break Err(err);
            }
            if inner.stopping.get() {
                break Ok(());
            }
        };

        inner.stopping.set(false);
        inner.running.set(false);

        outcome
    }

    /// Spawns `computation` as a task and runs the loop until it resolves.
    ///
    /// # Errors
    ///
    /// - [`Error::Cancelled`] if the task was cancelled,
    /// - [`Error::IllegalState`] if the loop was stopped first,
    /// - any error from [`run_forever`](Self::run_forever).
    pub fn run_until_complete<F>(&self, computation: F) -> Result<F::Output>
    where
        F: std::future::Future + 'static,
        F::Output: 'static,
    {
        let task = self.handle.spawn(computation);

        let handle = self.handle.clone();
        task.add_done_callback(move |_| handle.stop());

        self.run_forever()?;

        if !task.done() {
            return Err(Error::IllegalState(
                "event loop stopped before the future completed",
            ));
        }

        task.future().take_result()
    }

    /// Requests the running loop to return after its current step.
    pub fn stop(&self) {
        self.handle.stop();
    }

    /// Returns `true` while [`run_forever`](Self::run_forever) is active.
    pub fn is_running(&self) -> bool {
        self.handle.inner.running.get()
    }

    /// Returns `true` once the loop has been closed.
    pub fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }

    /// Closes the loop.
    ///
    /// Closes the self-pipe and the proactor (cancelling every pending
    /// operation) and drops queued callbacks, timers and tasks. Idempotent.
    ///
    /// # Errors
    ///
    /// [`Error::IllegalState`] if the loop is running.
    pub fn close(&self) -> Result<()> {
        let inner = &self.handle.inner;

        if inner.running.get() {
            return Err(Error::IllegalState("cannot close a running event loop"));
        }
        if inner.closed.get() {
            return Ok(());
        }

        self.handle.close_self_pipe();
        inner.closed.set(true);

        let proactor = inner.proactor.borrow_mut().take();
        if let Some(mut proactor) = proactor {
            proactor.close();
        }

        let ready = mem::take(&mut *inner.ready.borrow_mut());
        drop(ready);

        let timers = mem::take(&mut *inner.timers.borrow_mut());
        drop(timers);

        let tasks = inner.tasks.borrow_mut().drain();
        drop(tasks);

        Ok(())
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
