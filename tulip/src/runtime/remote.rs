use crate::proactor::sys::sys_send;
use crate::runtime::Handle;

use log::trace;
use std::mem;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, ThreadId};

pub(crate) type RemoteCallback = Box<dyn FnOnce(&Handle) + Send>;

/// The only event loop state reachable from other threads.
///
/// Everything else is owned by the loop thread. Producers on foreign
/// threads push into these lists and then write one byte to the self-pipe,
/// which interrupts a poll that would otherwise block.
pub(crate) struct Shared {
    /// Identifiers of tasks whose waker fired since the last step.
    woken: Mutex<Vec<usize>>,

    /// Callbacks queued through [`Remote::call_soon_threadsafe`].
    callbacks: Mutex<Vec<RemoteCallback>>,

    /// Stop request raised through [`Remote::stop`].
    stop: AtomicBool,

    /// Write end of the self-pipe, or `-1` once the loop is closed.
    wakeup_fd: AtomicI32,

    /// Thread running the event loop.
    owner: ThreadId,
}

impl Shared {
    pub(crate) fn new() -> Self {
        Self {
            woken: Mutex::new(Vec::new()),
            callbacks: Mutex::new(Vec::new()),
            stop: AtomicBool::new(false),
            wakeup_fd: AtomicI32::new(-1),
            owner: thread::current().id(),
        }
    }

    /// Records that task `id` must be polled again.
    pub(crate) fn wake_task(&self, id: usize) {
        self.woken
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(id);

        if thread::current().id() != self.owner {
            self.write_to_self();
        }
    }

    pub(crate) fn push_callback(&self, callback: RemoteCallback) {
        self.callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(callback);

        self.write_to_self();
    }

    pub(crate) fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
        self.write_to_self();
    }

    pub(crate) fn take_woken(&self) -> Vec<usize> {
        mem::take(&mut *self.woken.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub(crate) fn take_callbacks(&self) -> Vec<RemoteCallback> {
        mem::take(&mut *self.callbacks.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub(crate) fn take_stop(&self) -> bool {
        self.stop.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn set_wakeup_fd(&self, fd: RawFd) {
        self.wakeup_fd.store(fd, Ordering::Release);
    }

    /// Interrupts a blocked poll by writing to the self-pipe.
    ///
    /// A full pipe means a wakeup is already pending, so failures are
    /// ignored.
    pub(crate) fn write_to_self(&self) {
        let fd = self.wakeup_fd.load(Ordering::Acquire);
        if fd < 0 {
            return;
        }

        trace!("writing to the self-pipe");
        let _ = sys_send(fd, b"x");
    }
}

/// A thread-safe handle to an event loop.
///
/// `Remote` is the one way to reach a loop from another thread: it can
/// queue callbacks and request a stop, both of which interrupt a blocking
/// wait for completions through the loop's self-pipe.
#[derive(Clone)]
pub struct Remote {
    pub(crate) shared: Arc<Shared>,
}

impl Remote {
    /// Schedules `callback` to run on the loop thread.
    ///
    /// The callback receives the loop's [`Handle`] so it can reach
    /// loop-local state.
    pub fn call_soon_threadsafe(&self, callback: impl FnOnce(&Handle) + Send + 'static) {
        self.shared.push_callback(Box::new(callback));
    }

    /// Asks the loop to return from `run_forever` after its current step.
    pub fn stop(&self) {
        self.shared.request_stop();
    }
}
