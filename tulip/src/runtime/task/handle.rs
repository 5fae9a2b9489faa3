use super::core::TaskCore;
use super::state::{CANCELLED, COMPLETED, RUNNING};
use crate::error::Result;
use crate::future::{Future, Wait};

use std::future::IntoFuture;
use std::rc::Rc;

/// A handle to a spawned task.
///
/// A `Task` exposes the task's result [`Future`] and can cancel the
/// computation. Awaiting it yields the task's output.
///
/// Dropping the `Task` does **not** cancel the computation; it only
/// discards the ability to observe or cancel it.
pub struct Task<T> {
    pub(crate) core: Rc<TaskCore<T>>,
}

impl<T: 'static> Task<T> {
    /// The future that receives the task's output.
    pub fn future(&self) -> &Future<T> {
        &self.core.result
    }

    /// Returns `true` once the task has completed or been cancelled.
    pub fn done(&self) -> bool {
        self.core.result.done()
    }

    /// Returns `true` if the task was cancelled.
    pub fn cancelled(&self) -> bool {
        self.core.result.cancelled()
    }

    /// Registers a callback invoked once the task is done.
    pub fn add_done_callback(&self, callback: impl FnOnce(&Future<T>) + 'static) {
        self.core.result.add_done_callback(callback);
    }

    /// Cancels the task.
    ///
    /// The computation is dropped at its current suspension point (or right
    /// after its current step, if it cancels itself) and the result future
    /// is cancelled. Returns `false` if the task had already finished.
    pub fn cancel(&self) -> bool {
        let core = &self.core;

        let state = core.state.get();
        if state == COMPLETED || state == CANCELLED {
            return false;
        }

        core.state.set(CANCELLED);
        core.handle.release_task(core.id.get());

        if state != RUNNING {
            let computation = core.computation.borrow_mut().take();
            drop(computation);
        }

        core.result.cancel();
        true
    }
}

impl<T: Clone + 'static> Task<T> {
    /// Returns a clone of the task's output.
    ///
    /// # Errors
    ///
    /// See [`Future::result`].
    pub fn result(&self) -> Result<T> {
        self.core.result.result()
    }
}

impl<T: Clone + 'static> IntoFuture for Task<T> {
    type Output = Result<T>;
    type IntoFuture = Wait<T>;

    fn into_future(self) -> Wait<T> {
        self.core.result.clone().into_future()
    }
}
