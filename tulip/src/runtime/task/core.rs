use super::Task;
use super::state::{CANCELLED, COMPLETED, IDLE, QUEUED, RUNNING};
use super::waker::make_waker;
use crate::future::Future;
use crate::runtime::Handle;

use std::cell::{Cell, RefCell};
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

type Computation<T> = Pin<Box<dyn std::future::Future<Output = T>>>;

/// A unit of work the event loop can step.
///
/// The `Runnable` trait erases the output type of a task so the loop can
/// keep heterogeneous tasks in one table, indexed by the identifier their
/// wakers carry.
pub(crate) trait Runnable {
    /// Queues one step of the task, unless one is already queued.
    fn schedule(self: Rc<Self>);

    /// Polls the computation once.
    fn run(self: Rc<Self>);
}

/// A spawned computation managed by the event loop.
///
/// A `TaskCore` is the container for the computation. It coordinates the
/// lifecycle of that computation: its scheduling state, its waker and the
/// [`Future`] that receives its output.
pub(crate) struct TaskCore<T> {
    /// Index in the loop's task table.
    pub(crate) id: Cell<usize>,

    /// The current lifecycle state (IDLE, QUEUED, ...).
    pub(crate) state: Cell<usize>,

    /// The computation, taken out of the cell while it is being polled so
    /// that it may spawn or cancel tasks (itself included).
    pub(crate) computation: RefCell<Option<Computation<T>>>,

    /// Receives the output, or is cancelled with the task.
    pub(crate) result: Future<T>,

    pub(crate) handle: Handle,
}

impl<T: 'static> TaskCore<T> {
    pub(crate) fn new<F>(handle: &Handle, computation: F) -> Self
    where
        F: std::future::Future<Output = T> + 'static,
    {
        Self {
            id: Cell::new(usize::MAX),
            state: Cell::new(IDLE),
            computation: RefCell::new(Some(Box::pin(computation))),
            result: Future::new(handle),
            handle: handle.clone(),
        }
    }
}

impl<T: 'static> Runnable for TaskCore<T> {
    fn schedule(self: Rc<Self>) {
        if self.state.get() != IDLE {
            return;
        }

        self.state.set(QUEUED);

        let handle = self.handle.clone();
        handle.call_soon(move || self.run());
    }

    /// Steps the computation.
    ///
    /// - `Poll::Pending`: back to `IDLE`, waiting for the waker.
    /// - `Poll::Ready`: the output is stored in the result future, which
    ///   schedules the callbacks of everyone awaiting the task.
    fn run(self: Rc<Self>) {
        if self.state.get() != QUEUED {
            return;
        }

        let Some(mut computation) = self.computation.borrow_mut().take() else {
            return;
        };

        self.state.set(RUNNING);

        let waker = make_waker(self.handle.shared(), self.id.get());
        let mut cx = Context::from_waker(&waker);

        match computation.as_mut().poll(&mut cx) {
            Poll::Pending => {
                // Cancelled from inside its own step.
                if self.state.get() == CANCELLED {
                    return;
                }

                *self.computation.borrow_mut() = Some(computation);
                self.state.set(IDLE);
            }
            Poll::Ready(value) => {
                drop(computation);

                if self.state.get() == CANCELLED {
                    return;
                }

                self.state.set(COMPLETED);
                self.handle.release_task(self.id.get());

                let _ = self.result.set_result(value);
            }
        }
    }
}

/// Spawns `computation` as a task on the event loop behind `handle`.
///
/// The first step is queued immediately; the task then advances each time
/// a future it awaits resolves.
pub(crate) fn spawn<F>(handle: &Handle, computation: F) -> Task<F::Output>
where
    F: std::future::Future + 'static,
    F::Output: 'static,
{
    let core = Rc::new(TaskCore::new(handle, computation));

    match handle.register_task(core.clone()) {
        Some(id) => {
            core.id.set(id);
            core.clone().schedule();
        }
        None => {
            core.state.set(CANCELLED);
            core.computation.borrow_mut().take();
            core.result.cancel();
        }
    }

    Task { core }
}
