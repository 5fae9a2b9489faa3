//! Single-assignment futures.
//!
//! A [`Future`] is the meeting point between whoever starts an asynchronous
//! operation and whoever waits for it. It is resolved exactly once (with a
//! value, with an error, or by cancellation) and then notifies its done
//! callbacks through the event loop's ready queue, never synchronously from
//! the resolving call.
//!
//! Futures are also awaitable from tasks: `future.await` yields a
//! [`Result`] holding a clone of the stored value.

use crate::error::{Error, Result};
use crate::runtime::{Handle, TimerHandle};

use std::cell::RefCell;
use std::fmt;
use std::future::IntoFuture;
use std::mem;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};
use std::time::Duration;

/// Lifecycle of a [`Future`].
///
/// The only transitions are `Pending -> Cancelled` and
/// `Pending -> Finished`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FutureState {
    Pending,
    Cancelled,
    Finished,
}

type DoneCallback<T> = Box<dyn FnOnce(&Future<T>)>;

struct Inner<T> {
    state: FutureState,

    /// `Some(Ok)` or `Some(Err)` once finished; `None` while pending,
    /// after cancellation, or once the value has been taken.
    outcome: Option<Result<T>>,

    /// Callbacks in registration order. Emptied on resolution.
    callbacks: Vec<DoneCallback<T>>,

    /// Deferred cancellation armed by [`Future::with_timeout`].
    timeout: Option<TimerHandle>,
}

/// A single-assignment result container with done callbacks.
///
/// Cloning a `Future` yields another handle to the same container; the
/// waiter queues, the timeout timer and the awaiting task all share it.
pub struct Future<T> {
    inner: Rc<RefCell<Inner<T>>>,
    handle: Handle,
}

impl<T> Clone for Future<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            handle: self.handle.clone(),
        }
    }
}

impl<T: 'static> Future<T> {
    /// Creates a pending future bound to the given event loop.
    pub fn new(handle: &Handle) -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                state: FutureState::Pending,
                outcome: None,
                callbacks: Vec::new(),
                timeout: None,
            })),
            handle: handle.clone(),
        }
    }

    /// Creates a pending future that cancels itself after `timeout`.
    ///
    /// The timer is disarmed as soon as the future is resolved, so a
    /// timeout and an explicit [`cancel`](Self::cancel) are the same event.
    pub fn with_timeout(handle: &Handle, timeout: Option<Duration>) -> Self {
        let future = Self::new(handle);

        if let Some(delay) = timeout {
            let weak = Rc::downgrade(&future.inner);
            let loop_handle = handle.clone();

            let timer = handle.call_later(delay, move || {
                if let Some(inner) = weak.upgrade() {
                    Future {
                        inner,
                        handle: loop_handle,
                    }
                    .cancel();
                }
            });

            future.inner.borrow_mut().timeout = Some(timer);
        }

        future
    }

    /// Returns the current state.
    pub fn state(&self) -> FutureState {
        self.inner.borrow().state
    }

    /// Returns `true` once the future is finished or cancelled.
    pub fn done(&self) -> bool {
        self.state() != FutureState::Pending
    }

    /// Returns `true` if the future was cancelled.
    pub fn cancelled(&self) -> bool {
        self.state() == FutureState::Cancelled
    }

    /// Returns the event loop this future reports to.
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Marks the future finished with `value` and schedules its callbacks.
    ///
    /// # Errors
    ///
    /// [`Error::IllegalState`] if the future is already done.
    pub fn set_result(&self, value: T) -> Result<()> {
        self.resolve(FutureState::Finished, Some(Ok(value)))
    }

    /// Marks the future finished with `error` and schedules its callbacks.
    ///
    /// # Errors
    ///
    /// [`Error::IllegalState`] if the future is already done.
    pub fn set_error(&self, error: Error) -> Result<()> {
        self.resolve(FutureState::Finished, Some(Err(error)))
    }

    /// Cancels the future if it is still pending.
    ///
    /// Returns `false` (and does nothing) if it was already done.
    pub fn cancel(&self) -> bool {
        self.resolve(FutureState::Cancelled, None).is_ok()
    }

    /// Registers a callback invoked once the future is done.
    ///
    /// Callbacks run from the event loop in registration order. If the
    /// future is already done the callback is scheduled right away, still
    /// asynchronously.
    pub fn add_done_callback(&self, callback: impl FnOnce(&Future<T>) + 'static) {
        let callback: DoneCallback<T> = Box::new(callback);

        let mut inner = self.inner.borrow_mut();
        if inner.state == FutureState::Pending {
            inner.callbacks.push(callback);
            return;
        }
        drop(inner);

        self.schedule(callback);
    }

    /// Returns the stored error, if the future finished with one.
    pub fn error(&self) -> Option<Error> {
        match &self.inner.borrow().outcome {
            Some(Err(err)) => Some(err.clone()),
            _ => None,
        }
    }

    /// Returns `true` if both handles refer to the same future.
    pub fn ptr_eq(&self, other: &Future<T>) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Moves the outcome out of the future.
    pub(crate) fn take_result(&self) -> Result<T> {
        let mut inner = self.inner.borrow_mut();

        match inner.state {
            FutureState::Pending => Err(Error::IllegalState("result is not ready")),
            FutureState::Cancelled => Err(Error::Cancelled),
            FutureState::Finished => inner
                .outcome
                .take()
                .unwrap_or(Err(Error::IllegalState("result was already taken"))),
        }
    }

    fn resolve(&self, state: FutureState, outcome: Option<Result<T>>) -> Result<()> {
        let (callbacks, timeout) = {
            let mut inner = self.inner.borrow_mut();
            if inner.state != FutureState::Pending {
                return Err(Error::IllegalState("future is already done"));
            }

            inner.state = state;
            inner.outcome = outcome;

            (mem::take(&mut inner.callbacks), inner.timeout.take())
        };

        if let Some(timer) = timeout {
            timer.cancel();
        }

        for callback in callbacks {
            self.schedule(callback);
        }

        Ok(())
    }

    fn schedule(&self, callback: DoneCallback<T>) {
        let this = self.clone();
        self.handle.call_soon(move || callback(&this));
    }
}

impl<T: Clone + 'static> Future<T> {
    /// Returns a clone of the stored value.
    ///
    /// # Errors
    ///
    /// - [`Error::Cancelled`] if the future was cancelled,
    /// - the stored error if it finished with one,
    /// - [`Error::IllegalState`] if it is still pending.
    pub fn result(&self) -> Result<T> {
        let inner = self.inner.borrow();

        match inner.state {
            FutureState::Pending => Err(Error::IllegalState("result is not ready")),
            FutureState::Cancelled => Err(Error::Cancelled),
            FutureState::Finished => inner
                .outcome
                .clone()
                .unwrap_or(Err(Error::IllegalState("result was already taken"))),
        }
    }
}

impl<T> fmt::Debug for Future<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Future")
            .field("state", &self.inner.borrow().state)
            .finish()
    }
}

/// Awaitable view of a [`Future`], produced by `.await`.
pub struct Wait<T> {
    future: Future<T>,
    waker: Option<Rc<RefCell<Waker>>>,
}

impl<T: Clone + 'static> std::future::Future for Wait<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        if this.future.done() {
            return Poll::Ready(this.future.result());
        }

        match &this.waker {
            Some(slot) => {
                let mut waker = slot.borrow_mut();
                if !waker.will_wake(cx.waker()) {
                    *waker = cx.waker().clone();
                }
            }
            None => {
                let slot = Rc::new(RefCell::new(cx.waker().clone()));
                let registered = slot.clone();

                this.future
                    .add_done_callback(move |_| registered.borrow().wake_by_ref());
                this.waker = Some(slot);
            }
        }

        Poll::Pending
    }
}

impl<T: Clone + 'static> IntoFuture for Future<T> {
    type Output = Result<T>;
    type IntoFuture = Wait<T>;

    fn into_future(self) -> Wait<T> {
        Wait {
            future: self,
            waker: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EventLoop;

    use std::cell::RefCell;
    use std::rc::Rc;

    /// Runs the loop until everything already scheduled has happened.
    fn settle(event_loop: &EventLoop) {
        let handle = event_loop.handle();
        let stop = handle.clone();
        handle.call_later(Duration::from_millis(10), move || stop.stop());
        event_loop.run_forever().unwrap();
    }

    #[test]
    fn callbacks_fire_in_registration_order_after_resolution() {
        let event_loop = EventLoop::new().unwrap();
        let future = Future::<u32>::new(&event_loop.handle());
        let seen = Rc::new(RefCell::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let seen = seen.clone();
            future.add_done_callback(move |f| seen.borrow_mut().push((tag, f.result().unwrap())));
        }

        future.set_result(7).unwrap();
        assert!(seen.borrow().is_empty(), "callbacks must not run synchronously");

        settle(&event_loop);
        assert_eq!(
            *seen.borrow(),
            vec![("first", 7), ("second", 7), ("third", 7)]
        );
    }

    #[test]
    fn resolving_twice_is_an_illegal_state() {
        let event_loop = EventLoop::new().unwrap();
        let future = Future::<u32>::new(&event_loop.handle());

        future.set_result(1).unwrap();
        assert!(matches!(future.set_result(2), Err(Error::IllegalState(_))));
        assert!(matches!(
            future.set_error(Error::Cancelled),
            Err(Error::IllegalState(_))
        ));
        assert!(!future.cancel());
        assert_eq!(future.result().unwrap(), 1);
    }

    #[test]
    fn cancelled_future_reports_cancellation() {
        let event_loop = EventLoop::new().unwrap();
        let future = Future::<u32>::new(&event_loop.handle());

        assert!(future.cancel());
        assert!(future.cancelled());
        assert!(future.result().unwrap_err().is_cancelled());
    }

    #[test]
    fn stored_error_is_returned_by_result() {
        let event_loop = EventLoop::new().unwrap();
        let future = Future::<u32>::new(&event_loop.handle());

        future
            .set_error(Error::IllegalValue("out of range"))
            .unwrap();

        assert!(matches!(future.result(), Err(Error::IllegalValue(_))));
        assert!(matches!(future.error(), Some(Error::IllegalValue(_))));
    }

    #[test]
    fn late_callback_is_still_scheduled_asynchronously() {
        let event_loop = EventLoop::new().unwrap();
        let future = Future::<u32>::new(&event_loop.handle());
        future.set_result(3).unwrap();

        let fired = Rc::new(RefCell::new(false));
        let flag = fired.clone();
        future.add_done_callback(move |_| *flag.borrow_mut() = true);

        assert!(!*fired.borrow());
        settle(&event_loop);
        assert!(*fired.borrow());
    }

    #[test]
    fn timeout_cancels_a_pending_future() {
        let event_loop = EventLoop::new().unwrap();
        let future = Future::<()>::with_timeout(&event_loop.handle(), Some(Duration::from_millis(5)));

        let waited = future.clone();
        let outcome = event_loop
            .run_until_complete(async move { waited.await })
            .unwrap();

        assert!(outcome.unwrap_err().is_cancelled());
        assert!(future.cancelled());
    }

    #[test]
    fn resolution_disarms_the_timeout() {
        let event_loop = EventLoop::new().unwrap();
        let handle = event_loop.handle();
        let future = Future::<u32>::with_timeout(&handle, Some(Duration::from_millis(5)));
        future.set_result(11).unwrap();

        event_loop
            .run_until_complete({
                let handle = handle.clone();
                async move { handle.sleep(Duration::from_millis(20)).await }
            })
            .unwrap()
            .unwrap();

        assert_eq!(future.state(), FutureState::Finished);
        assert_eq!(future.result().unwrap(), 11);
    }
}
