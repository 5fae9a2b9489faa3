/// Task is idle and not scheduled.
///
/// The task is suspended on some future and waits for its waker.
pub(crate) const IDLE: usize = 0;

/// Task is queued for execution.
///
/// A step has been placed on the event loop's ready queue.
pub(crate) const QUEUED: usize = 1;

/// Task is currently being polled.
pub(crate) const RUNNING: usize = 2;

/// Task has completed execution.
///
/// The computation returned `Poll::Ready` and will not be polled again.
pub(crate) const COMPLETED: usize = 3;

/// Task has been cancelled.
///
/// The computation has been (or is about to be) dropped and the
/// task's result future is cancelled.
pub(crate) const CANCELLED: usize = 4;
