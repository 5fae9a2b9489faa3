use std::cell::Cell;
use std::cmp::Ordering;
use std::rc::Rc;
use std::time::Instant;

/// An entry in the event loop timer queue.
///
/// `TimerEntry` represents a callback scheduled at a specific
/// deadline. It is stored inside a binary heap ordered by deadline,
/// with the scheduling sequence number breaking ties so that timers
/// sharing a deadline fire in the order they were armed.
///
/// The entry may be cancelled before it fires.
pub(crate) struct TimerEntry {
    /// The time at which the callback becomes ready.
    pub(crate) deadline: Instant,

    /// Monotonic scheduling order.
    pub(crate) sequence: u64,

    /// Callback moved to the ready queue once the deadline is reached.
    pub(crate) callback: Box<dyn FnOnce()>,

    /// Cancellation flag shared with the [`TimerHandle`].
    pub(crate) cancelled: Rc<Cell<bool>>,
}

impl Eq for TimerEntry {}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.sequence == other.sequence
    }
}

impl Ord for TimerEntry {
    /// Orders timer entries by deadline, then by sequence.
    ///
    /// The comparison is **reversed** so that a `BinaryHeap<TimerEntry>`
    /// behaves as a min-heap, where the earliest deadline is popped first.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Handle to a callback scheduled with
/// [`Handle::call_later`](crate::Handle::call_later).
#[derive(Clone)]
pub struct TimerHandle {
    deadline: Instant,
    cancelled: Rc<Cell<bool>>,
}

impl TimerHandle {
    pub(crate) fn new(deadline: Instant, cancelled: Rc<Cell<bool>>) -> Self {
        Self {
            deadline,
            cancelled,
        }
    }

    /// Prevents the callback from running. Idempotent.
    pub fn cancel(&self) {
        self.cancelled.set(true);
    }

    /// Returns `true` once [`cancel`](Self::cancel) has been called.
    pub fn cancelled(&self) -> bool {
        self.cancelled.get()
    }

    /// The instant at which the callback becomes ready.
    pub fn deadline(&self) -> Instant {
        self.deadline
    }
}
