use super::waiters::WaiterQueue;
use crate::runtime::Handle;

use std::cell::Cell;
use std::fmt;
use std::time::Duration;

/// A flag tasks can wait on.
///
/// [`set`](Self::set) wakes every task currently waiting; tasks calling
/// [`wait`](Self::wait) while the flag is set return without suspending.
pub struct Event {
    value: Cell<bool>,
    waiters: WaiterQueue,
}

impl Event {
    /// Creates an event with the flag cleared.
    pub fn new(handle: &Handle) -> Self {
        Self {
            value: Cell::new(false),
            waiters: WaiterQueue::new(handle, false),
        }
    }

    /// Returns `true` if the flag is set.
    pub fn is_set(&self) -> bool {
        self.value.get()
    }

    /// Sets the flag and wakes every waiting task. Idempotent.
    pub fn set(&self) {
        if !self.value.replace(true) {
            self.waiters.wake_all();
        }
    }

    /// Clears the flag. Tasks already woken are unaffected.
    pub fn clear(&self) {
        self.value.set(false);
    }

    /// Waits until the flag is set, at most `timeout`.
    ///
    /// Returns `false` only if the timeout expired first.
    pub async fn wait(&self, timeout: Option<Duration>) -> bool {
        if self.value.get() {
            return true;
        }

        self.waiters.park(timeout).wait().await
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = if self.is_set() { "set" } else { "unset" };
        write!(f, "<Event [{state}]>")
    }
}
