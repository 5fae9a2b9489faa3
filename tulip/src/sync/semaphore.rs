use super::waiters::WaiterQueue;
use crate::error::{Error, Result};
use crate::runtime::Handle;

use std::cell::Cell;
use std::fmt;
use std::time::Duration;

/// A counting semaphore for tasks.
///
/// The counter is decremented by each [`acquire`](Self::acquire) and
/// incremented by each [`release`](Self::release); it never goes below
/// zero. Callers that find it at zero wait in arrival order.
///
/// A bounded semaphore additionally refuses to be released above its
/// initial value.
pub struct Semaphore {
    value: Cell<usize>,

    /// Initial value, when bounded.
    bound: Option<usize>,

    /// Set while the counter is at zero.
    locked: Cell<bool>,

    waiters: WaiterQueue,
}

/// Permits held by a semaphore built with [`Semaphore::with_default_value`].
pub const DEFAULT_SEMAPHORE_VALUE: usize = 1;

impl Semaphore {
    /// Creates an unbounded semaphore with a single permit.
    pub fn with_default_value(handle: &Handle) -> Self {
        Self::new(handle, DEFAULT_SEMAPHORE_VALUE)
    }

    /// Creates an unbounded semaphore with `value` permits.
    pub fn new(handle: &Handle, value: usize) -> Self {
        Self::with_bound(handle, value, None)
    }

    /// Creates a semaphore with `value` permits that cannot be released
    /// above `value`.
    pub fn bounded(handle: &Handle, value: usize) -> Self {
        Self::with_bound(handle, value, Some(value))
    }

    fn with_bound(handle: &Handle, value: usize, bound: Option<usize>) -> Self {
        Self {
            value: Cell::new(value),
            bound,
            locked: Cell::new(value == 0),
            waiters: WaiterQueue::new(handle, true),
        }
    }

    /// Returns `true` if the semaphore cannot be acquired immediately.
    pub fn locked(&self) -> bool {
        self.locked.get()
    }

    /// The number of permits currently available.
    pub fn value(&self) -> usize {
        self.value.get()
    }

    /// Takes one permit, waiting at most `timeout`.
    ///
    /// Returns `false` if the timeout expired first.
    pub async fn acquire(&self, timeout: Option<Duration>) -> bool {
        if self.waiters.is_empty() && self.value.get() > 0 {
            self.take_permit();
            return true;
        }

        if !self.waiters.park(timeout).wait().await {
            return false;
        }

        self.take_permit();
        true
    }

    /// Takes one permit and returns a guard giving it back on drop.
    ///
    /// Returns `None` if the timeout expired first.
    pub async fn acquire_guard(&self, timeout: Option<Duration>) -> Option<SemaphoreGuard<'_>> {
        if self.acquire(timeout).await {
            Some(SemaphoreGuard { semaphore: self })
        } else {
            None
        }
    }

    /// Gives one permit back and wakes the first queued caller.
    ///
    /// # Errors
    ///
    /// [`Error::IllegalValue`] if the semaphore is bounded and already at
    /// its initial value.
    pub fn release(&self) -> Result<()> {
        if self.bound.is_some_and(|bound| self.value.get() >= bound) {
            return Err(Error::IllegalValue("semaphore released too many times"));
        }

        self.value.set(self.value.get() + 1);
        self.locked.set(false);
        self.waiters.wake_one();

        Ok(())
    }

    fn take_permit(&self) {
        let value = self.value.get().saturating_sub(1);

        self.value.set(value);
        if value == 0 {
            self.locked.set(true);
        }
    }
}

impl fmt::Display for Semaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.locked() {
            write!(f, "<Semaphore [locked]>")
        } else {
            write!(f, "<Semaphore [unlocked,value:{}]>", self.value())
        }
    }
}

/// Gives a permit back when dropped. Created by
/// [`Semaphore::acquire_guard`].
pub struct SemaphoreGuard<'a> {
    semaphore: &'a Semaphore,
}

impl Drop for SemaphoreGuard<'_> {
    fn drop(&mut self) {
        let _ = self.semaphore.release();
    }
}
