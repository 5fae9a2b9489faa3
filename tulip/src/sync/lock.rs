use super::waiters::WaiterQueue;
use crate::error::{Error, Result};
use crate::runtime::Handle;

use std::cell::Cell;
use std::fmt;
use std::time::Duration;

/// A primitive lock for tasks.
///
/// A `Lock` is either locked or unlocked and is not owned by any
/// particular task: whoever holds it is expected to call
/// [`release`](Self::release). Blocked callers are served strictly in
/// arrival order, and each release wakes exactly one of them.
///
/// # Examples
///
/// ```rust,ignore
/// let lock = Lock::new(&handle);
///
/// if lock.acquire(None).await {
///     // critical section
///     lock.release()?;
/// }
/// ```
pub struct Lock {
    locked: Cell<bool>,
    waiters: WaiterQueue,
}

impl Lock {
    /// Creates an unlocked lock.
    pub fn new(handle: &Handle) -> Self {
        Self {
            locked: Cell::new(false),
            waiters: WaiterQueue::new(handle, true),
        }
    }

    /// Returns `true` if the lock is held.
    pub fn locked(&self) -> bool {
        self.locked.get()
    }

    /// Acquires the lock, waiting at most `timeout`.
    ///
    /// Returns immediately when the lock is free and nobody is queued.
    /// Returns `false` if the timeout expired first; the lock state is then
    /// untouched.
    pub async fn acquire(&self, timeout: Option<Duration>) -> bool {
        if self.waiters.is_empty() && !self.locked.get() {
            self.locked.set(true);
            return true;
        }

        if !self.waiters.park(timeout).wait().await {
            return false;
        }

        self.locked.set(true);
        true
    }

    /// Acquires the lock and returns a guard releasing it on drop.
    ///
    /// Returns `None` if the timeout expired first.
    pub async fn acquire_guard(&self, timeout: Option<Duration>) -> Option<LockGuard<'_>> {
        if self.acquire(timeout).await {
            Some(LockGuard { lock: self })
        } else {
            None
        }
    }

    /// Releases the lock and lets the first queued caller take it.
    ///
    /// # Errors
    ///
    /// [`Error::IllegalState`] if the lock is not held.
    pub fn release(&self) -> Result<()> {
        if !self.locked.get() {
            return Err(Error::IllegalState("lock is not acquired"));
        }

        self.locked.set(false);
        self.waiters.wake_one();

        Ok(())
    }
}

impl fmt::Display for Lock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = if self.locked() { "locked" } else { "unlocked" };
        write!(f, "<Lock [{state}]>")
    }
}

/// Releases a [`Lock`] when dropped. Created by [`Lock::acquire_guard`].
pub struct LockGuard<'a> {
    lock: &'a Lock,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        let _ = self.lock.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EventLoop;

    use std::rc::Rc;

    #[test]
    fn fast_path_and_double_release() {
        let event_loop = EventLoop::new().unwrap();
        let handle = event_loop.handle();
        let lock = Rc::new(Lock::new(&handle));

        let inner = lock.clone();
        event_loop
            .run_until_complete(async move {
                assert!(inner.acquire(None).await);
                assert!(inner.locked());
                assert_eq!(inner.to_string(), "<Lock [locked]>");

                inner.release().unwrap();
                assert!(matches!(inner.release(), Err(Error::IllegalState(_))));
            })
            .unwrap();

        assert_eq!(lock.to_string(), "<Lock [unlocked]>");
    }

    #[test]
    fn timed_out_acquire_leaves_the_lock_alone() {
        let event_loop = EventLoop::new().unwrap();
        let handle = event_loop.handle();
        let lock = Rc::new(Lock::new(&handle));

        let inner = lock.clone();
        event_loop
            .run_until_complete(async move {
                assert!(inner.acquire(None).await);
                assert!(!inner.acquire(Some(Duration::from_millis(5))).await);
                assert!(inner.locked());

                inner.release().unwrap();
                assert!(inner.acquire(Some(Duration::ZERO)).await);
            })
            .unwrap();
    }

    #[test]
    fn guard_releases_on_drop() {
        let event_loop = EventLoop::new().unwrap();
        let handle = event_loop.handle();
        let lock = Rc::new(Lock::new(&handle));

        let inner = lock.clone();
        event_loop
            .run_until_complete(async move {
                {
                    let _guard = inner.acquire_guard(None).await.unwrap();
                    assert!(inner.locked());
                }
                assert!(!inner.locked());
            })
            .unwrap();
    }

    #[test]
    fn cancelled_waiter_passes_the_lock_on() {
        let event_loop = EventLoop::new().unwrap();
        let handle = event_loop.handle();
        let lock = Rc::new(Lock::new(&handle));

        let outcome = {
            let lock = lock.clone();
            let handle = handle.clone();

            event_loop.run_until_complete(async move {
                assert!(lock.acquire(None).await);

                let doomed = handle.spawn({
                    let lock = lock.clone();
                    async move { lock.acquire(None).await }
                });
                let patient = handle.spawn({
                    let lock = lock.clone();
                    async move { lock.acquire(None).await }
                });

                handle.sleep(Duration::from_millis(1)).await.unwrap();

                lock.release().unwrap();
                doomed.cancel();

                patient.await.unwrap()
            })
        };

        assert!(outcome.unwrap());
        assert!(lock.locked());
    }
}
