use super::Lock;
use super::waiters::WaiterQueue;
use crate::error::{Error, Result};
use crate::runtime::Handle;

use std::fmt;
use std::rc::Rc;
use std::time::{Duration, Instant};

/// A condition variable for tasks.
///
/// A `Condition` pairs a [`Lock`] with its own queue of waiting tasks.
/// [`wait`](Self::wait) and [`notify`](Self::notify) must be called while
/// holding the lock.
///
/// # Examples
///
/// ```rust,ignore
/// let cond = Condition::new(&handle);
///
/// cond.acquire(None).await;
/// cond.wait_for(|| ready.get(), None).await?;
/// cond.release()?;
/// ```
pub struct Condition {
    lock: Rc<Lock>,
    waiters: WaiterQueue,
}

impl Condition {
    /// Creates a condition with a fresh lock.
    pub fn new(handle: &Handle) -> Self {
        Self::with_lock(handle, Rc::new(Lock::new(handle)))
    }

    /// Creates a condition around an existing, possibly shared, lock.
    pub fn with_lock(handle: &Handle, lock: Rc<Lock>) -> Self {
        Self {
            lock,
            waiters: WaiterQueue::new(handle, false),
        }
    }

    /// The underlying lock.
    pub fn lock(&self) -> &Rc<Lock> {
        &self.lock
    }

    /// See [`Lock::acquire`].
    pub async fn acquire(&self, timeout: Option<Duration>) -> bool {
        self.lock.acquire(timeout).await
    }

    /// See [`Lock::release`].
    pub fn release(&self) -> Result<()> {
        self.lock.release()
    }

    /// See [`Lock::locked`].
    pub fn locked(&self) -> bool {
        self.lock.locked()
    }

    /// Releases the lock, waits to be notified (at most `timeout`) and
    /// reacquires the lock.
    ///
    /// The lock is held again when this returns, whether the caller was
    /// notified (`Ok(true)`) or timed out (`Ok(false)`).
    ///
    /// # Errors
    ///
    /// [`Error::IllegalState`] if the lock is not held.
    pub async fn wait(&self, timeout: Option<Duration>) -> Result<bool> {
        if !self.lock.locked() {
            return Err(Error::IllegalState("cannot wait on un-acquired lock"));
        }

        self.lock.release()?;

        let notified = self.waiters.park(timeout).wait().await;

        while !self.lock.acquire(None).await {}

        Ok(notified)
    }

    /// Waits until `predicate` returns `true`, at most `timeout` in total.
    ///
    /// Returns the last value of `predicate`.
    ///
    /// # Errors
    ///
    /// [`Error::IllegalState`] if the lock is not held.
    pub async fn wait_for(
        &self,
        mut predicate: impl FnMut() -> bool,
        timeout: Option<Duration>,
    ) -> Result<bool> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut result = predicate();

        while !result {
            let remaining = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    Some(deadline - now)
                }
                None => None,
            };

            self.wait(remaining).await?;
            result = predicate();
        }

        Ok(result)
    }

    /// Wakes up to `n` waiting tasks, in arrival order.
    ///
    /// The lock is not released; woken tasks resume once the caller
    /// releases it.
    ///
    /// # Errors
    ///
    /// [`Error::IllegalState`] if the lock is not held.
    pub fn notify(&self, n: usize) -> Result<()> {
        if !self.lock.locked() {
            return Err(Error::IllegalState("cannot notify on un-acquired lock"));
        }

        self.waiters.wake_n(n);
        Ok(())
    }

    /// Wakes every waiting task.
    ///
    /// # Errors
    ///
    /// [`Error::IllegalState`] if the lock is not held.
    pub fn notify_all(&self) -> Result<()> {
        self.notify(self.waiters.len())
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = if self.locked() { "locked" } else { "unlocked" };
        write!(f, "<Condition [{state}]>")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EventLoop;

    use std::cell::Cell;

    #[test]
    fn wait_and_notify_require_the_lock() {
        let event_loop = EventLoop::new().unwrap();
        let cond = Rc::new(Condition::new(&event_loop.handle()));

        assert!(matches!(cond.notify(1), Err(Error::IllegalState(_))));
        assert!(matches!(cond.notify_all(), Err(Error::IllegalState(_))));

        let inner = cond.clone();
        let outcome = event_loop
            .run_until_complete(async move { inner.wait(None).await })
            .unwrap();

        assert!(matches!(outcome, Err(Error::IllegalState(_))));
    }

    #[test]
    fn timed_out_wait_still_reacquires() {
        let event_loop = EventLoop::new().unwrap();
        let cond = Rc::new(Condition::new(&event_loop.handle()));

        let inner = cond.clone();
        let notified = event_loop
            .run_until_complete(async move {
                assert!(inner.acquire(None).await);
                inner.wait(Some(Duration::from_millis(5))).await
            })
            .unwrap()
            .unwrap();

        assert!(!notified);
        assert!(cond.locked());
        assert_eq!(cond.to_string(), "<Condition [locked]>");
    }

    #[test]
    fn wait_for_gives_up_at_the_deadline() {
        let event_loop = EventLoop::new().unwrap();
        let cond = Rc::new(Condition::new(&event_loop.handle()));
        let calls = Rc::new(Cell::new(0));

        let inner = cond.clone();
        let counter = calls.clone();
        let result = event_loop
            .run_until_complete(async move {
                assert!(inner.acquire(None).await);
                inner
                    .wait_for(
                        move || {
                            counter.set(counter.get() + 1);
                            false
                        },
                        Some(Duration::from_millis(10)),
                    )
                    .await
            })
            .unwrap()
            .unwrap();

        assert!(!result);
        assert!(calls.get() >= 2);
        assert!(cond.locked());
    }

    #[test]
    fn notification_dies_with_a_cancelled_waiter() {
        let event_loop = EventLoop::new().unwrap();
        let handle = event_loop.handle();
        let cond = Rc::new(Condition::new(&handle));

        let park = |cond: Rc<Condition>| async move {
            assert!(cond.acquire(None).await);
            cond.wait(None).await
        };
        let first = handle.spawn(park(cond.clone()));
        let second = handle.spawn(park(cond.clone()));

        let driver = cond.clone();
        let sleeper = handle.clone();
        let (first_cancelled, second_done) = event_loop
            .run_until_complete(async move {
                sleeper.sleep(Duration::from_millis(1)).await.unwrap();

                assert!(driver.acquire(None).await);
                driver.notify(1).unwrap();
                first.cancel();
                driver.release().unwrap();

                sleeper.sleep(Duration::from_millis(5)).await.unwrap();
                (first.cancelled(), second.done())
            })
            .unwrap();

        assert!(first_cancelled);
        assert!(!second_done);
        assert!(!cond.locked());
    }

    #[test]
    fn shared_lock_is_observed_by_both() {
        let event_loop = EventLoop::new().unwrap();
        let handle = event_loop.handle();
        let lock = Rc::new(Lock::new(&handle));
        let cond = Condition::with_lock(&handle, lock.clone());

        assert!(Rc::ptr_eq(cond.lock(), &lock));
        assert!(!cond.locked());
    }
}
