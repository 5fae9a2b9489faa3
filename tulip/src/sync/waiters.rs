use crate::future::{Future, FutureState};
use crate::runtime::Handle;

use std::cell::RefCell;
use std::collections::VecDeque;
use std::time::Duration;

/// FIFO queue of callers blocked on a primitive.
///
/// Every blocked caller owns one entry, a [`Future`] resolved to grant it
/// the resource. An entry leaves the queue exactly once, through its
/// [`Waiter`]: when the caller resumes (granted or timed out) or when the
/// waiting task is dropped.
///
/// Granted entries stay queued until their caller resumes, so a primitive's
/// fast path (`is_empty()`) cannot overtake a caller that was already
/// served.
pub(crate) struct WaiterQueue {
    handle: Handle,
    entries: RefCell<VecDeque<Future<()>>>,

    /// Pass the grant on when a granted waiter is dropped before resuming.
    handoff: bool,
}

impl WaiterQueue {
    pub(crate) fn new(handle: &Handle, handoff: bool) -> Self {
        Self {
            handle: handle.clone(),
            entries: RefCell::new(VecDeque::new()),
            handoff,
        }
    }

    /// Appends an entry for the caller, cancelled after `timeout` if it has
    /// not been granted by then.
    pub(crate) fn park(&self, timeout: Option<Duration>) -> Waiter<'_> {
        let future = Future::with_timeout(&self.handle, timeout);
        self.entries.borrow_mut().push_back(future.clone());

        Waiter {
            queue: self,
            future,
            settled: false,
        }
    }

    /// Grants the first pending entry. Returns `false` if there was none.
    pub(crate) fn wake_one(&self) -> bool {
        self.wake_n(1) == 1
    }

    /// Grants up to `n` pending entries in arrival order, skipping (and
    /// dropping) cancelled ones. Returns how many were granted.
    pub(crate) fn wake_n(&self, n: usize) -> usize {
        let pending: Vec<Future<()>> = {
            let mut entries = self.entries.borrow_mut();
            entries.retain(|entry| !entry.cancelled());

            entries
                .iter()
                .filter(|entry| !entry.done())
                .take(n)
                .cloned()
                .collect()
        };

        for entry in &pending {
            let _ = entry.set_result(());
        }

        pending.len()
    }

    /// Grants every pending entry.
    pub(crate) fn wake_all(&self) -> usize {
        self.wake_n(usize::MAX)
    }

    fn remove(&self, future: &Future<()>) {
        let mut entries = self.entries.borrow_mut();
        if let Some(pos) = entries.iter().position(|entry| entry.ptr_eq(future)) {
            entries.remove(pos);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }
}

/// A caller's place in a [`WaiterQueue`].
///
/// Dropping a waiter that was never awaited to completion removes its
/// entry; if the entry had already been granted, the grant is passed to
/// the next waiter (for queues built with `handoff`).
pub(crate) struct Waiter<'a> {
    queue: &'a WaiterQueue,
    future: Future<()>,
    settled: bool,
}

impl Waiter<'_> {
    /// Suspends until the entry is granted (`true`) or cancelled (`false`).
    pub(crate) async fn wait(mut self) -> bool {
        let granted = self.future.clone().await.is_ok();

        self.settled = true;
        self.queue.remove(&self.future);

        granted
    }
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }

        self.queue.remove(&self.future);

        if self.future.state() == FutureState::Finished {
            if self.queue.handoff {
                self.queue.wake_one();
            }
        } else {
            self.future.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EventLoop;

    use std::rc::Rc;

    fn settle(event_loop: &EventLoop) {
        let handle = event_loop.handle();
        let stop = handle.clone();
        handle.call_later(Duration::from_millis(10), move || stop.stop());
        event_loop.run_forever().unwrap();
    }

    #[test]
    fn wake_one_grants_in_arrival_order() {
        let event_loop = EventLoop::new().unwrap();
        let handle = event_loop.handle();
        let queue = Rc::new(WaiterQueue::new(&handle, true));
        let order = Rc::new(RefCell::new(Vec::new()));

        for name in ["a", "b", "c"] {
            let queue = queue.clone();
            let order = order.clone();
            handle.spawn(async move {
                if queue.park(None).wait().await {
                    order.borrow_mut().push(name);
                }
            });
        }

        settle(&event_loop);
        assert_eq!(queue.len(), 3);

        for _ in 0..3 {
            assert!(queue.wake_one());
            settle(&event_loop);
        }

        assert_eq!(*order.borrow(), vec!["a", "b", "c"]);
        assert!(queue.is_empty());
        assert!(!queue.wake_one());
    }

    #[test]
    fn timed_out_entries_are_removed() {
        let event_loop = EventLoop::new().unwrap();
        let handle = event_loop.handle();
        let queue = Rc::new(WaiterQueue::new(&handle, true));

        let waiting = queue.clone();
        let granted = event_loop
            .run_until_complete(async move {
                waiting.park(Some(Duration::from_millis(5))).wait().await
            })
            .unwrap();

        assert!(!granted);
        assert!(queue.is_empty());
    }

    #[test]
    fn wake_n_skips_cancelled_entries_and_compacts_them() {
        let event_loop = EventLoop::new().unwrap();
        let handle = event_loop.handle();
        let queue = WaiterQueue::new(&handle, false);

        let first = queue.park(None);
        let second = queue.park(None);
        let third = queue.park(None);

        first.future.cancel();

        assert_eq!(queue.wake_n(1), 1);
        assert_eq!(queue.len(), 2);
        assert!(second.future.done() && !second.future.cancelled());
        assert!(!third.future.done());

        drop(first);
        drop(second);
        drop(third);
        assert!(queue.is_empty());
    }

    #[test]
    fn dropped_granted_waiter_hands_off_to_the_next() {
        let event_loop = EventLoop::new().unwrap();
        let handle = event_loop.handle();
        let queue = WaiterQueue::new(&handle, true);

        let first = queue.park(None);
        let second = queue.park(None);

        assert!(queue.wake_one());
        drop(first);

        assert!(second.future.done());
        assert!(!second.future.cancelled());
    }
}
