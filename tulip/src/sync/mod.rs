//! Synchronization primitives for tasks.
//!
//! These primitives coordinate tasks running on one event loop. They never
//! block the thread: a caller that cannot proceed parks a [`Future`] on the
//! primitive's waiter queue and is resumed once that future is resolved.
//!
//! The current primitives include:
//! - [`Lock`], a primitive mutual exclusion lock,
//! - [`Semaphore`], a counting semaphore, optionally bounded,
//! - [`Event`], a flag waking every waiter when set,
//! - [`Condition`], a condition variable built on a [`Lock`].
//!
//! ## Design notes
//!
//! - Waiters are served strictly in arrival order (FIFO), except for
//!   [`Event`], which wakes all of them at once.
//! - Timing out and being cancelled are the same thing: both make the wait
//!   return `false`. Misuse, such as releasing a lock nobody holds, is an
//!   [`Error`](crate::Error) instead.
//! - Primitives are single-threaded; share them between tasks with `Rc`.
//!
//! [`Future`]: crate::Future

mod condition;
mod event;
mod lock;
mod semaphore;
mod waiters;

pub use condition::Condition;
pub use event::Event;
pub use lock::{Lock, LockGuard};
pub use semaphore::{DEFAULT_SEMAPHORE_VALUE, Semaphore, SemaphoreGuard};
