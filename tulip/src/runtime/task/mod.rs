//! Task primitives.
//!
//! A task drives a suspended computation forward: each time a future the
//! computation awaits resolves, the task's waker records it and the event
//! loop queues exactly one more step.
//!
//! It includes:
//! - task state constants,
//! - the thread-safe waker that names a task by identifier,
//! - the [`Task`] handle returned by [`Handle::spawn`](crate::Handle::spawn).

pub(crate) mod core;
pub(crate) mod state;
pub(crate) mod waker;

mod handle;

pub(crate) use self::core::{Runnable, spawn};
pub use handle::Task;
