//! # Tulip
//!
//! **Tulip** is a small cooperative async runtime built around a
//! single-threaded event loop and completion-based ("proactor") I/O.
//!
//! Everything runs on the thread that owns the [`EventLoop`]. Suspension
//! points are explicit: a task only gives up control when it awaits a
//! [`Future`], and it is resumed exactly once, in scheduler order, when that
//! future resolves. There is no ambient loop: futures, primitives and
//! transports are all handed a [`Handle`] when they are created.
//!
//! Tulip provides:
//!
//! - **Single-assignment futures** with done callbacks, cancellation and
//!   timeouts
//! - **Tasks** driving ordinary Rust `async` code on the loop
//! - **Synchronization primitives** (lock, semaphore, event, condition) with
//!   FIFO waiter queues
//! - **A proactor** turning socket operations into futures
//! - **Transports and protocols** for callback-driven connection handling
//! - **Entry-point macros**: `#[tulip::main]` and `#[tulip::test]`
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::time::Duration;
//! use tulip::Handle;
//! use tulip::sync::Lock;
//!
//! #[tulip::main]
//! async fn main(handle: Handle) {
//!     let lock = std::rc::Rc::new(Lock::new(&handle));
//!
//!     let task = handle.spawn({
//!         let lock = lock.clone();
//!         async move { lock.acquire(None).await }
//!     });
//!
//!     handle.sleep(Duration::from_millis(10)).await.unwrap();
//!     assert!(task.await.unwrap());
//! }
//! ```
//!
//! ## Modules
//!
//! - [`sync`]: Lock, Semaphore, Event and Condition
//! - [`net`]: Sockets, transports, protocols and servers
//! - [`proactor`]: The completion-based I/O engine
//! - [`task`]: Spawned computations
//!
//! ## Logging
//!
//! Tulip logs through the [`log`] facade; install any logger to see the
//! loop's diagnostics.

mod error;
mod future;
mod runtime;
mod utils;

pub mod net;
pub mod proactor;
pub mod sync;

pub use error::{Error, Result};
pub use future::{Future, FutureState, Wait};
pub use net::{Protocol, Server, Socket, Transport, TransportOptions};
pub use proactor::Proactor;
pub use runtime::task;
pub use runtime::task::Task;
pub use runtime::{EventLoop, EventLoopBuilder, Handle, Remote, TimerHandle};

pub use tulip_macros::*;
