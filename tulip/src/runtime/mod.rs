//! Core runtime components.
//!
//! This module contains the event loop and everything it schedules.
//!
//! It is responsible for:
//! - running ready callbacks in FIFO order,
//! - firing timers by deadline,
//! - stepping tasks when the futures they await resolve,
//! - waiting on the proactor for I/O completions.
//!
//! Most users interact with [`EventLoop`] and [`Handle`] rather than with
//! the submodules directly.

mod builder;
mod core;
mod remote;
mod timer;

pub mod task;

pub use self::builder::EventLoopBuilder;
pub use self::core::{EventLoop, Handle};
pub use self::remote::Remote;
pub use self::timer::TimerHandle;

pub(crate) use self::builder::Config;
pub(crate) use self::remote::Shared;
