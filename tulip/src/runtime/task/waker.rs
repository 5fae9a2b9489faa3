use crate::runtime::remote::Shared;

use std::mem;
use std::sync::Arc;
use std::task::{RawWaker, RawWakerVTable, Waker};

/// What a task's waker carries: the task identifier and the loop's
/// thread-safe wake list.
///
/// Tasks themselves are single-threaded (`Rc`) and owned by the loop, so
/// the waker only names the task; the loop resolves the identifier when
/// it drains the wake list.
pub(crate) struct TaskWaker {
    id: usize,
    shared: Arc<Shared>,
}

static VTABLE: RawWakerVTable = RawWakerVTable::new(clone_raw, wake_raw, wake_by_ref_raw, drop_raw);

/// Creates a [`Waker`] that reschedules task `id` when woken.
///
/// # Safety
///
/// The pointer stored inside the `RawWaker` originates from
/// `Arc::into_raw` and every vtable function keeps the reference count
/// balanced.
pub(crate) fn make_waker(shared: Arc<Shared>, id: usize) -> Waker {
    let waker = Arc::new(TaskWaker { id, shared });

    unsafe { Waker::from_raw(RawWaker::new(Arc::into_raw(waker) as *const (), &VTABLE)) }
}

/// Clones the raw waker.
///
/// This increments the reference count of the underlying `Arc<TaskWaker>`.
fn clone_raw(ptr: *const ()) -> RawWaker {
    let arc = unsafe { Arc::<TaskWaker>::from_raw(ptr as *const TaskWaker) };
    let cloned = arc.clone();
    mem::forget(arc);

    RawWaker::new(Arc::into_raw(cloned) as *const (), &VTABLE)
}

/// Wakes the task and consumes the waker.
fn wake_raw(ptr: *const ()) {
    let arc = unsafe { Arc::<TaskWaker>::from_raw(ptr as *const TaskWaker) };
    arc.shared.wake_task(arc.id);
}

/// Wakes the task without consuming the waker.
fn wake_by_ref_raw(ptr: *const ()) {
    let arc = unsafe { Arc::<TaskWaker>::from_raw(ptr as *const TaskWaker) };
    arc.shared.wake_task(arc.id);
    mem::forget(arc);
}

/// Drops the raw waker.
fn drop_raw(ptr: *const ()) {
    unsafe { drop(Arc::<TaskWaker>::from_raw(ptr as *const TaskWaker)) };
}
