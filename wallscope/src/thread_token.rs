//! Per-thread registration tokens
//!
//! A thread can attach a token to itself (a label plus a mutable task id);
//! the signal handler captures a raw pointer to the current thread's token
//! with every sample, so samples can be attributed to logical units of work
//! rather than bare tids.
//!
//! The handler-side read is a single thread-local pointer load, which is the
//! only operation here that runs in signal context.

#![allow(unsafe_code)] // signal context reads the token through a raw pointer

use std::cell::Cell;
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};

thread_local! {
    static CURRENT_TOKEN: Cell<*const ThreadToken> = const { Cell::new(ptr::null()) };
}

/// Label and task id a thread registered for itself.
///
/// Tokens are leaked on purpose: a pointer captured by the sampler must stay
/// readable even if the registering thread has already exited. One token per
/// registration call, so the leak is bounded by thread churn.
#[derive(Debug)]
pub struct ThreadToken {
    label: &'static str,
    task_id: AtomicU64,
}

impl ThreadToken {
    /// The label the thread registered with.
    #[must_use]
    pub fn label(&self) -> &'static str {
        self.label
    }

    /// Current task id, 0 when none was set.
    #[must_use]
    pub fn task_id(&self) -> u64 {
        self.task_id.load(Ordering::Relaxed)
    }

    /// Update the task id; visible in all samples taken afterwards.
    pub fn set_task_id(&self, task_id: u64) {
        self.task_id.store(task_id, Ordering::Relaxed);
    }
}

/// Register a token for the calling thread, replacing any previous one.
///
/// The returned reference can be kept to update the task id as the thread
/// moves between units of work.
pub fn install(label: impl Into<String>) -> &'static ThreadToken {
    let label: &'static str = Box::leak(label.into().into_boxed_str());
    let token: &'static ThreadToken =
        Box::leak(Box::new(ThreadToken { label, task_id: AtomicU64::new(0) }));
    CURRENT_TOKEN.with(|cell| cell.set(token));
    token
}

/// The calling thread's token, if it installed one.
///
/// Handy inside task code that wants to tag whatever thread it happens to
/// run on, e.g. an async task updating the task id of its current worker.
#[must_use]
pub fn current() -> Option<&'static ThreadToken> {
    // SAFETY: tokens are leaked at registration, so the pointer is either
    // null or valid for the rest of the process.
    unsafe { current_raw().as_ref() }
}

/// The calling thread's token as a raw pointer, null when none registered.
///
/// Safe to call from signal context: `try_with` never initializes or
/// allocates for a const-initialized thread local, and a thread already in
/// teardown simply reports no token.
pub(crate) fn current_raw() -> *const ThreadToken {
    CURRENT_TOKEN.try_with(Cell::get).unwrap_or(ptr::null())
}
