//! Completion flag set by the output writer thread.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Default)]
struct Inner {
    done: Mutex<bool>,
    cond: Condvar,
}

/// Shared flag that turns true once a queued output task has run.
///
/// Clones observe the same flag. The flag never goes back to false.
#[derive(Debug, Clone, Default)]
pub struct Completion {
    inner: Arc<Inner>,
}

impl Completion {
    /// New, not yet completed flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// A flag that is already complete.
    pub fn done() -> Self {
        let completion = Self::new();
        completion.complete();
        completion
    }

    /// Mark complete and wake all waiters.
    pub(crate) fn complete(&self) {
        *self.inner.done.lock() = true;
        self.inner.cond.notify_all();
    }

    /// Check the flag without blocking.
    #[inline]
    pub fn is_done(&self) -> bool {
        *self.inner.done.lock()
    }

    /// Block until the task has run.
    pub fn wait(&self) {
        let mut done = self.inner.done.lock();
        while !*done {
            self.inner.cond.wait(&mut done);
        }
    }

    /// Block for at most `timeout`. Returns whether the task has run.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut done = self.inner.done.lock();
        if !*done {
            self.inner.cond.wait_while_for(&mut done, |done| !*done, timeout);
        }
        *done
    }
}
