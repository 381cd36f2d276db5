//! Binary semaphore used to wake idle workers exactly when work exists.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// A post/wait flag: `post` sets it and wakes a waiter, a successful `wait`
/// consumes it. Posting an already posted signal is a no-op, so a burst of
/// posts wakes at most one waiter unless they are consumed in between.
#[derive(Debug, Default)]
pub struct BinarySignal {
    posted: Mutex<bool>,
    cond: Condvar,
}

impl BinarySignal {
    pub fn new(posted: bool) -> Self {
        Self {
            posted: Mutex::new(posted),
            cond: Condvar::new(),
        }
    }

    pub fn post(&self) {
        *self.lock() = true;
        self.cond.notify_one();
    }

    /// Sets the flag and wakes every waiter; only one of them consumes it.
    pub fn post_all(&self) {
        *self.lock() = true;
        self.cond.notify_all();
    }

    pub fn reset(&self) {
        *self.lock() = false;
    }

    pub fn is_posted(&self) -> bool {
        *self.lock()
    }

    /// Blocks until the signal is posted, then consumes it.
    pub fn wait(&self) {
        let mut posted = self
            .cond
            .wait_while(self.lock(), |posted| !*posted)
            .unwrap_or_else(PoisonError::into_inner);
        *posted = false;
    }

    /// Like [`wait`](Self::wait) but gives up after `timeout`.
    ///
    /// Returns true when the signal was consumed.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (mut posted, _) = self
            .cond
            .wait_timeout_while(self.lock(), timeout, |posted| !*posted)
            .unwrap_or_else(PoisonError::into_inner);

        if *posted {
            *posted = false;
            true
        } else {
            false
        }
    }

    fn lock(&self) -> MutexGuard<'_, bool> {
        self.posted.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
