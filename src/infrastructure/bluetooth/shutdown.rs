//! Process-wide quit flag for a session.
//!
//! Long-running operations poll [`ShutdownSignal::is_requested`] between
//! asynchronous steps. Synchronous callers blocked on a result wait on the
//! companion condition variable and are released by either the result or a
//! shutdown request.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
pub struct ShutdownSignal {
    quit: Mutex<bool>,
    wake: Condvar,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    fn flag(&self) -> MutexGuard<'_, bool> {
        self.quit.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn request(&self) {
        *self.flag() = true;
        self.wake.notify_all();
    }

    pub fn reset(&self) {
        *self.flag() = false;
    }

    pub fn is_requested(&self) -> bool {
        *self.flag()
    }

    /// Wake blocked waiters so they re-check their condition.
    ///
    /// Call after publishing a result; taking the lock first ensures a waiter
    /// that has just checked its condition is already parked.
    pub fn notify(&self) {
        let _guard = self.flag();
        self.wake.notify_all();
    }

    /// Block until `ready` returns true or shutdown is requested.
    ///
    /// Returns true when `ready` was satisfied and false when shutdown woke
    /// the caller first.
    pub fn wait_until<F>(&self, mut ready: F) -> bool
    where
        F: FnMut() -> bool,
    {
        let guard = self.flag();
        let guard = self
            .wake
            .wait_while(guard, |quit| !*quit && !ready())
            .unwrap_or_else(PoisonError::into_inner);
        !*guard || ready()
    }
}
