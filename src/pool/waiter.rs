//! The waiter park: a single mutex/condvar pair a thread blocks on when no
//! connection has a free stream slot.
//!
//! Deliberately not FIFO: whoever wakes up
//! and wins the CAS on a connection's `in_flight` gets it. Per-connection
//! waiter lists are explicitly not attempted.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
pub(crate) struct WaiterPark {
    lock: Mutex<()>,
    condvar: Condvar,
    waiters: AtomicUsize,
}

/// Outcome of parking for a while.
pub(crate) enum Wake {
    /// Something happened (signal, spurious wake, or timeout elapsed) —
    /// caller should rescan and retry.
    Rescan,
    /// The deadline passed while parked.
    DeadlineElapsed,
}

impl WaiterPark {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Park until `deadline`, or forever if `deadline` is `None`. `waiters`
    /// is incremented only once `lock` is held, right before
    /// `wait`/`wait_timeout` — incrementing it earlier would let a
    /// signaler's `notify_*` land in the gap between the increment and the
    /// actual `condvar.wait` call, where it would be lost.
    pub(crate) fn park_until(&self, deadline: Option<Instant>) -> Wake {
        let guard = self.lock.lock().unwrap();
        self.waiters.fetch_add(1, Ordering::SeqCst);

        let result = match deadline {
            None => {
                let _unused = self.condvar.wait(guard).unwrap();
                Wake::Rescan
            }
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    Wake::DeadlineElapsed
                } else {
                    let (_unused, timeout_result) = self
                        .condvar
                        .wait_timeout(guard, deadline - now)
                        .unwrap();
                    if timeout_result.timed_out() {
                        Wake::DeadlineElapsed
                    } else {
                        Wake::Rescan
                    }
                }
            }
        };

        self.waiters.fetch_sub(1, Ordering::SeqCst);
        result
    }

    /// Cheap check used by signalers to skip the lock entirely when nobody
    /// is parked.
    fn any_waiters(&self) -> bool {
        self.waiters.load(Ordering::SeqCst) != 0
    }

    /// Wake a single waiter. Used by `return` and by a successful new
    /// connection creation.
    pub(crate) fn signal_one(&self) {
        if !self.any_waiters() {
            return;
        }
        let _guard = self.lock.lock().unwrap();
        self.condvar.notify_one();
    }

    /// Wake every waiter. Used by shutdown.
    pub(crate) fn signal_all(&self) {
        if !self.any_waiters() {
            return;
        }
        let _guard = self.lock.lock().unwrap();
        self.condvar.notify_all();
    }
}

pub(crate) fn deadline_from_timeout(timeout: Option<Duration>) -> Option<Instant> {
    timeout.map(|d| Instant::now() + d)
}
