//! A small seam for wall-clock time, so idle-timeout tests can advance time
//! deterministically instead of sleeping for real.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Supplies "now" as milliseconds since an arbitrary but fixed epoch, the
/// same unit [`crate::connection::IdleDeadline`] stores its deadlines in.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> i64;
}

/// The clock used outside of tests: real wall-clock time relative to the
/// instant the pool was constructed.
#[derive(Debug)]
pub struct SystemClock {
    epoch: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        self.epoch.elapsed().as_millis() as i64
    }
}

/// A manually-advanced clock for tests.
#[derive(Debug, Clone)]
pub struct FakeClock {
    millis: Arc<AtomicI64>,
}

impl FakeClock {
    pub fn new() -> Self {
        Self {
            millis: Arc::new(AtomicI64::new(0)),
        }
    }

    pub fn advance(&self, millis: i64) {
        self.millis.fetch_add(millis, Ordering::SeqCst);
    }
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for FakeClock {
    fn now_millis(&self) -> i64 {
        self.millis.load(Ordering::SeqCst)
    }
}
