//! Minimal clock seam so the strategy scheduler and job queue timestamps
//! are deterministically testable without wall-clock sleeps.

use chrono::Utc;
use std::sync::atomic::{AtomicI64, Ordering};

/// Anything that can report the current epoch time in milliseconds.
pub trait Clock: Send + Sync {
    /// Current time, milliseconds since the Unix epoch.
    fn now_ms(&self) -> i64;
}

/// Production clock backed by the system wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// Test clock that only advances when told to. Starts at an arbitrary
/// fixed instant so effective-time-window tests can pick any wall time.
#[derive(Debug)]
pub struct SteppingClock {
    now_ms: AtomicI64,
}

impl SteppingClock {
    /// Create a clock fixed at `start_ms`.
    pub fn new(start_ms: i64) -> Self {
        Self {
            now_ms: AtomicI64::new(start_ms),
        }
    }

    /// Advance the clock by `delta_ms` and return the new value.
    pub fn advance(&self, delta_ms: i64) -> i64 {
        self.now_ms.fetch_add(delta_ms, Ordering::SeqCst) + delta_ms
    }

    /// Pin the clock to an absolute value.
    pub fn set(&self, value_ms: i64) {
        self.now_ms.store(value_ms, Ordering::SeqCst);
    }
}

impl Clock for SteppingClock {
    fn now_ms(&self) -> i64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}
