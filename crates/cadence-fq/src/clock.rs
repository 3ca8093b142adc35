//! # Clock Sources
//!
//! The scheduler reads time as nanoseconds on a monotonic axis. Production
//! hosts use [`MonotonicClock`]; tests and simulations drive a
//! [`ManualClock`] so pacing and garbage-collection behavior can be
//! exercised deterministically.

use quanta::Instant;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub const NSEC_PER_SEC: u64 = 1_000_000_000;
pub const NSEC_PER_MSEC: u64 = 1_000_000;
pub const NSEC_PER_USEC: u64 = 1_000;

/// A monotonic nanosecond time source.
///
/// All timestamps handed to the scheduler (packet deadlines, pacing
/// instants, wakeups) live on the same axis as this clock.
pub trait Clock {
    /// Current time in nanoseconds since an arbitrary fixed epoch.
    fn now_ns(&self) -> u64;
}

// ─── MonotonicClock ─────────────────────────────────────────────────────────

/// Nanosecond clock anchored at its creation instant.
pub struct MonotonicClock {
    epoch: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        MonotonicClock {
            epoch: Instant::now(),
        }
    }
}

impl Clock for MonotonicClock {
    fn now_ns(&self) -> u64 {
        // u64 nanoseconds cover ~584 years from the epoch.
        self.epoch.elapsed().as_nanos() as u64
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

// ─── ManualClock ────────────────────────────────────────────────────────────

/// A hand-driven clock. Clones share the same underlying time, so a test
/// can keep one handle and advance time while the scheduler owns another.
#[derive(Clone)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(start_ns: u64) -> Self {
        ManualClock {
            now: Arc::new(AtomicU64::new(start_ns)),
        }
    }

    /// Move time forward by `delta_ns`.
    pub fn advance(&self, delta_ns: u64) {
        self.now.fetch_add(delta_ns, Ordering::Relaxed);
    }

    /// Jump to an absolute instant. Must not move backwards.
    pub fn set(&self, now_ns: u64) {
        self.now.store(now_ns, Ordering::Relaxed);
    }
}

impl Clock for ManualClock {
    fn now_ns(&self) -> u64 {
        self.now.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_clock_advances() {
        let clock = MonotonicClock::new();
        let t1 = clock.now_ns();
        std::thread::sleep(std::time::Duration::from_millis(1));
        let t2 = clock.now_ns();
        assert!(t2 > t1);
    }

    #[test]
    fn manual_clock_is_shared_between_clones() {
        let clock = ManualClock::new(100);
        let other = clock.clone();
        clock.advance(50);
        assert_eq!(other.now_ns(), 150);
        other.set(1_000);
        assert_eq!(clock.now_ns(), 1_000);
    }
}
