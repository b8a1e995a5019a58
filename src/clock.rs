//! Time source abstraction.
//!
//! Algorithms read the current time through a `Clock` instead of calling
//! `SystemTime::now()` directly, so tests can freeze and advance time instead
//! of sleeping.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

/// Source of the current time, in milliseconds since the Unix epoch.
pub trait Clock: Send + Sync + 'static {
    /// Current time in milliseconds since the Unix epoch.
    fn now_ms(&self) -> u64;
}

/// Wall-clock time source backed by `SystemTime`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl SystemClock {
    /// Create a new system clock.
    pub fn new() -> Self {
        Self
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system time before Unix epoch")
            .as_millis() as u64
    }
}

/// Manually controlled clock for deterministic tests.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now_ms: Arc<Mutex<u64>>,
}

impl ManualClock {
    /// Create a clock starting at `start_ms`.
    pub fn new(start_ms: u64) -> Self {
        Self {
            now_ms: Arc::new(Mutex::new(start_ms)),
        }
    }

    /// Set the clock to an absolute time.
    pub fn set(&self, now_ms: u64) {
        *self.now_ms.lock() = now_ms;
    }

    /// Advance the clock by `delta_ms`.
    pub fn advance(&self, delta_ms: u64) {
        let mut guard = self.now_ms.lock();
        *guard += delta_ms;
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        *self.now_ms.lock()
    }
}

/// Convert a millisecond timestamp to a `std::time::Instant`, anchored to the
/// real wall clock. Used only to populate `RateLimitInfo::reset_at`, which is
/// expressed in `Instant` for header rendering regardless of which `Clock`
/// drove the decision.
pub(crate) fn timestamp_to_instant(timestamp_ms: u64) -> std::time::Instant {
    let now = std::time::Instant::now();
    let now_ms = SystemClock.now_ms();

    if timestamp_ms >= now_ms {
        now + std::time::Duration::from_millis(timestamp_ms - now_ms)
    } else {
        now - std::time::Duration::from_millis(now_ms - timestamp_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advance() {
        let clock = ManualClock::new(1000);
        assert_eq!(clock.now_ms(), 1000);
        clock.advance(500);
        assert_eq!(clock.now_ms(), 1500);
        clock.set(9999);
        assert_eq!(clock.now_ms(), 9999);
    }

    #[test]
    fn test_system_clock_moves_forward() {
        let clock = SystemClock::new();
        let a = clock.now_ms();
        let b = clock.now_ms();
        assert!(b >= a);
    }
}
