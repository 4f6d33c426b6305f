//! Wall-clock abstraction.
//!
//! The store and scheduler never read the OS clock directly; they go through
//! [`Clock`] so tests can substitute a [`ManualClock`] and drive time
//! deterministically.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Source of wall time, expressed as seconds since the Unix epoch.
pub trait Clock: Send + Sync {
    /// Current wall time in seconds.
    fn now(&self) -> f64;
}

/// Clock backed by the operating system.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs_f64())
            .unwrap_or(0.0)
    }
}

/// Clock advanced explicitly by the caller.
///
/// Stores microseconds in an atomic so readers never block writers.
#[derive(Debug, Default)]
pub struct ManualClock {
    micros: AtomicU64,
}

impl ManualClock {
    /// Creates a clock starting at the given time in seconds.
    #[must_use]
    pub fn new(now: f64) -> Self {
        Self {
            micros: AtomicU64::new(to_micros(now)),
        }
    }

    /// Moves the clock forward by `seconds`.
    pub fn advance(&self, seconds: f64) {
        self.micros.fetch_add(to_micros(seconds), Ordering::SeqCst);
    }

    /// Sets the clock to an absolute time in seconds.
    pub fn set(&self, now: f64) {
        self.micros.store(to_micros(now), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> f64 {
        self.micros.load(Ordering::SeqCst) as f64 / 1_000_000.0
    }
}

fn to_micros(seconds: f64) -> u64 {
    (seconds.max(0.0) * 1_000_000.0).round() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_clock_is_monotonic_enough() {
        let clock = SystemClock;
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
        assert!(a > 1_000_000_000.0, "clock should be past 2001");
    }

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new(100.0);
        assert!((clock.now() - 100.0).abs() < 1e-6);
        clock.advance(59.5);
        assert!((clock.now() - 159.5).abs() < 1e-6);
        clock.set(10.0);
        assert!((clock.now() - 10.0).abs() < 1e-6);
    }
}
