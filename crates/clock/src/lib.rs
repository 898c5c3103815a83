#![deny(unsafe_code, unused_extern_crates, unused_import_braces)]
#![warn(unreachable_pub)]

//! The simulated clock shared by the manager and every observer of
//! simulated time.
//!
//! The clock is a monotonic `(seconds, nanoseconds)` pair advanced once per
//! manager tick by `delta = sim_speed_factor * wall_elapsed`. It is not
//! synchronized to wall time: it is a reproducible fiction that every
//! wait-queue ordering, unblock time, and deadlock sweep is measured against.

use std::time::Duration;

use parking_lot::Mutex;

/// Nanoseconds in one second.
pub const NANOS_PER_SEC: u64 = 1_000_000_000;

/// Default ratio of simulated time advanced per unit of wall time.
///
/// Matches the reference implementation's `simSpeedFactor` (see
/// `original_source/src/timekeeper.c`).
pub const DEFAULT_SIM_SPEED_FACTOR: f64 = 0.28;

/// A snapshot of the simulated clock: always normalized, i.e.
/// `nanoseconds < NANOS_PER_SEC`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Instant {
    /// Whole simulated seconds elapsed.
    pub seconds: u64,
    /// Simulated nanoseconds within the current second.
    pub nanoseconds: u32,
}

impl Instant {
    /// The origin of simulated time.
    pub const ZERO: Instant = Instant {
        seconds: 0,
        nanoseconds: 0,
    };
}

#[derive(Default)]
struct Inner {
    seconds: u64,
    nanoseconds: u32,
    initialized: bool,
}

/// Monotonic, manager-owned simulated clock.
///
/// `read` and `advance` are both taken under the same lock so that no
/// observer can ever see a denormalized `(seconds, nanoseconds)` pair.
pub struct SimulatedClock {
    inner: Mutex<Inner>,
}

impl Default for SimulatedClock {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedClock {
    /// Creates a clock at time zero, not yet marked initialized.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Marks the clock initialized. Idempotent.
    pub fn initialize(&self) {
        let mut inner = self.inner.lock();
        if !inner.initialized {
            inner.initialized = true;
            tracing::debug!("simulated clock initialized");
        }
    }

    /// Whether `initialize` has been called.
    pub fn is_initialized(&self) -> bool {
        self.inner.lock().initialized
    }

    /// Atomically reads the current simulated time.
    pub fn read(&self) -> Instant {
        let inner = self.inner.lock();
        Instant {
            seconds: inner.seconds,
            nanoseconds: inner.nanoseconds,
        }
    }

    /// Advances the clock by `delta_ns` nanoseconds, carrying overflow into
    /// seconds.
    pub fn advance(&self, delta_ns: u64) -> Instant {
        let mut inner = self.inner.lock();
        let total = inner.nanoseconds as u64 + delta_ns;
        inner.seconds += total / NANOS_PER_SEC;
        inner.nanoseconds = (total % NANOS_PER_SEC) as u32;
        Instant {
            seconds: inner.seconds,
            nanoseconds: inner.nanoseconds,
        }
    }

    /// Advances the clock according to the manager's progression rule:
    /// `delta = sim_speed_factor * wall_elapsed`.
    pub fn advance_for_wall_elapsed(&self, wall_elapsed: Duration, sim_speed_factor: f64) -> Instant {
        let delta_ns = (wall_elapsed.as_nanos() as f64 * sim_speed_factor) as u64;
        self.advance(delta_ns)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn advance_normalizes_overflow() {
        let clock = SimulatedClock::new();
        let after = clock.advance(2_500_000_000);
        assert_eq!(after.seconds, 2);
        assert_eq!(after.nanoseconds, 500_000_000);
        assert!(after.nanoseconds < NANOS_PER_SEC as u32);
    }

    #[test]
    fn advance_accumulates_across_calls() {
        let clock = SimulatedClock::new();
        clock.advance(NANOS_PER_SEC - 1);
        let after = clock.advance(2);
        assert_eq!(after.seconds, 1);
        assert_eq!(after.nanoseconds, 1);
    }

    #[test]
    fn read_is_monotonic_non_decreasing() {
        let clock = SimulatedClock::new();
        let mut last = clock.read();
        for _ in 0..100 {
            clock.advance(1_000);
            let now = clock.read();
            assert!(now >= last);
            last = now;
        }
    }

    #[test]
    fn concurrent_readers_never_observe_denormalized_time() {
        let clock = Arc::new(SimulatedClock::new());
        let mut handles = Vec::new();

        for _ in 0..8 {
            let clock = clock.clone();
            handles.push(std::thread::spawn(move || {
                let mut last = clock.read();
                for _ in 0..1_000 {
                    let now = clock.read();
                    assert!(now.nanoseconds < NANOS_PER_SEC as u32);
                    assert!(now >= last);
                    last = now;
                }
            }));
        }

        for _ in 0..1_000 {
            clock.advance(999);
        }

        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn initialize_is_idempotent() {
        let clock = SimulatedClock::new();
        assert!(!clock.is_initialized());
        clock.initialize();
        clock.initialize();
        assert!(clock.is_initialized());
    }
}
