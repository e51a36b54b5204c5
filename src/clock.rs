//! Time and randomness sources injected into the engine
//!
//! Handlers never read the wall clock or a global RNG directly; the engine
//! owns one of each so replays and tests can drive time explicitly.

use rand::Rng;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Instant;

/// Monotonic microsecond clock
pub trait Clock: Send + Sync {
    fn now_us(&self) -> u64;
}

/// Microseconds since the clock was created
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        MonotonicClock {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_us(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_micros()).unwrap_or(u64::MAX)
    }
}

/// Clock moved by hand (replay, tests)
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start_us: u64) -> Self {
        ManualClock {
            now: AtomicU64::new(start_us),
        }
    }

    pub fn set(&self, now_us: u64) {
        self.now.store(now_us, Ordering::Relaxed);
    }

    pub fn advance(&self, delta_us: u64) {
        self.now.fetch_add(delta_us, Ordering::Relaxed);
    }
}

impl Clock for ManualClock {
    fn now_us(&self) -> u64 {
        self.now.load(Ordering::Relaxed)
    }
}

/// Uniform 32-bit random values for statistical sampling
pub trait RandomSource: Send + Sync {
    fn next_u32(&self) -> u32;
}

/// Per-thread RNG; no shared state between traced threads
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadRandom;

impl RandomSource for ThreadRandom {
    fn next_u32(&self) -> u32 {
        rand::thread_rng().gen()
    }
}

/// Always returns the same value (replay, tests)
#[derive(Debug, Default)]
pub struct FixedRandom {
    value: AtomicU32,
}

impl FixedRandom {
    pub fn new(value: u32) -> Self {
        FixedRandom {
            value: AtomicU32::new(value),
        }
    }

    pub fn set(&self, value: u32) {
        self.value.store(value, Ordering::Relaxed);
    }
}

impl RandomSource for FixedRandom {
    fn next_u32(&self) -> u32 {
        self.value.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(100);
        assert_eq!(clock.now_us(), 100);
        clock.advance(50);
        assert_eq!(clock.now_us(), 150);
        clock.set(7);
        assert_eq!(clock.now_us(), 7);
    }

    #[test]
    fn test_monotonic_clock_never_goes_back() {
        let clock = MonotonicClock::new();
        let a = clock.now_us();
        let b = clock.now_us();
        assert!(b >= a);
    }

    #[test]
    fn test_fixed_random() {
        let random = FixedRandom::new(1);
        assert_eq!(random.next_u32(), 1);
        random.set(1000);
        assert_eq!(random.next_u32(), 1000);
    }
}
