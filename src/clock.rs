// Injectable time source for window and timeout measurement

//! # Clock Module
//!
//! Every component that measures durations or windows (circuit breaker, rate
//! limiter, cache) takes an injected [`Clock`] instead of reading the ambient
//! process clock. This keeps window and timeout behavior deterministic in
//! tests: a [`ManualClock`] can be advanced explicitly instead of sleeping.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// A monotonic time source
///
/// Implementations must be cheap to call and safe to share across tasks.
pub trait Clock: Send + Sync {
    /// Current monotonic instant
    fn now(&self) -> Instant;
}

/// The real monotonic clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A manually-advanced clock for deterministic tests
///
/// Starts at the instant of construction and only moves when
/// [`ManualClock::advance`] is called.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<Instant>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: Arc::new(Mutex::new(Instant::now())),
        }
    }

    /// Move the clock forward by `delta`
    pub fn advance(&self, delta: Duration) {
        let mut now = self.now.lock().expect("clock lock poisoned");
        *now += delta;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.lock().expect("clock lock poisoned")
    }
}

/// Shared trait-object handle used throughout the crate
pub type SharedClock = Arc<dyn Clock>;

/// Default clock used when a component is built without an explicit one
pub fn system_clock() -> SharedClock {
    Arc::new(SystemClock)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_only_moves_on_advance() {
        let clock = ManualClock::new();
        let t0 = clock.now();
        assert_eq!(clock.now(), t0);

        clock.advance(Duration::from_secs(5));
        assert_eq!(clock.now(), t0 + Duration::from_secs(5));
    }

    #[test]
    fn clones_share_the_same_timeline() {
        let clock = ManualClock::new();
        let other = clock.clone();
        clock.advance(Duration::from_millis(250));
        assert_eq!(clock.now(), other.now());
    }
}
