//! Time source abstraction
//!
//! Circuit breakers need a monotonic clock for recovery-timeout math and a
//! wall clock for the timestamps they report. Both come from a [`Clock`] so
//! tests can drive breaker recovery without sleeping.
//!
//! ```
//! use std::time::Duration;
//!
//! use tenantry_orchestrator::time::{Clock, MockClock};
//!
//! let clock = MockClock::new();
//! let start = clock.now();
//! clock.advance(Duration::from_secs(30));
//! assert_eq!(clock.now().duration_since(start), Duration::from_secs(30));
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

/// Source of monotonic and wall-clock time.
pub trait Clock: Send + Sync + 'static {
    /// Monotonic instant used for elapsed-time comparisons.
    fn now(&self) -> Instant;

    /// Wall-clock time used for reported timestamps.
    fn system_time(&self) -> SystemTime;

    /// Wall-clock time as a UTC timestamp.
    fn utc_now(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from(self.system_time())
    }
}

/// Real system clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn system_time(&self) -> SystemTime {
        SystemTime::now()
    }
}

impl<T: Clock> Clock for Arc<T> {
    fn now(&self) -> Instant {
        (**self).now()
    }

    fn system_time(&self) -> SystemTime {
        (**self).system_time()
    }
}

/// Manually advanced clock for deterministic tests.
///
/// Clones share the same elapsed offset, so a clone handed to a registry
/// moves together with the one kept by the test.
#[derive(Debug, Clone)]
pub struct MockClock {
    start: Instant,
    base_system_time: SystemTime,
    elapsed: Arc<Mutex<Duration>>,
}

impl MockClock {
    /// Create a clock anchored at the current real time.
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            base_system_time: SystemTime::now(),
            elapsed: Arc::new(Mutex::new(Duration::ZERO)),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, duration: Duration) {
        *self.elapsed.lock() += duration;
    }

    /// Simulated time since creation.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        *self.elapsed.lock()
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MockClock {
    fn now(&self) -> Instant {
        self.start + self.elapsed()
    }

    fn system_time(&self) -> SystemTime {
        self.base_system_time + self.elapsed()
    }
}
