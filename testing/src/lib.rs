//! # Steadfast Testing
//!
//! Testing utilities for the Steadfast reliability layer.
//!
//! This crate provides:
//! - Deterministic clocks and a recording sleeper
//! - [`InMemoryCache`] with TTLs and fault injection
//! - [`InMemoryBroker`] with the main/retry/dead-letter routing and TTL expiry
//! - [`InMemoryLedger`] with fault injection
//!
//! TTLs are measured with `tokio::time::Instant`, so tests can run under
//! `#[tokio::test(start_paused = true)]` and move time with
//! `tokio::time::advance`.
//!
//! ## Example
//!
//! ```ignore
//! use steadfast_testing::{InMemoryCache, InMemoryLedger, InMemoryBroker};
//!
//! #[tokio::test(start_paused = true)]
//! async fn lock_expires() {
//!     let cache = InMemoryCache::new();
//!     cache.set_if_absent("lock", "me", Duration::from_secs(1)).await?;
//!     tokio::time::advance(Duration::from_secs(2)).await;
//!     assert!(!cache.contains("lock"));
//! }
//! ```

use chrono::{DateTime, Utc};
use steadfast_core::environment::Clock;

/// In-memory broker double
pub mod broker_mocks;

/// In-memory cache double
pub mod cache_mocks;

/// In-memory ledger double
pub mod ledger_mocks;

/// Mock implementations of environment traits.
pub mod mocks {
    #![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity

    use super::{Clock, DateTime, Utc};
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::{Arc, Mutex, PoisonError};
    use std::time::Duration;
    use steadfast_core::environment::Sleeper;

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use steadfast_testing::mocks::FixedClock;
    /// use steadfast_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// assert_eq!(clock.now(), clock.now());
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    ///
    /// # Panics
    ///
    /// This function will panic if the hardcoded timestamp fails to parse,
    /// which should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }

    /// Clock that only moves when told to.
    #[derive(Debug, Clone)]
    pub struct ManualClock {
        time: Arc<Mutex<DateTime<Utc>>>,
    }

    impl ManualClock {
        /// Start at `time`.
        #[must_use]
        pub fn new(time: DateTime<Utc>) -> Self {
            Self {
                time: Arc::new(Mutex::new(time)),
            }
        }

        /// Move the clock forward.
        pub fn advance(&self, by: chrono::Duration) {
            let mut time = self.time.lock().unwrap_or_else(PoisonError::into_inner);
            *time += by;
        }

        /// Jump to `time`.
        pub fn set(&self, time: DateTime<Utc>) {
            *self.time.lock().unwrap_or_else(PoisonError::into_inner) = time;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.time.lock().unwrap_or_else(PoisonError::into_inner)
        }
    }

    /// Sleeper that records every requested delay.
    ///
    /// By default it returns immediately. [`RecordingSleeper::passthrough`]
    /// also waits on the tokio timer, which pairs with paused time.
    #[derive(Debug, Clone, Default)]
    pub struct RecordingSleeper {
        delays: Arc<Mutex<Vec<Duration>>>,
        passthrough: bool,
    }

    impl RecordingSleeper {
        /// Record without waiting.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Record and wait on the tokio timer.
        #[must_use]
        pub fn passthrough() -> Self {
            Self {
                delays: Arc::default(),
                passthrough: true,
            }
        }

        /// Delays requested so far, in order.
        #[must_use]
        pub fn delays(&self) -> Vec<Duration> {
            self.delays.lock().unwrap_or_else(PoisonError::into_inner).clone()
        }

        /// Sum of all requested delays.
        #[must_use]
        pub fn total(&self) -> Duration {
            self.delays.lock().unwrap_or_else(PoisonError::into_inner).iter().sum()
        }
    }

    impl Sleeper for RecordingSleeper {
        fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
            self.delays.lock().unwrap_or_else(PoisonError::into_inner).push(duration);
            let passthrough = self.passthrough;
            Box::pin(async move {
                if passthrough {
                    tokio::time::sleep(duration).await;
                }
            })
        }
    }
}

/// Fault injection shared by the in-memory doubles.
pub mod faults {
    #![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity

    use std::sync::{Arc, Mutex, PoisonError};

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Mode {
        Healthy,
        Failing,
        FailNext(usize),
    }

    /// Switch deciding whether the next operation fails.
    #[derive(Debug, Clone)]
    pub struct FaultSwitch {
        mode: Arc<Mutex<Mode>>,
    }

    impl Default for FaultSwitch {
        fn default() -> Self {
            Self {
                mode: Arc::new(Mutex::new(Mode::Healthy)),
            }
        }
    }

    impl FaultSwitch {
        /// Fail every operation until turned off.
        pub fn set_failing(&self, failing: bool) {
            *self.mode.lock().unwrap_or_else(PoisonError::into_inner) = if failing { Mode::Failing } else { Mode::Healthy };
        }

        /// Fail the next `count` operations, then recover.
        pub fn fail_next(&self, count: usize) {
            *self.mode.lock().unwrap_or_else(PoisonError::into_inner) = Mode::FailNext(count);
        }

        /// Consume one decision: `true` if this operation must fail.
        #[must_use]
        pub fn trip(&self) -> bool {
            let mut mode = self.mode.lock().unwrap_or_else(PoisonError::into_inner);
            match *mode {
                Mode::Healthy => false,
                Mode::Failing => true,
                Mode::FailNext(0) => {
                    *mode = Mode::Healthy;
                    false
                }
                Mode::FailNext(remaining) => {
                    *mode = if remaining == 1 {
                        Mode::Healthy
                    } else {
                        Mode::FailNext(remaining - 1)
                    };
                    true
                }
            }
        }
    }
}

// Re-export commonly used items
pub use broker_mocks::{InMemoryBroker, StoredMessage};
pub use cache_mocks::InMemoryCache;
pub use faults::FaultSwitch;
pub use ledger_mocks::InMemoryLedger;
pub use mocks::{FixedClock, ManualClock, RecordingSleeper, test_clock};

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use steadfast_core::environment::Sleeper;

    #[test]
    fn test_fixed_clock() {
        let clock = test_clock();
        assert_eq!(clock.now().to_rfc3339(), "2025-01-01T00:00:00+00:00");
    }

    #[test]
    fn manual_clock_advances() {
        let start = test_clock().now();
        let clock = ManualClock::new(start);
        clock.advance(chrono::Duration::days(31));
        assert_eq!(clock.now() - start, chrono::Duration::days(31));
    }

    #[tokio::test]
    async fn recording_sleeper_records_without_waiting() {
        let sleeper = RecordingSleeper::new();
        sleeper.sleep(Duration::from_secs(3600)).await;
        sleeper.sleep(Duration::from_millis(5)).await;
        assert_eq!(
            sleeper.delays(),
            vec![Duration::from_secs(3600), Duration::from_millis(5)]
        );
    }

    #[test]
    fn fault_switch_fails_exactly_n_times() {
        let switch = FaultSwitch::default();
        switch.fail_next(2);
        assert!(switch.trip());
        assert!(switch.trip());
        assert!(!switch.trip());

        switch.set_failing(true);
        assert!(switch.trip());
        switch.set_failing(false);
        assert!(!switch.trip());
    }
}
