//! # Steadfast Core
//!
//! Core traits and types for the Steadfast reliability layer.
//!
//! This crate holds the vocabulary shared by every other crate in the
//! workspace: the domain event envelope, the seams to the three unreliable or
//! durable dependencies (cache, broker, ledger), and the injected
//! environment (clock and sleeper).
//!
//! ## Core Concepts
//!
//! - **[`event::DomainEvent`]**: immutable envelope `{type, payload, metadata}`
//!   whose `eventId` is the downstream deduplication key
//! - **[`cache::Cache`]**: key-value store with TTLs and atomic create-if-absent
//! - **[`broker::Broker`]**: durable queues with a main/retry/dead-letter topology
//! - **[`ledger::Ledger`]**: durable record of processed event identifiers
//! - **[`idempotency`]**: request identities and stored responses
//! - **[`environment`]**: clock and sleeper, injected for testability
//!
//! ## Architecture Principles
//!
//! - Dependencies are traits, injected explicitly (no process-wide singletons)
//! - Every trait is dyn-compatible so it can sit behind `Arc<dyn _>`
//! - The ledger is the durable source of truth; cache and broker are lossy

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};

/// Broker abstraction: queue topology, deliveries, acknowledgement
pub mod broker;

/// Cache abstraction: TTL'd key-value store with atomic lock primitives
pub mod cache;

/// Domain events and their validation
pub mod event;

/// Request identities, stored responses and mutation failures
pub mod idempotency;

/// Processed-message ledger abstraction
pub mod ledger;

/// Environment module - injected dependencies for time
///
/// All time-dependent behaviour in the workspace reads the wall clock
/// through [`Clock`](environment::Clock) and waits through
/// [`Sleeper`](environment::Sleeper), so tests can substitute deterministic
/// implementations.
pub mod environment {
    use chrono::{DateTime, Utc};
    use std::future::Future;
    use std::pin::Pin;
    use std::time::Duration;

    /// Clock trait - abstracts time operations for testability
    ///
    /// # Examples
    ///
    /// ```ignore
    /// // Test - fixed time for deterministic tests
    /// struct FixedClock { time: DateTime<Utc> }
    /// impl Clock for FixedClock {
    ///     fn now(&self) -> DateTime<Utc> {
    ///         self.time
    ///     }
    /// }
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Wall clock backed by [`Utc::now`].
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }

    /// Asynchronous sleep, injected so backoff can be observed in tests.
    ///
    /// Implementations must not block the executor thread.
    pub trait Sleeper: Send + Sync {
        /// Wait for `duration`.
        fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
    }

    /// Sleeper backed by [`tokio::time::sleep`].
    #[derive(Debug, Clone, Copy, Default)]
    pub struct TokioSleeper;

    impl Sleeper for TokioSleeper {
        fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
            Box::pin(tokio::time::sleep(duration))
        }
    }

    impl<S: Sleeper + ?Sized> Sleeper for std::sync::Arc<S> {
        fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
            (**self).sleep(duration)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::environment::{Clock, Sleeper, SystemClock, TokioSleeper};
    use std::time::Duration;

    #[test]
    fn system_clock_is_monotonic_enough() {
        let clock = SystemClock;
        let first = clock.now();
        let second = clock.now();
        assert!(second >= first);
    }

    #[tokio::test(start_paused = true)]
    async fn tokio_sleeper_advances_virtual_time() {
        let start = tokio::time::Instant::now();
        TokioSleeper.sleep(Duration::from_millis(250)).await;
        assert!(start.elapsed() >= Duration::from_millis(250));
    }
}
