//! Scheduled eviction of old processed-message records.
//!
//! The ledger only needs to remember an event for as long as a redelivery
//! of it is plausible. [`EvictionJob`] deletes records older than the
//! retention window once a day at a fixed UTC time.

use crate::metrics::LedgerMetrics;
use chrono::{DateTime, NaiveTime, TimeDelta, Utc};
use std::sync::Arc;
use std::time::Duration;
use steadfast_core::environment::{Clock, SystemClock};
use steadfast_core::ledger::{Ledger, LedgerError};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Eviction schedule and retention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvictionConfig {
    /// Records older than this are deleted (default: 30 days)
    pub retention: TimeDelta,
    /// Daily run time in UTC (default: midnight)
    pub run_at: NaiveTime,
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self {
            retention: TimeDelta::days(30),
            run_at: NaiveTime::MIN,
        }
    }
}

impl EvictionConfig {
    /// Set the retention window.
    #[must_use]
    pub const fn with_retention(mut self, retention: TimeDelta) -> Self {
        self.retention = retention;
        self
    }

    /// Set the daily run time (UTC).
    #[must_use]
    pub const fn with_run_at(mut self, run_at: NaiveTime) -> Self {
        self.run_at = run_at;
        self
    }
}

/// First instant strictly after `now` whose UTC time of day is `run_at`.
#[must_use]
pub fn next_run_after(now: DateTime<Utc>, run_at: NaiveTime) -> DateTime<Utc> {
    let today = now.date_naive().and_time(run_at).and_utc();
    if today > now {
        today
    } else {
        today + TimeDelta::days(1)
    }
}

/// Deletes ledger records past the retention window.
#[derive(Clone)]
pub struct EvictionJob {
    ledger: Arc<dyn Ledger>,
    clock: Arc<dyn Clock>,
    config: EvictionConfig,
}

impl EvictionJob {
    /// Create a job over `ledger`.
    #[must_use]
    pub fn new(ledger: Arc<dyn Ledger>, config: EvictionConfig) -> Self {
        Self {
            ledger,
            clock: Arc::new(SystemClock),
            config,
        }
    }

    /// Replace the clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Schedule and retention in use.
    #[must_use]
    pub const fn config(&self) -> &EvictionConfig {
        &self.config
    }

    /// Evict once, now. Returns the number of records deleted.
    ///
    /// A retention window reaching past the earliest representable time
    /// covers every record, so nothing is deleted.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] if the delete fails.
    pub async fn run_once(&self) -> Result<u64, LedgerError> {
        let now = self.clock.now();
        let Some(cutoff) = now.checked_sub_signed(self.config.retention) else {
            tracing::warn!(retention = %self.config.retention, "Retention exceeds the clock range, nothing to evict");
            return Ok(0);
        };
        let evicted = self.ledger.evict_older_than(cutoff).await?;
        tracing::info!(evicted, %cutoff, "Evicted processed-message records");
        LedgerMetrics::record_evicted(evicted);
        Ok(evicted)
    }

    /// Run daily at `run_at` until `shutdown` fires.
    ///
    /// A failed run is logged and retried at the next scheduled time.
    #[must_use]
    pub fn spawn(self, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let now = self.clock.now();
                let next = next_run_after(now, self.config.run_at);
                let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
                tracing::debug!(%next, "Next ledger eviction scheduled");

                tokio::select! {
                    _ = shutdown.recv() => {
                        tracing::info!("Eviction job stopped");
                        break;
                    }
                    () = tokio::time::sleep(wait) => {
                        if let Err(error) = self.run_once().await {
                            tracing::error!(%error, "Ledger eviction failed");
                        }
                    }
                }
            }
        })
    }
}

impl std::fmt::Debug for EvictionJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvictionJob")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use steadfast_core::ledger::ProcessedMessage;
    use steadfast_testing::{InMemoryLedger, ManualClock, test_clock};
    use uuid::Uuid;

    fn at(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    fn processed(at: DateTime<Utc>) -> ProcessedMessage {
        ProcessedMessage {
            event_id: Uuid::new_v4(),
            event_type: "task.created".to_string(),
            processed_at: at,
        }
    }

    #[test]
    fn next_run_is_later_today_or_tomorrow() {
        let midnight = NaiveTime::MIN;
        let three = NaiveTime::from_hms_opt(3, 0, 0).unwrap();

        assert_eq!(
            next_run_after(at("2025-01-01T10:00:00Z"), midnight),
            at("2025-01-02T00:00:00Z")
        );
        assert_eq!(
            next_run_after(at("2025-01-01T01:00:00Z"), three),
            at("2025-01-01T03:00:00Z")
        );
        assert_eq!(
            next_run_after(at("2025-01-01T00:00:00Z"), midnight),
            at("2025-01-02T00:00:00Z")
        );
    }

    #[tokio::test]
    async fn run_once_deletes_only_records_past_retention() {
        let ledger = InMemoryLedger::new();
        let now = at("2025-03-01T00:00:00Z");
        let old = processed(now - TimeDelta::days(31));
        let boundary = processed(now - TimeDelta::days(30));
        let recent = processed(now - TimeDelta::days(1));
        for record in [&old, &boundary, &recent] {
            ledger.insert(record.clone());
        }

        let job = EvictionJob::new(Arc::new(ledger.clone()), EvictionConfig::default())
            .with_clock(Arc::new(ManualClock::new(now)));

        assert_eq!(job.run_once().await.unwrap(), 1);
        assert!(ledger.get(old.event_id).is_none());
        assert!(ledger.get(boundary.event_id).is_some());
        assert!(ledger.get(recent.event_id).is_some());
    }

    #[tokio::test]
    async fn oversized_retention_evicts_nothing() {
        let ledger = InMemoryLedger::new();
        let ancient = processed(at("1970-01-01T00:00:00Z"));
        ledger.insert(ancient.clone());
        let retention = TimeDelta::try_days(100_000_000).unwrap();

        let job = EvictionJob::new(
            Arc::new(ledger.clone()),
            EvictionConfig::default().with_retention(retention),
        )
        .with_clock(Arc::new(ManualClock::new(at("2025-03-01T00:00:00Z"))));

        let evicted = tokio::spawn(async move { job.run_once().await }).await.unwrap();

        assert_eq!(evicted.unwrap(), 0);
        assert!(ledger.get(ancient.event_id).is_some());
    }

    #[tokio::test]
    async fn run_once_surfaces_ledger_errors() {
        let ledger = InMemoryLedger::new();
        ledger.faults().set_failing(true);
        let job = EvictionJob::new(Arc::new(ledger), EvictionConfig::default());

        assert!(job.run_once().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn spawned_job_runs_at_next_scheduled_time() {
        let ledger = InMemoryLedger::new();
        let stale = processed(test_clock().now() - TimeDelta::days(60));
        ledger.insert(stale.clone());

        let (shutdown, _) = broadcast::channel(1);
        let handle = EvictionJob::new(Arc::new(ledger.clone()), EvictionConfig::default())
            .with_clock(Arc::new(test_clock()))
            .spawn(shutdown.subscribe());

        tokio::time::sleep(Duration::from_secs(60 * 60)).await;
        assert_eq!(ledger.len(), 1);

        tokio::time::sleep(Duration::from_secs(24 * 60 * 60)).await;
        assert!(ledger.is_empty());

        shutdown.send(()).unwrap();
        handle.await.unwrap();
    }
}
