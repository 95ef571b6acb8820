//! Prometheus metrics for observability and monitoring.
//!
//! This module provides metric collection for the reliability layer:
//! - Retry attempts and exhaustion
//! - Cache gateway availability
//! - Idempotency gate decisions
//! - Event publishing
//! - Consumer outcomes
//! - Ledger eviction
//!
//! # Example
//!
//! ```rust,no_run
//! use steadfast_runtime::metrics::MetricsServer;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//!
//! // Serve `server.render()` at http://localhost:9090/metrics
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

// Re-export metrics macros for use in other modules
pub use metrics::{counter, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus metrics recorder with a render handle.
///
/// The HTTP endpoint itself is served by the binary at [`MetricsServer::addr`].
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server.
    ///
    /// # Arguments
    ///
    /// * `addr` - Socket address the endpoint will be served on (e.g., `0.0.0.0:9090`)
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Address the endpoint should be served on.
    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Register descriptions and install the Prometheus recorder.
    ///
    /// # Errors
    ///
    /// Returns error if the exporter cannot be built or installed.
    ///
    /// # Note
    ///
    /// If a recorder is already installed (e.g., by another test), this logs
    /// a warning and succeeds without a render handle.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let builder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        match builder.install_recorder() {
            Ok(handle) => {
                self.handle = Some(handle);
                tracing::info!(addr = %self.addr, "Metrics recorder installed");
                Ok(())
            }
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already initialized") {
                    tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                    Ok(())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            }
        }
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if the recorder was not installed by this server.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register all metric descriptions.
fn register_metrics() {
    // Retry
    describe_counter!("retry_attempts_total", "Total number of retry attempts");
    describe_counter!("retry_successes_total", "Operations that succeeded after retrying");
    describe_counter!(
        "retry_exhausted_total",
        "Operations that failed after exhausting their attempts"
    );

    // Cache gateway
    describe_counter!(
        "cache_unavailable_total",
        "Cache operations that failed after retries, by operation"
    );

    // Idempotency gate
    describe_counter!(
        "idempotency_decisions_total",
        "Admission decisions made by the idempotency gate, by decision"
    );
    describe_counter!(
        "idempotency_result_store_failures_total",
        "Completed mutations whose response could not be cached"
    );

    // Producer
    describe_counter!("events_published_total", "Events published, by event type");
    describe_counter!(
        "events_publish_failures_total",
        "Events that could not be published, by reason"
    );
    describe_histogram!(
        "events_publish_duration_seconds",
        "Time taken to publish an event including retries"
    );

    // Consumer
    describe_counter!(
        "consumer_messages_total",
        "Deliveries settled by event workers, by outcome"
    );
    describe_histogram!(
        "consumer_handler_duration_seconds",
        "Time taken by event handlers"
    );

    // Ledger
    describe_counter!("ledger_records_total", "Processed-message records written, by event type");
    describe_counter!("ledger_evicted_total", "Processed-message records evicted");

    // HTTP
    describe_counter!(
        "http_request_deadline_exceeded_total",
        "Requests answered with 408 after the request deadline"
    );
    describe_counter!("http_rate_limited_total", "Requests refused with 429");
}

/// Retry metrics recorder.
pub struct RetryMetrics;

impl RetryMetrics {
    /// Record a retry attempt.
    pub fn record_attempt() {
        counter!("retry_attempts_total").increment(1);
    }

    /// Record a successful retry.
    pub fn record_success() {
        counter!("retry_successes_total").increment(1);
    }

    /// Record exhausted retries.
    pub fn record_exhausted() {
        counter!("retry_exhausted_total").increment(1);
    }
}

/// Cache gateway metrics recorder.
pub struct CacheMetrics;

impl CacheMetrics {
    /// Record an operation that failed after retries.
    pub fn record_unavailable(operation: &'static str) {
        counter!("cache_unavailable_total", "operation" => operation).increment(1);
    }
}

/// Idempotency gate metrics recorder.
pub struct GateMetrics;

impl GateMetrics {
    /// Record an admission decision.
    pub fn record_decision(decision: &'static str) {
        counter!("idempotency_decisions_total", "decision" => decision).increment(1);
    }

    /// Record a response that could not be cached.
    pub fn record_store_failure() {
        counter!("idempotency_result_store_failures_total").increment(1);
    }
}

/// Producer metrics recorder.
pub struct PublishMetrics;

impl PublishMetrics {
    /// Record a published event.
    pub fn record_published(event_type: &str, duration: Duration) {
        counter!("events_published_total", "event_type" => event_type.to_string()).increment(1);
        histogram!("events_publish_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record a publish failure.
    pub fn record_failure(reason: &'static str) {
        counter!("events_publish_failures_total", "reason" => reason).increment(1);
    }
}

/// Consumer metrics recorder.
pub struct ConsumerMetrics;

impl ConsumerMetrics {
    /// Record a settled delivery.
    pub fn record_outcome(outcome: &'static str) {
        counter!("consumer_messages_total", "outcome" => outcome).increment(1);
    }

    /// Record handler latency.
    pub fn record_handler(duration: Duration) {
        histogram!("consumer_handler_duration_seconds").record(duration.as_secs_f64());
    }
}

/// Ledger metrics recorder.
pub struct LedgerMetrics;

impl LedgerMetrics {
    /// Record evicted records.
    pub fn record_evicted(count: u64) {
        counter!("ledger_evicted_total").increment(count);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_server_creation() {
        let addr = "127.0.0.1:0".parse().unwrap();
        let server = MetricsServer::new(addr);
        assert!(server.handle().is_none());
        assert_eq!(server.addr(), addr);
    }

    #[test]
    fn test_metrics_server_render() {
        let mut server = MetricsServer::new("127.0.0.1:0".parse().unwrap());
        server.start().unwrap();

        GateMetrics::record_decision("proceed");
        ConsumerMetrics::record_outcome("handled");
        LedgerMetrics::record_evicted(3);

        // Another test may have installed the recorder first; metrics are
        // still recorded, just not renderable from this handle.
        if let Some(rendered) = server.render() {
            assert!(rendered.contains("idempotency_decisions_total"));
            assert!(rendered.contains("consumer_messages_total"));
            assert!(rendered.contains("ledger_evicted_total"));
        }
    }
}
