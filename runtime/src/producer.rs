//! Event producer.
//!
//! Validates domain events against the payload schema, stamps their
//! metadata once, and publishes them to the main queue with bounded retry.
//! A publish failure is reported to the caller but never undoes the
//! mutation that produced the event.

use crate::metrics::PublishMetrics;
use crate::retry::{RetryExecutor, RetryPolicy};
use std::sync::Arc;
use std::time::{Duration, Instant};
use steadfast_core::broker::{Broker, BrokerError, OutboundMessage};
use steadfast_core::environment::{Clock, Sleeper, SystemClock, TokioSleeper};
use steadfast_core::event::{DomainEvent, EventError, EventSchema, ValidationError};
use thiserror::Error;

/// Why an event was not published.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    /// The payload does not match its type's schema; nothing was sent
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The event could not be serialized; nothing was sent
    #[error(transparent)]
    Encode(#[from] EventError),

    /// The broker did not accept the event within the retry budget
    #[error("Broker unavailable: {0}")]
    Broker(#[source] BrokerError),
}

/// Default policy for publish calls.
#[must_use]
pub const fn default_publish_policy() -> RetryPolicy {
    RetryPolicy::builder()
        .max_attempts(3)
        .base_delay(Duration::from_millis(100))
        .max_delay(Duration::from_secs(2))
        .build()
}

/// Publishes validated domain events to the main queue.
#[derive(Clone)]
pub struct EventProducer {
    broker: Arc<dyn Broker>,
    schema: Arc<dyn EventSchema>,
    clock: Arc<dyn Clock>,
    retry: RetryExecutor<Arc<dyn Sleeper>>,
    policy: RetryPolicy,
    queue: String,
    source: String,
}

impl EventProducer {
    /// Create a producer publishing to `queue` on behalf of `source`.
    #[must_use]
    pub fn new(
        broker: Arc<dyn Broker>,
        schema: Arc<dyn EventSchema>,
        queue: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        Self {
            broker,
            schema,
            clock: Arc::new(SystemClock),
            retry: RetryExecutor::new(Arc::new(TokioSleeper)),
            policy: default_publish_policy(),
            queue: queue.into(),
            source: source.into(),
        }
    }

    /// Replace the clock used for event timestamps.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the sleeper used between attempts.
    #[must_use]
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.retry = RetryExecutor::new(sleeper);
        self
    }

    /// Replace the retry policy.
    #[must_use]
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Validate and publish an event of `event_type` carrying `payload`.
    ///
    /// Returns the published event, including its generated `eventId`.
    ///
    /// # Errors
    ///
    /// - [`PublishError::Validation`] if the payload is rejected; nothing is sent
    /// - [`PublishError::Broker`] if the broker fails every attempt
    pub async fn publish(
        &self,
        event_type: &str,
        payload: serde_json::Value,
    ) -> Result<DomainEvent, PublishError> {
        if let Err(error) = self.schema.validate(event_type, &payload) {
            tracing::warn!(event_type, %error, "Rejected invalid event");
            PublishMetrics::record_failure("validation");
            return Err(error.into());
        }

        let event = DomainEvent::new(event_type, payload, self.source.as_str(), self.clock.now());
        let body = event.to_bytes()?;
        let started = Instant::now();

        self.retry
            .run(
                &self.policy,
                || {
                    self.broker
                        .publish(&self.queue, OutboundMessage::new(body.clone()))
                },
                |error: &BrokerError| {
                    !matches!(error, BrokerError::UnknownQueue(_) | BrokerError::Closed)
                },
            )
            .await
            .map_err(|error| {
                tracing::error!(
                    event_id = %event.event_id(),
                    event_type,
                    queue = %self.queue,
                    %error,
                    "Failed to publish event"
                );
                PublishMetrics::record_failure("broker");
                PublishError::Broker(error)
            })?;

        tracing::info!(
            event_id = %event.event_id(),
            event_type,
            queue = %self.queue,
            "Event published"
        );
        PublishMetrics::record_published(event_type, started.elapsed());
        Ok(event)
    }
}

impl std::fmt::Debug for EventProducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventProducer")
            .field("queue", &self.queue)
            .field("source", &self.source)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;
    use steadfast_core::broker::QueueTopology;
    use steadfast_core::event::SchemaRegistry;
    use steadfast_testing::{InMemoryBroker, RecordingSleeper, test_clock};

    #[derive(Deserialize)]
    #[allow(dead_code)]
    struct TaskCreated {
        id: i64,
        title: String,
    }

    async fn producer() -> (EventProducer, InMemoryBroker, QueueTopology) {
        let broker = InMemoryBroker::new();
        let topology = QueueTopology::default();
        broker.declare_topology(&topology).await.unwrap();

        let schema = SchemaRegistry::new().register::<TaskCreated>("task.created");
        let producer = EventProducer::new(
            Arc::new(broker.clone()),
            Arc::new(schema),
            topology.main.clone(),
            "task-api",
        )
        .with_clock(Arc::new(test_clock()))
        .with_sleeper(Arc::new(RecordingSleeper::new()));
        (producer, broker, topology)
    }

    #[tokio::test]
    async fn valid_event_is_published_persistent_with_metadata() {
        let (producer, broker, topology) = producer().await;

        let event = producer
            .publish("task.created", json!({"id": 1, "title": "write"}))
            .await
            .unwrap();

        let queued = broker.messages(&topology.main);
        assert_eq!(queued.len(), 1);
        assert!(queued[0].persistent);
        assert_eq!(queued[0].retry_count, 0);

        let decoded = DomainEvent::from_bytes(&queued[0].body).unwrap();
        assert_eq!(decoded, event);
        assert_eq!(decoded.metadata.source, "task-api");
        assert_eq!(decoded.metadata.timestamp, test_clock().now());
    }

    #[tokio::test]
    async fn invalid_payload_is_not_published() {
        let (producer, broker, topology) = producer().await;

        let err = producer
            .publish("task.created", json!({"title": 5}))
            .await
            .unwrap_err();

        assert!(matches!(err, PublishError::Validation(_)));
        assert!(broker.history(&topology.main).is_empty());
    }

    #[tokio::test]
    async fn transient_broker_failures_are_retried_with_same_event_id() {
        let (producer, broker, topology) = producer().await;
        broker.publish_faults().fail_next(2);

        let event = producer
            .publish("task.created", json!({"id": 1, "title": "write"}))
            .await
            .unwrap();

        let queued = broker.messages(&topology.main);
        assert_eq!(queued.len(), 1);
        assert_eq!(
            DomainEvent::from_bytes(&queued[0].body).unwrap().event_id(),
            event.event_id()
        );
    }

    #[tokio::test]
    async fn exhausted_retries_surface_broker_error() {
        let (producer, broker, _) = producer().await;
        broker.publish_faults().set_failing(true);

        let err = producer
            .publish("task.created", json!({"id": 1, "title": "write"}))
            .await
            .unwrap_err();

        assert!(matches!(err, PublishError::Broker(BrokerError::PublishFailed { .. })));
    }
}
