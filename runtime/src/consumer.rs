//! Idempotent event worker with retry and dead-letter routing.
//!
//! [`EventWorker`] settles each delivery from the main queue through a fixed
//! sequence of checks:
//!
//! ```text
//! received
//!   ├─ malformed or schema-invalid ─────────────▶ dead-letter, ack
//!   ├─ no eventId ──────────────────────────────▶ ack, drop
//!   ├─ eventId already in ledger ───────────────▶ ack (duplicate)
//!   └─ run handler
//!        ├─ ok ─▶ record in ledger ─────────────▶ ack
//!        ├─ retryable failure, retries left ───▶ retry queue (count+1), ack
//!        └─ retries exhausted or rejected ─────▶ dead-letter, ack
//! ```
//!
//! The ledger's unique constraint is what makes concurrent workers safe:
//! if two workers handle the same event, the second insert reports
//! `AlreadyRecorded` and is acknowledged like any success.
//!
//! # Pattern: Subscribe-Process-Reconnect Loop
//!
//! Each consumer slot of a [`WorkerPool`] is a dedicated task that consumes
//! its own stream, settles deliveries one at a time, and resubscribes after
//! a delay if the stream fails or ends. Shutdown is signalled through a
//! broadcast channel and takes effect between deliveries.
//!
//! # Example
//!
//! ```rust,ignore
//! let handlers = HandlerRegistry::new()
//!     .register("task.created", Arc::new(NotifyOwner::new(pool.clone())));
//!
//! let worker = Arc::new(EventWorker::new(broker, ledger, topology, handlers).with_schema(schema));
//! let handles = WorkerPool::new(worker, 4).spawn(&shutdown_tx);
//! ```

use crate::metrics::ConsumerMetrics;
use crate::retry::{RetryExecutor, RetryPolicy};
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use steadfast_core::broker::{Broker, BrokerError, Delivery, OutboundMessage, QueueTopology};
use steadfast_core::environment::{Clock, Sleeper, SystemClock, TokioSleeper};
use steadfast_core::event::{DomainEvent, EventError, EventSchema, IncomingEvent};
use steadfast_core::ledger::{Ledger, LedgerError, ProcessedMessage, RecordOutcome};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Failure reported by an [`EventHandler`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WorkError {
    /// Might succeed later; goes through the retry tier
    #[error("Retryable failure: {0}")]
    Retryable(String),

    /// Will never succeed; goes straight to the dead-letter queue
    #[error("Rejected: {0}")]
    Rejected(String),
}

/// Side-effect work for one event type.
///
/// Handlers may run more than once for the same event (a crash between the
/// side effect and the ledger write), so their durable outcome must
/// tolerate repetition.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    /// Perform the side effect for `event`.
    ///
    /// # Errors
    ///
    /// Returns [`WorkError`] describing whether a retry can help.
    async fn handle(&self, event: &DomainEvent) -> Result<(), WorkError>;
}

/// Event handlers keyed by event type.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn EventHandler>>,
}

impl HandlerRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `event_type`, replacing any previous one.
    #[must_use]
    pub fn register(mut self, event_type: impl Into<String>, handler: Arc<dyn EventHandler>) -> Self {
        self.handlers.insert(event_type.into(), handler);
        self
    }

    /// Handler for `event_type`.
    #[must_use]
    pub fn get(&self, event_type: &str) -> Option<&Arc<dyn EventHandler>> {
        self.handlers.get(event_type)
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("event_types", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// How a delivery was settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Side effect ran and was recorded
    Handled,
    /// Already in the ledger, skipped
    Duplicate,
    /// Valid but no handler is registered for its type
    Unhandled,
    /// No `eventId`, dropped
    Dropped,
    /// Republished to the retry queue with this retry count
    Retried(u32),
    /// Published to the dead-letter queue
    DeadLettered,
    /// Republishing failed; rejected back to the broker
    Requeued,
}

impl ProcessOutcome {
    const fn label(&self) -> &'static str {
        match self {
            Self::Handled => "handled",
            Self::Duplicate => "duplicate",
            Self::Unhandled => "unhandled",
            Self::Dropped => "dropped",
            Self::Retried(_) => "retried",
            Self::DeadLettered => "dead_lettered",
            Self::Requeued => "requeued",
        }
    }
}

/// Default policy for the worker's own ledger and broker calls.
#[must_use]
pub const fn default_worker_policy() -> RetryPolicy {
    RetryPolicy::builder()
        .max_attempts(3)
        .base_delay(Duration::from_millis(100))
        .max_delay(Duration::from_secs(2))
        .build()
}

/// Settles deliveries from the main queue.
pub struct EventWorker {
    broker: Arc<dyn Broker>,
    ledger: Arc<dyn Ledger>,
    topology: QueueTopology,
    handlers: HandlerRegistry,
    schema: Option<Arc<dyn EventSchema>>,
    clock: Arc<dyn Clock>,
    retry: RetryExecutor<Arc<dyn Sleeper>>,
    policy: RetryPolicy,
    reconnect_delay: Duration,
}

impl EventWorker {
    /// Create a worker for `topology.main`.
    #[must_use]
    pub fn new(
        broker: Arc<dyn Broker>,
        ledger: Arc<dyn Ledger>,
        topology: QueueTopology,
        handlers: HandlerRegistry,
    ) -> Self {
        Self {
            broker,
            ledger,
            topology,
            handlers,
            schema: None,
            clock: Arc::new(SystemClock),
            retry: RetryExecutor::new(Arc::new(TokioSleeper)),
            policy: default_worker_policy(),
            reconnect_delay: Duration::from_secs(5),
        }
    }

    /// Validate payloads with `schema`; invalid events are dead-lettered.
    #[must_use]
    pub fn with_schema(mut self, schema: Arc<dyn EventSchema>) -> Self {
        self.schema = Some(schema);
        self
    }

    /// Replace the clock used for `processed_at`.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the sleeper used between ledger and broker attempts.
    #[must_use]
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.retry = RetryExecutor::new(sleeper);
        self
    }

    /// Replace the retry policy for ledger and broker calls.
    #[must_use]
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Set how long to wait before resubscribing (default: 5 seconds).
    #[must_use]
    pub const fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// The topology this worker settles against.
    #[must_use]
    pub const fn topology(&self) -> &QueueTopology {
        &self.topology
    }

    /// Settle one delivery.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError`] only if acknowledging or rejecting the
    /// delivery itself fails; every other failure is routed through the
    /// retry or dead-letter queue.
    pub async fn process(&self, delivery: Delivery) -> Result<ProcessOutcome, BrokerError> {
        let retry_count = delivery.retry_count();

        let incoming = match IncomingEvent::parse(delivery.body()) {
            Ok(incoming) => incoming,
            Err(error) => {
                warn!(retry_count, %error, "Malformed event body");
                return self.dead_letter(delivery, &error.to_string()).await;
            }
        };

        if let Some(schema) = &self.schema {
            if let Err(error) = schema.validate(&incoming.event_type, &incoming.payload) {
                warn!(
                    event_id = ?incoming.event_id(),
                    event_type = %incoming.event_type,
                    %error,
                    "Event failed schema validation"
                );
                return self.dead_letter(delivery, &error.to_string()).await;
            }
        }

        let event = match incoming.into_event() {
            Ok(event) => event,
            Err(EventError::MissingEventId) => {
                warn!(retry_count, "Event has no eventId, dropping");
                delivery.ack().await?;
                return Ok(self.settled(ProcessOutcome::Dropped));
            }
            Err(error) => {
                warn!(retry_count, %error, "Malformed event metadata");
                return self.dead_letter(delivery, &error.to_string()).await;
            }
        };

        let event_id = event.event_id();
        match self.already_processed(event_id).await {
            Ok(true) => {
                debug!(%event_id, event_type = %event.event_type, "Duplicate event, skipping");
                delivery.ack().await?;
                return Ok(self.settled(ProcessOutcome::Duplicate));
            }
            Ok(false) => {}
            Err(error) => {
                return self
                    .retry_or_dead_letter(delivery, &event, &format!("ledger lookup failed: {error}"))
                    .await;
            }
        }

        let Some(handler) = self.handlers.get(&event.event_type) else {
            warn!(%event_id, event_type = %event.event_type, "No handler registered, acknowledging");
            delivery.ack().await?;
            return Ok(self.settled(ProcessOutcome::Unhandled));
        };

        let started = Instant::now();
        let handled = handler.handle(&event).await;
        ConsumerMetrics::record_handler(started.elapsed());

        match handled {
            Ok(()) => {}
            Err(WorkError::Rejected(reason)) => {
                warn!(%event_id, event_type = %event.event_type, %reason, "Handler rejected event");
                return self.dead_letter(delivery, &reason).await;
            }
            Err(WorkError::Retryable(reason)) => {
                return self.retry_or_dead_letter(delivery, &event, &reason).await;
            }
        }

        match self.mark_processed(&event).await {
            Ok(RecordOutcome::Inserted) => {
                info!(%event_id, event_type = %event.event_type, retry_count, "Event processed");
            }
            Ok(RecordOutcome::AlreadyRecorded) => {
                info!(%event_id, event_type = %event.event_type, "Event already recorded by another worker");
            }
            Err(error) => {
                return self
                    .retry_or_dead_letter(delivery, &event, &format!("ledger write failed: {error}"))
                    .await;
            }
        }

        delivery.ack().await?;
        Ok(self.settled(ProcessOutcome::Handled))
    }

    async fn already_processed(&self, event_id: uuid::Uuid) -> Result<bool, LedgerError> {
        self.retry
            .run(&self.policy, || self.ledger.exists(event_id), |_: &LedgerError| true)
            .await
    }

    async fn mark_processed(&self, event: &DomainEvent) -> Result<RecordOutcome, LedgerError> {
        let record = ProcessedMessage {
            event_id: event.event_id(),
            event_type: event.event_type.clone(),
            processed_at: self.clock.now(),
        };
        self.retry
            .run(&self.policy, || self.ledger.record(&record), |_: &LedgerError| true)
            .await
    }

    async fn retry_or_dead_letter(
        &self,
        delivery: Delivery,
        event: &DomainEvent,
        reason: &str,
    ) -> Result<ProcessOutcome, BrokerError> {
        let retry_count = delivery.retry_count();
        if retry_count >= self.topology.max_retries {
            error!(
                event_id = %event.event_id(),
                event_type = %event.event_type,
                retry_count,
                reason,
                "Retries exhausted"
            );
            return self.dead_letter(delivery, reason).await;
        }

        let next = retry_count + 1;
        warn!(
            event_id = %event.event_id(),
            event_type = %event.event_type,
            retry_count = next,
            reason,
            "Event failed, scheduling retry"
        );
        let message = OutboundMessage::new(delivery.body().to_vec()).with_retry_count(next);
        self.republish(delivery, &self.topology.retry, message, ProcessOutcome::Retried(next))
            .await
    }

    async fn dead_letter(
        &self,
        delivery: Delivery,
        reason: &str,
    ) -> Result<ProcessOutcome, BrokerError> {
        warn!(
            queue = %self.topology.dead_letter,
            retry_count = delivery.retry_count(),
            reason,
            "Dead-lettering message"
        );
        let message =
            OutboundMessage::new(delivery.body().to_vec()).with_retry_count(delivery.retry_count());
        self.republish(delivery, &self.topology.dead_letter, message, ProcessOutcome::DeadLettered)
            .await
    }

    async fn republish(
        &self,
        delivery: Delivery,
        queue: &str,
        message: OutboundMessage,
        outcome: ProcessOutcome,
    ) -> Result<ProcessOutcome, BrokerError> {
        let published = self
            .retry
            .run(
                &self.policy,
                || self.broker.publish(queue, message.clone()),
                |_: &BrokerError| true,
            )
            .await;

        match published {
            Ok(()) => {
                delivery.ack().await?;
                Ok(self.settled(outcome))
            }
            Err(error) => {
                error!(
                    queue,
                    retry_count = delivery.retry_count(),
                    %error,
                    "Republish failed, rejecting delivery"
                );
                delivery.nack().await?;
                Ok(self.settled(ProcessOutcome::Requeued))
            }
        }
    }

    #[allow(clippy::unused_self)]
    fn settled(&self, outcome: ProcessOutcome) -> ProcessOutcome {
        ConsumerMetrics::record_outcome(outcome.label());
        outcome
    }

    /// Consume the main queue until shutdown, resubscribing on failure.
    pub async fn run(self: Arc<Self>, slot: usize, mut shutdown: broadcast::Receiver<()>) {
        let queue = self.topology.main.clone();
        info!(slot, %queue, "Event worker started");

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!(slot, "Event worker received shutdown signal");
                    break;
                }
                consumed = self.broker.consume(&queue) => {
                    match consumed {
                        Ok(mut stream) => {
                            info!(slot, %queue, "Subscribed to queue");
                            if self.drain(slot, &mut stream, &mut shutdown).await {
                                break;
                            }
                            warn!(slot, "Delivery stream ended, reconnecting in {:?}", self.reconnect_delay);
                        }
                        Err(error) => {
                            error!(
                                slot,
                                %error,
                                "Failed to consume queue, retrying in {:?}",
                                self.reconnect_delay
                            );
                        }
                    }
                }
            }

            tokio::select! {
                _ = shutdown.recv() => break,
                () = tokio::time::sleep(self.reconnect_delay) => {}
            }
        }

        info!(slot, "Event worker stopped");
    }

    /// Returns `true` if shutdown was requested.
    async fn drain(
        &self,
        slot: usize,
        stream: &mut steadfast_core::broker::DeliveryStream,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> bool {
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!(slot, "Event worker received shutdown signal during processing");
                    return true;
                }
                next = stream.next() => match next {
                    Some(Ok(delivery)) => {
                        if let Err(error) = self.process(delivery).await {
                            error!(slot, %error, "Failed to settle delivery");
                        }
                    }
                    Some(Err(error)) => {
                        error!(slot, %error, "Error receiving delivery");
                    }
                    None => return false,
                },
            }
        }
    }
}

impl std::fmt::Debug for EventWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventWorker")
            .field("topology", &self.topology)
            .field("handlers", &self.handlers)
            .field("reconnect_delay", &self.reconnect_delay)
            .finish_non_exhaustive()
    }
}

/// A fixed number of consumer slots sharing one [`EventWorker`].
#[derive(Debug, Clone)]
pub struct WorkerPool {
    worker: Arc<EventWorker>,
    concurrency: usize,
}

impl WorkerPool {
    /// Pool of `concurrency` slots (at least one).
    #[must_use]
    pub fn new(worker: Arc<EventWorker>, concurrency: usize) -> Self {
        Self {
            worker,
            concurrency: concurrency.max(1),
        }
    }

    /// Spawn every slot; each stops when `shutdown` fires.
    #[must_use]
    pub fn spawn(&self, shutdown: &broadcast::Sender<()>) -> Vec<tokio::task::JoinHandle<()>> {
        (0..self.concurrency)
            .map(|slot| {
                let worker = Arc::clone(&self.worker);
                tokio::spawn(worker.run(slot, shutdown.subscribe()))
            })
            .collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use steadfast_core::event::SchemaRegistry;
    use steadfast_testing::{InMemoryBroker, InMemoryLedger, RecordingSleeper, test_clock};

    #[derive(Default)]
    struct CountingHandler {
        calls: AtomicUsize,
        fail_with: Option<WorkError>,
    }

    #[async_trait]
    impl EventHandler for CountingHandler {
        async fn handle(&self, _event: &DomainEvent) -> Result<(), WorkError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.fail_with.clone().map_or(Ok(()), Err)
        }
    }

    #[derive(serde::Deserialize)]
    #[allow(dead_code)]
    struct Created {
        id: i64,
    }

    struct Harness {
        broker: InMemoryBroker,
        ledger: InMemoryLedger,
        topology: QueueTopology,
        handler: Arc<CountingHandler>,
        worker: EventWorker,
    }

    async fn harness(fail_with: Option<WorkError>) -> Harness {
        let broker = InMemoryBroker::new();
        let topology = QueueTopology::new("events").with_max_retries(3);
        broker.declare_topology(&topology).await.unwrap();
        let ledger = InMemoryLedger::new();
        let handler = Arc::new(CountingHandler {
            calls: AtomicUsize::new(0),
            fail_with,
        });
        let worker = EventWorker::new(
            Arc::new(broker.clone()),
            Arc::new(ledger.clone()),
            topology.clone(),
            HandlerRegistry::new().register("task.created", handler.clone()),
        )
        .with_schema(Arc::new(SchemaRegistry::new().register::<Created>("task.created")))
        .with_clock(Arc::new(test_clock()))
        .with_sleeper(Arc::new(RecordingSleeper::new()));
        Harness {
            broker,
            ledger,
            topology,
            handler,
            worker,
        }
    }

    fn event() -> DomainEvent {
        DomainEvent::new("task.created", json!({"id": 1}), "test", test_clock().now())
    }

    impl Harness {
        async fn deliver(&self, body: Vec<u8>, retry_count: u32) -> ProcessOutcome {
            self.broker.inject(&self.topology.main, body, retry_count).unwrap();
            let mut stream = self.broker.consume(&self.topology.main).await.unwrap();
            let delivery = stream.next().await.unwrap().unwrap();
            self.worker.process(delivery).await.unwrap()
        }
    }

    #[tokio::test]
    async fn successful_event_is_recorded_and_acked() {
        let h = harness(None).await;
        let event = event();

        let outcome = h.deliver(event.to_bytes().unwrap(), 0).await;

        assert_eq!(outcome, ProcessOutcome::Handled);
        assert_eq!(h.handler.calls.load(Ordering::SeqCst), 1);
        let record = h.ledger.get(event.event_id()).unwrap();
        assert_eq!(record.event_type, "task.created");
        assert_eq!(record.processed_at, test_clock().now());
        assert_eq!(h.broker.acked_count(), 1);
    }

    #[tokio::test]
    async fn redelivered_event_runs_side_effect_once() {
        let h = harness(None).await;
        let body = event().to_bytes().unwrap();

        assert_eq!(h.deliver(body.clone(), 0).await, ProcessOutcome::Handled);
        assert_eq!(h.deliver(body, 0).await, ProcessOutcome::Duplicate);

        assert_eq!(h.handler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.ledger.len(), 1);
        assert_eq!(h.broker.acked_count(), 2);
    }

    #[tokio::test]
    async fn malformed_body_is_dead_lettered() {
        let h = harness(None).await;

        let outcome = h.deliver(b"{not json".to_vec(), 0).await;

        assert_eq!(outcome, ProcessOutcome::DeadLettered);
        assert_eq!(h.broker.queue_len(&h.topology.dead_letter), 1);
        assert_eq!(h.handler.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn schema_invalid_payload_is_dead_lettered() {
        let h = harness(None).await;
        let bad = DomainEvent::new("task.created", json!({"id": "x"}), "test", test_clock().now());

        assert_eq!(
            h.deliver(bad.to_bytes().unwrap(), 0).await,
            ProcessOutcome::DeadLettered
        );
    }

    #[tokio::test]
    async fn missing_event_id_is_dropped() {
        let h = harness(None).await;
        let body = json!({
            "type": "task.created",
            "payload": {"id": 1},
            "metadata": {"timestamp": "2025-01-01T00:00:00Z", "source": "test"}
        });

        let outcome = h.deliver(body.to_string().into_bytes(), 0).await;

        assert_eq!(outcome, ProcessOutcome::Dropped);
        assert_eq!(h.broker.queue_len(&h.topology.dead_letter), 0);
        assert_eq!(h.broker.acked_count(), 1);
        assert!(h.ledger.is_empty());
    }

    #[tokio::test]
    async fn unknown_type_without_handler_is_acked() {
        let h = harness(None).await;
        let worker = EventWorker::new(
            Arc::new(h.broker.clone()),
            Arc::new(h.ledger.clone()),
            h.topology.clone(),
            HandlerRegistry::new(),
        );
        h.broker
            .inject(&h.topology.main, event().to_bytes().unwrap(), 0)
            .unwrap();
        let mut stream = h.broker.consume(&h.topology.main).await.unwrap();
        let delivery = stream.next().await.unwrap().unwrap();

        assert_eq!(worker.process(delivery).await.unwrap(), ProcessOutcome::Unhandled);
        assert!(h.ledger.is_empty());
    }

    #[tokio::test]
    async fn retryable_failure_goes_to_retry_with_incremented_count() {
        let h = harness(Some(WorkError::Retryable("smtp down".to_string()))).await;

        let outcome = h.deliver(event().to_bytes().unwrap(), 1).await;

        assert_eq!(outcome, ProcessOutcome::Retried(2));
        let retry = h.broker.messages(&h.topology.retry);
        assert_eq!(retry.len(), 1);
        assert_eq!(retry[0].retry_count, 2);
        assert!(h.ledger.is_empty());
        assert_eq!(h.broker.acked_count(), 1);
    }

    #[tokio::test]
    async fn failure_at_retry_ceiling_is_dead_lettered() {
        let h = harness(Some(WorkError::Retryable("smtp down".to_string()))).await;

        let outcome = h.deliver(event().to_bytes().unwrap(), 3).await;

        assert_eq!(outcome, ProcessOutcome::DeadLettered);
        assert_eq!(h.broker.queue_len(&h.topology.retry), 0);
        assert_eq!(h.broker.messages(&h.topology.dead_letter)[0].retry_count, 3);
    }

    #[tokio::test]
    async fn rejected_failure_skips_retry_tier() {
        let h = harness(Some(WorkError::Rejected("no such user".to_string()))).await;

        assert_eq!(
            h.deliver(event().to_bytes().unwrap(), 0).await,
            ProcessOutcome::DeadLettered
        );
        assert!(h.broker.history(&h.topology.retry).is_empty());
    }

    #[tokio::test]
    async fn ledger_outage_is_retried_not_treated_as_unprocessed() {
        let h = harness(None).await;
        h.ledger.faults().set_failing(true);

        let outcome = h.deliver(event().to_bytes().unwrap(), 0).await;

        assert_eq!(outcome, ProcessOutcome::Retried(1));
        assert_eq!(h.handler.calls.load(Ordering::SeqCst), 0);
    }

    struct RendezvousHandler {
        calls: AtomicUsize,
        barrier: tokio::sync::Barrier,
    }

    #[async_trait]
    impl EventHandler for RendezvousHandler {
        async fn handle(&self, _event: &DomainEvent) -> Result<(), WorkError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.barrier.wait().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn concurrent_duplicates_record_once_and_both_ack() {
        let h = harness(None).await;
        let handler = Arc::new(RendezvousHandler {
            calls: AtomicUsize::new(0),
            barrier: tokio::sync::Barrier::new(2),
        });
        let worker = EventWorker::new(
            Arc::new(h.broker.clone()),
            Arc::new(h.ledger.clone()),
            h.topology.clone(),
            HandlerRegistry::new().register("task.created", handler.clone()),
        )
        .with_clock(Arc::new(test_clock()))
        .with_sleeper(Arc::new(RecordingSleeper::new()));

        let body = event().to_bytes().unwrap();
        h.broker.inject(&h.topology.main, body.clone(), 0).unwrap();
        h.broker.inject(&h.topology.main, body, 0).unwrap();
        let mut stream = h.broker.consume(&h.topology.main).await.unwrap();
        let first = stream.next().await.unwrap().unwrap();
        let second = stream.next().await.unwrap().unwrap();

        // Neither handler returns until both have passed the ledger lookup.
        let (a, b) = tokio::join!(worker.process(first), worker.process(second));

        assert_eq!(a.unwrap(), ProcessOutcome::Handled);
        assert_eq!(b.unwrap(), ProcessOutcome::Handled);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
        assert_eq!(h.ledger.len(), 1);
        assert_eq!(h.broker.acked_count(), 2);
        assert_eq!(h.broker.nacked_count(), 0);
        assert_eq!(h.broker.queue_len(&h.topology.dead_letter), 0);
        assert_eq!(h.broker.queue_len(&h.topology.retry), 0);
    }

    #[tokio::test]
    async fn failed_republish_nacks_delivery() {
        let h = harness(Some(WorkError::Retryable("down".to_string()))).await;
        h.broker.publish_faults().set_failing(true);

        let outcome = h.deliver(event().to_bytes().unwrap(), 0).await;

        assert_eq!(outcome, ProcessOutcome::Requeued);
        assert_eq!(h.broker.nacked_count(), 1);
        // The broker's dead-letter route for main is the retry queue.
        let parked = h.broker.messages(&h.topology.retry);
        assert_eq!(parked.len(), 1);
        assert_eq!(parked[0].retry_count, 1);
    }

    #[tokio::test]
    async fn rejected_deliveries_still_reach_the_retry_ceiling() {
        let h = harness(Some(WorkError::Retryable("down".to_string()))).await;
        h.broker.publish_faults().set_failing(true);
        let body = event().to_bytes().unwrap();

        let mut retry_count = 0;
        for _ in 0..h.topology.max_retries {
            assert_eq!(h.deliver(body.clone(), retry_count).await, ProcessOutcome::Requeued);
            retry_count = h.broker.messages(&h.topology.retry).last().unwrap().retry_count;
        }
        assert_eq!(retry_count, h.topology.max_retries);

        h.broker.publish_faults().set_failing(false);
        assert_eq!(h.deliver(body, retry_count).await, ProcessOutcome::DeadLettered);
        assert_eq!(h.broker.queue_len(&h.topology.dead_letter), 1);
    }

    #[tokio::test]
    async fn pool_stops_on_shutdown() {
        let h = harness(None).await;
        let (shutdown, _) = broadcast::channel(1);
        let handles = WorkerPool::new(Arc::new(h.worker), 2).spawn(&shutdown);

        h.broker
            .publish(&h.topology.main, OutboundMessage::new(event().to_bytes().unwrap()))
            .await
            .unwrap();
        assert!(h.broker.wait_for_len(&h.topology.main, 0, Duration::from_secs(5)).await);

        shutdown.send(()).unwrap();
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(h.ledger.len(), 1);
    }
}
