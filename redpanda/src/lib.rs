//! Redpanda broker implementation for Steadfast.
//!
//! This crate implements the [`Broker`] trait from `steadfast-core` on
//! Kafka-compatible topics using rdkafka. Each queue of a
//! [`QueueTopology`] is one topic.
//!
//! # Architecture
//!
//! ```text
//!   publish ──▶ ┌────────┐  consume  ┌────────┐
//!               │  main  │ ────────▶ │ worker │
//!               └────────┘           └───┬────┘
//!                   ▲                    │ nack / republish
//!                   │ not-before         ▼
//!             ┌───────────┐        ┌─────────┐
//!             │   relay   │ ◀───── │  retry  │
//!             └───────────┘        └─────────┘
//! ```
//!
//! Kafka has no per-message TTL, so the retry tier is a topic whose
//! messages carry a `not-before` header (epoch milliseconds). The retry
//! relay started by [`RedpandaBroker::spawn_retry_relay`] waits until that
//! instant and forwards the message to main, keeping its retry-count header.
//! Because every retry message gets the same delay, waiting on the head of
//! a partition never holds back a message that is already due.
//!
//! # Delivery Semantics
//!
//! **At-least-once delivery** with manual offset commits:
//! - A consumer hands out one delivery at a time and waits for it to be settled
//! - `ack` commits the offset
//! - `nack` forwards the message along the queue's dead-letter route, then commits
//! - A delivery dropped without settling stops the consumer uncommitted, so the
//!   group rebalances and the message is redelivered
//!
//! Topics are created on [`Broker::declare_topology`]; producers use
//! `acks=all` so a confirmed publish is persisted on every in-sync replica.
//!
//! # Example
//!
//! ```no_run
//! use steadfast_core::broker::{Broker, OutboundMessage, QueueTopology};
//! use steadfast_redpanda::RedpandaBroker;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let broker = RedpandaBroker::builder()
//!     .brokers("localhost:9092")
//!     .consumer_group("task-workers")
//!     .build()?;
//!
//! let topology = QueueTopology::new("task_events");
//! broker.declare_topology(&topology).await?;
//! let _relay = broker.spawn_retry_relay()?;
//!
//! broker.publish(&topology.main, OutboundMessage::new(b"{}".to_vec())).await?;
//! # Ok(())
//! # }
//! ```

use futures::StreamExt;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::RDKafkaErrorCode;
use rdkafka::message::{BorrowedMessage, Header, Headers, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use steadfast_core::broker::{
    Acknowledger, Broker, BrokerError, Delivery, DeliveryStream, OutboundMessage, QueueTopology,
    RETRY_COUNT_HEADER,
};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

/// Header carrying the earliest time (epoch milliseconds) a retry message may
/// return to the main queue.
pub const NOT_BEFORE_HEADER: &str = "x-not-before";

/// Redpanda broker.
///
/// Cloning is cheap; clones share the producer, the declared topology and
/// the shutdown signal.
#[derive(Clone)]
pub struct RedpandaBroker {
    producer: FutureProducer,
    brokers: String,
    consumer_group: String,
    timeout: Duration,
    partitions: i32,
    replication_factor: i32,
    auto_offset_reset: String,
    topology: Arc<RwLock<Option<QueueTopology>>>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl RedpandaBroker {
    /// Create a broker with default configuration.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ConnectionFailed`] if the producer cannot be created.
    pub fn new(brokers: &str) -> Result<Self, BrokerError> {
        Self::builder().brokers(brokers).build()
    }

    /// Create a new builder for configuring the broker.
    #[must_use]
    pub fn builder() -> RedpandaBrokerBuilder {
        RedpandaBrokerBuilder::default()
    }

    /// Get a reference to the brokers string.
    #[must_use]
    pub fn brokers(&self) -> &str {
        &self.brokers
    }

    fn declared(&self) -> Result<QueueTopology, BrokerError> {
        self.topology
            .read()
            .map_err(|_| BrokerError::ConnectionFailed("topology lock poisoned".to_string()))?
            .clone()
            .ok_or_else(|| BrokerError::UnknownQueue("no topology declared".to_string()))
    }

    fn ensure_open(&self) -> Result<(), BrokerError> {
        if *self.shutdown.borrow() {
            Err(BrokerError::Closed)
        } else {
            Ok(())
        }
    }

    fn create_consumer(&self, group: &str, topic: &str) -> Result<StreamConsumer, BrokerError> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &self.brokers)
            .set("group.id", group)
            .set("enable.auto.commit", "false") // Manual commit for at-least-once
            .set("auto.offset.reset", &self.auto_offset_reset)
            .set("session.timeout.ms", "6000")
            .set("enable.partition.eof", "false")
            .create()
            .map_err(|e| BrokerError::ConsumeFailed {
                queue: topic.to_string(),
                reason: format!("Failed to create consumer: {e}"),
            })?;

        consumer
            .subscribe(&[topic])
            .map_err(|e| BrokerError::ConsumeFailed {
                queue: topic.to_string(),
                reason: format!("Failed to subscribe: {e}"),
            })?;
        Ok(consumer)
    }

    /// Start forwarding due retry messages back to the main queue.
    ///
    /// The relay runs until [`Broker::close`] is called.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::UnknownQueue`] if no topology has been declared,
    /// or [`BrokerError::ConsumeFailed`] if the relay cannot subscribe.
    pub fn spawn_retry_relay(&self) -> Result<JoinHandle<()>, BrokerError> {
        self.ensure_open()?;
        let topology = self.declared()?;
        let group = format!("{}.retry-relay", self.consumer_group);
        let consumer = self.create_consumer(&group, &topology.retry)?;
        let producer = self.producer.clone();
        let timeout = self.timeout;
        let mut shutdown = self.shutdown.subscribe();

        tracing::info!(
            retry = %topology.retry,
            main = %topology.main,
            consumer_group = %group,
            "Retry relay started"
        );

        Ok(tokio::spawn(async move {
            let mut stream = consumer.stream();

            loop {
                let next = tokio::select! {
                    _ = shutdown.changed() => break,
                    next = stream.next() => next,
                };
                let message = match next {
                    Some(Ok(message)) => message,
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "Retry relay failed to receive message");
                        continue;
                    }
                    None => break,
                };

                let retry_count = header_value(message.headers(), RETRY_COUNT_HEADER).unwrap_or(0);
                let not_before: i64 =
                    header_value(message.headers(), NOT_BEFORE_HEADER).unwrap_or(0);
                let wait = relay_wait(not_before, chrono::Utc::now().timestamp_millis());

                tokio::select! {
                    _ = shutdown.changed() => break,
                    () = tokio::time::sleep(wait) => {}
                }

                let body = message.payload().unwrap_or_default();
                loop {
                    match produce(&producer, timeout, &topology.main, body, retry_count, None).await {
                        Ok(()) => break,
                        Err(e) => {
                            tracing::warn!(error = %e, "Retry relay failed to forward, retrying");
                            tokio::select! {
                                _ = shutdown.changed() => return,
                                () = tokio::time::sleep(Duration::from_secs(1)) => {}
                            }
                        }
                    }
                }

                if let Err(e) = consumer.commit_message(&message, CommitMode::Async) {
                    tracing::warn!(
                        partition = message.partition(),
                        offset = message.offset(),
                        error = %e,
                        "Failed to commit relayed message (it may be relayed again)"
                    );
                }
                tracing::debug!(retry_count, main = %topology.main, "Relayed retry message");
            }

            tracing::debug!("Retry relay exiting");
        }))
    }
}

/// Builder for configuring a [`RedpandaBroker`].
#[derive(Default)]
pub struct RedpandaBrokerBuilder {
    brokers: Option<String>,
    consumer_group: Option<String>,
    timeout: Option<Duration>,
    partitions: Option<i32>,
    replication_factor: Option<i32>,
    auto_offset_reset: Option<String>,
}

impl RedpandaBrokerBuilder {
    /// Set the broker addresses.
    ///
    /// # Parameters
    ///
    /// - `brokers`: Comma-separated list of broker addresses (e.g., "localhost:9092")
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Set the consumer group shared by all worker slots (default: "steadfast").
    #[must_use]
    pub fn consumer_group(mut self, consumer_group: impl Into<String>) -> Self {
        self.consumer_group = Some(consumer_group.into());
        self
    }

    /// Set the producer send timeout.
    ///
    /// Default: 5 seconds
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the partition count for created topics (default: 1).
    #[must_use]
    pub const fn partitions(mut self, partitions: i32) -> Self {
        self.partitions = Some(partitions);
        self
    }

    /// Set the replication factor for created topics (default: 1).
    #[must_use]
    pub const fn replication_factor(mut self, replication_factor: i32) -> Self {
        self.replication_factor = Some(replication_factor);
        self
    }

    /// Set where a new consumer group starts reading (default: "earliest").
    #[must_use]
    pub fn auto_offset_reset(mut self, policy: impl Into<String>) -> Self {
        self.auto_offset_reset = Some(policy.into());
        self
    }

    /// Build the [`RedpandaBroker`].
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ConnectionFailed`] if:
    /// - Brokers not set
    /// - Cannot create producer
    pub fn build(self) -> Result<RedpandaBroker, BrokerError> {
        let brokers = self
            .brokers
            .ok_or_else(|| BrokerError::ConnectionFailed("Brokers not configured".to_string()))?;
        let timeout = self.timeout.unwrap_or(Duration::from_secs(5));

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &brokers)
            .set("message.timeout.ms", timeout.as_millis().to_string())
            .set("acks", "all")
            .set("enable.idempotence", "true")
            .create()
            .map_err(|e| BrokerError::ConnectionFailed(format!("Failed to create producer: {e}")))?;

        let consumer_group = self.consumer_group.unwrap_or_else(|| "steadfast".to_string());
        tracing::info!(brokers = %brokers, consumer_group = %consumer_group, "RedpandaBroker created");

        let (shutdown, _) = watch::channel(false);
        Ok(RedpandaBroker {
            producer,
            brokers,
            consumer_group,
            timeout,
            partitions: self.partitions.unwrap_or(1),
            replication_factor: self.replication_factor.unwrap_or(1),
            auto_offset_reset: self
                .auto_offset_reset
                .unwrap_or_else(|| "earliest".to_string()),
            topology: Arc::new(RwLock::new(None)),
            shutdown: Arc::new(shutdown),
        })
    }
}

/// Headers for an outbound record.
fn outbound_headers(retry_count: u32, not_before: Option<i64>) -> OwnedHeaders {
    let count = retry_count.to_string();
    let headers = OwnedHeaders::new().insert(Header {
        key: RETRY_COUNT_HEADER,
        value: Some(count.as_str()),
    });
    match not_before {
        Some(at) => {
            let at = at.to_string();
            headers.insert(Header {
                key: NOT_BEFORE_HEADER,
                value: Some(at.as_str()),
            })
        }
        None => headers,
    }
}

/// Parse the first header named `key`.
fn header_value<H, T>(headers: Option<&H>, key: &str) -> Option<T>
where
    H: Headers,
    T: FromStr,
{
    headers?
        .iter()
        .find(|header| header.key == key)
        .and_then(|header| header.value)
        .and_then(|value| std::str::from_utf8(value).ok())
        .and_then(|value| value.parse().ok())
}

fn not_before(topology: &QueueTopology, queue: &str) -> Option<i64> {
    (queue == topology.retry).then(|| {
        let ttl = i64::try_from(topology.retry_ttl.as_millis()).unwrap_or(i64::MAX);
        chrono::Utc::now().timestamp_millis().saturating_add(ttl)
    })
}

/// Time left until `not_before`; zero once it has passed.
fn relay_wait(not_before: i64, now: i64) -> Duration {
    u64::try_from(not_before.saturating_sub(now))
        .map(Duration::from_millis)
        .unwrap_or(Duration::ZERO)
}

async fn produce(
    producer: &FutureProducer,
    timeout: Duration,
    topic: &str,
    body: &[u8],
    retry_count: u32,
    not_before: Option<i64>,
) -> Result<(), BrokerError> {
    let record = FutureRecord::<(), [u8]>::to(topic)
        .payload(body)
        .headers(outbound_headers(retry_count, not_before));

    match producer.send(record, Timeout::After(timeout)).await {
        Ok((partition, offset)) => {
            tracing::debug!(topic, partition, offset, retry_count, "Message published");
            Ok(())
        }
        Err((kafka_error, _)) => {
            tracing::error!(topic, error = %kafka_error, "Failed to publish message");
            Err(BrokerError::PublishFailed {
                queue: topic.to_string(),
                reason: kafka_error.to_string(),
            })
        }
    }
}

enum Settlement {
    Ack,
    Nack,
}

type SettlementRequest = (Settlement, oneshot::Sender<Result<(), BrokerError>>);

/// Hands the settlement to the consumer task that owns the message.
struct RedpandaAcker {
    settle: oneshot::Sender<SettlementRequest>,
}

impl RedpandaAcker {
    fn settle(
        self,
        settlement: Settlement,
    ) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let sent = self.settle.send((settlement, reply_tx));
        Box::pin(async move {
            if sent.is_err() {
                return Err(BrokerError::AckFailed("consumer stopped".to_string()));
            }
            reply_rx.await.unwrap_or_else(|_| {
                Err(BrokerError::AckFailed(
                    "consumer stopped before settling".to_string(),
                ))
            })
        })
    }
}

impl Acknowledger for RedpandaAcker {
    fn ack(self: Box<Self>) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send>> {
        self.settle(Settlement::Ack)
    }

    fn nack(self: Box<Self>) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send>> {
        self.settle(Settlement::Nack)
    }
}

fn commit(
    consumer: &StreamConsumer,
    message: &BorrowedMessage<'_>,
    queue: &str,
) -> Result<(), BrokerError> {
    consumer
        .commit_message(message, CommitMode::Async)
        .map_err(|e| {
            tracing::warn!(
                queue,
                partition = message.partition(),
                offset = message.offset(),
                error = %e,
                "Failed to commit offset (message may be redelivered)"
            );
            BrokerError::AckFailed(e.to_string())
        })
}

impl Broker for RedpandaBroker {
    fn declare_topology(
        &self,
        topology: &QueueTopology,
    ) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + '_>> {
        let topology = topology.clone();

        Box::pin(async move {
            self.ensure_open()?;

            let admin: AdminClient<DefaultClientContext> = ClientConfig::new()
                .set("bootstrap.servers", &self.brokers)
                .create()
                .map_err(|e| {
                    BrokerError::ConnectionFailed(format!("Failed to create admin client: {e}"))
                })?;

            let names = topology.declaration_order();
            let topics: Vec<NewTopic<'_>> = names
                .iter()
                .map(|name| {
                    NewTopic::new(
                        name,
                        self.partitions,
                        TopicReplication::Fixed(self.replication_factor),
                    )
                })
                .collect();

            let results = admin
                .create_topics(&topics, &AdminOptions::new())
                .await
                .map_err(|e| BrokerError::TopologyFailed {
                    queue: topology.main.clone(),
                    reason: e.to_string(),
                })?;

            for result in results {
                match result {
                    Ok(name) => tracing::info!(topic = %name, "Created topic"),
                    Err((name, RDKafkaErrorCode::TopicAlreadyExists)) => {
                        tracing::debug!(topic = %name, "Topic already exists");
                    }
                    Err((name, code)) => {
                        return Err(BrokerError::TopologyFailed {
                            queue: name,
                            reason: code.to_string(),
                        });
                    }
                }
            }

            let mut declared = self.topology.write().map_err(|_| {
                BrokerError::ConnectionFailed("topology lock poisoned".to_string())
            })?;
            if let Some(existing) = declared.as_ref() {
                if *existing != topology {
                    return Err(BrokerError::TopologyFailed {
                        queue: topology.main.clone(),
                        reason: "a different topology is already declared".to_string(),
                    });
                }
            }
            *declared = Some(topology);
            Ok(())
        })
    }

    fn publish(
        &self,
        queue: &str,
        message: OutboundMessage,
    ) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + '_>> {
        let queue = queue.to_string();

        Box::pin(async move {
            self.ensure_open()?;
            let topology = self.declared()?;
            if !topology.contains(&queue) {
                return Err(BrokerError::UnknownQueue(queue));
            }

            produce(
                &self.producer,
                self.timeout,
                &queue,
                &message.body,
                message.retry_count,
                not_before(&topology, &queue),
            )
            .await
        })
    }

    #[allow(clippy::too_many_lines)] // Settlement hand-off keeps the consumer loop in one place
    fn consume(
        &self,
        queue: &str,
    ) -> Pin<Box<dyn Future<Output = Result<DeliveryStream, BrokerError>> + Send + '_>> {
        let queue = queue.to_string();

        Box::pin(async move {
            self.ensure_open()?;
            let topology = self.declared()?;
            if !topology.contains(&queue) {
                return Err(BrokerError::UnknownQueue(queue));
            }

            let consumer = self.create_consumer(&self.consumer_group, &queue)?;
            let producer = self.producer.clone();
            let timeout = self.timeout;
            let mut shutdown = self.shutdown.subscribe();

            tracing::info!(
                queue = %queue,
                consumer_group = %self.consumer_group,
                manual_commit = true,
                "Subscribed to queue"
            );

            // One in flight: the next message is fetched only after this one settles.
            let (tx, rx) = mpsc::channel(1);

            tokio::spawn(async move {
                let mut stream = consumer.stream();

                loop {
                    let next = tokio::select! {
                        _ = shutdown.changed() => break,
                        next = stream.next() => next,
                    };
                    let message = match next {
                        Some(Ok(message)) => message,
                        Some(Err(e)) => {
                            let err = BrokerError::ConsumeFailed {
                                queue: queue.clone(),
                                reason: format!("Failed to receive message: {e}"),
                            };
                            if tx.send(Err(err)).await.is_err() {
                                break; // Receiver dropped
                            }
                            continue;
                        }
                        None => break,
                    };

                    let retry_count = header_value(message.headers(), RETRY_COUNT_HEADER).unwrap_or(0);
                    let body = message.payload().map(<[u8]>::to_vec).unwrap_or_default();
                    let (settle_tx, settle_rx) = oneshot::channel();
                    let delivery = Delivery::new(
                        queue.clone(),
                        body,
                        retry_count,
                        Box::new(RedpandaAcker { settle: settle_tx }),
                    );

                    if tx.send(Ok(delivery)).await.is_err() {
                        tracing::debug!("Delivery receiver dropped, exiting consumer task");
                        break; // Exit WITHOUT committing
                    }

                    let Ok((settlement, reply)) = settle_rx.await else {
                        tracing::warn!(
                            queue = %queue,
                            offset = message.offset(),
                            "Delivery dropped unsettled, stopping consumer for redelivery"
                        );
                        break;
                    };

                    let result = match settlement {
                        Settlement::Ack => commit(&consumer, &message, &queue),
                        Settlement::Nack => match topology.dead_letter_route(&queue) {
                            Some(target) => {
                                let forwarded = produce(
                                    &producer,
                                    timeout,
                                    target,
                                    message.payload().unwrap_or_default(),
                                    topology.rejected_retry_count(&queue, retry_count),
                                    not_before(&topology, target),
                                )
                                .await;
                                forwarded.and_then(|()| commit(&consumer, &message, &queue))
                            }
                            None => commit(&consumer, &message, &queue),
                        },
                    };

                    // The settling side may have given up waiting.
                    let _ = reply.send(result);
                }

                tracing::debug!(queue = %queue, "Consumer task exiting");
            });

            let stream = async_stream::stream! {
                let mut rx = rx;
                while let Some(result) = rx.recv().await {
                    yield result;
                }
            };

            Ok(Box::pin(stream) as DeliveryStream)
        })
    }

    fn close(&self) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + '_>> {
        Box::pin(async move {
            self.shutdown.send_replace(true);

            let producer = self.producer.clone();
            let timeout = self.timeout;
            tokio::task::spawn_blocking(move || producer.flush(Timeout::After(timeout)))
                .await
                .map_err(|e| BrokerError::ConnectionFailed(format!("Flush task failed: {e}")))?
                .map_err(|e| BrokerError::ConnectionFailed(format!("Failed to flush producer: {e}")))?;

            tracing::info!("RedpandaBroker closed");
            Ok(())
        })
    }
}

impl std::fmt::Debug for RedpandaBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedpandaBroker")
            .field("brokers", &self.brokers)
            .field("consumer_group", &self.consumer_group)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn redpanda_broker_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<RedpandaBroker>();
        assert_sync::<RedpandaBroker>();
    }

    #[test]
    fn relay_wait_handles_extreme_headers() {
        assert_eq!(relay_wait(1_500, 1_000), Duration::from_millis(500));
        assert_eq!(relay_wait(1_000, 1_500), Duration::ZERO);
        assert_eq!(relay_wait(i64::MIN, 1_000), Duration::ZERO);
        assert_eq!(relay_wait(i64::MAX, -1_000), Duration::from_millis(i64::MAX.unsigned_abs()));
    }

    #[test]
    fn builder_requires_brokers() {
        let err = RedpandaBroker::builder().build().unwrap_err();
        assert!(matches!(err, BrokerError::ConnectionFailed(_)));
    }

    #[test]
    fn retry_headers_round_trip() {
        let headers = outbound_headers(2, Some(1_700_000_000_000));

        assert_eq!(header_value::<_, u32>(Some(&headers), RETRY_COUNT_HEADER), Some(2));
        assert_eq!(
            header_value::<_, i64>(Some(&headers), NOT_BEFORE_HEADER),
            Some(1_700_000_000_000)
        );
    }

    #[test]
    fn missing_or_garbled_headers_read_as_none() {
        let garbled = OwnedHeaders::new().insert(Header {
            key: RETRY_COUNT_HEADER,
            value: Some("many"),
        });

        assert_eq!(header_value::<OwnedHeaders, u32>(None, RETRY_COUNT_HEADER), None);
        assert_eq!(header_value::<_, u32>(Some(&garbled), RETRY_COUNT_HEADER), None);
        assert_eq!(
            header_value::<_, i64>(Some(&outbound_headers(0, None)), NOT_BEFORE_HEADER),
            None
        );
    }

    #[test]
    fn only_retry_queue_gets_a_delay() {
        let topology = QueueTopology::new("events").with_retry_ttl(Duration::from_secs(5));
        let before = chrono::Utc::now().timestamp_millis();

        let due = not_before(&topology, &topology.retry).unwrap();

        assert!(due >= before + 5_000);
        assert_eq!(not_before(&topology, &topology.main), None);
        assert_eq!(not_before(&topology, &topology.dead_letter), None);
    }

    #[tokio::test]
    async fn publish_before_declare_is_unknown_queue() {
        let broker = RedpandaBroker::new("localhost:9092").unwrap();

        let err = broker
            .publish("events", OutboundMessage::new(vec![1]))
            .await
            .unwrap_err();

        assert!(matches!(err, BrokerError::UnknownQueue(_)));
    }

    #[tokio::test]
    async fn closed_broker_rejects_work() {
        let broker = RedpandaBroker::new("localhost:9092").unwrap();
        broker.close().await.unwrap();

        let err = broker.consume("events").await.err().unwrap();
        assert_eq!(err, BrokerError::Closed);
    }
}
