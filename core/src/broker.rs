//! Broker abstraction for durable event queues.
//!
//! This module provides the [`Broker`] trait and the [`QueueTopology`] that
//! every broker declares before use: three named queues related by
//! dead-letter routing.
//!
//! # Topology
//!
//! ```text
//!                      nack
//!   ┌────────┐ ───────────────────────▶ ┌─────────┐
//!   │  main  │                          │  retry  │  (messages wait retry_ttl)
//!   └────────┘ ◀─────────────────────── └─────────┘
//!        │            TTL expiry
//!        │ retry-count ≥ max_retries
//!        ▼
//!   ┌─────────────┐
//!   │ dead-letter │  (terminal, for inspection and replay)
//!   └─────────────┘
//! ```
//!
//! A message nacked from *main* is dead-lettered to *retry*, waits out the
//! retry TTL, and is routed back to *main*. Consumers count round trips in
//! the [`RETRY_COUNT_HEADER`] and publish to *dead-letter* once the count
//! reaches [`QueueTopology::max_retries`].
//!
//! # Key Principles
//!
//! - **At-least-once delivery**: every delivery may be a redelivery
//! - **Explicit acknowledgement**: a delivery is settled only by
//!   [`Delivery::ack`] or [`Delivery::nack`]
//! - **Idempotent setup**: declaring an existing topology is a no-op

use futures::Stream;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;

/// Header carrying how many times a message has been through the retry tier.
pub const RETRY_COUNT_HEADER: &str = "x-retry-count";

/// Default retry-tier TTL.
pub const DEFAULT_RETRY_TTL: Duration = Duration::from_secs(5);

/// Default number of retry round trips before dead-lettering.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Errors that can occur during broker operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// Failed to connect to the broker
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Failed to declare a queue
    #[error("Topology declaration failed for queue '{queue}': {reason}")]
    TopologyFailed {
        /// The queue that failed
        queue: String,
        /// The reason for failure
        reason: String,
    },

    /// Failed to publish a message
    #[error("Publish failed for queue '{queue}': {reason}")]
    PublishFailed {
        /// The queue that failed
        queue: String,
        /// The reason for failure
        reason: String,
    },

    /// Failed to start or continue consuming
    #[error("Consume failed for queue '{queue}': {reason}")]
    ConsumeFailed {
        /// The queue that failed
        queue: String,
        /// The reason for failure
        reason: String,
    },

    /// Failed to settle a delivery
    #[error("Acknowledgement failed: {0}")]
    AckFailed(String),

    /// Queue is not part of the declared topology
    #[error("Unknown queue: {0}")]
    UnknownQueue(String),

    /// The broker has been closed
    #[error("Broker is closed")]
    Closed,
}

/// Names and timings of the main/retry/dead-letter queues.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueTopology {
    /// Queue workers consume from
    pub main: String,
    /// Holding queue that routes back to `main` after `retry_ttl`
    pub retry: String,
    /// Terminal queue
    pub dead_letter: String,
    /// How long a message waits on `retry`
    pub retry_ttl: Duration,
    /// Retry round trips before dead-lettering
    pub max_retries: u32,
}

impl QueueTopology {
    /// Topology for `main`, with `{main}.retry` and `{main}.dlq` and default timings.
    #[must_use]
    pub fn new(main: impl Into<String>) -> Self {
        let main = main.into();
        Self {
            retry: format!("{main}.retry"),
            dead_letter: format!("{main}.dlq"),
            main,
            retry_ttl: DEFAULT_RETRY_TTL,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    /// Override the retry queue name.
    #[must_use]
    pub fn with_retry_queue(mut self, name: impl Into<String>) -> Self {
        self.retry = name.into();
        self
    }

    /// Override the dead-letter queue name.
    #[must_use]
    pub fn with_dead_letter_queue(mut self, name: impl Into<String>) -> Self {
        self.dead_letter = name.into();
        self
    }

    /// Override the retry TTL.
    #[must_use]
    pub const fn with_retry_ttl(mut self, ttl: Duration) -> Self {
        self.retry_ttl = ttl;
        self
    }

    /// Override the retry ceiling.
    #[must_use]
    pub const fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Where a message rejected (or expired) on `queue` is routed.
    ///
    /// `main` routes to `retry`, `retry` routes back to `main`, and
    /// `dead_letter` is terminal.
    #[must_use]
    pub fn dead_letter_route(&self, queue: &str) -> Option<&str> {
        if queue == self.main {
            Some(&self.retry)
        } else if queue == self.retry {
            Some(&self.main)
        } else {
            None
        }
    }

    /// Retry count a message carries after being rejected on `queue`.
    ///
    /// A rejection on `main` parks the message on `retry`, which counts as
    /// one more attempt. The hop from `retry` back to `main` keeps the count.
    #[must_use]
    pub fn rejected_retry_count(&self, queue: &str, retry_count: u32) -> u32 {
        if queue == self.main {
            retry_count.saturating_add(1)
        } else {
            retry_count
        }
    }

    /// All three queues in declaration order (dead-letter, retry, main).
    #[must_use]
    pub fn declaration_order(&self) -> [&str; 3] {
        [&self.dead_letter, &self.retry, &self.main]
    }

    /// Whether `queue` belongs to this topology.
    #[must_use]
    pub fn contains(&self, queue: &str) -> bool {
        queue == self.main || queue == self.retry || queue == self.dead_letter
    }
}

impl Default for QueueTopology {
    fn default() -> Self {
        Self::new("task_events")
    }
}

/// A message to publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    /// Serialized event
    pub body: Vec<u8>,
    /// Value of the retry-count header
    pub retry_count: u32,
    /// Whether the broker must persist the message to disk
    pub persistent: bool,
}

impl OutboundMessage {
    /// A persistent message with retry count zero.
    #[must_use]
    pub const fn new(body: Vec<u8>) -> Self {
        Self {
            body,
            retry_count: 0,
            persistent: true,
        }
    }

    /// Set the retry-count header.
    #[must_use]
    pub const fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }
}

/// Settles a single delivery with the broker.
///
/// Implemented by each broker; consumers call [`Delivery::ack`] and
/// [`Delivery::nack`] instead of using this directly.
pub trait Acknowledger: Send {
    /// Mark the delivery handled; the broker will not redeliver it.
    fn ack(self: Box<Self>) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send>>;

    /// Reject the delivery; the broker routes it along the queue's dead-letter route.
    fn nack(self: Box<Self>) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send>>;
}

/// A message received from a queue, pending acknowledgement.
pub struct Delivery {
    queue: String,
    body: Vec<u8>,
    retry_count: u32,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    /// Create a delivery. Called by broker implementations.
    #[must_use]
    pub fn new(
        queue: impl Into<String>,
        body: Vec<u8>,
        retry_count: u32,
        acker: Box<dyn Acknowledger>,
    ) -> Self {
        Self {
            queue: queue.into(),
            body,
            retry_count,
            acker,
        }
    }

    /// Queue this delivery came from.
    #[must_use]
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Raw message body.
    #[must_use]
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Value of the retry-count header (zero if absent).
    #[must_use]
    pub const fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Acknowledge the delivery.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::AckFailed`] if the broker rejects the acknowledgement.
    pub async fn ack(self) -> Result<(), BrokerError> {
        self.acker.ack().await
    }

    /// Reject the delivery, routing it along the queue's dead-letter route.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::AckFailed`] if the broker rejects the call.
    pub async fn nack(self) -> Result<(), BrokerError> {
        self.acker.nack().await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("queue", &self.queue)
            .field("body_len", &self.body.len())
            .field("retry_count", &self.retry_count)
            .finish_non_exhaustive()
    }
}

/// Stream of deliveries from a queue.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<Delivery, BrokerError>> + Send>>;

/// Trait for broker implementations.
///
/// # Dyn Compatibility
///
/// This trait uses explicit `Pin<Box<dyn Future>>` returns instead of
/// `async fn` to allow `Arc<dyn Broker>`.
pub trait Broker: Send + Sync {
    /// Declare the topology. Declaring an existing topology is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::TopologyFailed`] if a queue cannot be created.
    fn declare_topology(
        &self,
        topology: &QueueTopology,
    ) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + '_>>;

    /// Publish a message to a queue.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::PublishFailed`] if the broker does not confirm the message.
    fn publish(
        &self,
        queue: &str,
        message: OutboundMessage,
    ) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + '_>>;

    /// Start consuming a queue.
    ///
    /// Every item must be settled with [`Delivery::ack`] or [`Delivery::nack`].
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ConsumeFailed`] if the subscription cannot be set up.
    fn consume(
        &self,
        queue: &str,
    ) -> Pin<Box<dyn Future<Output = Result<DeliveryStream, BrokerError>> + Send + '_>>;

    /// Flush pending work and release connections.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError`] if in-flight messages could not be flushed.
    fn close(&self) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + '_>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_topology_names() {
        let topology = QueueTopology::default();
        assert_eq!(topology.main, "task_events");
        assert_eq!(topology.retry, "task_events.retry");
        assert_eq!(topology.dead_letter, "task_events.dlq");
        assert_eq!(topology.retry_ttl, Duration::from_secs(5));
        assert_eq!(topology.max_retries, 3);
    }

    #[test]
    fn dead_letter_routes_form_a_ladder() {
        let topology = QueueTopology::new("orders");
        assert_eq!(topology.dead_letter_route("orders"), Some("orders.retry"));
        assert_eq!(topology.dead_letter_route("orders.retry"), Some("orders"));
        assert_eq!(topology.dead_letter_route("orders.dlq"), None);
        assert_eq!(topology.dead_letter_route("elsewhere"), None);
    }

    #[test]
    fn rejection_on_main_counts_as_an_attempt() {
        let topology = QueueTopology::new("orders");
        assert_eq!(topology.rejected_retry_count("orders", 0), 1);
        assert_eq!(topology.rejected_retry_count("orders.retry", 1), 1);
        assert_eq!(topology.rejected_retry_count("orders", u32::MAX), u32::MAX);
    }

    #[test]
    fn declaration_order_puts_dead_letter_first() {
        let topology = QueueTopology::new("q")
            .with_dead_letter_queue("graveyard")
            .with_retry_queue("waiting");
        assert_eq!(topology.declaration_order(), ["graveyard", "waiting", "q"]);
        assert!(topology.contains("waiting"));
        assert!(!topology.contains("q.retry"));
    }
}
