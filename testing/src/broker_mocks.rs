#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity

use crate::faults::FaultSwitch;
use futures::future::ready;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use steadfast_core::broker::{
    Acknowledger, Broker, BrokerError, Delivery, DeliveryStream, OutboundMessage, QueueTopology,
};
use tokio::sync::Notify;

/// A message held by [`InMemoryBroker`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    /// Broker-assigned sequence number
    pub id: u64,
    /// Message body
    pub body: Vec<u8>,
    /// Retry-count header
    pub retry_count: u32,
    /// Persistence flag as published
    pub persistent: bool,
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<StoredMessage>,
    history: Vec<StoredMessage>,
    notify: Arc<Notify>,
}

#[derive(Debug, Default)]
struct Shared {
    queues: Mutex<HashMap<String, QueueState>>,
    topology: Mutex<Option<QueueTopology>>,
    closed: AtomicBool,
    next_id: AtomicU64,
    acked: AtomicUsize,
    nacked: AtomicUsize,
    declarations: AtomicUsize,
    publish_faults: FaultSwitch,
}

impl Shared {
    fn enqueue(self: &Arc<Self>, queue: &str, message: StoredMessage) -> Result<(), BrokerError> {
        let topology = self
            .topology
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .filter(|t| t.contains(queue))
            .ok_or_else(|| BrokerError::UnknownQueue(queue.to_string()))?;

        let id = message.id;
        {
            let mut queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
            let state = queues.entry(queue.to_string()).or_default();
            state.history.push(message.clone());
            state.ready.push_back(message);
            state.notify.notify_one();
        }

        // Retry-tier messages expire back to main after the TTL.
        if queue == topology.retry {
            let shared = Arc::clone(self);
            let retry = topology.retry.clone();
            let main = topology.main.clone();
            let ttl = topology.retry_ttl;
            tokio::spawn(async move {
                tokio::time::sleep(ttl).await;
                if let Some(expired) = shared.take(&retry, id) {
                    shared.enqueue(&main, expired).ok();
                }
            });
        }
        Ok(())
    }

    fn take(&self, queue: &str, id: u64) -> Option<StoredMessage> {
        let mut queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
        let ready = &mut queues.get_mut(queue)?.ready;
        let position = ready.iter().position(|m| m.id == id)?;
        ready.remove(position)
    }

    fn pop(&self, queue: &str) -> Option<StoredMessage> {
        self.queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(queue)
            .and_then(|state| state.ready.pop_front())
    }

    fn notifier(&self, queue: &str) -> Option<Arc<Notify>> {
        self.queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(queue)
            .map(|state| Arc::clone(&state.notify))
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }
}

struct InMemoryAcker {
    shared: Arc<Shared>,
    queue: String,
    message: StoredMessage,
}

impl Acknowledger for InMemoryAcker {
    fn ack(self: Box<Self>) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send>> {
        self.shared.acked.fetch_add(1, Ordering::SeqCst);
        Box::pin(ready(Ok(())))
    }

    fn nack(self: Box<Self>) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send>> {
        self.shared.nacked.fetch_add(1, Ordering::SeqCst);
        let InMemoryAcker {
            shared,
            queue,
            mut message,
        } = *self;
        let route = shared
            .topology
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(|t| {
                message.retry_count = t.rejected_retry_count(&queue, message.retry_count);
                t.dead_letter_route(&queue).map(str::to_string)
            });
        let result = match route {
            Some(target) => shared.enqueue(&target, message),
            None => Ok(()),
        };
        Box::pin(ready(result))
    }
}

/// In-memory broker for tests.
///
/// Implements the declared topology's routing: nacked messages follow the
/// queue's dead-letter route, and messages published to the retry queue move
/// to the main queue once the retry TTL elapses on the tokio clock.
/// Inspection helpers expose what is waiting in, and what was ever
/// published to, each queue.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

impl InMemoryBroker {
    /// Create a broker with no topology.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fault injection for [`Broker::publish`].
    #[must_use]
    pub fn publish_faults(&self) -> &FaultSwitch {
        &self.shared.publish_faults
    }

    /// Place raw bytes on a queue, bypassing fault injection.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::UnknownQueue`] if the queue was not declared.
    pub fn inject(&self, queue: &str, body: Vec<u8>, retry_count: u32) -> Result<(), BrokerError> {
        let message = StoredMessage {
            id: self.shared.next_id(),
            body,
            retry_count,
            persistent: true,
        };
        self.shared.enqueue(queue, message)
    }

    /// Messages currently waiting on `queue`.
    #[must_use]
    pub fn messages(&self, queue: &str) -> Vec<StoredMessage> {
        self.shared
            .queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(queue)
            .map(|state| state.ready.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of messages waiting on `queue`.
    #[must_use]
    pub fn queue_len(&self, queue: &str) -> usize {
        self.shared
            .queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(queue)
            .map_or(0, |state| state.ready.len())
    }

    /// Every message ever placed on `queue`, in order.
    #[must_use]
    pub fn history(&self, queue: &str) -> Vec<StoredMessage> {
        self.shared
            .queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(queue)
            .map(|state| state.history.clone())
            .unwrap_or_default()
    }

    /// Deliveries acknowledged so far.
    #[must_use]
    pub fn acked_count(&self) -> usize {
        self.shared.acked.load(Ordering::SeqCst)
    }

    /// Deliveries rejected so far.
    #[must_use]
    pub fn nacked_count(&self) -> usize {
        self.shared.nacked.load(Ordering::SeqCst)
    }

    /// Successful `declare_topology` calls.
    #[must_use]
    pub fn declaration_count(&self) -> usize {
        self.shared.declarations.load(Ordering::SeqCst)
    }

    /// Whether `close` has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Poll until `queue` holds `len` messages or `timeout` elapses.
    ///
    /// Returns whether the length was reached.
    pub async fn wait_for_len(&self, queue: &str, len: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.queue_len(queue) == len {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Broker for InMemoryBroker {
    fn declare_topology(
        &self,
        topology: &QueueTopology,
    ) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + '_>> {
        let mut current = self.shared.topology.lock().unwrap_or_else(PoisonError::into_inner);
        let result = match current.as_ref() {
            Some(existing) if existing != topology => Err(BrokerError::TopologyFailed {
                queue: topology.main.clone(),
                reason: "queue already declared with different arguments".to_string(),
            }),
            _ => {
                *current = Some(topology.clone());
                let mut queues = self.shared.queues.lock().unwrap_or_else(PoisonError::into_inner);
                for queue in topology.declaration_order() {
                    queues.entry(queue.to_string()).or_default();
                }
                self.shared.declarations.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        };
        Box::pin(ready(result))
    }

    fn publish(
        &self,
        queue: &str,
        message: OutboundMessage,
    ) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + '_>> {
        let result = if self.is_closed() {
            Err(BrokerError::Closed)
        } else if self.shared.publish_faults.trip() {
            Err(BrokerError::PublishFailed {
                queue: queue.to_string(),
                reason: "injected failure".to_string(),
            })
        } else {
            let stored = StoredMessage {
                id: self.shared.next_id(),
                body: message.body,
                retry_count: message.retry_count,
                persistent: message.persistent,
            };
            self.shared.enqueue(queue, stored)
        };
        Box::pin(ready(result))
    }

    fn consume(
        &self,
        queue: &str,
    ) -> Pin<Box<dyn Future<Output = Result<DeliveryStream, BrokerError>> + Send + '_>> {
        let queue = queue.to_string();
        let shared = Arc::clone(&self.shared);

        Box::pin(async move {
            if shared.closed.load(Ordering::SeqCst) {
                return Err(BrokerError::Closed);
            }
            let notify = shared
                .notifier(&queue)
                .ok_or_else(|| BrokerError::ConsumeFailed {
                    queue: queue.clone(),
                    reason: "queue not declared".to_string(),
                })?;

            let stream = async_stream::stream! {
                loop {
                    let notified = notify.notified();
                    tokio::pin!(notified);
                    notified.as_mut().enable();

                    if shared.closed.load(Ordering::SeqCst) {
                        break;
                    }
                    if let Some(message) = shared.pop(&queue) {
                        let acker = InMemoryAcker {
                            shared: Arc::clone(&shared),
                            queue: queue.clone(),
                            message: message.clone(),
                        };
                        yield Ok(Delivery::new(
                            queue.clone(),
                            message.body,
                            message.retry_count,
                            Box::new(acker),
                        ));
                        continue;
                    }
                    notified.await;
                }
            };
            Ok(Box::pin(stream) as DeliveryStream)
        })
    }

    fn close(&self) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + '_>> {
        self.shared.closed.store(true, Ordering::SeqCst);
        for state in self.shared.queues.lock().unwrap_or_else(PoisonError::into_inner).values() {
            state.notify.notify_waiters();
        }
        Box::pin(ready(Ok(())))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use futures::StreamExt;

    async fn declared() -> (InMemoryBroker, QueueTopology) {
        let broker = InMemoryBroker::new();
        let topology = QueueTopology::new("jobs").with_retry_ttl(Duration::from_secs(5));
        broker.declare_topology(&topology).await.unwrap();
        (broker, topology)
    }

    #[tokio::test]
    async fn declaring_twice_is_a_no_op() {
        let (broker, topology) = declared().await;
        broker.declare_topology(&topology).await.unwrap();
        assert_eq!(broker.declaration_count(), 2);

        let conflicting = topology.clone().with_max_retries(9);
        assert!(broker.declare_topology(&conflicting).await.is_err());
    }

    #[tokio::test]
    async fn publish_to_unknown_queue_fails() {
        let (broker, _) = declared().await;
        let err = broker
            .publish("nowhere", OutboundMessage::new(b"x".to_vec()))
            .await
            .unwrap_err();
        assert_eq!(err, BrokerError::UnknownQueue("nowhere".to_string()));
    }

    #[tokio::test]
    async fn consume_yields_published_messages_in_order() {
        let (broker, topology) = declared().await;
        broker
            .publish(&topology.main, OutboundMessage::new(b"one".to_vec()))
            .await
            .unwrap();
        broker
            .publish(&topology.main, OutboundMessage::new(b"two".to_vec()).with_retry_count(2))
            .await
            .unwrap();

        let mut stream = broker.consume(&topology.main).await.unwrap();
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.body(), b"one");
        first.ack().await.unwrap();

        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(second.retry_count(), 2);
        second.ack().await.unwrap();

        assert_eq!(broker.acked_count(), 2);
        assert_eq!(broker.queue_len(&topology.main), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_queue_expires_back_to_main() {
        let (broker, topology) = declared().await;
        broker
            .publish(&topology.retry, OutboundMessage::new(b"later".to_vec()).with_retry_count(1))
            .await
            .unwrap();
        assert_eq!(broker.queue_len(&topology.retry), 1);

        tokio::time::sleep(Duration::from_secs(6)).await;

        assert_eq!(broker.queue_len(&topology.retry), 0);
        let main = broker.messages(&topology.main);
        assert_eq!(main.len(), 1);
        assert_eq!(main[0].retry_count, 1);
    }

    #[tokio::test]
    async fn nack_from_main_routes_to_retry() {
        let (broker, topology) = declared().await;
        broker.inject(&topology.main, b"bad".to_vec(), 0).unwrap();

        let mut stream = broker.consume(&topology.main).await.unwrap();
        let delivery = stream.next().await.unwrap().unwrap();
        delivery.nack().await.unwrap();

        assert_eq!(broker.nacked_count(), 1);
        let parked = broker.messages(&topology.retry);
        assert_eq!(parked.len(), 1);
        assert_eq!(parked[0].retry_count, 1);
    }

    #[tokio::test]
    async fn close_ends_streams_and_rejects_publish() {
        let (broker, topology) = declared().await;
        let mut stream = broker.consume(&topology.main).await.unwrap();

        let waiter = tokio::spawn(async move { stream.next().await.is_none() });
        tokio::task::yield_now().await;
        broker.close().await.unwrap();

        assert!(waiter.await.unwrap());
        assert_eq!(
            broker
                .publish(&topology.main, OutboundMessage::new(vec![]))
                .await,
            Err(BrokerError::Closed)
        );
    }
}
