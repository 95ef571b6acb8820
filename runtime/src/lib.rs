//! # Steadfast Runtime
//!
//! Reliability algorithms built on the `steadfast-core` traits.
//!
//! ## Core Components
//!
//! - **Retry**: bounded exponential backoff around any fallible operation
//! - **Cache Gateway**: cache access that reports `Unavailable` after retries
//! - **Idempotency Gate**: lock-and-replay admission for client mutations
//! - **Event Producer**: validated, retried publishing of domain events
//! - **Event Worker**: ledger-checked consumption with retry and dead-letter routing
//! - **Eviction**: daily removal of old ledger records
//!
//! ## Example
//!
//! ```ignore
//! use steadfast_runtime::{CacheGateway, IdempotencyConfig, IdempotencyGate};
//!
//! let gate = IdempotencyGate::new(CacheGateway::new(cache), IdempotencyConfig::default());
//!
//! let outcome = gate
//!     .execute(Some(&identity), || async move { create_task(&pool, body).await })
//!     .await?;
//! ```

/// Retry logic with exponential backoff
pub mod retry;

/// Prometheus metrics for observability
pub mod metrics;

/// Retrying cache front
pub mod cache_gateway;

/// Request deduplication in front of mutations
pub mod idempotency;

/// Domain event publishing
pub mod producer;

/// Event consumption
pub mod consumer;

/// Ledger eviction schedule
pub mod eviction;

pub use cache_gateway::{CacheGateway, CacheGatewayError};
pub use consumer::{
    EventHandler, EventWorker, HandlerRegistry, ProcessOutcome, WorkError, WorkerPool,
};
pub use eviction::{EvictionConfig, EvictionJob};
pub use idempotency::{
    CacheFailurePolicy, Decision, GateError, IdempotencyConfig, IdempotencyGate, LockGuard,
    Outcome,
};
pub use producer::{EventProducer, PublishError};
pub use retry::{RetryExecutor, RetryPolicy};
