//! Idempotency gate for mutating requests.
//!
//! The gate deduplicates mutations by a caller-supplied [`RequestIdentity`]
//! using two cache entries per identity:
//!
//! - a **lock** (`{prefix}:lock:{identity}`), created atomically with a short
//!   TTL and holding a random owner token;
//! - a **result** (`{prefix}:result:{identity}`), holding the completed
//!   [`StoredResponse`] with a long TTL.
//!
//! # Lifecycle per identity
//!
//! ```text
//! absent ──admit──▶ locked ──complete──▶ completed (replayed until result TTL)
//!                     │
//!                     └──lock TTL elapses──▶ expired-without-completion
//! ```
//!
//! At most one caller per identity holds the lock, so at most one caller at
//! a time receives [`Decision::Proceed`]. Once a result is stored, every
//! admission within the result TTL is a [`Decision::Replay`] of the same
//! response. If the holder dies, the lock expires and a later caller may
//! run the mutation again.
//!
//! # Example
//!
//! ```rust,ignore
//! let outcome = gate
//!     .execute(Some(&identity), || async { create_task(&db, body).await })
//!     .await?;
//!
//! match outcome {
//!     Outcome::Executed(response) | Outcome::Replayed(response) => respond(response),
//! }
//! ```

use crate::cache_gateway::{CacheGateway, CacheGatewayError};
use crate::metrics::GateMetrics;
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use steadfast_core::idempotency::{MutationError, RequestIdentity, StoredResponse};
use thiserror::Error;
use uuid::Uuid;

/// Floor for the lock renewal period; `interval` rejects a zero period.
const MIN_HEARTBEAT_PERIOD: Duration = Duration::from_millis(1);

/// What the gate does when the cache cannot be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheFailurePolicy {
    /// Refuse the request ([`Decision::ServiceUnavailable`])
    #[default]
    FailClosed,
    /// Run the mutation without deduplication ([`Decision::Bypass`])
    FailOpen,
}

/// Gate configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdempotencyConfig {
    /// Prefix for both cache keys
    pub key_prefix: String,
    /// How long an unrenewed lock lives
    pub lock_ttl: Duration,
    /// How long a completed response is replayed
    pub result_ttl: Duration,
    /// Behaviour when the cache is unavailable
    pub failure_policy: CacheFailurePolicy,
    /// Renew the lock every `lock_ttl / 3` while a mutation runs under [`IdempotencyGate::execute`]
    pub heartbeat: bool,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            key_prefix: "idempotency".to_string(),
            lock_ttl: Duration::from_secs(30),
            result_ttl: Duration::from_secs(60 * 60),
            failure_policy: CacheFailurePolicy::FailClosed,
            heartbeat: true,
        }
    }
}

impl IdempotencyConfig {
    /// Set the lock TTL.
    #[must_use]
    pub const fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    /// Set the result TTL.
    #[must_use]
    pub const fn with_result_ttl(mut self, ttl: Duration) -> Self {
        self.result_ttl = ttl;
        self
    }

    /// Set the cache failure policy.
    #[must_use]
    pub const fn with_failure_policy(mut self, policy: CacheFailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    /// Enable or disable lock renewal.
    #[must_use]
    pub const fn with_heartbeat(mut self, heartbeat: bool) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    /// Set the key prefix.
    #[must_use]
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }
}

/// Result of [`IdempotencyGate::admit`].
#[derive(Debug)]
pub enum Decision {
    /// No identity (or cache down under fail-open): run without deduplication
    Bypass,
    /// Already completed: return this response without executing
    Replay(StoredResponse),
    /// Another caller holds the lock: respond 409 without executing
    Conflict,
    /// Lock acquired: execute, then settle the guard
    Proceed(LockGuard),
    /// Cache unreachable under fail-closed: respond 503 without executing
    ServiceUnavailable,
}

impl Decision {
    const fn label(&self) -> &'static str {
        match self {
            Self::Bypass => "bypass",
            Self::Replay(_) => "replay",
            Self::Conflict => "conflict",
            Self::Proceed(_) => "proceed",
            Self::ServiceUnavailable => "unavailable",
        }
    }
}

/// Result of a gated execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The mutation ran during this call
    Executed(StoredResponse),
    /// A stored response was replayed
    Replayed(StoredResponse),
}

impl Outcome {
    /// The response, whichever way it was produced.
    #[must_use]
    pub const fn response(&self) -> &StoredResponse {
        match self {
            Self::Executed(response) | Self::Replayed(response) => response,
        }
    }

    /// Whether the response was replayed.
    #[must_use]
    pub const fn is_replay(&self) -> bool {
        matches!(self, Self::Replayed(_))
    }
}

/// Why a gated execution produced no response.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GateError {
    /// Another request with the same identity is in progress
    #[error("A request with this idempotency key is already in progress")]
    Conflict,

    /// The cache could not be reached
    #[error("Idempotency store unavailable")]
    Unavailable,

    /// The mutation returned a typed failure
    #[error(transparent)]
    Mutation(#[from] MutationError),

    /// The mutation panicked
    #[error("Mutation aborted unexpectedly")]
    Aborted,
}

/// Failure to store a completed response.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompletionError {
    /// The response could not be encoded
    #[error("Failed to encode stored response: {0}")]
    Encode(String),

    /// The cache rejected the write or the release
    #[error(transparent)]
    Cache(#[from] CacheGatewayError),
}

/// Ownership of an identity's lock, handed out with [`Decision::Proceed`].
///
/// Settle it with [`complete`](Self::complete) or
/// [`abandon`](Self::abandon). Dropping an unsettled guard releases the
/// lock from a background task.
#[derive(Debug)]
pub struct LockGuard {
    cache: CacheGateway,
    identity: RequestIdentity,
    lock_key: String,
    result_key: String,
    token: String,
    lock_ttl: Duration,
    result_ttl: Duration,
    settled: bool,
}

impl LockGuard {
    /// Identity this guard locks.
    #[must_use]
    pub const fn identity(&self) -> &RequestIdentity {
        &self.identity
    }

    /// Store `response` for replay, then release the lock.
    ///
    /// The lock is released even when storing fails.
    ///
    /// # Errors
    ///
    /// Returns [`CompletionError`] if the response could not be stored or
    /// the lock could not be released.
    pub async fn complete(mut self, response: &StoredResponse) -> Result<(), CompletionError> {
        self.settled = true;
        let stored = match serde_json::to_string(response) {
            Ok(encoded) => self
                .cache
                .set(&self.result_key, &encoded, self.result_ttl)
                .await
                .map_err(CompletionError::from),
            Err(e) => Err(CompletionError::Encode(e.to_string())),
        };
        let released = self.release().await;
        stored?;
        released?;
        Ok(())
    }

    /// Release the lock without storing anything.
    ///
    /// # Errors
    ///
    /// Returns [`CacheGatewayError`] if the release failed; the lock then
    /// lapses after its TTL.
    pub async fn abandon(mut self) -> Result<(), CacheGatewayError> {
        self.settled = true;
        self.release().await
    }

    /// Extend the lock TTL if this guard still owns it.
    ///
    /// Returns `false` if the lock expired and was taken by someone else.
    ///
    /// # Errors
    ///
    /// Returns [`CacheGatewayError`] if the cache is unavailable.
    pub async fn renew(&self) -> Result<bool, CacheGatewayError> {
        self.cache
            .expire_if_equals(&self.lock_key, &self.token, self.lock_ttl)
            .await
    }

    async fn release(&self) -> Result<(), CacheGatewayError> {
        let released = self
            .cache
            .delete_if_equals(&self.lock_key, &self.token)
            .await?;
        if !released {
            tracing::warn!(
                identity = %self.identity,
                "Lock expired before release; another request may have run"
            );
        }
        Ok(())
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(
                identity = %self.identity,
                "Lock guard dropped outside a runtime; lock will lapse after its TTL"
            );
            return;
        };
        let cache = self.cache.clone();
        let key = std::mem::take(&mut self.lock_key);
        let token = std::mem::take(&mut self.token);
        let identity = self.identity.clone();
        runtime.spawn(async move {
            if let Err(error) = cache.delete_if_equals(&key, &token).await {
                tracing::warn!(%identity, %error, "Failed to release dropped lock");
            }
        });
    }
}

/// Deduplicates mutations by request identity.
#[derive(Debug, Clone)]
pub struct IdempotencyGate {
    cache: CacheGateway,
    config: IdempotencyConfig,
}

impl IdempotencyGate {
    /// Create a gate over `cache`.
    #[must_use]
    pub const fn new(cache: CacheGateway, config: IdempotencyConfig) -> Self {
        Self { cache, config }
    }

    /// The gate's configuration.
    #[must_use]
    pub const fn config(&self) -> &IdempotencyConfig {
        &self.config
    }

    /// Cache key of the lock entry.
    #[must_use]
    pub fn lock_key(&self, identity: &RequestIdentity) -> String {
        format!("{}:lock:{identity}", self.config.key_prefix)
    }

    /// Cache key of the result entry.
    #[must_use]
    pub fn result_key(&self, identity: &RequestIdentity) -> String {
        format!("{}:result:{identity}", self.config.key_prefix)
    }

    /// Decide whether a request may execute.
    pub async fn admit(&self, identity: Option<&RequestIdentity>) -> Decision {
        let decision = match identity {
            None => Decision::Bypass,
            Some(identity) => match self.try_admit(identity).await {
                Ok(decision) => decision,
                Err(error) => match self.config.failure_policy {
                    CacheFailurePolicy::FailClosed => {
                        tracing::error!(%identity, %error, "Idempotency store unavailable, refusing request");
                        Decision::ServiceUnavailable
                    }
                    CacheFailurePolicy::FailOpen => {
                        tracing::warn!(%identity, %error, "Idempotency store unavailable, proceeding without deduplication");
                        GateMetrics::record_decision("fail_open");
                        return Decision::Bypass;
                    }
                },
            },
        };
        GateMetrics::record_decision(decision.label());
        decision
    }

    async fn try_admit(&self, identity: &RequestIdentity) -> Result<Decision, CacheGatewayError> {
        let result_key = self.result_key(identity);
        if let Some(response) = self.stored_response(identity, &result_key).await? {
            tracing::debug!(%identity, status = response.status, "Replaying stored response");
            return Ok(Decision::Replay(response));
        }

        let lock_key = self.lock_key(identity);
        let token = Uuid::new_v4().to_string();
        let acquired = self
            .cache
            .set_if_absent(&lock_key, &token, self.config.lock_ttl)
            .await?;
        if !acquired {
            tracing::info!(%identity, "Request already in progress");
            return Ok(Decision::Conflict);
        }

        let guard = LockGuard {
            cache: self.cache.clone(),
            identity: identity.clone(),
            lock_key,
            result_key: result_key.clone(),
            token,
            lock_ttl: self.config.lock_ttl,
            result_ttl: self.config.result_ttl,
            settled: false,
        };

        // A previous holder may have completed between the read and the lock.
        if let Some(response) = self.stored_response(identity, &result_key).await? {
            if let Err(error) = guard.abandon().await {
                tracing::warn!(%identity, %error, "Failed to release lock before replay");
            }
            return Ok(Decision::Replay(response));
        }

        tracing::debug!(%identity, "Lock acquired");
        Ok(Decision::Proceed(guard))
    }

    async fn stored_response(
        &self,
        identity: &RequestIdentity,
        result_key: &str,
    ) -> Result<Option<StoredResponse>, CacheGatewayError> {
        let Some(raw) = self.cache.get(result_key).await? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(response) => Ok(Some(response)),
            Err(error) => {
                tracing::warn!(%identity, %error, "Ignoring unreadable stored response");
                Ok(None)
            }
        }
    }

    /// Run `mutation` under the gate.
    ///
    /// Admits the request, executes the mutation at most once per
    /// admission, stores successful responses for replay and releases the
    /// lock on every exit path. Failures are not stored. While the mutation
    /// runs, the lock is renewed if heartbeats are enabled.
    ///
    /// If storing the response fails, the fresh response is still returned.
    ///
    /// # Errors
    ///
    /// - [`GateError::Conflict`] if another request holds the lock
    /// - [`GateError::Unavailable`] if the cache is down under fail-closed
    /// - [`GateError::Mutation`] if the mutation failed
    /// - [`GateError::Aborted`] if the mutation panicked
    pub async fn execute<F, Fut>(
        &self,
        identity: Option<&RequestIdentity>,
        mutation: F,
    ) -> Result<Outcome, GateError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<StoredResponse, MutationError>>,
    {
        let guard = match self.admit(identity).await {
            Decision::Bypass => return Ok(Outcome::Executed(mutation().await?)),
            Decision::Replay(response) => return Ok(Outcome::Replayed(response)),
            Decision::Conflict => return Err(GateError::Conflict),
            Decision::ServiceUnavailable => return Err(GateError::Unavailable),
            Decision::Proceed(guard) => guard,
        };

        let result = self.run_with_heartbeat(&guard, mutation()).await;

        match result {
            Ok(Ok(response)) => {
                if let Err(error) = guard.complete(&response).await {
                    GateMetrics::record_store_failure();
                    tracing::warn!(%error, "Mutation succeeded but its response was not stored");
                }
                Ok(Outcome::Executed(response))
            }
            Ok(Err(failure)) => {
                if let Err(error) = guard.abandon().await {
                    tracing::warn!(%error, "Failed to release lock after mutation failure");
                }
                Err(GateError::Mutation(failure))
            }
            Err(()) => {
                tracing::error!(identity = %guard.identity(), "Mutation panicked; releasing lock");
                if let Err(error) = guard.abandon().await {
                    tracing::warn!(%error, "Failed to release lock after panic");
                }
                Err(GateError::Aborted)
            }
        }
    }

    async fn run_with_heartbeat<Fut>(
        &self,
        guard: &LockGuard,
        mutation: Fut,
    ) -> Result<Result<StoredResponse, MutationError>, ()>
    where
        Fut: Future<Output = Result<StoredResponse, MutationError>>,
    {
        let mutation = AssertUnwindSafe(mutation).catch_unwind();
        tokio::pin!(mutation);

        if !self.config.heartbeat {
            return mutation.await.map_err(|_| ());
        }

        let period = (self.config.lock_ttl / 3).max(MIN_HEARTBEAT_PERIOD);
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        loop {
            tokio::select! {
                result = &mut mutation => return result.map_err(|_| ()),
                _ = ticker.tick() => match guard.renew().await {
                    Ok(true) => tracing::debug!(identity = %guard.identity(), "Lock renewed"),
                    Ok(false) => tracing::warn!(identity = %guard.identity(), "Lock lost while mutation in progress"),
                    Err(error) => tracing::warn!(identity = %guard.identity(), %error, "Lock renewal failed"),
                },
            }
        }
    }
}
