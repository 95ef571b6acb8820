//! Running mutations behind the idempotency gate.
//!
//! [`gated`] spawns the whole gate protocol (admit, mutate, store, release)
//! on its own task. A client that disconnects, or a request that hits the
//! deadline, drops only the waiting handler; the mutation and the lock
//! release still run to completion.
//!
//! | Gate result              | Response                                   |
//! |--------------------------|--------------------------------------------|
//! | `Executed(response)`     | stored status and body                     |
//! | `Replayed(response)`     | same, plus `Idempotent-Replayed: true`     |
//! | `Conflict`               | 409                                        |
//! | `Unavailable`            | 503                                        |
//! | `Mutation(err)`          | the error's status                         |
//! | `Aborted`                | 500                                        |

use crate::error::AppError;
use axum::{
    Json,
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use std::future::Future;
use steadfast_core::idempotency::{MutationError, RequestIdentity, StoredResponse};
use steadfast_runtime::{IdempotencyGate, Outcome};

/// Response header marking a replayed response.
pub const REPLAYED_HEADER: &str = "Idempotent-Replayed";

/// Run `mutation` through `gate` and render the result.
///
/// `identity` of `None` bypasses deduplication.
pub async fn gated<F, Fut>(
    gate: IdempotencyGate,
    identity: Option<RequestIdentity>,
    mutation: F,
) -> Response
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<StoredResponse, MutationError>> + Send + 'static,
{
    let task = tokio::spawn(async move { gate.execute(identity.as_ref(), mutation).await });

    match task.await {
        Ok(Ok(outcome)) => render(&outcome),
        Ok(Err(error)) => AppError::from(error).into_response(),
        Err(join_error) => AppError::internal("An internal error occurred")
            .with_source(anyhow::Error::new(join_error))
            .into_response(),
    }
}

/// Render a gate outcome as the stored status and body.
#[must_use]
pub fn render(outcome: &Outcome) -> Response {
    let stored = outcome.response();
    let status = StatusCode::from_u16(stored.status).unwrap_or(StatusCode::OK);
    let mut response = (status, Json(stored.body.clone())).into_response();

    if outcome.is_replay() {
        response
            .headers_mut()
            .insert(REPLAYED_HEADER, HeaderValue::from_static("true"));
    }
    response
}
