//! Axum integration for Steadfast.
//!
//! This crate is the HTTP boundary of the reliability layer: it turns the
//! `Idempotency-Key` header into a request identity, runs mutations behind
//! the [`IdempotencyGate`](steadfast_runtime::IdempotencyGate), and renders
//! every failure as a structured `{status, message}` body.
//!
//! # Request Flow
//!
//! ```text
//! request ─▶ RateLimit ─▶ RequestDeadline ─▶ handler
//!                                              │ IdempotencyKey extractor
//!                                              ▼
//!                                       gated(gate, key, mutation)
//!                                              │ spawned task
//!                                              ▼
//!                              admit ─▶ mutation ─▶ complete / abandon
//! ```
//!
//! # Example
//!
//! ```ignore
//! use axum::{Router, routing::post, extract::State, response::Response};
//! use steadfast_web::{IdempotencyKey, gated};
//!
//! async fn create_task(
//!     State(state): State<AppState>,
//!     key: IdempotencyKey,
//!     Json(request): Json<CreateTask>,
//! ) -> Response {
//!     let db = state.db.clone();
//!     gated(state.gate.clone(), key.0, move || insert_task(db, request)).await
//! }
//!
//! let app = Router::new()
//!     .route("/api/tasks", post(create_task))
//!     .with_state(app_state);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod error;
pub mod extractors;
pub mod gated;
pub mod handlers;
pub mod middleware;

// Re-export key types for convenience
pub use error::AppError;
pub use extractors::{ClientIp, IDEMPOTENCY_KEY_HEADER, IdempotencyKey};
pub use gated::{REPLAYED_HEADER, gated, render};
pub use middleware::{RateLimitLayer, RequestDeadlineLayer};

/// Result type alias for web handlers.
pub type WebResult<T> = Result<T, AppError>;
