//! Request identities, stored responses and mutation failures.
//!
//! These are the types the idempotency gate exchanges with the mutation
//! layer: the caller-supplied key, the response that gets cached and
//! replayed, and the typed failure a mutation may return instead.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Longest accepted request identity, in bytes.
pub const MAX_IDENTITY_LEN: usize = 255;

/// Why a request identity was rejected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    /// Empty or whitespace-only key
    #[error("Idempotency key must not be empty")]
    Empty,

    /// Key longer than [`MAX_IDENTITY_LEN`]
    #[error("Idempotency key exceeds {MAX_IDENTITY_LEN} bytes")]
    TooLong,

    /// Key contains control characters
    #[error("Idempotency key contains control characters")]
    InvalidCharacters,
}

/// Caller-supplied key identifying one logical attempt at a mutation.
///
/// Scope is global across mutation types; callers namespace keys themselves
/// if they need to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestIdentity(String);

impl RequestIdentity {
    /// Validate and wrap a key.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError`] for empty, over-long or control-character keys.
    pub fn new(key: impl Into<String>) -> Result<Self, IdentityError> {
        let key = key.into();
        if key.trim().is_empty() {
            return Err(IdentityError::Empty);
        }
        if key.len() > MAX_IDENTITY_LEN {
            return Err(IdentityError::TooLong);
        }
        if key.chars().any(char::is_control) {
            return Err(IdentityError::InvalidCharacters);
        }
        Ok(Self(key))
    }

    /// The key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Completed response, stored under the result key and replayed verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredResponse {
    /// HTTP status code
    pub status: u16,
    /// Response body
    pub body: serde_json::Value,
}

impl StoredResponse {
    /// Create a stored response.
    #[must_use]
    pub const fn new(status: u16, body: serde_json::Value) -> Self {
        Self { status, body }
    }

    /// `200 OK` with `body`.
    #[must_use]
    pub const fn ok(body: serde_json::Value) -> Self {
        Self::new(200, body)
    }

    /// `201 Created` with `body`.
    #[must_use]
    pub const fn created(body: serde_json::Value) -> Self {
        Self::new(201, body)
    }
}

/// Typed failure returned by a business mutation.
///
/// Failures are never cached; the lock is released and a retry with the
/// same identity runs the mutation again.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MutationError {
    /// Request failed business validation
    #[error("{0}")]
    Validation(String),

    /// Target resource does not exist
    #[error("{0}")]
    NotFound(String),

    /// Request conflicts with current state
    #[error("{0}")]
    Conflict(String),

    /// Unexpected failure
    #[error("{0}")]
    Internal(String),
}

impl MutationError {
    /// HTTP status code for this failure.
    #[must_use]
    pub const fn status(&self) -> u16 {
        match self {
            Self::Validation(_) => 400,
            Self::NotFound(_) => 404,
            Self::Conflict(_) => 409,
            Self::Internal(_) => 500,
        }
    }
}
