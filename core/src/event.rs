//! Domain events and their validation.
//!
//! A [`DomainEvent`] is the unit published after a mutation commits and
//! consumed by background workers. It is immutable once created, and its
//! `metadata.eventId` is generated exactly once, at publish time. Downstream
//! consumers use that identifier as their deduplication key.
//!
//! # Wire Format
//!
//! Events travel as JSON:
//!
//! ```json
//! {
//!   "type": "task.created",
//!   "payload": { "id": 42, "title": "write docs" },
//!   "metadata": {
//!     "eventId": "1b4e28ba-2fa1-11d2-883f-0016d3cca427",
//!     "timestamp": "2025-01-01T00:00:00Z",
//!     "source": "task-api"
//!   }
//! }
//! ```
//!
//! # Example
//!
//! ```
//! use steadfast_core::event::{DomainEvent, EventSchema, SchemaRegistry};
//! use serde::Deserialize;
//!
//! #[derive(Deserialize)]
//! struct TaskCreated { id: i64, title: String }
//!
//! let schema = SchemaRegistry::new().register::<TaskCreated>("task.created");
//! let payload = serde_json::json!({ "id": 1, "title": "ship it" });
//! assert!(schema.validate("task.created", &payload).is_ok());
//!
//! let event = DomainEvent::new("task.created", payload, "task-api", chrono::Utc::now());
//! let decoded = DomainEvent::from_bytes(&event.to_bytes().unwrap()).unwrap();
//! assert_eq!(decoded, event);
//! ```

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Error types for event encoding and decoding.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventError {
    /// Failed to serialize event to bytes.
    #[error("Failed to serialize event: {0}")]
    SerializationError(String),

    /// The body is not a well-formed event envelope.
    #[error("Malformed event: {0}")]
    Malformed(String),

    /// The envelope is well-formed but carries no `metadata.eventId`.
    #[error("Event has no eventId")]
    MissingEventId,
}

/// Payload rejected by an [`EventSchema`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// No schema is registered for the event type.
    #[error("Unknown event type: {0}")]
    UnknownType(String),

    /// The payload does not match the schema for its type.
    #[error("Invalid payload for '{event_type}': {reason}")]
    InvalidPayload {
        /// Event type tag
        event_type: String,
        /// Why the payload was rejected
        reason: String,
    },
}

/// Envelope metadata stamped once at publish time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMetadata {
    /// Globally unique identifier, the downstream deduplication key
    pub event_id: Uuid,
    /// When the event was created
    pub timestamp: DateTime<Utc>,
    /// Name of the service that produced the event
    pub source: String,
}

/// An immutable domain event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainEvent {
    /// Type tag, e.g. `task.created`
    #[serde(rename = "type")]
    pub event_type: String,
    /// Tag-specific structured data
    pub payload: serde_json::Value,
    /// Identity, time and origin
    pub metadata: EventMetadata,
}

/// A decoded envelope whose metadata has not been checked yet.
///
/// Consumers decode into this first so they can validate the payload before
/// deciding what a missing `eventId` means.
#[derive(Debug, Clone, Deserialize)]
pub struct IncomingEvent {
    /// Type tag
    #[serde(rename = "type")]
    pub event_type: String,
    /// Tag-specific structured data
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    metadata: RawMetadata,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct RawMetadata {
    event_id: Option<Uuid>,
    timestamp: Option<DateTime<Utc>>,
    source: Option<String>,
}

impl IncomingEvent {
    /// Decode the JSON envelope.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Malformed`] if the body is not an envelope with a `type`.
    pub fn parse(bytes: &[u8]) -> Result<Self, EventError> {
        serde_json::from_slice(bytes).map_err(|e| EventError::Malformed(e.to_string()))
    }

    /// The `eventId`, if the producer set one.
    #[must_use]
    pub const fn event_id(&self) -> Option<Uuid> {
        self.metadata.event_id
    }

    /// Complete the envelope.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::MissingEventId`] if there is no `eventId`, or
    /// [`EventError::Malformed`] if the timestamp or source is missing.
    pub fn into_event(self) -> Result<DomainEvent, EventError> {
        let event_id = self.metadata.event_id.ok_or(EventError::MissingEventId)?;
        let timestamp = self
            .metadata
            .timestamp
            .ok_or_else(|| EventError::Malformed("missing metadata.timestamp".to_string()))?;
        let source = self
            .metadata
            .source
            .ok_or_else(|| EventError::Malformed("missing metadata.source".to_string()))?;

        Ok(DomainEvent {
            event_type: self.event_type,
            payload: self.payload,
            metadata: EventMetadata {
                event_id,
                timestamp,
                source,
            },
        })
    }
}

impl DomainEvent {
    /// Create an event with a freshly generated `eventId`.
    #[must_use]
    pub fn new(
        event_type: impl Into<String>,
        payload: serde_json::Value,
        source: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
            metadata: EventMetadata {
                event_id: Uuid::new_v4(),
                timestamp,
                source: source.into(),
            },
        }
    }

    /// The deduplication key.
    #[must_use]
    pub const fn event_id(&self) -> Uuid {
        self.metadata.event_id
    }

    /// Serialize to the JSON wire format.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::SerializationError`] if the payload cannot be encoded.
    pub fn to_bytes(&self) -> Result<Vec<u8>, EventError> {
        serde_json::to_vec(self).map_err(|e| EventError::SerializationError(e.to_string()))
    }

    /// Decode an event received from the broker.
    ///
    /// A body whose metadata lacks an `eventId` is reported as
    /// [`EventError::MissingEventId`] so consumers can drop it rather than
    /// dead-letter it. Any other structural problem is [`EventError::Malformed`].
    ///
    /// # Errors
    ///
    /// See above.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EventError> {
        IncomingEvent::parse(bytes)?.into_event()
    }
}

impl fmt::Display for DomainEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.event_type, self.metadata.event_id)
    }
}

/// Validates tag-specific payload shapes.
pub trait EventSchema: Send + Sync {
    /// Check `payload` against the schema registered for `event_type`.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError`] if the type is unknown or the payload does
    /// not match.
    fn validate(&self, event_type: &str, payload: &serde_json::Value)
    -> Result<(), ValidationError>;
}

type PayloadCheck = Box<dyn Fn(&serde_json::Value) -> Result<(), String> + Send + Sync>;

/// Schema built from one typed payload struct per event type.
///
/// A payload is valid when it deserializes into the struct registered for
/// its tag.
#[derive(Default)]
pub struct SchemaRegistry {
    checks: HashMap<String, PayloadCheck>,
}

impl SchemaRegistry {
    /// Create an empty registry. Every type is unknown until registered.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `T` as the payload shape of `event_type`.
    #[must_use]
    pub fn register<T: DeserializeOwned + 'static>(mut self, event_type: &str) -> Self {
        self.checks.insert(
            event_type.to_string(),
            Box::new(|payload| {
                serde_json::from_value::<T>(payload.clone())
                    .map(|_| ())
                    .map_err(|e| e.to_string())
            }),
        );
        self
    }

    /// Registered event types.
    pub fn event_types(&self) -> impl Iterator<Item = &str> {
        self.checks.keys().map(String::as_str)
    }
}

impl EventSchema for SchemaRegistry {
    fn validate(
        &self,
        event_type: &str,
        payload: &serde_json::Value,
    ) -> Result<(), ValidationError> {
        let check = self
            .checks
            .get(event_type)
            .ok_or_else(|| ValidationError::UnknownType(event_type.to_string()))?;
        check(payload).map_err(|reason| ValidationError::InvalidPayload {
            event_type: event_type.to_string(),
            reason,
        })
    }
}

impl fmt::Debug for SchemaRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchemaRegistry")
            .field("event_types", &self.checks.keys().collect::<Vec<_>>())
            .finish()
    }
}
