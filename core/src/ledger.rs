//! Processed-message ledger abstraction.
//!
//! The ledger is the durable record of which event identifiers a consumer
//! has already handled. Existence of a record is the only signal a worker
//! uses to skip a redelivered event, and a uniqueness conflict on insert
//! means another worker got there first.
//!
//! Only the consumer creates records and only the eviction job deletes them.

use chrono::{DateTime, Utc};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur during ledger operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// Could not reach the ledger's database
    #[error("Ledger connection failed: {0}")]
    Connection(String),

    /// A query failed
    #[error("Ledger query failed: {0}")]
    Query(String),
}

/// A successfully handled event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedMessage {
    /// Deduplication key (unique)
    pub event_id: Uuid,
    /// Event type tag
    pub event_type: String,
    /// When the side effect completed
    pub processed_at: DateTime<Utc>,
}

/// Result of [`Ledger::record`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    /// This call created the record
    Inserted,
    /// A record for the event already existed
    AlreadyRecorded,
}

/// Trait for ledger implementations.
pub trait Ledger: Send + Sync {
    /// Whether `event_id` has been recorded.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] if the lookup fails. Callers must not treat a
    /// failed lookup as "not processed".
    fn exists(
        &self,
        event_id: Uuid,
    ) -> Pin<Box<dyn Future<Output = Result<bool, LedgerError>> + Send + '_>>;

    /// Record a processed event. A duplicate is reported, not an error.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] if the insert fails for any reason other than
    /// uniqueness.
    fn record(
        &self,
        message: &ProcessedMessage,
    ) -> Pin<Box<dyn Future<Output = Result<RecordOutcome, LedgerError>> + Send + '_>>;

    /// Delete every record with `processed_at` strictly before `cutoff`.
    ///
    /// Returns the number of records deleted.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] if the delete fails.
    fn evict_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<u64, LedgerError>> + Send + '_>>;
}
