#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity

use crate::faults::FaultSwitch;
use chrono::{DateTime, Utc};
use futures::future::ready;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, PoisonError, RwLock};
use steadfast_core::ledger::{Ledger, LedgerError, ProcessedMessage, RecordOutcome};
use uuid::Uuid;

/// In-memory ledger for tests.
///
/// Records are keyed by event id, mirroring the unique constraint of the
/// real table.
#[derive(Debug, Clone, Default)]
pub struct InMemoryLedger {
    records: Arc<RwLock<HashMap<Uuid, ProcessedMessage>>>,
    faults: FaultSwitch,
}

impl InMemoryLedger {
    /// Create an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fault injection switch for every operation.
    #[must_use]
    pub const fn faults(&self) -> &FaultSwitch {
        &self.faults
    }

    /// Seed a record directly.
    pub fn insert(&self, message: ProcessedMessage) {
        self.records.write().unwrap_or_else(PoisonError::into_inner).insert(message.event_id, message);
    }

    /// Record for `event_id`, if any.
    #[must_use]
    pub fn get(&self, event_id: Uuid) -> Option<ProcessedMessage> {
        self.records.read().unwrap_or_else(PoisonError::into_inner).get(&event_id).cloned()
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether the ledger is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn guard(&self) -> Result<(), LedgerError> {
        if self.faults.trip() {
            Err(LedgerError::Connection("injected failure".to_string()))
        } else {
            Ok(())
        }
    }
}

impl Ledger for InMemoryLedger {
    fn exists(
        &self,
        event_id: Uuid,
    ) -> Pin<Box<dyn Future<Output = Result<bool, LedgerError>> + Send + '_>> {
        let result = self
            .guard()
            .map(|()| self.records.read().unwrap_or_else(PoisonError::into_inner).contains_key(&event_id));
        Box::pin(ready(result))
    }

    fn record(
        &self,
        message: &ProcessedMessage,
    ) -> Pin<Box<dyn Future<Output = Result<RecordOutcome, LedgerError>> + Send + '_>> {
        let result = self.guard().map(|()| {
            let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
            if records.contains_key(&message.event_id) {
                RecordOutcome::AlreadyRecorded
            } else {
                records.insert(message.event_id, message.clone());
                RecordOutcome::Inserted
            }
        });
        Box::pin(ready(result))
    }

    fn evict_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<u64, LedgerError>> + Send + '_>> {
        let result = self.guard().map(|()| {
            let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
            let before = records.len();
            records.retain(|_, record| record.processed_at >= cutoff);
            (before - records.len()) as u64
        });
        Box::pin(ready(result))
    }
}
