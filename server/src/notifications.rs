//! Notification side effect for task events.
//!
//! Each task event becomes one row in `task_notifications`, keyed by the
//! event's id. The insert is `ON CONFLICT DO NOTHING`, so running the
//! handler twice for the same event (a crash between the insert and the
//! ledger write) leaves a single notification.

use async_trait::async_trait;
use sqlx::PgPool;
use steadfast_core::event::DomainEvent;
use steadfast_runtime::{EventHandler, HandlerRegistry, WorkError};
use std::sync::Arc;
use uuid::Uuid;

use crate::tasks::{TASK_CREATED, TASK_DELETED, TASK_UPDATED};

/// A notification derived from a task event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Source event id (unique)
    pub event_id: Uuid,
    /// Task the event is about
    pub task_id: Uuid,
    /// Event type
    pub event_type: String,
    /// Human-readable message
    pub message: String,
}

impl Notification {
    /// Build the notification for `event`.
    ///
    /// # Errors
    ///
    /// [`WorkError::Rejected`] if the payload carries no task id; retrying
    /// cannot fix that.
    pub fn from_event(event: &DomainEvent) -> Result<Self, WorkError> {
        let task_id = event
            .payload
            .get("id")
            .and_then(serde_json::Value::as_str)
            .and_then(|id| Uuid::parse_str(id).ok())
            .ok_or_else(|| WorkError::Rejected("payload has no task id".to_string()))?;

        let title = event.payload.get("title").and_then(serde_json::Value::as_str);
        let message = match (event.event_type.as_str(), title) {
            (TASK_CREATED, Some(title)) => format!("Task \"{title}\" was created"),
            (TASK_UPDATED, Some(title)) => format!("Task \"{title}\" was updated"),
            (TASK_DELETED, _) => format!("Task {task_id} was deleted"),
            (other, _) => format!("Task {task_id}: {other}"),
        };

        Ok(Self {
            event_id: event.event_id(),
            task_id,
            event_type: event.event_type.clone(),
            message,
        })
    }
}

/// Writes task notifications to `PostgreSQL`.
#[derive(Debug, Clone)]
pub struct NotificationHandler {
    pool: PgPool,
}

impl NotificationHandler {
    /// Create a handler writing through `pool`.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Registry routing every task event to this handler.
    #[must_use]
    pub fn registry(self) -> HandlerRegistry {
        let handler: Arc<dyn EventHandler> = Arc::new(self);
        HandlerRegistry::new()
            .register(TASK_CREATED, Arc::clone(&handler))
            .register(TASK_UPDATED, Arc::clone(&handler))
            .register(TASK_DELETED, handler)
    }
}

#[async_trait]
impl EventHandler for NotificationHandler {
    async fn handle(&self, event: &DomainEvent) -> Result<(), WorkError> {
        let notification = Notification::from_event(event)?;

        let result = sqlx::query(
            r"
            INSERT INTO task_notifications (event_id, task_id, event_type, message)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (event_id) DO NOTHING
            ",
        )
        .bind(notification.event_id)
        .bind(notification.task_id)
        .bind(&notification.event_type)
        .bind(&notification.message)
        .execute(&self.pool)
        .await
        .map_err(|e| WorkError::Retryable(format!("Failed to write notification: {e}")))?;

        if result.rows_affected() == 0 {
            tracing::debug!(event_id = %notification.event_id, "Notification already written");
        } else {
            tracing::info!(
                event_id = %notification.event_id,
                task_id = %notification.task_id,
                "Notification written"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(event_type: &str, payload: serde_json::Value) -> DomainEvent {
        DomainEvent::new(event_type, payload, "test", chrono::Utc::now())
    }

    #[test]
    fn test_created_notification() {
        let id = Uuid::new_v4();
        let event = event(TASK_CREATED, json!({"id": id, "title": "write docs", "done": false}));

        let notification = Notification::from_event(&event).unwrap();

        assert_eq!(notification.event_id, event.event_id());
        assert_eq!(notification.task_id, id);
        assert_eq!(notification.message, "Task \"write docs\" was created");
    }

    #[test]
    fn test_deleted_notification() {
        let id = Uuid::new_v4();
        let notification = Notification::from_event(&event(TASK_DELETED, json!({"id": id}))).unwrap();

        assert_eq!(notification.message, format!("Task {id} was deleted"));
    }

    #[test]
    fn test_missing_task_id_is_rejected() {
        let err = Notification::from_event(&event(TASK_CREATED, json!({"title": "x"}))).unwrap_err();

        assert!(matches!(err, WorkError::Rejected(_)));
    }
}
