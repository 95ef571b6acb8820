//! Task domain: storage, mutations and the events they emit.
//!
//! Mutations run behind the idempotency gate and return a
//! [`StoredResponse`], so a retried request replays the same body. After a
//! mutation commits, the matching event is published; a publish failure is
//! logged and counted but does not fail the request, because the task row
//! is already written.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::PgPool;
use std::sync::Arc;
use steadfast_core::environment::{Clock, SystemClock};
use steadfast_core::event::SchemaRegistry;
use steadfast_core::idempotency::{MutationError, StoredResponse};
use steadfast_runtime::EventProducer;
use thiserror::Error;
use uuid::Uuid;

/// Event emitted when a task is created.
pub const TASK_CREATED: &str = "task.created";
/// Event emitted when a task is updated.
pub const TASK_UPDATED: &str = "task.updated";
/// Event emitted when a task is deleted.
pub const TASK_DELETED: &str = "task.deleted";

/// Longest accepted title, in characters.
pub const MAX_TITLE_LEN: usize = 200;

/// A task row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Task identifier
    pub id: Uuid,
    /// Short title
    pub title: String,
    /// Optional longer description
    pub description: Option<String>,
    /// Completion flag
    pub done: bool,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

/// Body of `POST /api/tasks`.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateTask {
    /// Short title
    pub title: String,
    /// Optional longer description
    #[serde(default)]
    pub description: Option<String>,
}

/// Body of `PUT /api/tasks/:id`; absent fields are left unchanged.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateTask {
    /// New title
    pub title: Option<String>,
    /// New description
    pub description: Option<String>,
    /// New completion flag
    pub done: Option<bool>,
}

/// Payload of `task.created` and `task.updated`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskChanged {
    /// Task identifier
    pub id: Uuid,
    /// Title after the change
    pub title: String,
    /// Description after the change
    pub description: Option<String>,
    /// Completion flag after the change
    pub done: bool,
}

/// Payload of `task.deleted`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDeleted {
    /// Task identifier
    pub id: Uuid,
}

/// Schema of every event this service publishes.
#[must_use]
pub fn task_schema() -> SchemaRegistry {
    SchemaRegistry::new()
        .register::<TaskChanged>(TASK_CREATED)
        .register::<TaskChanged>(TASK_UPDATED)
        .register::<TaskDeleted>(TASK_DELETED)
}

/// Storage failure.
#[derive(Error, Debug)]
pub enum RepositoryError {
    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Task storage.
#[async_trait]
pub trait TaskRepository: Send + Sync + 'static {
    /// Insert a new task.
    async fn insert(&self, task: &Task) -> Result<(), RepositoryError>;

    /// Apply `changes`; `None` if the task does not exist.
    async fn update(&self, id: Uuid, changes: &UpdateTask) -> Result<Option<Task>, RepositoryError>;

    /// Delete a task; `false` if it did not exist.
    async fn delete(&self, id: Uuid) -> Result<bool, RepositoryError>;

    /// Fetch a task.
    async fn get(&self, id: Uuid) -> Result<Option<Task>, RepositoryError>;
}

/// `PostgreSQL` task storage.
#[derive(Debug, Clone)]
pub struct PostgresTaskRepository {
    pool: PgPool,
}

impl PostgresTaskRepository {
    /// Create a repository over `pool`.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TaskRepository for PostgresTaskRepository {
    async fn insert(&self, task: &Task) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO tasks (id, title, description, done, created_at) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(task.id)
        .bind(&task.title)
        .bind(&task.description)
        .bind(task.done)
        .bind(task.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update(&self, id: Uuid, changes: &UpdateTask) -> Result<Option<Task>, RepositoryError> {
        let task = sqlx::query_as::<_, Task>(
            r"
            UPDATE tasks
            SET title = COALESCE($2, title),
                description = COALESCE($3, description),
                done = COALESCE($4, done)
            WHERE id = $1
            RETURNING id, title, description, done, created_at
            ",
        )
        .bind(id)
        .bind(&changes.title)
        .bind(&changes.description)
        .bind(changes.done)
        .fetch_optional(&self.pool)
        .await?;
        Ok(task)
    }

    async fn delete(&self, id: Uuid) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM tasks WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Task>, RepositoryError> {
        let task = sqlx::query_as::<_, Task>(
            "SELECT id, title, description, done, created_at FROM tasks WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(task)
    }
}

fn internal(error: &RepositoryError) -> MutationError {
    tracing::error!(%error, "Task storage failed");
    MutationError::Internal(error.to_string())
}

fn validate_title(title: &str) -> Result<String, MutationError> {
    let title = title.trim();
    if title.is_empty() {
        return Err(MutationError::Validation("title must not be empty".to_string()));
    }
    if title.chars().count() > MAX_TITLE_LEN {
        return Err(MutationError::Validation(format!(
            "title must be at most {MAX_TITLE_LEN} characters"
        )));
    }
    Ok(title.to_string())
}

fn to_value<T: Serialize>(value: &T) -> Result<serde_json::Value, MutationError> {
    serde_json::to_value(value).map_err(|e| MutationError::Internal(e.to_string()))
}

/// Task mutations and queries.
#[derive(Clone)]
pub struct TaskService {
    repository: Arc<dyn TaskRepository>,
    producer: EventProducer,
    clock: Arc<dyn Clock>,
}

impl TaskService {
    /// Create a service storing tasks in `repository` and publishing through `producer`.
    #[must_use]
    pub fn new(repository: Arc<dyn TaskRepository>, producer: EventProducer) -> Self {
        Self {
            repository,
            producer,
            clock: Arc::new(SystemClock),
        }
    }

    /// Replace the clock used for creation times.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Create a task; responds `201` with the task.
    ///
    /// # Errors
    ///
    /// [`MutationError::Validation`] for a bad title, [`MutationError::Internal`]
    /// if storage fails.
    pub async fn create(&self, request: CreateTask) -> Result<StoredResponse, MutationError> {
        let task = Task {
            id: Uuid::new_v4(),
            title: validate_title(&request.title)?,
            description: request.description,
            done: false,
            created_at: self.clock.now(),
        };

        self.repository.insert(&task).await.map_err(|e| internal(&e))?;
        tracing::info!(task_id = %task.id, "Task created");

        self.emit(TASK_CREATED, &changed(&task)).await;
        Ok(StoredResponse::created(to_value(&task)?))
    }

    /// Update a task; responds `200` with the updated task.
    ///
    /// # Errors
    ///
    /// [`MutationError::NotFound`] if the task does not exist,
    /// [`MutationError::Validation`] for a bad title, [`MutationError::Internal`]
    /// if storage fails.
    pub async fn update(&self, id: Uuid, mut changes: UpdateTask) -> Result<StoredResponse, MutationError> {
        if let Some(title) = &changes.title {
            changes.title = Some(validate_title(title)?);
        }

        let task = self
            .repository
            .update(id, &changes)
            .await
            .map_err(|e| internal(&e))?
            .ok_or_else(|| MutationError::NotFound(format!("Task with id {id} not found")))?;
        tracing::info!(task_id = %id, "Task updated");

        self.emit(TASK_UPDATED, &changed(&task)).await;
        Ok(StoredResponse::ok(to_value(&task)?))
    }

    /// Delete a task; responds `200` with `{id, deleted: true}`.
    ///
    /// # Errors
    ///
    /// [`MutationError::NotFound`] if the task does not exist,
    /// [`MutationError::Internal`] if storage fails.
    pub async fn delete(&self, id: Uuid) -> Result<StoredResponse, MutationError> {
        if !self.repository.delete(id).await.map_err(|e| internal(&e))? {
            return Err(MutationError::NotFound(format!("Task with id {id} not found")));
        }
        tracing::info!(task_id = %id, "Task deleted");

        self.emit(TASK_DELETED, &TaskDeleted { id }).await;
        Ok(StoredResponse::ok(json!({"id": id, "deleted": true})))
    }

    /// Fetch a task.
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError`] if storage fails.
    pub async fn get(&self, id: Uuid) -> Result<Option<Task>, RepositoryError> {
        self.repository.get(id).await
    }

    async fn emit<T: Serialize>(&self, event_type: &str, payload: &T) {
        let payload = match serde_json::to_value(payload) {
            Ok(payload) => payload,
            Err(error) => {
                tracing::error!(event_type, %error, "Failed to encode event payload");
                return;
            }
        };
        // Already logged and counted by the producer.
        let _ = self.producer.publish(event_type, payload).await;
    }
}

fn changed(task: &Task) -> TaskChanged {
    TaskChanged {
        id: task.id,
        title: task.title.clone(),
        description: task.description.clone(),
        done: task.done,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use steadfast_core::event::EventSchema;

    #[test]
    fn test_title_is_trimmed_and_bounded() {
        assert_eq!(validate_title("  write docs ").unwrap(), "write docs");
        assert!(matches!(validate_title("   "), Err(MutationError::Validation(_))));
        assert!(validate_title(&"x".repeat(MAX_TITLE_LEN)).is_ok());
        assert!(validate_title(&"x".repeat(MAX_TITLE_LEN + 1)).is_err());
    }

    #[test]
    fn test_schema_accepts_task_payloads() {
        let schema = task_schema();
        let id = Uuid::new_v4();

        assert!(schema
            .validate(TASK_CREATED, &json!({"id": id, "title": "t", "description": null, "done": false}))
            .is_ok());
        assert!(schema.validate(TASK_DELETED, &json!({"id": id})).is_ok());
        assert!(schema.validate(TASK_DELETED, &json!({"id": "not-a-uuid"})).is_err());
        assert!(schema.validate("task.archived", &json!({"id": id})).is_err());
    }

    #[test]
    fn test_task_serializes_camel_case() {
        let task = Task {
            id: Uuid::nil(),
            title: "t".into(),
            description: None,
            done: false,
            created_at: "2025-01-01T00:00:00Z".parse().unwrap(),
        };

        let value = serde_json::to_value(&task).unwrap();
        assert!(value.get("createdAt").is_some());
        assert!(value.get("created_at").is_none());
    }
}
