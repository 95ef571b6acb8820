//! HTTP routes for the task server.
//!
//! Mutating routes run behind the idempotency gate; reads are not gated.

use crate::config::ServerConfig;
use crate::tasks::{CreateTask, Task, TaskService, UpdateTask};
use axum::{
    Json, Router,
    extract::{
        Path, State,
        rejection::{JsonRejection, PathRejection},
    },
    response::{IntoResponse, Response},
    routing::{get, post},
};
use std::time::Duration;
use steadfast_runtime::IdempotencyGate;
use steadfast_web::{
    AppError, IdempotencyKey, RateLimitLayer, RequestDeadlineLayer, WebResult, gated,
    handlers::health_check,
};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    /// Idempotency gate for mutating routes
    pub gate: IdempotencyGate,
    /// Task mutations and queries
    pub tasks: TaskService,
}

/// Build the complete router.
///
/// - `GET /health`
/// - `POST /api/tasks` (gated)
/// - `GET /api/tasks/:id`
/// - `PUT /api/tasks/:id` (gated)
/// - `DELETE /api/tasks/:id` (gated)
///
/// Every request is traced, rate limited per client IP and bounded by the
/// request deadline.
pub fn build_router(state: AppState, server: &ServerConfig) -> Router {
    let api_routes = Router::new()
        .route("/tasks", post(create_task))
        .route("/tasks/:id", get(get_task).put(update_task).delete(delete_task));

    Router::new()
        .route("/health", get(health_check))
        .nest("/api", api_routes)
        .with_state(state)
        .layer(RequestDeadlineLayer::new(Duration::from_secs(
            server.request_deadline_secs,
        )))
        .layer(RateLimitLayer::new(
            server.rate_limit_requests,
            Duration::from_secs(server.rate_limit_window_secs),
        ))
        .layer(TraceLayer::new_for_http())
}

fn task_id(path: Result<Path<Uuid>, PathRejection>) -> WebResult<Uuid> {
    path.map(|Path(id)| id)
        .map_err(|rejection| AppError::bad_request(rejection.body_text()))
}

async fn create_task(
    State(state): State<AppState>,
    key: IdempotencyKey,
    body: Result<Json<CreateTask>, JsonRejection>,
) -> Response {
    let request = match body {
        Ok(Json(request)) => request,
        Err(rejection) => return AppError::bad_request(rejection.body_text()).into_response(),
    };

    let tasks = state.tasks.clone();
    gated(state.gate.clone(), key.0, move || async move {
        tasks.create(request).await
    })
    .await
}

async fn update_task(
    State(state): State<AppState>,
    path: Result<Path<Uuid>, PathRejection>,
    key: IdempotencyKey,
    body: Result<Json<UpdateTask>, JsonRejection>,
) -> Response {
    let (id, changes) = match (task_id(path), body) {
        (Ok(id), Ok(Json(changes))) => (id, changes),
        (Err(error), _) => return error.into_response(),
        (_, Err(rejection)) => return AppError::bad_request(rejection.body_text()).into_response(),
    };

    let tasks = state.tasks.clone();
    gated(state.gate.clone(), key.0, move || async move {
        tasks.update(id, changes).await
    })
    .await
}

async fn delete_task(
    State(state): State<AppState>,
    path: Result<Path<Uuid>, PathRejection>,
    key: IdempotencyKey,
) -> Response {
    let id = match task_id(path) {
        Ok(id) => id,
        Err(error) => return error.into_response(),
    };

    let tasks = state.tasks.clone();
    gated(state.gate.clone(), key.0, move || async move {
        tasks.delete(id).await
    })
    .await
}

async fn get_task(
    State(state): State<AppState>,
    path: Result<Path<Uuid>, PathRejection>,
) -> WebResult<Json<Task>> {
    let id = task_id(path)?;
    state
        .tasks
        .get(id)
        .await
        .map_err(|e| AppError::internal("Failed to load task").with_source(e.into()))?
        .map(Json)
        .ok_or_else(|| AppError::not_found("Task", id))
}
