//! HTTP-level tests for gated mutations.
//!
//! A small router with one gated `POST /api/items` endpoint, backed by the
//! in-memory cache, driven through `tower::ServiceExt::oneshot`.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use axum::{
    Json, Router,
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    response::Response,
    routing::{get, post},
};
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use steadfast_core::idempotency::{MutationError, RequestIdentity, StoredResponse};
use steadfast_runtime::{CacheGateway, Decision, IdempotencyConfig, IdempotencyGate};
use steadfast_testing::{InMemoryCache, RecordingSleeper};
use steadfast_web::{
    IDEMPOTENCY_KEY_HEADER, IdempotencyKey, REPLAYED_HEADER, RequestDeadlineLayer, gated,
    handlers::health_check,
};
use tower::ServiceExt;

#[derive(Clone)]
struct TestApp {
    gate: IdempotencyGate,
    executions: Arc<AtomicUsize>,
    work: Duration,
}

async fn create_item(
    State(app): State<TestApp>,
    key: IdempotencyKey,
    Json(request): Json<Value>,
) -> Response {
    let executions = Arc::clone(&app.executions);
    let work = app.work;

    gated(app.gate.clone(), key.0, move || async move {
        executions.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(work).await;

        match request.get("title").and_then(Value::as_str) {
            Some("missing") => Err(MutationError::NotFound("Item not found".into())),
            Some(title) => Ok(StoredResponse::created(json!({"id": 42, "title": title}))),
            None => Err(MutationError::Validation("title is required".into())),
        }
    })
    .await
}

struct Harness {
    cache: InMemoryCache,
    gate: IdempotencyGate,
    executions: Arc<AtomicUsize>,
    router: Router,
}

fn harness(work: Duration) -> Harness {
    let cache = InMemoryCache::new();
    let gateway =
        CacheGateway::new(Arc::new(cache.clone())).with_sleeper(Arc::new(RecordingSleeper::new()));
    let gate = IdempotencyGate::new(gateway, IdempotencyConfig::default());
    let executions = Arc::new(AtomicUsize::new(0));

    let router = Router::new()
        .route("/api/items", post(create_item))
        .route("/health", get(health_check))
        .layer(RequestDeadlineLayer::new(Duration::from_secs(10)))
        .with_state(TestApp {
            gate: gate.clone(),
            executions: Arc::clone(&executions),
            work,
        });

    Harness {
        cache,
        gate,
        executions,
        router,
    }
}

fn post_item(key: Option<&str>, title: &str) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/api/items")
        .header("content-type", "application/json");
    if let Some(key) = key {
        builder = builder.header(IDEMPOTENCY_KEY_HEADER, key);
    }
    builder
        .body(Body::from(json!({"title": title}).to_string()))
        .unwrap()
}

async fn json_body(response: Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_retry_with_same_key_replays_response() {
    let h = harness(Duration::ZERO);

    let first = h
        .router
        .clone()
        .oneshot(post_item(Some("order-1"), "write docs"))
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::CREATED);
    assert!(first.headers().get(REPLAYED_HEADER).is_none());
    let first_body = json_body(first).await;

    let second = h
        .router
        .oneshot(post_item(Some("order-1"), "write docs"))
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::CREATED);
    assert_eq!(second.headers().get(REPLAYED_HEADER).unwrap(), "true");
    assert_eq!(json_body(second).await, first_body);

    assert_eq!(h.executions.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_in_progress_key_gets_409_then_replay() {
    let h = harness(Duration::ZERO);
    let identity = RequestIdentity::new("key-1").unwrap();

    let Decision::Proceed(guard) = h.gate.admit(Some(&identity)).await else {
        panic!("first admission should proceed");
    };

    let conflict = h
        .router
        .clone()
        .oneshot(post_item(Some("key-1"), "anything"))
        .await
        .unwrap();
    assert_eq!(conflict.status(), StatusCode::CONFLICT);
    assert_eq!(json_body(conflict).await["status"], 409);

    guard
        .complete(&StoredResponse::created(json!({"id": 42, "title": "first"})))
        .await
        .unwrap();

    let replay = h
        .router
        .oneshot(post_item(Some("key-1"), "anything"))
        .await
        .unwrap();
    assert_eq!(replay.status(), StatusCode::CREATED);
    assert_eq!(json_body(replay).await, json!({"id": 42, "title": "first"}));
    assert_eq!(h.executions.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_cache_outage_is_503_without_running_mutation() {
    let h = harness(Duration::ZERO);
    h.cache.set_failing(true);

    let response = h
        .router
        .oneshot(post_item(Some("key-2"), "anything"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(json_body(response).await["status"], 503);
    assert_eq!(h.executions.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_no_key_runs_every_time() {
    let h = harness(Duration::ZERO);

    for _ in 0..2 {
        let response = h
            .router
            .clone()
            .oneshot(post_item(None, "write docs"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
    }

    assert_eq!(h.executions.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_empty_key_is_rejected_with_400() {
    let h = harness(Duration::ZERO);

    let response = h.router.oneshot(post_item(Some(""), "x")).await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = json_body(response).await;
    assert_eq!(body["status"], 400);
    assert!(body["message"].is_string());
    assert_eq!(h.executions.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_failures_are_not_replayed() {
    let h = harness(Duration::ZERO);

    for _ in 0..2 {
        let response = h
            .router
            .clone()
            .oneshot(post_item(Some("order-9"), "missing"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    // Lock released after each failure, so the retry ran again.
    assert_eq!(h.executions.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_deadline_does_not_cancel_admitted_mutation() {
    let h = harness(Duration::from_secs(15));
    let identity = RequestIdentity::new("slow-1").unwrap();

    let response = h
        .router
        .clone()
        .oneshot(post_item(Some("slow-1"), "slow"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::REQUEST_TIMEOUT);

    let result_key = h.gate.result_key(&identity);
    for _ in 0..100 {
        if h.cache.contains(&result_key) {
            break;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    assert!(h.cache.contains(&result_key), "mutation should finish and store its response");

    let replay = h
        .router
        .oneshot(post_item(Some("slow-1"), "slow"))
        .await
        .unwrap();
    assert_eq!(replay.status(), StatusCode::CREATED);
    assert_eq!(replay.headers().get(REPLAYED_HEADER).unwrap(), "true");
    assert_eq!(h.executions.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_health_endpoint() {
    let h = harness(Duration::ZERO);
    let server = axum_test::TestServer::new(h.router).unwrap();

    let response = server.get("/health").await;

    response.assert_status_ok();
    response.assert_text("ok");
}
