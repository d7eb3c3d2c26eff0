//! HTTP routes against a running coordinator actor with in-memory fakes.

mod common;

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use common::*;
use forge_grid::coordinator::{CoordinatorHandle, CyclePhase, coordinator_channel, spawn_coordinator};
use forge_grid::server::{AppState, build_router};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tower::ServiceExt;

struct App {
    router: Router,
    handle: CoordinatorHandle,
    tracker: Arc<FakeTracker>,
    grid: Arc<FakeGrid>,
}

fn app() -> App {
    let h = harness();
    let state = Arc::new(AppState {
        budget: h.coordinator.budget().clone(),
        db: h.db.clone(),
        repo: REPO.into(),
        coordinator: {
            let (handle, _task) = spawn_coordinator(h.coordinator);
            handle
        },
    });
    h.completion.classify(7, &simple("small"));
    h.tracker.add_issue(7, "Fix typo", "", &[]);
    App {
        handle: state.coordinator.clone(),
        router: build_router(state),
        tracker: h.tracker,
        grid: h.grid,
    }
}

async fn send(router: &Router, req: Request<Body>) -> (StatusCode, Value) {
    let resp = router.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, body)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn webhook(event: &str, delivery: Option<&str>, body: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/webhooks/github")
        .header("content-type", "application/json")
        .header("x-github-event", event);
    if let Some(id) = delivery {
        builder = builder.header("x-github-delivery", id);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

/// Launch issue #7 through the actor and return its execution id.
async fn launched(app: &App) -> String {
    app.handle.run_phase(CyclePhase::Intake).await.unwrap();
    app.grid.launches()[0].execution_id.clone()
}

#[tokio::test]
async fn test_health() {
    let app = app();
    let (status, body) = send(&app.router, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_agent_status_applies_once() {
    let app = app();
    let id = launched(&app).await;
    let payload = json!({"execution_id": id, "status": "completed", "pr_number": 12, "cost_usd": 0.5});

    let (status, body) = send(
        &app.router,
        json_request("POST", "/api/agent-status", payload.clone()),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "applied");
    assert_eq!(app.tracker.labels(7), vec!["ai-review-pending"]);

    let (status, body) = send(&app.router, json_request("POST", "/api/agent-status", payload)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "duplicate");
}

#[tokio::test]
async fn test_agent_status_errors() {
    let app = app();
    let (status, body) = send(
        &app.router,
        json_request(
            "POST",
            "/api/agent-status",
            json!({"execution_id": "missing", "status": "failed"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains("missing"));

    let id = launched(&app).await;
    let (status, _) = send(
        &app.router,
        json_request(
            "POST",
            "/api/agent-status",
            json!({"execution_id": id, "status": "running"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_webhook_routing() {
    let app = app();

    let (status, body) = send(&app.router, webhook("ping", Some("d-1"), json!({"zen": "hi"}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "pong");

    let (status, body) = send(
        &app.router,
        webhook("issues", Some("d-2"), json!({"action": "opened"})),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "queued");
    assert_eq!(body["phase"], "intake");

    let (status, body) = send(
        &app.router,
        webhook("issues", Some("d-2"), json!({"action": "opened"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "duplicate");

    let (status, body) = send(&app.router, webhook("push", Some("d-3"), json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ignored");

    let missing_event = json_request("POST", "/webhooks/github", json!({}));
    let (status, _) = send(&app.router, missing_event).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_webhook_redelivery_after_full_queue_is_queued() {
    let h = harness();
    let (handle, mut commands) = coordinator_channel(1);
    let router = build_router(Arc::new(AppState {
        budget: h.coordinator.budget().clone(),
        db: h.db.clone(),
        repo: REPO.into(),
        coordinator: handle.clone(),
    }));
    assert!(handle.enqueue_phase(CyclePhase::Dependencies).unwrap());

    let opened = || webhook("issues", Some("d-9"), json!({"action": "opened"}));
    let (status, body) = send(&router, opened()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ignored");

    commands.recv().await.unwrap();
    let (status, body) = send(&router, opened()).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "queued");

    let (_, body) = send(&router, opened()).await;
    assert_eq!(body["status"], "duplicate");
}

#[tokio::test]
async fn test_execution_listing_and_lookup() {
    let app = app();
    let id = launched(&app).await;

    let (status, body) = send(&app.router, get("/api/executions?status=running")).await;
    assert_eq!(status, StatusCode::OK);
    let executions = body["executions"].as_array().unwrap();
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0]["id"], id.as_str());

    let (status, body) = send(&app.router, get("/api/executions?status=completed")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["executions"].as_array().unwrap().is_empty());

    let (status, body) = send(&app.router, get(&format!("/api/executions/{}", id))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["issue_number"], 7);
    assert_eq!(body["mode"], "implement");

    let (status, _) = send(&app.router, get("/api/executions/nope")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_checkpoint_and_cancel() {
    let app = app();
    let id = launched(&app).await;

    let (status, body) = send(
        &app.router,
        json_request(
            "PUT",
            &format!("/api/executions/{}/checkpoint", id),
            json!({"context_summary": "halfway"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "saved");

    let (status, _) = send(
        &app.router,
        json_request("PUT", "/api/executions/nope/checkpoint", json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let cancel = Request::builder()
        .method("POST")
        .uri(format!("/api/executions/{}/cancel", id))
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&app.router, cancel).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "applied");
    assert_eq!(app.grid.cancels(), vec![id.clone()]);

    let (_, body) = send(&app.router, get(&format!("/api/executions/{}", id))).await;
    assert_eq!(body["status"], "failed");
    assert_eq!(body["checkpoint"]["context_summary"], "halfway");
}

#[tokio::test]
async fn test_nudges_are_queued_and_listed() {
    let app = app();
    let (status, body) = send(
        &app.router,
        json_request(
            "POST",
            "/api/nudge",
            json!({"issue_number": 7, "priority": 3, "reason": "unblocked by #6"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["issue_number"], 7);
    assert_eq!(body["repo"], REPO);

    let (status, body) = send(&app.router, get("/api/nudges")).await;
    assert_eq!(status, StatusCode::OK);
    let nudges = body["nudges"].as_array().unwrap();
    assert_eq!(nudges.len(), 1);
    assert_eq!(nudges[0]["priority"], 3);
}

#[tokio::test]
async fn test_cycle_and_budget() {
    let app = app();
    let (status, body) = send(&app.router, json_request("POST", "/api/cycle", json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["launched"], 1);
    assert_eq!(body["phases"].as_array().unwrap().len(), 6);

    let (status, body) = send(&app.router, get("/api/budget")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["active_executions"], 1);
    assert_eq!(body["max_concurrent"], 5);
}
