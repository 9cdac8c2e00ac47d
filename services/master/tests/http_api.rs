//! The HTTP surface end to end, driven through the router in process.

mod common;

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use common::start;
use gantry_id::AgentId;
use gantry_master::api::create_router;
use gantry_master::config::PoolConfig;
use serde_json::{json, Value};
use tower::ServiceExt;

fn pools() -> Vec<PoolConfig> {
    vec![PoolConfig::named("compute")]
}

async fn call(router: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("x-request-id", "test-request");
    let body = match body {
        Some(value) => {
            builder = builder.header(header::CONTENT_TYPE, "application/json");
            Body::from(value.to_string())
        }
        None => Body::empty(),
    };
    let response = router
        .clone()
        .oneshot(builder.body(body).unwrap())
        .await
        .unwrap();

    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

#[tokio::test]
async fn task_lifecycle_over_http() {
    let h = start(pools());
    let router = create_router(h.master.clone());
    let agent = AgentId::new();

    let (status, body) = call(
        &router,
        Method::POST,
        "/v1/agents",
        Some(json!({
            "agent_id": agent.to_string(),
            "pool": "compute",
            "slots": ["gpu", "gpu"],
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["slots"], 2);

    let (status, body) = call(
        &router,
        Method::POST,
        "/v1/pools/compute/tasks",
        Some(json!({ "slots": 2, "device": "gpu", "name": "train" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["state"], "pending");
    let id = body["allocation_id"].as_str().unwrap().to_string();

    h.master.schedule_pass("compute").await.unwrap();
    h.wait_for_state(
        id.parse().unwrap(),
        gantry_events::AllocationState::Starting,
    )
    .await;

    let (status, body) = call(&router, Method::POST, &format!("/v1/allocations/{id}/ready"), None).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["accepted"], true);
    assert_eq!(body["state"], "running");

    let (status, body) = call(
        &router,
        Method::POST,
        &format!("/v1/allocations/{id}/logs"),
        Some(json!({
            "entries": [
                { "timestamp": "2026-01-01T00:00:01Z", "message": "loading", "rank": 0 },
                { "timestamp": "2026-01-01T00:00:02Z", "message": "step 1", "level": "warning", "rank": 1 },
            ]
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["accepted"], 2);

    let (status, body) = call(
        &router,
        Method::GET,
        &format!("/v1/allocations/{id}/logs?level=warning"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let items = body["items"].as_array().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["message"], "step 1");

    let (status, body) = call(&router, Method::GET, &format!("/v1/allocations/{id}/logs/fields"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ranks"], json!([0, 1]));

    let (status, body) = call(
        &router,
        Method::POST,
        &format!("/v1/agents/{agent}/allocations/{id}/exit"),
        Some(json!({ "success": true, "exit_code": 0 })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["state"], "terminated");
    assert_eq!(body["outcome"], "success");

    let (status, body) = call(&router, Method::GET, &format!("/v1/allocations/{id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["history"].as_array().unwrap().len() >= 5);

    let (_, body) = call(&router, Method::GET, "/v1/pools", None).await;
    assert_eq!(body["items"][0]["name"], "compute");
    assert_eq!(body["items"][0]["free"]["gpu"], 2);
}

#[tokio::test]
async fn errors_are_problem_documents() {
    let h = start(pools());
    let router = create_router(h.master.clone());

    let (status, body) = call(&router, Method::GET, "/v1/allocations/alloc_nope", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "invalid_allocation_id");
    assert_eq!(body["request_id"], "test-request");

    let missing = gantry_id::AllocationId::new();
    let (status, body) = call(&router, Method::GET, &format!("/v1/allocations/{missing}"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "unknown_allocation");

    let (status, body) = call(
        &router,
        Method::POST,
        "/v1/pools/nowhere/tasks",
        Some(json!({ "slots": 1 })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "unknown_pool");

    // No agent in the pool can ever hold this.
    let (status, body) = call(
        &router,
        Method::POST,
        "/v1/pools/compute/tasks",
        Some(json!({ "slots": 4, "device": "gpu" })),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["status"], 422);
}

#[tokio::test]
async fn readiness_follows_reattachment() {
    let h = start(pools());
    let router = create_router(h.master.clone());

    let (status, _) = call(&router, Method::GET, "/healthz", None).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = call(&router, Method::GET, "/readyz", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["status"], "starting");

    h.master.reattach().await.unwrap();
    let (status, body) = call(&router, Method::GET, "/readyz", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}
