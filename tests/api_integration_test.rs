//! Integration tests for the cache administration API
//!
//! Requests are driven through the router in-process; no socket is bound.

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use observation_cache::api::router;
use observation_cache::{
    CacheConfig, CacheContext, ChangeSignal, ChangeSource, MemoryStore, Result, SwrOptions,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

struct QuietSource;

#[async_trait]
impl ChangeSource for QuietSource {
    async fn poll(&self, _endpoint: &str) -> Result<ChangeSignal> {
        Ok(ChangeSignal::default())
    }
}

/// Test helper building a router over a seeded in-memory store
async fn test_app(store: &MemoryStore) -> (Router, Arc<CacheContext>) {
    let context = Arc::new(CacheContext::with_store(
        CacheConfig::testing(),
        Arc::new(store.clone()),
        Arc::new(QuietSource),
    ));

    let swr = context.swr();
    let options = SwrOptions::new().ttl(60);
    swr.set("observations:1", &json!({"id": 1}), &options.clone().tags(["observations"]))
        .await;
    swr.set("observations:2", &json!({"id": 2}), &options).await;
    swr.set("static:countries", &json!(["NL"]), &options.clone().tags(["countries"]))
        .await;

    (router(Arc::clone(&context)), context)
}

async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

fn post(body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/cache/invalidate")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn test_health_check() {
    let store = MemoryStore::new();
    let (app, _) = test_app(&store).await;

    let (status, body) = send(app, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["store"], "memory");
    assert_eq!(body["storeAvailable"], true);
}

#[tokio::test]
async fn test_health_check_degraded() {
    let store = MemoryStore::new();
    let (app, _) = test_app(&store).await;
    store.set_available(false);

    let (status, body) = send(app, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "degraded");
}

#[tokio::test]
async fn test_invalidate_by_tag() {
    let store = MemoryStore::new();
    let (app, _) = test_app(&store).await;

    let (status, body) = send(app, post(json!({"method": "tag", "target": "observations"}))).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["method"], "tag");
    assert_eq!(body["target"], "observations");
    assert_eq!(body["reason"], "manual");
    assert_eq!(body["invalidatedCount"], 1);
    assert!(body["duration"].is_u64());
    assert!(body["timestamp"].is_string());
}

#[tokio::test]
async fn test_invalidate_by_pattern() {
    let store = MemoryStore::new();
    let (app, _) = test_app(&store).await;

    let (status, body) = send(
        app.clone(),
        post(json!({"method": "pattern", "target": "observations:*"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["invalidatedCount"], 2);

    let (status, _) = send(app, post(json!({"method": "pattern", "target": "*"}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_invalidate_by_rule_is_the_default_method() {
    let store = MemoryStore::new();
    let (app, _) = test_app(&store).await;

    let (status, body) = send(app, post(json!({"target": "static-data"}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["method"], "rule");
    assert_eq!(body["invalidatedCount"], 1);
}

#[tokio::test]
async fn test_smart_invalidation_requires_type() {
    let store = MemoryStore::new();
    let (app, _) = test_app(&store).await;

    let (status, body) = send(
        app.clone(),
        post(json!({"method": "smart", "target": "observation_update", "data": {"id": 1}})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Smart invalidation requires data.type");

    let (status, body) = send(
        app,
        post(json!({
            "method": "smart",
            "target": "observation_update",
            "data": {"type": "observation", "id": 1}
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["invalidatedCount"], 2);
}

#[tokio::test]
async fn test_manual_invalidation_with_scope() {
    let store = MemoryStore::new();
    let (app, context) = test_app(&store).await;

    let (status, body) = send(
        app,
        post(json!({
            "method": "manual",
            "target": "countries",
            "reason": "boundary update",
            "scope": "tag"
        })),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["reason"], "boundary update");
    assert_eq!(body["invalidatedCount"], 1);
    assert_eq!(context.metrics().snapshot().invalidations["manual"].entries, 1);
}

#[tokio::test]
async fn test_invalid_requests() {
    let store = MemoryStore::new();
    let (app, _) = test_app(&store).await;

    let (status, body) = send(app.clone(), post(json!({"method": "tag"}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Target is required");

    let (status, body) = send(app, post(json!({"method": "purge", "target": "x"}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Unknown invalidation method: purge");
}

#[tokio::test]
async fn test_stats_and_rules() {
    let store = MemoryStore::new();
    let (app, _) = test_app(&store).await;

    let (status, body) = send(app.clone(), get("/cache/invalidate?action=stats")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["invalidationManager"]["rulesCount"], 6);
    assert_eq!(body["invalidationManager"]["changeDetectionActive"], false);
    assert_eq!(body["swrCache"]["totalEntries"], 3);
    assert_eq!(body["swrCache"]["freshEntries"], 3);
    assert!(body["metrics"].is_object());

    let (status, body) = send(app.clone(), get("/cache/invalidate?action=rules")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 6);
    assert!(body["rules"]
        .as_array()
        .unwrap()
        .contains(&json!("new-observations")));

    let (status, _) = send(app, get("/cache/invalidate")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
