//! ---
//! bw_section: "05-networking-external-interfaces"
//! bw_subsection: "module"
//! bw_type: "source"
//! bw_scope: "code"
//! bw_description: "Route-level tests for the administrative API."
//! bw_version: "v0.1.0"
//! bw_owner: "tbd"
//! ---
use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use bulwark_api::{router, spawn_api_server, ApiState};
use bulwark_common::{AppConfig, ErrorCategory};
use bulwark_resilience::{ChannelAlertSink, ResilienceEngine};
use serde_json::{json, Value};
use tower::ServiceExt;

fn engine(chaos_enabled: bool) -> Arc<ResilienceEngine> {
    let mut config = AppConfig::default();
    config.chaos.enabled = chaos_enabled;
    let (sink, _alerts) = ChannelAlertSink::new();
    Arc::new(
        ResilienceEngine::builder(config)
            .alert_sink(Arc::new(sink))
            .build()
            .unwrap(),
    )
}

fn app(engine: Arc<ResilienceEngine>) -> Router {
    router(Arc::new(ApiState::new(engine, "test")))
}

async fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

fn trip(engine: &ResilienceEngine, key: &str) {
    for _ in 0..10 {
        engine
            .breakers()
            .on_failure(key, ErrorCategory::ExternalDependency);
    }
}

#[tokio::test]
async fn health_reports_service_unavailable_when_a_breaker_is_open() {
    let engine = engine(false);
    let app = app(engine.clone());

    let (status, body) = call(&app, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");

    trip(&engine, "payments-api");
    let (status, body) = call(&app, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["status"], "unhealthy");
    assert_eq!(body["open_breaker_count"], 1);
}

#[tokio::test]
async fn breaker_routes_list_inspect_and_reset() {
    let engine = engine(false);
    let app = app(engine.clone());
    trip(&engine, "payments-api");
    engine.breakers().get_or_create("ledger", None);

    let (status, body) = call(&app, Method::GET, "/api/breakers", None).await;
    assert_eq!(status, StatusCode::OK);
    let keys: Vec<&str> = body
        .as_array()
        .unwrap()
        .iter()
        .map(|snapshot| snapshot["key"].as_str().unwrap())
        .collect();
    assert_eq!(keys, vec!["ledger", "payments-api"]);

    let (status, body) = call(&app, Method::GET, "/api/breakers/payments-api", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "OPEN");

    let (status, body) = call(&app, Method::GET, "/api/breakers/missing", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["message"].as_str().unwrap().contains("missing"));

    let (status, body) = call(&app, Method::POST, "/api/breakers/payments-api/reset", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["reset"], 1);
    let (_, body) = call(&app, Method::GET, "/api/breakers/payments-api", None).await;
    assert_eq!(body["state"], "CLOSED");

    let (status, _) = call(&app, Method::POST, "/api/breakers/missing/reset", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = call(&app, Method::POST, "/api/breakers/reset", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["reset"], 2);
}

#[tokio::test]
async fn statistics_routes_report_and_reset() {
    let engine = engine(false);
    let app = app(engine.clone());
    engine.handle(
        &anyhow::anyhow!("ECONNREFUSED 10.0.0.7:5432"),
        Default::default(),
    );

    let (status, body) = call(&app, Method::GET, "/api/errors/stats", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total_errors"], 1);
    assert_eq!(body["recent"].as_array().unwrap().len(), 1);

    let (status, body) = call(&app, Method::POST, "/api/errors/reset", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["reset_at"].is_string());
    let (_, body) = call(&app, Method::GET, "/api/errors/stats", None).await;
    assert_eq!(body["total_errors"], 0);
}

#[tokio::test]
async fn chaos_routes_are_forbidden_when_disabled() {
    let app = app(engine(false));
    let (status, body) = call(&app, Method::GET, "/api/chaos/experiments", None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["message"], "chaos experiments are disabled");

    let (status, _) = call(
        &app,
        Method::POST,
        "/api/chaos/experiments",
        Some(json!({ "type": "random" })),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn chaos_routes_start_list_and_stop_experiments() {
    let app = app(engine(true));

    let (status, body) = call(
        &app,
        Method::POST,
        "/api/chaos/experiments",
        Some(json!({
            "type": "sequential",
            "target_categories": ["network", "timeout"],
            "max_errors": 1000,
            "duration_ms": 60000,
            "tick_interval_ms": 1000,
        })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let id = body["id"].as_str().unwrap().to_string();

    let (status, body) = call(&app, Method::GET, "/api/chaos/experiments", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body[0]["id"], id.as_str());
    assert_eq!(body[0]["running"], true);

    let uri = format!("/api/chaos/experiments/{id}");
    let (status, body) = call(&app, Method::DELETE, &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["stop_reason"], "stopped");

    let unknown = format!("/api/chaos/experiments/{}", uuid::Uuid::new_v4());
    let (status, _) = call(&app, Method::DELETE, &unknown, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn invalid_experiment_is_rejected() {
    let app = app(engine(true));
    let (status, body) = call(
        &app,
        Method::POST,
        "/api/chaos/experiments",
        Some(json!({ "type": "burst", "probability_per_tick": 2.5 })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["message"].as_str().unwrap().contains("probability"));
}

#[tokio::test]
async fn spawned_server_binds_and_shuts_down() {
    let state = Arc::new(ApiState::new(engine(false), "test"));
    let server = spawn_api_server(state, "127.0.0.1:0".parse().unwrap()).unwrap();
    assert_ne!(server.addr().port(), 0);
    server.shutdown().await.unwrap();
}
