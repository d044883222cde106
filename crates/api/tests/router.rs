use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use api::config::{AppConfig, BackendKind};
use api::pipeline::{build_orchestrator, Backend};
use api::{create_router, AppState};
use axum::body::{to_bytes, Body};
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

fn mock_config(dir: &Path) -> AppConfig {
    let mut config = AppConfig::default();
    config.engine.backend = BackendKind::Mock;
    config.engine.model_dir = dir.join("models");
    config.engine.cache_dir = dir.join("cache");
    config.detection.input_size = 64;
    std::fs::create_dir_all(&config.engine.model_dir).unwrap();
    std::fs::write(config.engine.model_dir.join("plate_detect.onnx"), b"onnx").unwrap();
    config
}

fn app(dir: &Path) -> (Router, Arc<AppState>) {
    let config = mock_config(dir);
    let backend = Backend::from_settings(&config.engine);
    let orchestrator = build_orchestrator(&config, &backend).unwrap();
    let state = Arc::new(AppState::new(orchestrator, None));
    (create_router(state.clone()), state)
}

async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
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
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

#[tokio::test]
async fn health_reports_engines() {
    let dir = tempfile::tempdir().unwrap();
    let (app, _) = app(dir.path());

    let (status, body) = send(&app, Method::GET, "/api/v1/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["active_streams"], 0);
    assert_eq!(body["engines"][0]["name"], "plate_detect-dev0");
}

#[tokio::test]
async fn view_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let (app, state) = app(dir.path());
    let view = json!({ "uri": "synthetic://gate1?interval_ms=2" });

    let (status, body) = send(&app, Method::POST, "/api/v1/views", Some(view.clone())).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["state"], "running");

    let (status, body) = send(&app, Method::POST, "/api/v1/views", Some(view.clone())).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], 409);

    let (status, body) = send(&app, Method::GET, "/api/v1/views", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 1);
    assert_eq!(body["uris"][0], "synthetic://gate1?interval_ms=2");

    let (status, body) = send(&app, Method::DELETE, "/api/v1/views", Some(view.clone())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "stopped");
    assert!(state.orchestrator.list_active_uris().is_empty());

    let (status, _) = send(&app, Method::DELETE, "/api/v1/views", Some(view)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn rejected_views() {
    let dir = tempfile::tempdir().unwrap();
    let (app, _) = app(dir.path());

    let (status, _) = send(
        &app,
        Method::POST,
        "/api/v1/views",
        Some(json!({ "uri": "synthetic://down?refuse=1" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);

    let (status, _) = send(&app, Method::POST, "/api/v1/views", Some(json!({ "uri": "  " }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (_, body) = send(&app, Method::GET, "/api/v1/views", None).await;
    assert_eq!(body["count"], 0);
}

#[tokio::test]
async fn detections_follow_the_stream() {
    let dir = tempfile::tempdir().unwrap();
    let (app, _) = app(dir.path());
    let uri = "synthetic://gate2?interval_ms=1";

    let (status, _) = send(&app, Method::GET, "/api/v1/detections?uri=synthetic://none", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(&app, Method::POST, "/api/v1/views", Some(json!({ "uri": uri }))).await;
    assert_eq!(status, StatusCode::CREATED);

    let query = "/api/v1/detections?uri=synthetic%3A%2F%2Fgate2%3Finterval_ms%3D1";
    let mut latest = Value::Null;
    for _ in 0..200 {
        let (status, body) = send(&app, Method::GET, query, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["uri"], uri);
        latest = body["latest"].clone();
        if latest["results"].as_u64().unwrap_or(0) >= 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(latest["results"].as_u64().unwrap_or(0) >= 3, "latest: {latest}");
    assert_eq!(latest["errors"], 0);
    let plates = latest["plates"].as_array().unwrap();
    assert_eq!(plates.len(), 1);
    assert!(plates[0]["confidence"].as_f64().unwrap() > 0.5);
}

#[tokio::test]
async fn metrics_require_a_recorder() {
    let dir = tempfile::tempdir().unwrap();
    let (app, _) = app(dir.path());

    let (status, body) = send(&app, Method::GET, "/metrics", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], 404);
}
