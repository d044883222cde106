//! Traffic Inference Gateway
//!
//! HTTP control plane over the stream orchestrator: add and remove video
//! sources, read the latest plate detections and export Prometheus metrics.

use axum::{
    extract::State,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use detection::PlateDetector;
use inference_engine::EngineStats;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use stream_orchestrator::StreamOrchestrator;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod config;
pub mod error;
pub mod pipeline;
pub mod routes;
pub mod store;

use config::{AppConfig, LoggingConfig};
use error::ApiError;
use pipeline::Backend;
use store::DetectionStore;

pub type PlateOrchestrator = StreamOrchestrator<PlateDetector>;

/// Application state shared across handlers
pub struct AppState {
    pub orchestrator: Arc<PlateOrchestrator>,
    /// Latest detections per stream
    pub store: Arc<DetectionStore>,
    pub version: String,
    pub start_time: Instant,
    /// Renders `/metrics`; absent when no recorder is installed
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    /// Wire the detection store in as the orchestrator's result callback
    pub fn new(orchestrator: PlateOrchestrator, metrics: Option<PrometheusHandle>) -> Self {
        let store = Arc::new(DetectionStore::new());
        orchestrator.set_callback(store.callback());
        Self {
            orchestrator: Arc::new(orchestrator),
            store,
            version: env!("CARGO_PKG_VERSION").to_string(),
            start_time: Instant::now(),
            metrics,
        }
    }
}

/// Health response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub active_streams: usize,
    pub engines: Vec<EngineHealth>,
}

#[derive(Debug, Serialize)]
pub struct EngineHealth {
    pub name: String,
    pub device_id: usize,
    pub max_batch_size: usize,
    pub pending: usize,
    pub stats: EngineStats,
}

/// Create the application router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/v1/health", get(health_handler))
        .route(
            "/api/v1/views",
            get(routes::views::list_views)
                .post(routes::views::create_view)
                .delete(routes::views::delete_view),
        )
        .route("/api/v1/detections", get(routes::detections::get_detections))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check handler
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let engines = state
        .orchestrator
        .engines()
        .iter()
        .map(|engine| EngineHealth {
            name: engine.name().to_string(),
            device_id: engine.device_id(),
            max_batch_size: engine.max_batch_size(),
            pending: engine.pending(),
            stats: engine.stats(),
        })
        .collect();

    Json(HealthResponse {
        status: "healthy".to_string(),
        version: state.version.clone(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        active_streams: state.orchestrator.list_active_uris().len(),
        engines,
    })
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> Result<String, ApiError> {
    state
        .metrics
        .as_ref()
        .map(|handle| handle.render())
        .ok_or_else(|| ApiError::not_found("metrics recorder not installed"))
}

/// Initialize logging. `RUST_LOG` takes precedence over the configured level.
pub fn init_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.level));
    let registry = tracing_subscriber::registry().with(filter);

    // Already initialized (tests, repeated calls) is fine
    let _ = if config.json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .try_init()
    };
}

/// Compile/load the engines, then serve the API until Ctrl-C
pub async fn run_server(config: AppConfig) -> anyhow::Result<()> {
    let metrics = PrometheusBuilder::new().install_recorder()?;

    let addr = config.server.addr();
    let orchestrator = tokio::task::spawn_blocking(move || {
        let backend = Backend::from_settings(&config.engine);
        pipeline::build_orchestrator(&config, &backend)
    })
    .await??;

    let state = Arc::new(AppState::new(orchestrator, Some(metrics)));
    let app = create_router(state.clone());

    info!("Starting API server on {}", addr);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown requested");
        })
        .await?;

    let orchestrator = state.orchestrator.clone();
    tokio::task::spawn_blocking(move || orchestrator.stop_all()).await?;
    info!("Gateway stopped");
    Ok(())
}
