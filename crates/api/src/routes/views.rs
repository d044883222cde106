//! Stream view routes

use axum::{extract::State, http::StatusCode, Json};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use stream_orchestrator::StreamState;
use tracing::info;

use crate::error::ApiError;
use crate::AppState;

/// Body of view creation and removal requests
#[derive(Debug, Deserialize)]
pub struct ViewRequest {
    pub uri: String,
}

#[derive(Debug, Serialize)]
pub struct ViewResponse {
    pub uri: String,
    pub state: StreamState,
}

#[derive(Debug, Serialize)]
pub struct ViewList {
    pub uris: Vec<String>,
    pub count: usize,
}

fn requested_uri(request: &ViewRequest) -> Result<String, ApiError> {
    let uri = request.uri.trim();
    if uri.is_empty() {
        return Err(ApiError::bad_request("uri must not be empty"));
    }
    Ok(uri.to_string())
}

/// Running views
pub async fn list_views(State(state): State<Arc<AppState>>) -> Json<ViewList> {
    let uris = state.orchestrator.list_active_uris();
    Json(ViewList {
        count: uris.len(),
        uris,
    })
}

/// Start streaming a source. Responds once the source accepted or refused the connection.
pub async fn create_view(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ViewRequest>,
) -> Result<(StatusCode, Json<ViewResponse>), ApiError> {
    let uri = requested_uri(&request)?;

    let orchestrator = state.orchestrator.clone();
    let target = uri.clone();
    tokio::task::spawn_blocking(move || orchestrator.make_view(&target)).await??;

    info!("View created: {}", uri);
    let current = state
        .orchestrator
        .session_state(&uri)
        .unwrap_or(StreamState::Running);
    Ok((StatusCode::CREATED, Json(ViewResponse { uri, state: current })))
}

/// Stop a source and drop its collected detections
pub async fn delete_view(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ViewRequest>,
) -> Result<Json<ViewResponse>, ApiError> {
    let uri = requested_uri(&request)?;

    let orchestrator = state.orchestrator.clone();
    let target = uri.clone();
    tokio::task::spawn_blocking(move || orchestrator.stop_view(&target)).await??;
    state.store.remove(&uri);

    Ok(Json(ViewResponse {
        uri,
        state: StreamState::Stopped,
    }))
}
