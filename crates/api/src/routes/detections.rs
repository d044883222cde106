//! Detection result routes

use axum::{
    extract::{Query, State},
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use stream_orchestrator::{SessionStats, StreamState};

use crate::error::ApiError;
use crate::store::StreamDetections;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct DetectionQuery {
    pub uri: String,
}

#[derive(Debug, Serialize)]
pub struct DetectionResponse {
    pub uri: String,
    /// `None` once the view was removed
    pub state: Option<StreamState>,
    pub session: Option<SessionStats>,
    pub latest: Option<StreamDetections>,
}

/// Latest detections and counters of one stream
pub async fn get_detections(
    State(state): State<Arc<AppState>>,
    Query(params): Query<DetectionQuery>,
) -> Result<Json<DetectionResponse>, ApiError> {
    let uri = params.uri.trim().to_string();
    let session_state = state.orchestrator.session_state(&uri);
    let latest = state.store.get(&uri);
    if session_state.is_none() && latest.is_none() {
        return Err(ApiError::not_found(format!("no stream {uri}")));
    }

    Ok(Json(DetectionResponse {
        session: state.orchestrator.session_stats(&uri),
        state: session_state,
        latest,
        uri,
    }))
}
