use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::proxy::errors::relay_error;
use crate::proxy::server::AppState;

#[derive(Debug, Deserialize)]
pub struct BatchRequest {
    #[serde(default)]
    pub prompts: Vec<String>,
    #[serde(default)]
    pub params: Map<String, Value>,
}

/// POST /batch
pub async fn enqueue(State(state): State<AppState>, Json(payload): Json<BatchRequest>) -> Response {
    let ids = state.batch.enqueue(payload.prompts, payload.params);
    if ids.is_empty() {
        return relay_error(StatusCode::BAD_REQUEST, "prompts is required");
    }
    (
        StatusCode::ACCEPTED,
        Json(json!({ "success": true, "ids": ids })),
    )
        .into_response()
}

/// GET /batch
pub async fn list(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "running": state.batch.is_running(),
        "items": state.batch.items(),
    }))
}

/// POST /batch/stop
pub async fn stop(State(state): State<AppState>) -> impl IntoResponse {
    let cancelled = state.batch.stop();
    Json(json!({ "success": true, "cancelled": cancelled }))
}
