// Handlers 模块 - HTTP 接口处理

pub mod admin;
pub mod batch;
pub mod generate;

use axum::{response::IntoResponse, Json};
use serde::Serialize;

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

/// GET /health - 健康检查
pub async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}
