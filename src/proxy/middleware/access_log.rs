use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

// 只记录 path，不记录 query（check-status 的 uuid 等不进访问日志）
pub async fn access_log_middleware(
    State(enabled): State<Arc<RwLock<bool>>>,
    request: Request,
    next: Next,
) -> Response {
    let enabled = { *enabled.read().await };
    if !enabled {
        return next.run(request).await;
    }

    let start = Instant::now();
    let method = request.method().to_string();
    let path = request.uri().path().to_string();

    let response = next.run(request).await;
    let status = response.status().as_u16();
    let duration_ms = start.elapsed().as_millis() as u64;

    if response.status().is_server_error() {
        tracing::warn!("[Access] {} {} {} {}ms", method, path, status, duration_ms);
    } else {
        tracing::info!("[Access] {} {} {} {}ms", method, path, status, duration_ms);
    }
    response
}
