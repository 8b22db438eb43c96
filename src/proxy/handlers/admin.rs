// 管理接口：调度器重置/快照、刷新 token、验证码参数覆盖
use axum::{extract::State, response::IntoResponse, Json};
use serde_json::json;

use crate::proxy::captcha::CaptchaOverrides;
use crate::proxy::server::AppState;

/// POST /reset-scheduler
pub async fn reset_scheduler(State(state): State<AppState>) -> impl IntoResponse {
    state.dispatcher.reset_scheduler();
    Json(json!({ "success": true }))
}

/// GET /admin/scheduler
pub async fn scheduler_snapshot(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.dispatcher.snapshot().await)
}

/// POST /admin/refresh-tokens - 跳过 TTL 立即重新拉取
pub async fn refresh_tokens(State(state): State<AppState>) -> impl IntoResponse {
    let count = state.dispatcher.tokens().refresh().await;
    Json(json!({ "success": true, "count": count }))
}

/// GET /admin/captcha-overrides
pub async fn get_captcha_overrides(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.dispatcher.captcha().overrides().await)
}

/// POST /admin/captcha-overrides
pub async fn set_captcha_overrides(
    State(state): State<AppState>,
    Json(overrides): Json<CaptchaOverrides>,
) -> impl IntoResponse {
    state.dispatcher.captcha().set_overrides(overrides.clone()).await;
    tracing::info!("[Admin] Captcha overrides updated");
    Json(json!({ "success": true, "overrides": overrides }))
}
