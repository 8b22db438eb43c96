use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::RwLock;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::modules::config::AppConfig;
use crate::modules::logger;
use crate::proxy::batch::BatchQueue;
use crate::proxy::dispatcher::Dispatcher;
use crate::proxy::generation::GenerationService;
use crate::proxy::handlers;
use crate::proxy::middleware::{access_log_middleware, admin_auth_middleware, AdminSecurity};

// 参考图/视频上传上限
const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

/// 服务器状态
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub generation: Arc<GenerationService>,
    pub batch: Arc<BatchQueue>,
    pub access_log_enabled: Arc<RwLock<bool>>,
    pub admin: Arc<RwLock<AdminSecurity>>,
}

impl AppState {
    pub fn new(dispatcher: Arc<Dispatcher>, config: &AppConfig) -> Self {
        let generation = Arc::new(GenerationService::new(dispatcher.clone(), &config.upstream));
        let batch = Arc::new(BatchQueue::new(generation.clone(), &config.batch));
        Self {
            dispatcher,
            generation,
            batch,
            access_log_enabled: Arc::new(RwLock::new(config.server.access_log_enabled)),
            admin: Arc::new(RwLock::new(AdminSecurity::new(config.server.admin_key.clone()))),
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    // CORS 配置 - 浏览器前端直接调用
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let admin = Router::new()
        .route("/reset-scheduler", post(handlers::admin::reset_scheduler))
        .route("/admin/scheduler", get(handlers::admin::scheduler_snapshot))
        .route("/admin/refresh-tokens", post(handlers::admin::refresh_tokens))
        .route(
            "/admin/captcha-overrides",
            get(handlers::admin::get_captcha_overrides).post(handlers::admin::set_captcha_overrides),
        )
        .route_layer(axum::middleware::from_fn_with_state(
            state.admin.clone(),
            admin_auth_middleware,
        ));

    Router::new()
        .route("/health", get(handlers::health))
        .route("/generate", post(handlers::generate::generate))
        .route("/check-status", get(handlers::generate::check_status))
        .route("/batch", get(handlers::batch::list).post(handlers::batch::enqueue))
        .route("/batch/stop", post(handlers::batch::stop))
        .merge(admin)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(axum::middleware::from_fn_with_state(
            state.access_log_enabled.clone(),
            access_log_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// 启动 HTTP 服务器，直到 `shutdown` 完成
pub async fn start_server(
    config: &AppConfig,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), String> {
    let app = build_router(state);
    let addr = config.server.bind_address();

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| format!("绑定端口失败 {}: {}", addr, e))?;
    logger::log_info(&format!("[Server] 启动服务器: http://{}", addr));

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| format!("服务器运行失败: {}", e))?;

    logger::log_info("[Server] 服务器已停止");
    Ok(())
}
