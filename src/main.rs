use anyhow::Context;
use std::sync::Arc;
use tracing::{error, info, warn};

use sora_relay_lib::modules::{config, logger};
use sora_relay_lib::proxy::{start_server, AppState, Dispatcher};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = config::load_app_config()
        .map_err(anyhow::Error::msg)
        .context("Failed to load config")?;

    let log_dir = config::get_data_dir().ok().map(|dir| dir.join("logs"));
    // 保持 guard 存活到进程结束
    let _log_guard = logger::init_logger(&config.logging, log_dir.as_deref());

    info!("Starting sora_relay v{}...", env!("CARGO_PKG_VERSION"));

    if config.tokens.csv_url.trim().is_empty() && config.tokens.static_tokens.is_empty() {
        warn!("No token source configured; every dispatch will fail with \"No tokens available\"");
    }
    if config.captcha.api_key.trim().is_empty() {
        warn!("captcha.api_key is empty; captcha challenges cannot be solved");
    }

    let dispatcher = Dispatcher::from_config(&config)
        .map_err(anyhow::Error::msg)
        .context("Failed to build dispatcher")?;
    let dispatcher = Arc::new(dispatcher);

    // 预热 token 缓存，失败不影响启动
    let count = dispatcher.tokens().refresh().await;
    info!("Token pool warmed up with {} token(s)", count);

    let state = AppState::new(dispatcher, &config);
    let batch = state.batch.clone();

    let shutdown = async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for ctrl_c: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Shutdown signal received");
        batch.stop();
    };

    if let Err(e) = start_server(&config, state, shutdown).await {
        logger::log_error(&format!("[Server] 服务器启动失败: {}", e));
        return Err(anyhow::Error::msg(e));
    }

    Ok(())
}
