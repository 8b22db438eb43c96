use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::modules::config::LoggingConfig;

/// 初始化日志系统：控制台 + 按天滚动的文件日志
///
/// 返回的 guard 必须在进程生命周期内保持存活，否则文件日志会丢失尾部内容。
pub fn init_logger(config: &LoggingConfig, log_dir: Option<&Path>) -> Option<WorkerGuard> {
    // 桥接 `log` crate 的记录（reqwest/hyper 内部使用）
    let _ = tracing_log::LogTracer::init();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.clone()));

    let console_layer = fmt::layer().with_target(false);

    let (file_layer, guard) = match log_dir.filter(|_| config.file_enabled) {
        Some(dir) => {
            if let Err(e) = std::fs::create_dir_all(dir) {
                eprintln!("Failed to create log dir {:?}: {}", dir, e);
                (None, None)
            } else {
                let appender = tracing_appender::rolling::daily(dir, "sora_relay.log");
                let (non_blocking, guard) = tracing_appender::non_blocking(appender);
                let layer = fmt::layer().with_ansi(false).with_writer(non_blocking);
                (Some(layer), Some(guard))
            }
        }
        None => (None, None),
    };

    let result = tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init();

    if let Err(e) = result {
        eprintln!("Logger already initialized: {}", e);
    }

    guard
}

pub fn log_info(message: &str) {
    tracing::info!("{}", message);
}

pub fn log_error(message: &str) {
    tracing::error!("{}", message);
}
