use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// 默认监听端口
pub const DEFAULT_PORT: u16 = 8787;

// ============================================================================
// 辅助工具函数
// ============================================================================

/// 数据目录: `~/.sora_relay`，不存在时自动创建
pub fn get_data_dir() -> Result<PathBuf, String> {
    let home = dirs::home_dir().ok_or("Failed to resolve home directory")?;
    let data_dir = home.join(".sora_relay");
    if !data_dir.exists() {
        std::fs::create_dir_all(&data_dir)
            .map_err(|e| format!("Failed to create data dir: {}", e))?;
    }
    Ok(data_dir)
}

/// 配置文件路径，`SORA_RELAY_CONFIG` 优先
pub fn get_config_path() -> Result<PathBuf, String> {
    if let Ok(path) = std::env::var("SORA_RELAY_CONFIG") {
        if !path.trim().is_empty() {
            return Ok(PathBuf::from(path));
        }
    }
    Ok(get_data_dir()?.join("config.json"))
}

// ============================================================================
// Settings
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub tokens: TokenSourceConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub captcha: CaptchaConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Required for `/reset-scheduler` and `/admin/*` when non-empty.
    #[serde(default)]
    pub admin_key: String,
    #[serde(default = "default_true")]
    pub access_log_enabled: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: DEFAULT_PORT,
            admin_key: String::new(),
            access_log_enabled: true,
        }
    }
}

impl ServerConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenSourceConfig {
    /// Published CSV sheet; first column of every row is a bearer token.
    #[serde(default)]
    pub csv_url: String,
    #[serde(default = "default_token_cache_ttl")]
    pub cache_ttl_secs: u64,
    #[serde(default = "default_sheet_timeout")]
    pub fetch_timeout_secs: u64,
    /// Used as the pool when `csv_url` is empty.
    #[serde(default)]
    pub static_tokens: Vec<String>,
}

impl Default for TokenSourceConfig {
    fn default() -> Self {
        Self {
            csv_url: String::new(),
            cache_ttl_secs: default_token_cache_ttl(),
            fetch_timeout_secs: default_sheet_timeout(),
            static_tokens: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_upstream_base_url")]
    pub base_url: String,
    #[serde(default = "default_generate_path")]
    pub generate_path: String,
    /// `{id}` is replaced with the job id.
    #[serde(default = "default_status_path")]
    pub status_path: String,
    #[serde(default = "default_attempt_timeout")]
    pub attempt_timeout_secs: u64,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency_per_token: usize,
    /// Optional outbound proxy (http://, https://, socks5://)
    #[serde(default)]
    pub proxy_url: String,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: default_upstream_base_url(),
            generate_path: default_generate_path(),
            status_path: default_status_path(),
            attempt_timeout_secs: default_attempt_timeout(),
            max_concurrency_per_token: default_max_concurrency(),
            proxy_url: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptchaConfig {
    /// Solver service key; HTTP solving is skipped when empty.
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_captcha_submit_url")]
    pub submit_url: String,
    #[serde(default = "default_captcha_result_url")]
    pub result_url: String,
    #[serde(default = "default_captcha_method")]
    pub method: String,
    #[serde(default)]
    pub site_key: String,
    #[serde(default)]
    pub page_url: String,
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub data: Option<String>,
    #[serde(default)]
    pub page_data: Option<String>,
    #[serde(default = "default_captcha_poll_interval")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_captcha_max_polls")]
    pub max_polls: u32,
    /// Header carrying the solved challenge token on the retried request.
    #[serde(default = "default_captcha_token_header")]
    pub token_header: String,
}

impl Default for CaptchaConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            submit_url: default_captcha_submit_url(),
            result_url: default_captcha_result_url(),
            method: default_captcha_method(),
            site_key: String::new(),
            page_url: String::new(),
            action: None,
            data: None,
            page_data: None,
            poll_interval_ms: default_captcha_poll_interval(),
            max_polls: default_captcha_max_polls(),
            token_header: default_captcha_token_header(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    #[serde(default = "default_batch_poll_interval")]
    pub status_poll_interval_ms: u64,
    #[serde(default = "default_batch_max_polls")]
    pub max_status_polls: u32,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            status_poll_interval_ms: default_batch_poll_interval(),
            max_status_polls: default_batch_max_polls(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// EnvFilter directive used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_true")]
    pub file_enabled: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file_enabled: true,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_token_cache_ttl() -> u64 {
    15
}

fn default_sheet_timeout() -> u64 {
    10
}

fn default_upstream_base_url() -> String {
    "https://sora.chatgpt.com/backend".to_string()
}

fn default_generate_path() -> String {
    "/video/generate".to_string()
}

fn default_status_path() -> String {
    "/video/history/{id}".to_string()
}

fn default_attempt_timeout() -> u64 {
    20
}

fn default_max_concurrency() -> usize {
    2
}

fn default_captcha_submit_url() -> String {
    "https://2captcha.com/in.php".to_string()
}

fn default_captcha_result_url() -> String {
    "https://2captcha.com/res.php".to_string()
}

fn default_captcha_method() -> String {
    "turnstile".to_string()
}

fn default_captcha_poll_interval() -> u64 {
    5_000
}

fn default_captcha_max_polls() -> u32 {
    24
}

fn default_captcha_token_header() -> String {
    "openai-sentinel-turnstile-token".to_string()
}

fn default_batch_poll_interval() -> u64 {
    10_000
}

fn default_batch_max_polls() -> u32 {
    120
}

fn default_log_level() -> String {
    "info".to_string()
}

// ============================================================================
// Load
// ============================================================================

/// 加载配置文件，文件不存在时使用默认值，然后应用环境变量覆盖
pub fn load_app_config() -> Result<AppConfig, String> {
    let path = get_config_path()?;
    let mut config = load_from_path(&path)?;
    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    Ok(config)
}

pub fn load_from_path(path: &std::path::Path) -> Result<AppConfig, String> {
    if !path.exists() {
        tracing::info!("[Config] {:?} not found, using defaults", path);
        return Ok(AppConfig::default());
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config file: {}", e))?;

    serde_json::from_str(&content).map_err(|e| format!("Failed to parse config: {}", e))
}

/// 环境变量覆盖。`lookup` 便于测试注入。
pub fn apply_env_overrides<F>(config: &mut AppConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

    if let Some(host) = non_empty("SORA_RELAY_HOST") {
        config.server.host = host;
    }
    if let Some(port) = non_empty("SORA_RELAY_PORT") {
        match port.trim().parse::<u16>() {
            Ok(p) => config.server.port = p,
            Err(_) => tracing::warn!("Invalid SORA_RELAY_PORT: {}, ignoring", port),
        }
    }
    if let Some(url) = non_empty("SORA_RELAY_TOKEN_CSV_URL") {
        config.tokens.csv_url = url;
    }
    if let Some(key) = non_empty("SORA_RELAY_ADMIN_KEY") {
        tracing::info!("Using admin key from environment variable");
        config.server.admin_key = key;
    }
    if let Some(url) = non_empty("SORA_RELAY_UPSTREAM_URL") {
        config.upstream.base_url = url;
    }
    if let Some(key) = non_empty("CAPTCHA_API_KEY") {
        config.captcha.api_key = key;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn empty_json_yields_defaults() {
        let config: AppConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.server.port, DEFAULT_PORT);
        assert_eq!(config.tokens.cache_ttl_secs, 15);
        assert_eq!(config.upstream.attempt_timeout_secs, 20);
        assert_eq!(config.upstream.max_concurrency_per_token, 2);
        assert_eq!(config.captcha.poll_interval_ms, 5_000);
        assert_eq!(config.captcha.max_polls, 24);
        assert!(config.server.access_log_enabled);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config: AppConfig = serde_json::from_str(
            r#"{"upstream":{"base_url":"http://127.0.0.1:9000"},"tokens":{"static_tokens":["a"]}}"#,
        )
        .unwrap();
        assert_eq!(config.upstream.base_url, "http://127.0.0.1:9000");
        assert_eq!(config.upstream.generate_path, "/video/generate");
        assert_eq!(config.tokens.static_tokens, vec!["a".to_string()]);
    }

    #[test]
    fn env_overrides_apply_and_ignore_garbage() {
        let env: HashMap<&str, &str> = [
            ("SORA_RELAY_PORT", "not-a-port"),
            ("SORA_RELAY_ADMIN_KEY", "sk-admin"),
            ("SORA_RELAY_TOKEN_CSV_URL", "https://sheet.example/csv"),
            ("CAPTCHA_API_KEY", "   "),
        ]
        .into_iter()
        .collect();

        let mut config = AppConfig::default();
        apply_env_overrides(&mut config, |k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.server.port, DEFAULT_PORT);
        assert_eq!(config.server.admin_key, "sk-admin");
        assert_eq!(config.tokens.csv_url, "https://sheet.example/csv");
        assert!(config.captcha.api_key.is_empty());
    }

    #[test]
    fn missing_file_loads_defaults() {
        let path = std::env::temp_dir().join(format!("sora-relay-missing-{}.json", uuid::Uuid::new_v4()));
        let config = load_from_path(&path).unwrap();
        assert_eq!(config.server.host, "127.0.0.1");
    }
}
