use std::borrow::Cow;
use std::collections::HashSet;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use crate::modules::config::TokenSourceConfig;
use crate::proxy::bearer::normalize_token;
use crate::proxy::privacy::mask_token;

#[derive(Debug, Default)]
struct TokenCache {
    tokens: Vec<String>,
    fetched_at: Option<Instant>,
}

impl TokenCache {
    fn is_fresh(&self, ttl: Duration) -> bool {
        !self.tokens.is_empty()
            && self
                .fetched_at
                .map(|at| at.elapsed() < ttl)
                .unwrap_or(false)
    }
}

/// Token pool backed by a published CSV sheet.
///
/// The sheet is re-read at most once per TTL. When a refresh fails the last
/// good pool is served (stale) so a flaky sheet host never takes the relay
/// down; an empty result means there has never been a good fetch.
pub struct TokenSource {
    http: reqwest::Client,
    csv_url: String,
    ttl: Duration,
    fetch_timeout: Duration,
    static_tokens: Vec<String>,
    cache: RwLock<TokenCache>,
}

impl TokenSource {
    pub fn new(http: reqwest::Client, config: &TokenSourceConfig) -> Self {
        Self {
            http,
            csv_url: config.csv_url.trim().to_string(),
            ttl: Duration::from_secs(config.cache_ttl_secs),
            fetch_timeout: Duration::from_secs(config.fetch_timeout_secs.max(1)),
            static_tokens: dedupe_tokens(config.static_tokens.iter().map(|s| s.as_str())),
            cache: RwLock::new(TokenCache::default()),
        }
    }

    /// Current token pool in rotation order.
    pub async fn get_tokens(&self, force_refresh: bool) -> Vec<String> {
        if self.csv_url.is_empty() {
            return self.static_tokens.clone();
        }

        if !force_refresh {
            let cache = self.cache.read().await;
            if cache.is_fresh(self.ttl) {
                return cache.tokens.clone();
            }
        }

        match self.fetch_sheet().await {
            Ok(tokens) => {
                let mut cache = self.cache.write().await;
                if cache.tokens.len() != tokens.len() {
                    tracing::info!(
                        "[TokenSource] Pool size changed: {} -> {}",
                        cache.tokens.len(),
                        tokens.len()
                    );
                    tracing::debug!(
                        "[TokenSource] Pool: {:?}",
                        tokens.iter().map(|t| mask_token(t)).collect::<Vec<_>>()
                    );
                }
                cache.tokens = tokens.clone();
                cache.fetched_at = Some(Instant::now());
                tokens
            }
            Err(e) => {
                let cache = self.cache.read().await;
                if cache.tokens.is_empty() {
                    tracing::error!("[TokenSource] Sheet fetch failed and no cached tokens: {}", e);
                    Vec::new()
                } else {
                    tracing::warn!(
                        "[TokenSource] Sheet fetch failed, serving {} stale token(s): {}",
                        cache.tokens.len(),
                        e
                    );
                    cache.tokens.clone()
                }
            }
        }
    }

    /// Forced refresh; returns the resulting pool size.
    pub async fn refresh(&self) -> usize {
        self.get_tokens(true).await.len()
    }

    async fn fetch_sheet(&self) -> Result<Vec<String>, String> {
        let resp = self
            .http
            .get(&self.csv_url)
            .timeout(self.fetch_timeout)
            .send()
            .await
            .map_err(|e| format!("request failed: {}", e))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(format!("sheet returned HTTP {}", status.as_u16()));
        }

        let text = resp
            .text()
            .await
            .map_err(|e| format!("failed to read body: {}", e))?;

        Ok(parse_token_csv(&text))
    }
}

/// First column of every non-empty row, header row (`token` / `bearer`)
/// skipped, duplicates collapsed keeping first occurrence.
pub fn parse_token_csv(text: &str) -> Vec<String> {
    let cells = text
        .lines()
        .map(|line| line.trim())
        .filter(|line| !line.is_empty())
        .map(first_csv_field);

    dedupe_tokens(cells)
}

/// 每行第一个字段。引号字段可含逗号与 `""` 转义；跨行的引号字段不支持
fn first_csv_field(line: &str) -> Cow<'_, str> {
    let Some(rest) = line.strip_prefix('"') else {
        return Cow::Borrowed(line.split(',').next().unwrap_or_default());
    };

    let mut out = String::with_capacity(rest.len());
    let mut chars = rest.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '"' {
            out.push(c);
        } else if chars.peek() == Some(&'"') {
            chars.next();
            out.push('"');
        } else {
            break;
        }
    }
    Cow::Owned(out)
}

fn is_header_cell(cell: &str) -> bool {
    let c = cell.trim().trim_matches('"').trim().to_ascii_lowercase();
    c == "token" || c == "bearer"
}

fn dedupe_tokens<I, S>(cells: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for cell in cells {
        let cell = cell.as_ref();
        if is_header_cell(cell) {
            continue;
        }
        let token = normalize_token(cell);
        if token.is_empty() {
            continue;
        }
        if seen.insert(token.clone()) {
            out.push(token);
        }
    }
    out
}
