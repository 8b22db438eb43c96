use bytes::Bytes;
use reqwest::header::{HeaderValue, AUTHORIZATION, USER_AGENT};
use reqwest::Method;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::time::Duration;

use crate::modules::config::{AppConfig, UpstreamConfig};
use crate::proxy::bearer::bearer_header_value;
use crate::proxy::captcha::{CaptchaSolver, SolvedCaptcha};
use crate::proxy::errors::summarize_for_log;
use crate::proxy::job_registry::JobRegistry;
use crate::proxy::load_tracker::LoadTracker;
use crate::proxy::mappers::error_classifier::{
    classify_response, classify_transport, describe_transport_error, extract_upstream_error, Verdict,
};
use crate::proxy::privacy::slot_label;
use crate::proxy::token_source::TokenSource;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("No tokens available")]
    NoTokensAvailable,
    #[error("All tokens failed or quota exhausted")]
    AllTokensExhausted { last_error: Option<String> },
    #[error("Token slot #{index} attempt failed: {reason}")]
    TokenAttemptFailed { index: usize, reason: String },
    /// Upstream refused the job itself; not retried on other tokens.
    #[error("{message}")]
    Rejected {
        index: usize,
        status: u16,
        message: String,
    },
}

/// Why one attempt produced nothing usable.
#[derive(Debug)]
enum AttemptFailure {
    /// Move on to the next token.
    Soft(String),
    Rejected { status: u16, message: String },
}

impl AttemptFailure {
    fn rejected(status: u16, body: &Value) -> Self {
        AttemptFailure::Rejected {
            status,
            message: extract_upstream_error(body)
                .describe()
                .unwrap_or_else(|| format!("Upstream rejected the request (HTTP {})", status)),
        }
    }

    fn into_dispatch_error(self, index: usize) -> DispatchError {
        match self {
            AttemptFailure::Soft(reason) => DispatchError::TokenAttemptFailed { index, reason },
            AttemptFailure::Rejected { status, message } => DispatchError::Rejected {
                index,
                status,
                message,
            },
        }
    }
}

#[derive(Debug, Clone)]
pub enum FormValue {
    Text(String),
    File {
        bytes: Bytes,
        filename: String,
        mime: Option<String>,
    },
}

#[derive(Debug, Clone)]
pub struct FormPart {
    pub name: String,
    pub value: FormValue,
}

/// Multipart parts are kept as data so every attempt can rebuild the form.
#[derive(Debug, Clone)]
pub enum RequestBody {
    Empty,
    Json(Value),
    Multipart(Vec<FormPart>),
}

/// Description of one upstream call, replayable against any token.
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub method: Method,
    /// Relative to the upstream base url, or absolute.
    pub path: String,
    pub body: RequestBody,
}

impl UpstreamRequest {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            path: path.into(),
            body: RequestBody::Empty,
        }
    }

    pub fn post_json(path: impl Into<String>, body: Value) -> Self {
        Self {
            method: Method::POST,
            path: path.into(),
            body: RequestBody::Json(body),
        }
    }

    pub fn post_multipart(path: impl Into<String>, parts: Vec<FormPart>) -> Self {
        Self {
            method: Method::POST,
            path: path.into(),
            body: RequestBody::Multipart(parts),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Dispatched {
    pub token_index: usize,
    pub status: u16,
    pub body: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerSnapshot {
    pub pool_size: usize,
    pub cursor: usize,
    pub limit: usize,
    pub load: Vec<usize>,
    pub tracked_jobs: usize,
}

pub fn join_base_url(base: &str, path: &str) -> String {
    if path.starts_with("http://") || path.starts_with("https://") {
        return path.to_string();
    }
    let base = base.trim_end_matches('/');
    let path = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    };
    format!("{}{}", base, path)
}

pub fn build_client(upstream: &UpstreamConfig) -> Result<reqwest::Client, String> {
    let mut builder = reqwest::Client::builder().connect_timeout(Duration::from_secs(10));

    if !upstream.proxy_url.trim().is_empty() {
        let proxy = reqwest::Proxy::all(upstream.proxy_url.trim())
            .map_err(|e| format!("Invalid upstream proxy url: {}", e))?;
        builder = builder.proxy(proxy);
    }

    builder
        .tcp_nodelay(true)
        .build()
        .map_err(|e| format!("Failed to build HTTP client: {}", e))
}

/// Token-rotating, concurrency-limited dispatcher. One instance per process.
pub struct Dispatcher {
    http: reqwest::Client,
    base_url: String,
    attempt_timeout: Duration,
    tokens: TokenSource,
    load: Arc<LoadTracker>,
    jobs: JobRegistry,
    captcha: CaptchaSolver,
    /// Index of the last token that succeeded.
    cursor: AtomicUsize,
}

impl Dispatcher {
    pub fn new(
        http: reqwest::Client,
        upstream: &UpstreamConfig,
        tokens: TokenSource,
        captcha: CaptchaSolver,
    ) -> Self {
        let load = Arc::new(LoadTracker::new(upstream.max_concurrency_per_token));
        Self {
            http,
            base_url: upstream.base_url.clone(),
            attempt_timeout: Duration::from_secs(upstream.attempt_timeout_secs.max(1)),
            tokens,
            jobs: JobRegistry::new(load.clone()),
            load,
            captcha,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn from_config(config: &AppConfig) -> Result<Self, String> {
        let http = build_client(&config.upstream)?;
        let tokens = TokenSource::new(http.clone(), &config.tokens);
        let captcha = CaptchaSolver::new(http.clone(), config.captcha.clone());
        Ok(Self::new(http, &config.upstream, tokens, captcha))
    }

    /// Shorter per-attempt timeout, mainly for tests.
    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    pub fn tokens(&self) -> &TokenSource {
        &self.tokens
    }

    pub fn load(&self) -> &LoadTracker {
        &self.load
    }

    pub fn jobs(&self) -> &JobRegistry {
        &self.jobs
    }

    pub fn captcha(&self) -> &CaptchaSolver {
        &self.captcha
    }

    pub fn cursor(&self) -> usize {
        self.cursor.load(Ordering::SeqCst)
    }

    /// Least-loaded slot scanning from the cursor, `None` on an empty pool.
    pub async fn pick_start_index(&self) -> Option<usize> {
        let n = self.tokens.get_tokens(false).await.len();
        if n == 0 {
            return None;
        }
        self.load.ensure_counts(n);
        self.load.auto_reset(n, self.jobs.is_empty());
        Some(self.load.pick_index_by_load(n, self.cursor()))
    }

    /// Run `request` through the pool, starting at `start_index` or the cursor.
    pub async fn dispatch(
        &self,
        request: &UpstreamRequest,
        start_index: Option<usize>,
    ) -> Result<Dispatched, DispatchError> {
        let tokens = self.tokens.get_tokens(false).await;
        if tokens.is_empty() {
            tracing::error!("[Dispatcher] Token pool is empty");
            return Err(DispatchError::NoTokensAvailable);
        }

        let n = tokens.len();
        self.load.ensure_counts(n);
        self.load.auto_reset(n, self.jobs.is_empty());

        let start = start_index.unwrap_or_else(|| self.cursor()) % n;
        let mut attempted_any = false;
        let mut last_error: Option<String> = None;

        for offset in 0..n {
            let idx = (start + offset) % n;
            if self.load.is_saturated(idx) {
                tracing::debug!(
                    "[Dispatcher] {} saturated (limit {}), skipping",
                    slot_label(idx, &tokens[idx]),
                    self.load.limit()
                );
                continue;
            }

            attempted_any = true;
            match self.attempt(request, idx, &tokens[idx]).await {
                Ok(dispatched) => {
                    self.cursor.store(idx, Ordering::SeqCst);
                    tracing::info!(
                        "[Dispatcher] {} {} succeeded via {}",
                        request.method,
                        request.path,
                        slot_label(idx, &tokens[idx])
                    );
                    return Ok(dispatched);
                }
                Err(AttemptFailure::Soft(reason)) => last_error = Some(reason),
                Err(rejected) => {
                    tracing::warn!(
                        "[Dispatcher] {} {} rejected by upstream via {}, not rotating",
                        request.method,
                        request.path,
                        slot_label(idx, &tokens[idx])
                    );
                    return Err(rejected.into_dispatch_error(idx));
                }
            }
        }

        // 全部因饱和被跳过：计数器可能已与实际不同步，强制清零后用首个 token 再试一次
        if !attempted_any {
            tracing::warn!(
                "[Dispatcher] All {} slot(s) saturated, force-resetting counters and retrying with slot #0",
                n
            );
            self.load.reset_all();
            match self.attempt(request, 0, &tokens[0]).await {
                Ok(dispatched) => {
                    self.cursor.store(0, Ordering::SeqCst);
                    return Ok(dispatched);
                }
                Err(AttemptFailure::Soft(reason)) => last_error = Some(reason),
                Err(rejected) => return Err(rejected.into_dispatch_error(0)),
            }
        }

        tracing::error!(
            "[Dispatcher] {} {} exhausted all {} token(s), last error: {}",
            request.method,
            request.path,
            n,
            last_error.as_deref().unwrap_or("<none>")
        );
        Err(DispatchError::AllTokensExhausted { last_error })
    }

    /// Single attempt with the token at `index`; no rotation, cursor untouched.
    pub async fn dispatch_with_token(
        &self,
        request: &UpstreamRequest,
        index: usize,
    ) -> Result<Dispatched, DispatchError> {
        let tokens = self.tokens.get_tokens(false).await;
        if tokens.is_empty() {
            return Err(DispatchError::NoTokensAvailable);
        }
        let Some(token) = tokens.get(index) else {
            return Err(DispatchError::TokenAttemptFailed {
                index,
                reason: format!("slot no longer in pool of {}", tokens.len()),
            });
        };
        self.attempt(request, index, token)
            .await
            .map_err(|failure| failure.into_dispatch_error(index))
    }

    /// Zero every counter and forget every tracked job.
    pub fn reset_scheduler(&self) {
        self.load.reset_all();
        self.jobs.clear();
        tracing::warn!("[Dispatcher] Scheduler reset: counters zeroed, job registry cleared");
    }

    pub async fn snapshot(&self) -> SchedulerSnapshot {
        let pool_size = self.tokens.get_tokens(false).await.len();
        SchedulerSnapshot {
            pool_size,
            cursor: self.cursor(),
            limit: self.load.limit(),
            load: self.load.snapshot(),
            tracked_jobs: self.jobs.len(),
        }
    }

    /// One classified attempt (plus at most one captcha retry) with one token.
    async fn attempt(
        &self,
        request: &UpstreamRequest,
        index: usize,
        token: &str,
    ) -> Result<Dispatched, AttemptFailure> {
        let label = slot_label(index, token);
        let auth = bearer_header_value(token).map_err(|e| {
            tracing::warn!("[Dispatcher] {} unusable: {}", label, e);
            AttemptFailure::Soft(e)
        })?;

        let (status, body) = match self.send_once(request, &auth, None).await {
            Ok(r) => r,
            Err(e) => {
                let verdict = classify_transport(&e);
                tracing::warn!(
                    "[Dispatcher] {} {} ({}), trying next token",
                    label,
                    describe_transport_error(&e),
                    verdict.as_str()
                );
                return Err(AttemptFailure::Soft(format!(
                    "{}: {}",
                    verdict.as_str(),
                    describe_transport_error(&e)
                )));
            }
        };

        match classify_response(status, &body) {
            Verdict::Ok => Ok(Dispatched {
                token_index: index,
                status,
                body,
            }),
            Verdict::CaptchaRequired => {
                tracing::info!("[Dispatcher] {} requires captcha, solving", label);
                self.retry_with_captcha(request, index, &auth, &label).await
            }
            Verdict::Rejected => {
                tracing::warn!(
                    "[Dispatcher] {} HTTP {} rejected: {}",
                    label,
                    status,
                    summarize_for_log(&body.to_string())
                );
                Err(AttemptFailure::rejected(status, &body))
            }
            verdict => {
                tracing::warn!(
                    "[Dispatcher] {} HTTP {} -> {}: {}",
                    label,
                    status,
                    verdict.as_str(),
                    summarize_for_log(&body.to_string())
                );
                Err(AttemptFailure::Soft(format!("{} (HTTP {})", verdict.as_str(), status)))
            }
        }
    }

    async fn retry_with_captcha(
        &self,
        request: &UpstreamRequest,
        index: usize,
        auth: &HeaderValue,
        label: &str,
    ) -> Result<Dispatched, AttemptFailure> {
        let Some(solved) = self.captcha.solve(None).await else {
            tracing::warn!("[Dispatcher] {} captcha unsolved, trying next token", label);
            return Err(AttemptFailure::Soft("captcha_unsolved".to_string()));
        };

        match self.send_once(request, auth, Some(&solved)).await {
            Ok((status, body)) => match classify_response(status, &body) {
                Verdict::Ok => {
                    tracing::info!("[Dispatcher] {} succeeded after captcha", label);
                    Ok(Dispatched {
                        token_index: index,
                        status,
                        body,
                    })
                }
                Verdict::Rejected => Err(AttemptFailure::rejected(status, &body)),
                verdict => {
                    tracing::warn!(
                        "[Dispatcher] {} retry after captcha HTTP {} -> {}",
                        label,
                        status,
                        verdict.as_str()
                    );
                    Err(AttemptFailure::Soft(format!(
                        "captcha retry {} (HTTP {})",
                        verdict.as_str(),
                        status
                    )))
                }
            },
            Err(e) => {
                tracing::warn!(
                    "[Dispatcher] {} retry after captcha {}",
                    label,
                    describe_transport_error(&e)
                );
                Err(AttemptFailure::Soft(format!(
                    "captcha retry {}",
                    describe_transport_error(&e)
                )))
            }
        }
    }

    async fn send_once(
        &self,
        request: &UpstreamRequest,
        auth: &HeaderValue,
        solved: Option<&SolvedCaptcha>,
    ) -> Result<(u16, Value), reqwest::Error> {
        let url = join_base_url(&self.base_url, &request.path);
        let mut builder = self
            .http
            .request(request.method.clone(), &url)
            .timeout(self.attempt_timeout)
            .header(AUTHORIZATION, auth.clone());

        if let Some(solved) = solved {
            builder = builder.header(self.captcha.token_header(), solved.token.as_str());
            if let Some(ua) = &solved.user_agent {
                builder = builder.header(USER_AGENT, ua.as_str());
            }
        }

        builder = match &request.body {
            RequestBody::Empty => builder,
            RequestBody::Json(v) => builder.json(v),
            RequestBody::Multipart(parts) => builder.multipart(build_form(parts)?),
        };

        let resp = builder.send().await?;
        let status = resp.status().as_u16();
        let text = resp.text().await?;
        let body = match serde_json::from_str::<Value>(&text) {
            Ok(v) => v,
            Err(_) => Value::String(text),
        };
        Ok((status, body))
    }
}

fn build_form(parts: &[FormPart]) -> Result<reqwest::multipart::Form, reqwest::Error> {
    let mut form = reqwest::multipart::Form::new();
    for part in parts {
        form = match &part.value {
            FormValue::Text(text) => form.text(part.name.clone(), text.clone()),
            FormValue::File {
                bytes,
                filename,
                mime,
            } => {
                let mut file = reqwest::multipart::Part::bytes(bytes.to_vec()).file_name(filename.clone());
                if let Some(mime) = mime {
                    file = file.mime_str(mime)?;
                }
                form.part(part.name.clone(), file)
            }
        };
    }
    Ok(form)
}
