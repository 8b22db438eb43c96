use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::Duration;

use crate::modules::config::CaptchaConfig;

const NOT_READY: &str = "CAPCHA_NOT_READY";

/// Runtime overrides merged over the static captcha config on every solve.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptchaOverrides {
    #[serde(default)]
    pub site_key: Option<String>,
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub data: Option<String>,
    #[serde(default)]
    pub page_data: Option<String>,
    #[serde(default)]
    pub target_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SolvedCaptcha {
    pub token: String,
    pub user_agent: Option<String>,
}

/// One set of challenge parameters submitted to a solver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeParams {
    pub site_key: String,
    pub page_url: String,
    pub action: Option<String>,
    pub data: Option<String>,
    pub page_data: Option<String>,
}

/// In-process solver tried after every HTTP candidate failed.
pub trait LocalSolver: Send + Sync {
    fn solve<'a>(&'a self, challenge: &'a ChallengeParams) -> BoxFuture<'a, Option<SolvedCaptcha>>;
}

pub struct CaptchaSolver {
    http: reqwest::Client,
    config: CaptchaConfig,
    overrides: RwLock<CaptchaOverrides>,
    local: Option<Arc<dyn LocalSolver>>,
}

fn non_empty(value: Option<&String>) -> Option<String> {
    value
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn origin_url(page_url: &str) -> Option<String> {
    let url = url::Url::parse(page_url).ok()?;
    if !url.origin().is_tuple() {
        return None;
    }
    Some(format!("{}/", url.origin().ascii_serialization()))
}

/// Primary candidate plus an origin-URL fallback, deduplicated.
pub fn build_candidates(
    config: &CaptchaConfig,
    overrides: &CaptchaOverrides,
    target_url: Option<&str>,
) -> Vec<ChallengeParams> {
    let site_key = non_empty(overrides.site_key.as_ref())
        .or_else(|| non_empty(Some(&config.site_key)));
    let page_url = target_url
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .or_else(|| non_empty(overrides.target_url.as_ref()))
        .or_else(|| non_empty(Some(&config.page_url)));

    let (Some(site_key), Some(page_url)) = (site_key, page_url) else {
        return Vec::new();
    };

    let primary = ChallengeParams {
        site_key,
        page_url: page_url.clone(),
        action: non_empty(overrides.action.as_ref()).or_else(|| non_empty(config.action.as_ref())),
        data: non_empty(overrides.data.as_ref()).or_else(|| non_empty(config.data.as_ref())),
        page_data: non_empty(overrides.page_data.as_ref())
            .or_else(|| non_empty(config.page_data.as_ref())),
    };

    let mut candidates = vec![primary.clone()];
    if let Some(origin) = origin_url(&page_url) {
        if origin != page_url {
            candidates.push(ChallengeParams {
                page_url: origin,
                ..primary
            });
        }
    }
    candidates
}

impl CaptchaSolver {
    pub fn new(http: reqwest::Client, config: CaptchaConfig) -> Self {
        Self {
            http,
            config,
            overrides: RwLock::new(CaptchaOverrides::default()),
            local: None,
        }
    }

    pub fn with_local_solver(mut self, solver: Arc<dyn LocalSolver>) -> Self {
        self.local = Some(solver);
        self
    }

    pub fn token_header(&self) -> &str {
        &self.config.token_header
    }

    pub async fn overrides(&self) -> CaptchaOverrides {
        self.overrides.read().await.clone()
    }

    pub async fn set_overrides(&self, overrides: CaptchaOverrides) {
        let mut current = self.overrides.write().await;
        *current = overrides;
        tracing::info!("[Captcha] Overrides updated: {:?}", *current);
    }

    fn http_enabled(&self) -> bool {
        !self.config.api_key.trim().is_empty()
    }

    /// Solve a challenge for `target_url`. Every failure collapses to `None`.
    pub async fn solve(&self, target_url: Option<&str>) -> Option<SolvedCaptcha> {
        let overrides = self.overrides().await;
        let candidates = build_candidates(&self.config, &overrides, target_url);
        if candidates.is_empty() {
            tracing::warn!("[Captcha] No site key / page url configured, cannot solve");
            return None;
        }

        if self.http_enabled() {
            for candidate in &candidates {
                if let Some(solved) = self.solve_http(candidate).await {
                    return Some(solved);
                }
            }
        }

        if let Some(local) = &self.local {
            tracing::info!("[Captcha] Falling back to local solver");
            if let Some(solved) = local.solve(&candidates[0]).await {
                return Some(solved);
            }
        }

        tracing::warn!("[Captcha] All solve candidates failed");
        None
    }

    async fn solve_http(&self, challenge: &ChallengeParams) -> Option<SolvedCaptcha> {
        let request_id = self.submit(challenge).await?;
        tracing::info!(
            "[Captcha] Submitted challenge for {} (request id {})",
            challenge.page_url,
            request_id
        );

        let interval = Duration::from_millis(self.config.poll_interval_ms);
        for attempt in 1..=self.config.max_polls {
            tokio::time::sleep(interval).await;

            let body = match self.poll(&request_id).await {
                Ok(body) => body,
                Err(e) => {
                    tracing::warn!("[Captcha] Poll {} failed: {}", attempt, e);
                    return None;
                }
            };

            let status = body.get("status").and_then(|v| v.as_i64()).unwrap_or(0);
            let request = body.get("request").and_then(|v| v.as_str()).unwrap_or_default();

            if status == 1 && !request.is_empty() {
                tracing::info!("[Captcha] Solved after {} poll(s)", attempt);
                return Some(SolvedCaptcha {
                    token: request.to_string(),
                    user_agent: body
                        .get("useragent")
                        .or_else(|| body.get("userAgent"))
                        .and_then(|v| v.as_str())
                        .map(|s| s.to_string())
                        .filter(|s| !s.is_empty()),
                });
            }
            if request == NOT_READY {
                tracing::debug!("[Captcha] Not ready ({}/{})", attempt, self.config.max_polls);
                continue;
            }

            tracing::warn!("[Captcha] Solver rejected request {}: {}", request_id, request);
            return None;
        }

        tracing::warn!(
            "[Captcha] Gave up on request {} after {} polls",
            request_id,
            self.config.max_polls
        );
        None
    }

    async fn submit(&self, challenge: &ChallengeParams) -> Option<String> {
        let mut form: Vec<(&str, String)> = vec![
            ("key", self.config.api_key.clone()),
            ("method", self.config.method.clone()),
            ("sitekey", challenge.site_key.clone()),
            ("pageurl", challenge.page_url.clone()),
            ("json", "1".to_string()),
        ];
        if let Some(action) = &challenge.action {
            form.push(("action", action.clone()));
        }
        if let Some(data) = &challenge.data {
            form.push(("data", data.clone()));
        }
        if let Some(page_data) = &challenge.page_data {
            form.push(("pagedata", page_data.clone()));
        }

        let resp = match self.http.post(&self.config.submit_url).form(&form).send().await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!("[Captcha] Submit request failed: {}", e);
                return None;
            }
        };
        let text = resp.text().await.ok()?;
        let body: Value = match serde_json::from_str(&text) {
            Ok(v) => v,
            Err(_) => {
                tracing::warn!("[Captcha] Submit returned non-JSON body: {}", text);
                return None;
            }
        };

        let accepted = body.get("status").and_then(|v| v.as_i64()) == Some(1);
        let request_id = body.get("request").and_then(|v| v.as_str()).unwrap_or_default();
        if !accepted || request_id.is_empty() {
            tracing::warn!("[Captcha] Submit rejected: {}", request_id);
            return None;
        }
        Some(request_id.to_string())
    }

    async fn poll(&self, request_id: &str) -> Result<Value, String> {
        let text = self
            .http
            .get(&self.config.result_url)
            .query(&[
                ("key", self.config.api_key.as_str()),
                ("action", "get"),
                ("id", request_id),
                ("json", "1"),
            ])
            .send()
            .await
            .map_err(|e| format!("request failed: {}", e))?
            .text()
            .await
            .map_err(|e| format!("failed to read body: {}", e))?;

        serde_json::from_str(&text).map_err(|_| format!("non-JSON body: {}", text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        extract::Query,
        routing::{get, post},
        Json, Router,
    };
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn base_config() -> CaptchaConfig {
        CaptchaConfig {
            site_key: "0xSITE".into(),
            page_url: "https://sora.example.com/explore?tab=video".into(),
            poll_interval_ms: 5,
            max_polls: 4,
            ..Default::default()
        }
    }

    struct FixedSolver(Option<&'static str>);

    impl LocalSolver for FixedSolver {
        fn solve<'a>(&'a self, _challenge: &'a ChallengeParams) -> BoxFuture<'a, Option<SolvedCaptcha>> {
            Box::pin(async move {
                self.0.map(|t| SolvedCaptcha {
                    token: t.to_string(),
                    user_agent: None,
                })
            })
        }
    }

    #[test]
    fn candidates_include_origin_fallback() {
        let candidates = build_candidates(&base_config(), &CaptchaOverrides::default(), None);
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].page_url, "https://sora.example.com/explore?tab=video");
        assert_eq!(candidates[1].page_url, "https://sora.example.com/");
        assert_eq!(candidates[1].site_key, "0xSITE");
    }

    #[test]
    fn overrides_win_and_origin_duplicate_is_dropped() {
        let overrides = CaptchaOverrides {
            site_key: Some("0xOVERRIDE".into()),
            action: Some("generate".into()),
            target_url: Some("https://other.example.com/".into()),
            ..Default::default()
        };
        let candidates = build_candidates(&base_config(), &overrides, None);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].site_key, "0xOVERRIDE");
        assert_eq!(candidates[0].action.as_deref(), Some("generate"));

        // explicit target beats the override target
        let candidates = build_candidates(&base_config(), &overrides, Some("https://third.example.com/a"));
        assert_eq!(candidates[0].page_url, "https://third.example.com/a");
    }

    #[test]
    fn no_site_key_means_no_candidates() {
        let config = CaptchaConfig {
            site_key: String::new(),
            ..base_config()
        };
        assert!(build_candidates(&config, &CaptchaOverrides::default(), None).is_empty());
    }

    #[tokio::test]
    async fn local_solver_used_when_http_disabled() {
        let solver = CaptchaSolver::new(reqwest::Client::new(), base_config())
            .with_local_solver(Arc::new(FixedSolver(Some("local-token"))));
        let solved = solver.solve(None).await.unwrap();
        assert_eq!(solved.token, "local-token");

        let failing = CaptchaSolver::new(reqwest::Client::new(), base_config())
            .with_local_solver(Arc::new(FixedSolver(None)));
        assert!(failing.solve(None).await.is_none());
    }

    #[tokio::test]
    async fn overrides_round_trip() {
        let solver = CaptchaSolver::new(reqwest::Client::new(), base_config());
        assert_eq!(solver.overrides().await, CaptchaOverrides::default());
        let o = CaptchaOverrides {
            data: Some("cdata".into()),
            ..Default::default()
        };
        solver.set_overrides(o.clone()).await;
        assert_eq!(solver.overrides().await, o);
    }

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn http_solver_polls_until_ready() {
        let polls = Arc::new(AtomicUsize::new(0));
        let counter = polls.clone();
        let app = Router::new()
            .route("/in.php", post(|| async { Json(json!({"status": 1, "request": "REQ1"})) }))
            .route(
                "/res.php",
                get(move |Query(q): Query<HashMap<String, String>>| {
                    let counter = counter.clone();
                    async move {
                        assert_eq!(q.get("id").map(|s| s.as_str()), Some("REQ1"));
                        if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                            Json(json!({"status": 0, "request": "CAPCHA_NOT_READY"}))
                        } else {
                            Json(json!({"status": 1, "request": "solved-token", "useragent": "UA/1.0"}))
                        }
                    }
                }),
            );
        let base = serve(app).await;

        let config = CaptchaConfig {
            api_key: "k".into(),
            submit_url: format!("{}/in.php", base),
            result_url: format!("{}/res.php", base),
            ..base_config()
        };
        let solver = CaptchaSolver::new(reqwest::Client::new(), config);
        let solved = solver.solve(None).await.unwrap();
        assert_eq!(solved.token, "solved-token");
        assert_eq!(solved.user_agent.as_deref(), Some("UA/1.0"));
        assert_eq!(polls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn http_solver_failure_falls_through_to_local() {
        let app = Router::new()
            .route("/in.php", post(|| async { Json(json!({"status": 1, "request": "REQ"})) }))
            .route(
                "/res.php",
                get(|| async { Json(json!({"status": 0, "request": "ERROR_CAPTCHA_UNSOLVABLE"})) }),
            );
        let base = serve(app).await;

        let config = CaptchaConfig {
            api_key: "k".into(),
            submit_url: format!("{}/in.php", base),
            result_url: format!("{}/res.php", base),
            ..base_config()
        };
        let solver = CaptchaSolver::new(reqwest::Client::new(), config)
            .with_local_solver(Arc::new(FixedSolver(Some("from-local"))));
        assert_eq!(solver.solve(None).await.unwrap().token, "from-local");
    }
}
