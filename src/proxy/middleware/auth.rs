// 管理接口认证中间件
use axum::{
    extract::Request,
    extract::State,
    http::{header, StatusCode},
    middleware::Next,
    response::Response,
};
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Default)]
pub struct AdminSecurity {
    /// Empty leaves admin routes open.
    pub api_key: String,
}

impl AdminSecurity {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into().trim().to_string(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.api_key.is_empty()
    }
}

fn extract_query_api_key<'a>(query: &'a str, key: &str) -> Option<&'a str> {
    for pair in query.split('&') {
        let mut iter = pair.splitn(2, '=');
        let name = iter.next().unwrap_or_default();
        if name == key {
            return iter.next().or(Some(""));
        }
    }
    None
}

fn extract_api_key(request: &Request) -> Option<&str> {
    let header_key = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer ").or(Some(s)));

    if header_key.is_some() {
        return header_key;
    }

    if let Some(value) = request
        .headers()
        .get("x-api-key")
        .and_then(|h| h.to_str().ok())
    {
        return Some(value);
    }

    request
        .uri()
        .query()
        .and_then(|query| extract_query_api_key(query, "key"))
}

/// Guards `/reset-scheduler` and `/admin/*`.
pub async fn admin_auth_middleware(
    State(security): State<Arc<RwLock<AdminSecurity>>>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    // Allow CORS preflight regardless of auth policy.
    if request.method() == axum::http::Method::OPTIONS {
        return Ok(next.run(request).await);
    }

    let security = security.read().await.clone();
    if !security.is_enabled() {
        return Ok(next.run(request).await);
    }

    let authorized = extract_api_key(&request)
        .map(|k| k == security.api_key)
        .unwrap_or(false);

    if authorized {
        Ok(next.run(request).await)
    } else {
        tracing::warn!("[Auth] Rejected admin request: {}", request.uri().path());
        Err(StatusCode::UNAUTHORIZED)
    }
}
