use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::proxy::dispatcher::DispatchError;
use crate::proxy::mappers::error_classifier::extract_upstream_error;

/// Failures that reach the client-facing HTTP boundary.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error(transparent)]
    Dispatch(DispatchError),
    #[error("{0}")]
    Upstream(String),
    #[error("Upstream response did not include a job id")]
    MissingJobId,
    #[error("{0}")]
    BadRequest(String),
}

impl From<DispatchError> for RelayError {
    fn from(err: DispatchError) -> Self {
        match err {
            // 任务级拒绝直接透传上游信息
            DispatchError::Rejected { message, .. } => RelayError::Upstream(message),
            other => RelayError::Dispatch(other),
        }
    }
}

pub(crate) fn truncate_utf8(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }

    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    let mut out = s[..end].to_string();
    out.push_str("…");
    out
}

pub fn relay_error(status: StatusCode, message: impl Into<String>) -> Response {
    let message = message.into();
    (
        status,
        Json(json!({
            "success": false,
            "error": message
        })),
    )
        .into_response()
}

/// Short one-line form of an upstream body for logs.
pub fn summarize_for_log(body_text: &str) -> String {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body_text) {
        let err = extract_upstream_error(&value);
        match (err.code, err.message) {
            (Some(code), Some(message)) => {
                return format!("{}: {}", code, truncate_utf8(&message, 400));
            }
            (Some(code), None) => return code,
            (None, Some(message)) => return truncate_utf8(&message, 400),
            (None, None) => {}
        }
    }

    truncate_utf8(body_text, 400)
}

pub fn dispatch_error_status(err: &DispatchError) -> (StatusCode, &'static str) {
    match err {
        DispatchError::NoTokensAvailable => (StatusCode::INTERNAL_SERVER_ERROR, "No tokens available"),
        DispatchError::AllTokensExhausted { .. } => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "All tokens failed or quota exhausted",
        ),
        DispatchError::TokenAttemptFailed { .. } => {
            (StatusCode::BAD_GATEWAY, "Upstream request failed")
        }
        DispatchError::Rejected { .. } => (StatusCode::BAD_GATEWAY, "Upstream rejected the request"),
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        match &self {
            RelayError::Dispatch(err) => {
                if let DispatchError::AllTokensExhausted {
                    last_error: Some(last),
                } = err
                {
                    tracing::debug!("[Relay] Exhausted, last error: {}", last);
                }
                let (status, message) = dispatch_error_status(err);
                relay_error(status, message)
            }
            RelayError::Upstream(message) => {
                relay_error(StatusCode::BAD_GATEWAY, truncate_utf8(message, 400))
            }
            RelayError::MissingJobId => relay_error(StatusCode::BAD_GATEWAY, self.to_string()),
            RelayError::BadRequest(message) => relay_error(StatusCode::BAD_REQUEST, message.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    async fn body_json(resp: Response) -> Value {
        let bytes = axum::body::to_bytes(resp.into_body(), 64 * 1024)
            .await
            .expect("body bytes");
        serde_json::from_slice(&bytes).expect("json")
    }

    #[test]
    fn test_truncate_utf8() {
        let s = "абвгд";
        let t = truncate_utf8(s, 5);
        assert!(t.ends_with('…'));
        assert!(t.len() <= s.len() + 3);
    }

    #[test]
    fn test_summarize_for_log() {
        let body = r#"{"detail":{"error_code":"TURNSTILE_REQUIRED","error_message":"solve"}}"#;
        assert_eq!(summarize_for_log(body), "TURNSTILE_REQUIRED: solve");
        assert_eq!(summarize_for_log(r#"{"error":"boom"}"#), "boom");
        assert_eq!(summarize_for_log("<html>bad gateway</html>"), "<html>bad gateway</html>");
        assert!(summarize_for_log(&"x".repeat(1000)).len() < 420);
    }

    #[tokio::test]
    async fn test_no_tokens_is_500() {
        let resp = RelayError::from(DispatchError::NoTokensAvailable).into_response();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let v = body_json(resp).await;
        assert_eq!(v["success"], false);
        assert_eq!(v["error"], "No tokens available");
    }

    #[tokio::test]
    async fn test_exhausted_hides_last_error() {
        let resp = RelayError::from(DispatchError::AllTokensExhausted {
            last_error: Some("auth_failed (HTTP 401)".into()),
        })
        .into_response();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let v = body_json(resp).await;
        assert_eq!(v["error"], "All tokens failed or quota exhausted");
    }

    #[tokio::test]
    async fn test_rejection_keeps_upstream_message() {
        let err = RelayError::from(DispatchError::Rejected {
            index: 1,
            status: 400,
            message: "This prompt violates our content policy".into(),
        });
        assert!(matches!(err, RelayError::Upstream(_)));
        let resp = err.into_response();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            body_json(resp).await["error"],
            "This prompt violates our content policy"
        );
    }

    #[tokio::test]
    async fn test_upstream_and_bad_request() {
        let resp = RelayError::Upstream("prompt blocked".into()).into_response();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(body_json(resp).await["error"], "prompt blocked");

        let resp = RelayError::BadRequest("prompt is required".into()).into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(resp).await["error"], "prompt is required");
    }
}
