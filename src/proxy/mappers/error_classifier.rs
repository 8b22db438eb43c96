// 错误分类模块 - 将上游响应/传输错误归类为调度器可匹配的判定
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Error;
use serde_json::Value;

/// Upstream error code asking for a solved Turnstile challenge.
pub const CAPTCHA_REQUIRED_CODE: &str = "TURNSTILE_REQUIRED";
/// Upstream error code for an exhausted trial allowance on the token.
pub const TRIAL_LIMIT_CODE: &str = "TRIAL_LIMIT_EXCEEDED";

// Concurrency / rate-limit wording seen in upstream error messages.
static CONCURRENCY_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)concurrent|too many|rate limit|already processing|max|limit video")
        .expect("concurrency pattern is a valid regex")
});

/// What the rotation loop should make of one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Ok,
    RateLimited,
    AuthFailed,
    CaptchaRequired,
    /// 422: the request itself is rejected; no captcha, move on.
    ClientError,
    /// Other 4xx carrying an explicit upstream error: the job itself was
    /// refused (content policy, bad parameters). Another token gets the same answer.
    Rejected,
    Timeout,
    Unknown,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Ok => "ok",
            Verdict::RateLimited => "rate_limited",
            Verdict::AuthFailed => "auth_failed",
            Verdict::CaptchaRequired => "captcha_required",
            Verdict::ClientError => "client_error",
            Verdict::Rejected => "rejected",
            Verdict::Timeout => "timeout",
            Verdict::Unknown => "unknown",
        }
    }
}

/// Error code / message pulled out of an upstream body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpstreamError {
    pub code: Option<String>,
    pub message: Option<String>,
}

impl UpstreamError {
    pub fn is_empty(&self) -> bool {
        self.code.is_none() && self.message.is_none()
    }

    /// Message, else code, for logs and client-facing errors.
    pub fn describe(&self) -> Option<String> {
        self.message.clone().or_else(|| self.code.clone())
    }
}

fn str_field(v: &Value, key: &str) -> Option<String> {
    v.get(key)
        .and_then(|x| x.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Look for `detail.error_code` / `detail.error_message`, then the top-level
/// `error_code` / `error_message`, then `error` (string or `{code,message}`).
pub fn extract_upstream_error(body: &Value) -> UpstreamError {
    let mut out = UpstreamError::default();

    match body.get("detail") {
        Some(detail @ Value::Object(_)) => {
            out.code = str_field(detail, "error_code").or_else(|| str_field(detail, "code"));
            out.message = str_field(detail, "error_message").or_else(|| str_field(detail, "message"));
        }
        Some(Value::String(s)) if !s.trim().is_empty() => {
            out.message = Some(s.trim().to_string());
        }
        _ => {}
    }

    if out.code.is_none() {
        out.code = str_field(body, "error_code");
    }
    if out.message.is_none() {
        out.message = str_field(body, "error_message");
    }

    match body.get("error") {
        Some(Value::String(s)) if out.message.is_none() && !s.trim().is_empty() => {
            out.message = Some(s.trim().to_string());
        }
        Some(err @ Value::Object(_)) => {
            if out.code.is_none() {
                out.code = str_field(err, "code").or_else(|| str_field(err, "type"));
            }
            if out.message.is_none() {
                out.message = str_field(err, "message");
            }
        }
        _ => {}
    }

    out
}

pub fn looks_like_concurrency_limit(text: &str) -> bool {
    CONCURRENCY_PATTERN.is_match(text)
}

/// Classify an HTTP response that made it back from upstream.
///
/// A 2xx body is only a failure when it carries one of the known error codes;
/// job-level `error_message` payloads are left to the caller.
pub fn classify_response(status: u16, body: &Value) -> Verdict {
    let err = extract_upstream_error(body);
    let code = err.code.as_deref().unwrap_or_default();

    if (200..300).contains(&status) {
        return match code {
            CAPTCHA_REQUIRED_CODE => Verdict::CaptchaRequired,
            TRIAL_LIMIT_CODE => Verdict::RateLimited,
            _ => Verdict::Ok,
        };
    }

    if status == 422 {
        return Verdict::ClientError;
    }
    if code == CAPTCHA_REQUIRED_CODE {
        return Verdict::CaptchaRequired;
    }
    if status == 401 || status == 403 {
        return Verdict::AuthFailed;
    }
    if status == 429 || code == TRIAL_LIMIT_CODE {
        return Verdict::RateLimited;
    }

    let text = [err.code.as_deref(), err.message.as_deref()]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>()
        .join(" ");
    if looks_like_concurrency_limit(&text) {
        return Verdict::RateLimited;
    }
    if (400..500).contains(&status) && !err.is_empty() {
        return Verdict::Rejected;
    }

    Verdict::Unknown
}

/// Classify a request that never produced a response.
pub fn classify_transport(error: &Error) -> Verdict {
    if error.is_timeout() {
        Verdict::Timeout
    } else {
        Verdict::Unknown
    }
}

/// Short label for transport failures in log lines.
pub fn describe_transport_error(error: &Error) -> &'static str {
    if error.is_timeout() {
        "timeout_error"
    } else if error.is_connect() {
        "connection_error"
    } else if error.is_decode() {
        "decode_error"
    } else if error.is_body() {
        "body_error"
    } else {
        "unknown_error"
    }
}
