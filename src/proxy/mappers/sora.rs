// Sora 风格上游响应解析：任务 ID 提取、历史记录状态解释
use serde::Serialize;
use serde_json::Value;

use crate::proxy::mappers::error_classifier::extract_upstream_error;

const JOB_ID_FIELDS: [&str; 5] = ["uuid", "id", "task_id", "job_id", "generation_id"];
const VIDEO_URL_FIELDS: [&str; 4] = ["url", "video_url", "downloadable_url", "download_url"];

/// Job status as reported to clients of `/check-status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum JobStatus {
    Complete { url: String },
    Processing,
    Error { message: String },
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Processing)
    }
}

fn id_from(obj: &Value) -> Option<String> {
    JOB_ID_FIELDS.iter().find_map(|key| match obj.get(*key) {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

/// Job id from a generation response; checks the top level, then `data`.
pub fn extract_job_id(body: &Value) -> Option<String> {
    id_from(body).or_else(|| body.get("data").and_then(id_from))
}

/// Error reported in a generation response that otherwise came back 2xx.
pub fn generation_error(body: &Value) -> Option<String> {
    if extract_job_id(body).is_some() {
        return None;
    }
    extract_upstream_error(body).describe()
}

/// Interpret a history/status payload.
///
/// `error_message` wins, then `generated_video[0]` with a URL field; anything
/// else is still processing.
pub fn interpret_status(body: &Value) -> JobStatus {
    if let Some(message) = body
        .get("error_message")
        .and_then(|v| v.as_str())
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
    {
        return JobStatus::Error {
            message: message.to_string(),
        };
    }

    let first_video = body
        .get("generated_video")
        .and_then(|v| v.as_array())
        .and_then(|arr| arr.first());

    if let Some(video) = first_video {
        let url = VIDEO_URL_FIELDS.iter().find_map(|key| {
            video
                .get(*key)
                .and_then(|v| v.as_str())
                .map(|s| s.trim())
                .filter(|s| !s.is_empty())
        });
        if let Some(url) = url {
            return JobStatus::Complete {
                url: url.to_string(),
            };
        }
    }

    JobStatus::Processing
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn job_id_field_priority_and_nesting() {
        assert_eq!(extract_job_id(&json!({"uuid": "u1", "id": "i1"})).as_deref(), Some("u1"));
        assert_eq!(extract_job_id(&json!({"task_id": "t1"})).as_deref(), Some("t1"));
        assert_eq!(extract_job_id(&json!({"data": {"generation_id": "g1"}})).as_deref(), Some("g1"));
        assert_eq!(extract_job_id(&json!({"id": 42})).as_deref(), Some("42"));
        assert_eq!(extract_job_id(&json!({"id": "  "})), None);
        assert_eq!(extract_job_id(&json!({"ok": true})), None);
    }

    #[test]
    fn generation_error_only_without_job_id() {
        assert_eq!(
            generation_error(&json!({"detail": {"error_message": "prompt blocked"}})).as_deref(),
            Some("prompt blocked")
        );
        assert_eq!(generation_error(&json!({"id": "x", "error": "ignored"})), None);
        assert_eq!(generation_error(&json!({})), None);
    }

    #[test]
    fn status_payloads() {
        assert_eq!(
            interpret_status(&json!({"error_message": "moderation"})),
            JobStatus::Error { message: "moderation".into() }
        );
        assert_eq!(
            interpret_status(&json!({"generated_video": [{"downloadable_url": "https://cdn/v.mp4"}]})),
            JobStatus::Complete { url: "https://cdn/v.mp4".into() }
        );
        assert_eq!(interpret_status(&json!({"generated_video": [{}]})), JobStatus::Processing);
        assert_eq!(interpret_status(&json!({"generated_video": []})), JobStatus::Processing);
        assert_eq!(interpret_status(&json!({"status": "running"})), JobStatus::Processing);
    }

    #[test]
    fn status_serializes_with_tag() {
        let v = serde_json::to_value(JobStatus::Complete { url: "u".into() }).unwrap();
        assert_eq!(v, json!({"status": "complete", "url": "u"}));
        let v = serde_json::to_value(JobStatus::Processing).unwrap();
        assert_eq!(v, json!({"status": "processing"}));
        assert!(!JobStatus::Processing.is_terminal());
        assert!(JobStatus::Error { message: "m".into() }.is_terminal());
    }
}
