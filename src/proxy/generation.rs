// 生成服务：提交生成任务、查询任务状态，负责任务与 token 槽位的登记/释放
use bytes::Bytes;
use serde_json::{Map, Value};
use std::sync::Arc;

use crate::modules::config::UpstreamConfig;
use crate::proxy::dispatcher::{DispatchError, Dispatcher, FormPart, FormValue, UpstreamRequest};
use crate::proxy::errors::RelayError;
use crate::proxy::mappers::sora::{extract_job_id, generation_error, interpret_status, JobStatus};

#[derive(Debug, Clone)]
pub struct UploadFile {
    pub bytes: Bytes,
    pub filename: String,
    pub mime: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct GenerateRequest {
    pub prompt: String,
    /// Extra generation parameters forwarded verbatim (size, seconds, model...).
    pub params: Map<String, Value>,
    pub file: Option<UploadFile>,
}

fn param_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub fn build_generate_request(path: &str, request: &GenerateRequest) -> UpstreamRequest {
    match &request.file {
        Some(file) => {
            let mut parts = vec![FormPart {
                name: "prompt".to_string(),
                value: FormValue::Text(request.prompt.clone()),
            }];
            for (name, value) in &request.params {
                if name == "prompt" {
                    continue;
                }
                parts.push(FormPart {
                    name: name.clone(),
                    value: FormValue::Text(param_text(value)),
                });
            }
            parts.push(FormPart {
                name: "file".to_string(),
                value: FormValue::File {
                    bytes: file.bytes.clone(),
                    filename: file.filename.clone(),
                    mime: file.mime.clone(),
                },
            });
            UpstreamRequest::post_multipart(path, parts)
        }
        None => {
            let mut body = request.params.clone();
            body.insert("prompt".to_string(), Value::String(request.prompt.clone()));
            UpstreamRequest::post_json(path, Value::Object(body))
        }
    }
}

pub fn status_path_for(template: &str, job_id: &str) -> String {
    if template.contains("{id}") {
        template.replace("{id}", job_id)
    } else {
        format!("{}/{}", template.trim_end_matches('/'), job_id)
    }
}

pub struct GenerationService {
    dispatcher: Arc<Dispatcher>,
    generate_path: String,
    status_path: String,
}

impl GenerationService {
    pub fn new(dispatcher: Arc<Dispatcher>, upstream: &UpstreamConfig) -> Self {
        Self {
            dispatcher,
            generate_path: upstream.generate_path.clone(),
            status_path: upstream.status_path.clone(),
        }
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Submit a generation job and reserve a slot on the token that took it.
    pub async fn generate(&self, request: GenerateRequest) -> Result<String, RelayError> {
        if request.prompt.trim().is_empty() {
            return Err(RelayError::BadRequest("prompt is required".to_string()));
        }

        let upstream = build_generate_request(&self.generate_path, &request);
        let start = self.dispatcher.pick_start_index().await;
        let dispatched = self.dispatcher.dispatch(&upstream, start).await?;

        let Some(job_id) = extract_job_id(&dispatched.body) else {
            return Err(match generation_error(&dispatched.body) {
                Some(message) => {
                    tracing::warn!("[Generation] Upstream rejected job: {}", message);
                    RelayError::Upstream(message)
                }
                None => {
                    tracing::warn!("[Generation] No job id in upstream response");
                    RelayError::MissingJobId
                }
            });
        };

        self.dispatcher.jobs().record(&job_id, dispatched.token_index);
        tracing::info!(
            "[Generation] Job {} accepted on slot #{} (load {:?})",
            job_id,
            dispatched.token_index,
            self.dispatcher.load().snapshot()
        );
        Ok(job_id)
    }

    /// Poll one job. Known jobs are queried with the token that created them.
    pub async fn check_status(&self, job_id: &str) -> Result<JobStatus, RelayError> {
        let job_id = job_id.trim();
        if job_id.is_empty() {
            return Err(RelayError::BadRequest("uuid is required".to_string()));
        }

        let request = UpstreamRequest::get(status_path_for(&self.status_path, job_id));
        let dispatched = match self.dispatcher.jobs().lookup(job_id) {
            Some(index) => match self.dispatcher.dispatch_with_token(&request, index).await {
                Ok(d) => d,
                Err(e @ DispatchError::Rejected { .. }) => return Err(e.into()),
                Err(e) => {
                    tracing::warn!(
                        "[Generation] Status for {} via owning slot failed ({}), rotating",
                        job_id,
                        e
                    );
                    self.dispatcher.dispatch(&request, None).await?
                }
            },
            None => self.dispatcher.dispatch(&request, None).await?,
        };

        let status = interpret_status(&dispatched.body);
        if status.is_terminal() {
            if let Some(index) = self.dispatcher.jobs().release(job_id) {
                tracing::info!(
                    "[Generation] Job {} finished, released slot #{}",
                    job_id,
                    index
                );
            }
        }
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::dispatcher::RequestBody;
    use serde_json::json;

    fn params(v: Value) -> Map<String, Value> {
        match v {
            Value::Object(m) => m,
            _ => Map::new(),
        }
    }

    #[test]
    fn json_body_merges_params_and_prompt() {
        let req = GenerateRequest {
            prompt: "a cat".into(),
            params: params(json!({"seconds": 10, "prompt": "ignored"})),
            file: None,
        };
        let up = build_generate_request("/video/generate", &req);
        assert_eq!(up.method, reqwest::Method::POST);
        match up.body {
            RequestBody::Json(v) => assert_eq!(v, json!({"prompt": "a cat", "seconds": 10})),
            other => panic!("unexpected body {:?}", other),
        }
    }

    #[test]
    fn file_switches_to_multipart() {
        let req = GenerateRequest {
            prompt: "a dog".into(),
            params: params(json!({"size": "720x1280", "seconds": 5})),
            file: Some(UploadFile {
                bytes: Bytes::from_static(b"\x89PNG"),
                filename: "ref.png".into(),
                mime: Some("image/png".into()),
            }),
        };
        let up = build_generate_request("/video/generate", &req);
        let RequestBody::Multipart(parts) = up.body else {
            panic!("expected multipart");
        };
        let names: Vec<_> = parts.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names.first(), Some(&"prompt"));
        assert_eq!(names.last(), Some(&"file"));
        assert!(names.contains(&"size"));
        let seconds = parts.iter().find(|p| p.name == "seconds").map(|p| &p.value);
        assert!(matches!(seconds, Some(FormValue::Text(s)) if s == "5"));
    }

    #[test]
    fn status_path_template() {
        assert_eq!(status_path_for("/video/history/{id}", "abc"), "/video/history/abc");
        assert_eq!(status_path_for("/video/history/", "abc"), "/video/history/abc");
    }
}
