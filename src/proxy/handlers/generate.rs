// 客户端接口：POST /generate、GET /check-status
use axum::{
    extract::{FromRequest, Multipart, Query, Request, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use bytes::Bytes;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::proxy::errors::{dispatch_error_status, RelayError};
use crate::proxy::generation::{GenerateRequest, UploadFile};
use crate::proxy::server::AppState;

// JSON 请求里不作为生成参数转发的字段
const JSON_RESERVED_FIELDS: [&str; 3] = ["prompt", "image_base64", "image_filename"];

/// POST /generate - multipart (prompt, file, ...) 或 JSON
pub async fn generate(State(state): State<AppState>, request: Request) -> Response {
    let is_multipart = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.starts_with("multipart/form-data"))
        .unwrap_or(false);

    let parsed = if is_multipart {
        match Multipart::from_request(request, &state).await {
            Ok(multipart) => parse_multipart(multipart).await,
            Err(rejection) => Err(RelayError::BadRequest(rejection.body_text())),
        }
    } else {
        match Json::<Value>::from_request(request, &state).await {
            Ok(Json(body)) => parse_json(body),
            Err(rejection) => Err(RelayError::BadRequest(rejection.body_text())),
        }
    };

    let result = match parsed {
        Ok(req) => state.generation.generate(req).await,
        Err(e) => Err(e),
    };

    match result {
        Ok(job_id) => Json(json!({ "success": true, "uuid": job_id })).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn parse_multipart(mut multipart: Multipart) -> Result<GenerateRequest, RelayError> {
    let mut request = GenerateRequest::default();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| RelayError::BadRequest(format!("Invalid multipart body: {}", e)))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                let filename = field
                    .file_name()
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "upload.bin".to_string());
                let mime = field.content_type().map(|s| s.to_string());
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| RelayError::BadRequest(format!("Failed to read file: {}", e)))?;
                if !bytes.is_empty() {
                    request.file = Some(UploadFile {
                        bytes,
                        filename,
                        mime,
                    });
                }
            }
            "" => {}
            _ => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| RelayError::BadRequest(format!("Invalid field {}: {}", name, e)))?;
                if name == "prompt" {
                    request.prompt = text;
                } else {
                    request.params.insert(name, Value::String(text));
                }
            }
        }
    }

    Ok(request)
}

/// `data:image/png;base64,....` 或纯 base64
fn decode_image(raw: &str) -> Result<(Bytes, Option<String>), RelayError> {
    let (mime, payload) = match raw.strip_prefix("data:") {
        Some(rest) => match rest.split_once(";base64,") {
            Some((mime, payload)) => (Some(mime.to_string()).filter(|m| !m.is_empty()), payload),
            None => return Err(RelayError::BadRequest("Unsupported image data url".to_string())),
        },
        None => (None, raw),
    };

    let bytes = BASE64
        .decode(payload.trim())
        .map_err(|e| RelayError::BadRequest(format!("Invalid image_base64: {}", e)))?;
    Ok((Bytes::from(bytes), mime))
}

fn default_filename(mime: Option<&str>) -> String {
    let ext = match mime {
        Some("image/jpeg") => "jpg",
        Some("image/webp") => "webp",
        Some("image/gif") => "gif",
        Some("video/mp4") => "mp4",
        _ => "png",
    };
    format!("reference.{}", ext)
}

pub fn parse_json(body: Value) -> Result<GenerateRequest, RelayError> {
    let Value::Object(mut obj) = body else {
        return Err(RelayError::BadRequest("Request body must be a JSON object".to_string()));
    };

    let prompt = match obj.get("prompt") {
        Some(Value::String(s)) => s.clone(),
        _ => String::new(),
    };

    let file = match obj.get("image_base64").and_then(|v| v.as_str()) {
        Some(raw) if !raw.trim().is_empty() => {
            let (bytes, mime) = decode_image(raw.trim())?;
            let filename = obj
                .get("image_filename")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
                .unwrap_or_else(|| default_filename(mime.as_deref()));
            Some(UploadFile {
                bytes,
                filename,
                mime: mime.or_else(|| Some("image/png".to_string())),
            })
        }
        _ => None,
    };

    for key in JSON_RESERVED_FIELDS {
        obj.remove(key);
    }
    let params: Map<String, Value> = obj;

    Ok(GenerateRequest {
        prompt,
        params,
        file,
    })
}

#[derive(Debug, Deserialize)]
pub struct StatusQuery {
    #[serde(default)]
    pub uuid: String,
}

/// GET /check-status?uuid=
pub async fn check_status(State(state): State<AppState>, Query(query): Query<StatusQuery>) -> Response {
    match state.generation.check_status(&query.uuid).await {
        Ok(status) => Json(status).into_response(),
        Err(e) => {
            let status = match &e {
                RelayError::BadRequest(_) => StatusCode::BAD_REQUEST,
                RelayError::Dispatch(d) => dispatch_error_status(d).0,
                _ => StatusCode::BAD_GATEWAY,
            };
            (
                status,
                Json(json!({ "status": "error", "message": e.to_string() })),
            )
                .into_response()
        }
    }
}
