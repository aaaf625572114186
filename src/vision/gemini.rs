//! Gemini Files API backend.
//!
//! Upload uses the resumable protocol: a `start` request announces size and
//! MIME type and returns an upload URL, then one `upload, finalize` request
//! streams the file body from disk. Generation references the file by URI
//! and asks for `application/json` output.

use super::{GenerationRequest, RemoteFile, VisionModel};
use crate::error::{ModelError, PipelineError};
use crate::config::{http_client, DEFAULT_MODEL};
use futures::future::BoxFuture;
use serde_json::{json, Value};
use std::path::Path;
use std::time::Duration;
use tokio_util::io::ReaderStream;
use tracing::debug;

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

/// Polls while an upload is still `PROCESSING`.
const ACTIVE_POLL_ATTEMPTS: u32 = 10;
const ACTIVE_POLL_INTERVAL: Duration = Duration::from_secs(1);
/// Uploads of large slices and long generations both go through this client.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(600);

/// Gemini over REST.
pub struct GeminiVision {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl std::fmt::Debug for GeminiVision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeminiVision")
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .field("api_key", &"<redacted>")
            .finish()
    }
}

impl GeminiVision {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: http_client(REQUEST_TIMEOUT),
            api_key: api_key.into(),
            model: model.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    /// Key from `GEMINI_API_KEY` (or `GOOGLE_API_KEY`), model from
    /// `BOOKMETA_MODEL`, else `model`, else the default.
    pub fn from_env(model: Option<&str>) -> Result<Self, PipelineError> {
        let api_key = ["GEMINI_API_KEY", "GOOGLE_API_KEY"]
            .iter()
            .filter_map(|k| std::env::var(k).ok())
            .find(|v| !v.trim().is_empty())
            .ok_or_else(|| PipelineError::BackendNotConfigured {
                backend: "gemini".into(),
                hint: "Set GEMINI_API_KEY (or GOOGLE_API_KEY).".into(),
            })?;
        let model = std::env::var("BOOKMETA_MODEL")
            .ok()
            .filter(|m| !m.is_empty())
            .or_else(|| model.map(str::to_string))
            .unwrap_or_else(|| DEFAULT_MODEL.to_string());
        Ok(Self::new(api_key, model))
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    async fn start_upload(&self, display_name: &str, size: u64, mime_type: &str) -> Result<String, ModelError> {
        let resp = self
            .client
            .post(format!("{}/upload/v1beta/files", self.base_url))
            .header("x-goog-api-key", &self.api_key)
            .header("X-Goog-Upload-Protocol", "resumable")
            .header("X-Goog-Upload-Command", "start")
            .header("X-Goog-Upload-Header-Content-Length", size.to_string())
            .header("X-Goog-Upload-Header-Content-Type", mime_type)
            .json(&json!({ "file": { "display_name": display_name } }))
            .send()
            .await?;
        let resp = check_status(resp).await?;
        resp.headers()
            .get("x-goog-upload-url")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| ModelError::Malformed {
                detail: "upload start response has no x-goog-upload-url header".into(),
            })
    }

    async fn wait_until_active(&self, mut file: Value) -> Result<Value, ModelError> {
        for _ in 0..ACTIVE_POLL_ATTEMPTS {
            match file["state"].as_str() {
                Some("PROCESSING") => {}
                Some("FAILED") => {
                    return Err(ModelError::Rejected {
                        status: None,
                        detail: format!("file processing failed: {}", file["error"]),
                    })
                }
                _ => return Ok(file),
            }
            tokio::time::sleep(ACTIVE_POLL_INTERVAL).await;
            let name = file["name"].as_str().unwrap_or_default().to_string();
            let resp = self
                .client
                .get(format!("{}/v1beta/{}", self.base_url, name))
                .header("x-goog-api-key", &self.api_key)
                .send()
                .await?;
            file = check_status(resp).await?.json().await?;
        }
        Err(ModelError::Transient {
            status: None,
            detail: "uploaded file did not become ACTIVE".into(),
        })
    }
}

/// Map a non-2xx response to a [`ModelError`], keeping `Retry-After`.
pub(crate) async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, ModelError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    if status.as_u16() == 429 {
        let retry_after = resp
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        return Err(ModelError::RateLimited { retry_after });
    }
    let body = resp.text().await.unwrap_or_default();
    let detail: String = body.chars().take(400).collect();
    Err(ModelError::from_status(status.as_u16(), detail))
}

/// Build the `generateContent` body.
pub fn generation_body(request: &GenerationRequest<'_>) -> Value {
    let mut parts: Vec<Value> = request
        .files
        .iter()
        .map(|f| json!({ "file_data": { "mime_type": f.mime_type, "file_uri": f.uri } }))
        .collect();
    parts.push(json!({ "text": request.instructions }));
    json!({
        "contents": [{ "role": "user", "parts": parts }],
        "generationConfig": {
            "temperature": request.temperature,
            "maxOutputTokens": request.max_output_tokens,
            "responseMimeType": "application/json"
        }
    })
}

/// Concatenate the text parts of the first candidate.
pub fn response_text(body: &Value) -> Result<String, ModelError> {
    if let Some(reason) = body["promptFeedback"]["blockReason"].as_str() {
        return Err(ModelError::Rejected {
            status: None,
            detail: format!("prompt blocked: {}", reason),
        });
    }
    let parts = body["candidates"][0]["content"]["parts"]
        .as_array()
        .ok_or_else(|| ModelError::Malformed {
            detail: format!(
                "no candidate content (finishReason: {})",
                body["candidates"][0]["finishReason"].as_str().unwrap_or("unknown")
            ),
        })?;
    let text: String = parts.iter().filter_map(|p| p["text"].as_str()).collect();
    if text.trim().is_empty() {
        return Err(ModelError::Malformed {
            detail: "candidate has no text".into(),
        });
    }
    Ok(text)
}

/// Read the `file` object of an upload response.
pub fn remote_file_from(body: &Value) -> Result<RemoteFile, ModelError> {
    let file = if body["file"].is_object() { &body["file"] } else { body };
    let name = file["name"].as_str();
    let uri = file["uri"].as_str();
    match (name, uri) {
        (Some(name), Some(uri)) => Ok(RemoteFile {
            name: name.to_string(),
            uri: uri.to_string(),
            mime_type: file["mimeType"].as_str().unwrap_or("application/pdf").to_string(),
            expires_at: file["expirationTime"].as_str().map(str::to_string),
        }),
        _ => Err(ModelError::Malformed {
            detail: "upload response lacks file name or uri".into(),
        }),
    }
}

impl VisionModel for GeminiVision {
    fn name(&self) -> &str {
        "gemini"
    }

    fn upload<'a>(&'a self, path: &'a Path, mime_type: &'a str) -> BoxFuture<'a, Result<RemoteFile, ModelError>> {
        Box::pin(async move {
            let io = |e: std::io::Error| ModelError::Io { detail: e.to_string() };
            let size = tokio::fs::metadata(path).await.map_err(io)?.len();
            let display_name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "slice.pdf".into());

            let upload_url = self.start_upload(&display_name, size, mime_type).await?;
            let file = tokio::fs::File::open(path).await.map_err(io)?;
            let body = reqwest::Body::wrap_stream(ReaderStream::new(file));

            let resp = self
                .client
                .post(upload_url)
                .header("Content-Length", size.to_string())
                .header("X-Goog-Upload-Offset", "0")
                .header("X-Goog-Upload-Command", "upload, finalize")
                .body(body)
                .send()
                .await?;
            let json: Value = check_status(resp).await?.json().await?;
            let file = if json["file"].is_object() { json["file"].clone() } else { json };
            let file = self.wait_until_active(file).await?;
            let remote = remote_file_from(&file)?;
            debug!("Uploaded {} ({} bytes) as {}", display_name, size, remote.name);
            Ok(remote)
        })
    }

    fn generate<'a>(&'a self, request: GenerationRequest<'a>) -> BoxFuture<'a, Result<String, ModelError>> {
        Box::pin(async move {
            let resp = self
                .client
                .post(format!(
                    "{}/v1beta/models/{}:generateContent",
                    self.base_url, self.model
                ))
                .header("x-goog-api-key", &self.api_key)
                .json(&generation_body(&request))
                .send()
                .await?;
            let body: Value = check_status(resp).await?.json().await?;
            if let Some(usage) = body.get("usageMetadata") {
                debug!(
                    "{}: {} input tokens, {} output tokens",
                    self.model,
                    usage["promptTokenCount"].as_u64().unwrap_or(0),
                    usage["candidatesTokenCount"].as_u64().unwrap_or(0)
                );
            }
            response_text(&body)
        })
    }

    fn delete<'a>(&'a self, file: &'a RemoteFile) -> BoxFuture<'a, Result<(), ModelError>> {
        Box::pin(async move {
            let resp = self
                .client
                .delete(format!("{}/v1beta/{}", self.base_url, file.name))
                .header("x-goog-api-key", &self.api_key)
                .send()
                .await?;
            // Already expired or deleted counts as done.
            if resp.status().as_u16() == 404 {
                return Ok(());
            }
            check_status(resp).await?;
            Ok(())
        })
    }
}
