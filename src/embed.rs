//! Book embeddings for semantic search.
//!
//! The embedded text is the catalogue view of a book: title, authors,
//! summary (or description) and chapter titles, capped at
//! [`MAX_EMBED_CHARS`]. A failed embedding never fails the run; the book
//! is stored without one.

use crate::config::http_client;
use crate::error::{ModelError, PipelineError};
use crate::model::{BookRecord, ChapterRecord};
use crate::retry::{call_with_policy, RetryPolicy};
use crate::vision::gemini::check_status;
use futures::future::BoxFuture;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, warn};

pub const DEFAULT_EMBEDDING_MODEL: &str = "gemini-embedding-001";
pub const DEFAULT_DIMENSIONS: usize = 768;
pub const MAX_EMBED_CHARS: usize = 9000;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Turns text into a dense vector.
pub trait Embedder: Send + Sync {
    fn name(&self) -> &str;

    fn embed<'a>(&'a self, text: &'a str) -> BoxFuture<'a, Result<Vec<f32>, ModelError>>;
}

/// `models/{model}:embedContent` over REST.
pub struct GeminiEmbedder {
    client: reqwest::Client,
    api_key: String,
    model: String,
    dimensions: usize,
    base_url: String,
}

impl std::fmt::Debug for GeminiEmbedder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeminiEmbedder")
            .field("model", &self.model)
            .field("dimensions", &self.dimensions)
            .field("api_key", &"<redacted>")
            .finish()
    }
}

impl GeminiEmbedder {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: http_client(REQUEST_TIMEOUT),
            api_key: api_key.into(),
            model: DEFAULT_EMBEDDING_MODEL.to_string(),
            dimensions: DEFAULT_DIMENSIONS,
            base_url: crate::vision::gemini::DEFAULT_BASE_URL.to_string(),
        }
    }

    pub fn from_env() -> Result<Self, PipelineError> {
        ["GEMINI_API_KEY", "GOOGLE_API_KEY"]
            .iter()
            .filter_map(|k| std::env::var(k).ok())
            .find(|v| !v.trim().is_empty())
            .map(Self::new)
            .ok_or_else(|| PipelineError::BackendNotConfigured {
                backend: "gemini-embedding".into(),
                hint: "Set GEMINI_API_KEY (or GOOGLE_API_KEY), or disable embeddings.".into(),
            })
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_dimensions(mut self, dimensions: usize) -> Self {
        self.dimensions = dimensions.max(1);
        self
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    fn request_body(&self, text: &str) -> Value {
        json!({
            "model": format!("models/{}", self.model),
            "content": { "parts": [{ "text": text }] },
            "taskType": "RETRIEVAL_DOCUMENT",
            "title": "Math Book Entry",
            "outputDimensionality": self.dimensions,
        })
    }
}

/// Read `embedding.values` from an `embedContent` response.
pub fn embedding_values(body: &Value) -> Result<Vec<f32>, ModelError> {
    let values = body["embedding"]["values"]
        .as_array()
        .ok_or_else(|| ModelError::Malformed {
            detail: "response has no embedding.values".into(),
        })?;
    values
        .iter()
        .map(|v| v.as_f64().map(|f| f as f32))
        .collect::<Option<Vec<f32>>>()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ModelError::Malformed {
            detail: "embedding.values is empty or not numeric".into(),
        })
}

impl Embedder for GeminiEmbedder {
    fn name(&self) -> &str {
        &self.model
    }

    fn embed<'a>(&'a self, text: &'a str) -> BoxFuture<'a, Result<Vec<f32>, ModelError>> {
        Box::pin(async move {
            let url = format!("{}/v1beta/models/{}:embedContent", self.base_url, self.model);
            let resp = self
                .client
                .post(url)
                .header("x-goog-api-key", &self.api_key)
                .json(&self.request_body(text))
                .send()
                .await?;
            let body: Value = check_status(resp).await?.json().await?;
            let values = embedding_values(&body)?;
            if values.len() != self.dimensions {
                debug!("{}: got {} dimensions, asked for {}", self.model, values.len(), self.dimensions);
            }
            Ok(values)
        })
    }
}

/// Text embedded for one book.
pub fn embedding_text(book: &BookRecord, chapters: &[ChapterRecord]) -> String {
    let mut parts = Vec::new();
    if let Some(title) = &book.title {
        parts.push(format!("Title: {}", title));
    }
    if !book.authors.is_empty() {
        parts.push(format!("Author: {}", book.authors.join(", ")));
    }
    if let Some(text) = book.summary.as_ref().or(book.description.as_ref()) {
        parts.push(format!("Description: {}", text));
    }
    if !chapters.is_empty() {
        parts.push("Chapters:".to_string());
        parts.extend(chapters.iter().map(|c| format!("- {}", c.title)));
    }
    parts.join("\n").chars().take(MAX_EMBED_CHARS).collect()
}

/// Embed `text` under `policy`; `None` on any failure.
pub async fn embed_or_skip(embedder: &dyn Embedder, policy: &RetryPolicy, text: &str) -> Option<Vec<f32>> {
    if text.trim().is_empty() {
        return None;
    }
    match call_with_policy(policy, "embedding", |_| embedder.embed(text)).await {
        Ok(values) => Some(values),
        Err(e) => {
            warn!(
                phase = "resolved",
                code = e.error.kind().code(),
                "Embedding with {} failed after {} attempts, storing book without one: {}",
                embedder.name(),
                e.attempts,
                e.error
            );
            None
        }
    }
}

/// Little-endian `f32` bytes, the on-disk form of an embedding.
pub fn embedding_to_blob(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub fn embedding_from_blob(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct Failing;

    impl Embedder for Failing {
        fn name(&self) -> &str {
            "failing"
        }
        fn embed<'a>(&'a self, _text: &'a str) -> BoxFuture<'a, Result<Vec<f32>, ModelError>> {
            Box::pin(async { Err(ModelError::Transient { status: Some(503), detail: "down".into() }) })
        }
    }

    #[test]
    fn values_are_read() {
        let body = json!({"embedding": {"values": [0.25, -1.0, 0.5]}});
        assert_eq!(embedding_values(&body).unwrap(), vec![0.25, -1.0, 0.5]);
        assert!(embedding_values(&json!({"embedding": {"values": []}})).is_err());
        assert!(embedding_values(&json!({"error": {}})).is_err());
    }

    #[test]
    fn request_asks_for_configured_dimensions() {
        let body = GeminiEmbedder::new("k").with_dimensions(256).request_body("x");
        assert_eq!(body["outputDimensionality"], 256);
        assert_eq!(body["model"], "models/gemini-embedding-001");
    }

    #[test]
    fn blob_round_trip_is_lossless() {
        let v = vec![1.5f32, -0.125, 3.0e-7];
        assert_eq!(embedding_from_blob(&embedding_to_blob(&v)), v);
    }

    #[tokio::test]
    async fn failure_is_absorbed() {
        let policy = RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
            multiplier: 1.0,
            jitter: Duration::ZERO,
            timeout: Duration::from_secs(1),
        };
        assert_eq!(embed_or_skip(&Failing, &policy, "General Topology").await, None);
        assert_eq!(embed_or_skip(&Failing, &policy, "   ").await, None);
    }
}
