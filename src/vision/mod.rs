//! Vision model boundary.
//!
//! A [`VisionModel`] knows three things: how to upload a file, how to ask
//! one question about uploaded files, and how to delete an upload. Retry,
//! upload lifecycle and response validation live above this seam in
//! [`crate::pipeline::extract`], so every backend gets them for free.
//!
//! Backends:
//! * [`gemini::GeminiVision`]: Gemini Files API + `generateContent` over
//!   `reqwest`; uploads are real remote files.
//! * [`llm::ProviderVision`]: any `edgequake-llm` provider; a PDF "upload"
//!   rasterises its pages into PNG attachments held under a local handle.

pub mod gemini;
pub mod llm;

use crate::error::ModelError;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Handle to an uploaded file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFile {
    /// Provider resource name, used for deletion (`files/abc123`).
    pub name: String,
    /// URI referenced from generation requests.
    pub uri: String,
    pub mime_type: String,
    /// RFC 3339 expiry reported by the provider, if any.
    pub expires_at: Option<String>,
}

/// One structured-output request.
#[derive(Debug, Clone)]
pub struct GenerationRequest<'a> {
    pub files: &'a [RemoteFile],
    pub instructions: &'a str,
    pub temperature: f32,
    pub max_output_tokens: usize,
}

/// A remote reasoning model that reads uploaded documents.
pub trait VisionModel: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &str;

    fn upload<'a>(&'a self, path: &'a Path, mime_type: &'a str) -> BoxFuture<'a, Result<RemoteFile, ModelError>>;

    /// Raw response text; expected to be JSON.
    fn generate<'a>(&'a self, request: GenerationRequest<'a>) -> BoxFuture<'a, Result<String, ModelError>>;

    fn delete<'a>(&'a self, file: &'a RemoteFile) -> BoxFuture<'a, Result<(), ModelError>>;
}
