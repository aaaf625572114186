//! [`VisionModel`] over any `edgequake-llm` provider.
//!
//! Chat-completion providers cannot read a PDF by reference, so "upload"
//! rasterises every page of the slice with pdfium, PNG-encodes it and keeps
//! the attachments under a local handle until `delete` drops them.
//! `generate` sends the instructions plus all staged pages in one user turn.

use super::{GenerationRequest, RemoteFile, VisionModel};
use crate::error::{ModelError, PipelineError};
use crate::pipeline::slice::bind_pdfium;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::{ChatMessage, CompletionOptions, ImageData, LLMProvider, ProviderFactory};
use futures::future::BoxFuture;
use image::DynamicImage;
use pdfium_render::prelude::*;
use std::collections::HashMap;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Longest rendered edge in pixels.
pub const DEFAULT_MAX_PIXELS: u32 = 1600;

const FALLBACK_MODEL: &str = "gpt-4.1-nano";

pub struct ProviderVision {
    provider: Arc<dyn LLMProvider>,
    label: String,
    pdfium_library: Option<PathBuf>,
    max_pixels: u32,
    staged: Mutex<HashMap<String, Vec<ImageData>>>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for ProviderVision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderVision")
            .field("provider", &self.label)
            .field("max_pixels", &self.max_pixels)
            .finish()
    }
}

impl ProviderVision {
    pub fn new(provider: Arc<dyn LLMProvider>) -> Self {
        Self {
            provider,
            label: "edgequake-llm".to_string(),
            pdfium_library: std::env::var_os("PDFIUM_LIB_PATH").map(PathBuf::from),
            max_pixels: DEFAULT_MAX_PIXELS,
            staged: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Resolve a provider from the environment and wrap it.
    pub fn from_env(provider_name: Option<&str>, model: Option<&str>) -> Result<Self, PipelineError> {
        let vision = resolve_provider(provider_name, model).map(Self::new)?;
        Ok(match provider_name {
            Some(name) => vision.with_label(name),
            None => vision,
        })
    }

    /// Name reported in logs.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_max_pixels(mut self, px: u32) -> Self {
        self.max_pixels = px.max(256);
        self
    }

    pub fn with_pdfium_library(mut self, path: impl Into<PathBuf>) -> Self {
        self.pdfium_library = Some(path.into());
        self
    }

    /// Number of uploads not yet deleted.
    pub fn staged_count(&self) -> usize {
        self.staged.lock().map(|m| m.len()).unwrap_or(0)
    }
}

fn create_provider(name: &str, model: &str) -> Result<Arc<dyn LLMProvider>, PipelineError> {
    ProviderFactory::create_llm_provider(name, model).map_err(|e| PipelineError::BackendNotConfigured {
        backend: name.to_string(),
        hint: format!("{e}"),
    })
}

/// Explicit name, then `EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL`, then an
/// OpenAI key, then whatever the factory detects.
pub fn resolve_provider(
    provider_name: Option<&str>,
    model: Option<&str>,
) -> Result<Arc<dyn LLMProvider>, PipelineError> {
    if let Some(name) = provider_name {
        return create_provider(name, model.unwrap_or(FALLBACK_MODEL));
    }

    if let (Ok(prov), Ok(model)) = (
        std::env::var("EDGEQUAKE_LLM_PROVIDER"),
        std::env::var("EDGEQUAKE_MODEL"),
    ) {
        if !prov.is_empty() && !model.is_empty() {
            return create_provider(&prov, &model);
        }
    }

    if std::env::var("OPENAI_API_KEY").map(|k| !k.is_empty()).unwrap_or(false) {
        return create_provider("openai", model.unwrap_or(FALLBACK_MODEL));
    }

    let (llm, _embedding) = ProviderFactory::from_env().map_err(|e| PipelineError::BackendNotConfigured {
        backend: "auto".to_string(),
        hint: format!(
            "No LLM provider could be detected from the environment.\n\
             Set GEMINI_API_KEY, OPENAI_API_KEY or ANTHROPIC_API_KEY.\n\
             Error: {e}"
        ),
    })?;
    Ok(llm)
}

/// Map a provider error message onto [`ModelError`].
///
/// `edgequake-llm` reports HTTP failures as text, so the status is sniffed
/// from the message.
pub fn classify_provider_error(message: &str) -> ModelError {
    let lower = message.to_lowercase();
    let detail = message.to_string();
    if lower.contains("429") || lower.contains("rate limit") || lower.contains("quota") {
        ModelError::RateLimited { retry_after: None }
    } else if lower.contains("401") || lower.contains("403") || lower.contains("api key") || lower.contains("unauthorized") {
        ModelError::Auth { detail }
    } else if lower.contains("400") || lower.contains("invalid request") {
        ModelError::Rejected { status: Some(400), detail }
    } else if lower.contains("timed out") || lower.contains("timeout") {
        ModelError::Timeout {
            elapsed: std::time::Duration::ZERO,
        }
    } else {
        ModelError::Transient { status: None, detail }
    }
}

/// PNG-encode one rendered page.
pub fn encode_page(img: &DynamicImage) -> Result<ImageData, image::ImageError> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)?;
    Ok(ImageData::new(STANDARD.encode(&buf), "image/png").with_detail("high"))
}

fn render_blocking(path: &Path, library: Option<&Path>, max_pixels: u32) -> Result<Vec<ImageData>, ModelError> {
    let io = |detail: String| ModelError::Io { detail };
    let pdfium = bind_pdfium(library).map_err(|e| io(e.to_string()))?;
    let document = pdfium
        .load_pdf_from_file(path, None)
        .map_err(|e| io(format!("{}: {:?}", path.display(), e)))?;
    let render_config = PdfRenderConfig::new()
        .set_target_width(max_pixels as i32)
        .set_maximum_height(max_pixels as i32);

    let mut images = Vec::new();
    for (idx, page) in document.pages().iter().enumerate() {
        let bitmap = page
            .render_with_config(&render_config)
            .map_err(|e| io(format!("page {}: {:?}", idx + 1, e)))?;
        let image = bitmap.as_image();
        images.push(encode_page(&image).map_err(|e| io(format!("page {}: {}", idx + 1, e)))?);
    }
    Ok(images)
}

impl VisionModel for ProviderVision {
    fn name(&self) -> &str {
        &self.label
    }

    fn upload<'a>(&'a self, path: &'a Path, mime_type: &'a str) -> BoxFuture<'a, Result<RemoteFile, ModelError>> {
        Box::pin(async move {
            if mime_type != "application/pdf" {
                return Err(ModelError::Rejected {
                    status: None,
                    detail: format!("{} cannot be rendered locally", mime_type),
                });
            }
            let lib = self.pdfium_library.clone();
            let owned = path.to_path_buf();
            let max_pixels = self.max_pixels;
            let images = tokio::task::spawn_blocking(move || render_blocking(&owned, lib.as_deref(), max_pixels))
                .await
                .map_err(|e| ModelError::Io {
                    detail: format!("render task panicked: {}", e),
                })??;

            let name = format!("local/{}", self.next_id.fetch_add(1, Ordering::Relaxed));
            debug!("Staged {} rendered pages as {}", images.len(), name);
            self.staged
                .lock()
                .map_err(|_| ModelError::Io {
                    detail: "staging lock poisoned".into(),
                })?
                .insert(name.clone(), images);
            Ok(RemoteFile {
                uri: format!("local://{}", name),
                name,
                mime_type: mime_type.to_string(),
                expires_at: None,
            })
        })
    }

    fn generate<'a>(&'a self, request: GenerationRequest<'a>) -> BoxFuture<'a, Result<String, ModelError>> {
        Box::pin(async move {
            let images: Vec<ImageData> = {
                let staged = self.staged.lock().map_err(|_| ModelError::Io {
                    detail: "staging lock poisoned".into(),
                })?;
                let mut out = Vec::new();
                for file in request.files {
                    match staged.get(&file.name) {
                        Some(pages) => out.extend(pages.iter().cloned()),
                        None => {
                            return Err(ModelError::Rejected {
                                status: None,
                                detail: format!("unknown file handle {}", file.name),
                            })
                        }
                    }
                }
                out
            };

            let messages = vec![ChatMessage::user_with_images(request.instructions, images)];
            let options = CompletionOptions {
                temperature: Some(request.temperature),
                max_tokens: Some(request.max_output_tokens),
                ..Default::default()
            };
            let response = self
                .provider
                .chat(&messages, Some(&options))
                .await
                .map_err(|e| classify_provider_error(&e.to_string()))?;
            debug!(
                "{}: {} input tokens, {} output tokens",
                self.label,
                response.prompt_tokens,
                response.completion_tokens
            );
            Ok(response.content)
        })
    }

    fn delete<'a>(&'a self, file: &'a RemoteFile) -> BoxFuture<'a, Result<(), ModelError>> {
        Box::pin(async move {
            match self.staged.lock() {
                Ok(mut staged) => {
                    if staged.remove(&file.name).is_none() {
                        warn!("Delete of unknown handle {}", file.name);
                    }
                    Ok(())
                }
                Err(_) => Err(ModelError::Io {
                    detail: "staging lock poisoned".into(),
                }),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};

    #[test]
    fn encode_small_image() {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(10, 10, Rgba([255, 0, 0, 255])));
        let data = encode_page(&img).expect("encode should succeed");
        assert_eq!(data.mime_type, "image/png");
        let decoded = STANDARD.decode(&data.data).expect("valid base64");
        assert_eq!(&decoded[1..4], b"PNG");
    }

    #[test]
    fn provider_errors_are_classified() {
        assert!(matches!(
            classify_provider_error("HTTP 429 Too Many Requests"),
            ModelError::RateLimited { .. }
        ));
        assert!(matches!(
            classify_provider_error("401 Unauthorized: invalid api key"),
            ModelError::Auth { .. }
        ));
        assert!(matches!(
            classify_provider_error("400 invalid request: image too large"),
            ModelError::Rejected { .. }
        ));
        assert!(matches!(
            classify_provider_error("connection reset by peer"),
            ModelError::Transient { .. }
        ));
    }
}
