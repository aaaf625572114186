//! Configuration for a metadata-resolution run.
//!
//! Every knob lives in one immutable [`PipelineConfig`], built via
//! [`PipelineConfigBuilder`] and handed to the
//! [`Orchestrator`](crate::orchestrator::Orchestrator). The same config can be
//! shared by concurrent runs; nothing in it is mutated once built.
//!
//! Deployments that keep settings on disk can layer a TOML [`ConfigFile`] over
//! the defaults with [`PipelineConfigBuilder::apply_file`].

use crate::error::PipelineError;
use crate::progress::PipelineObserver;
use crate::retry::RetryPolicy;
use crate::state::PlanLimits;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Default model for extraction and reflection.
pub const DEFAULT_MODEL: &str = "gemini-2.5-flash-lite";

/// TCP connect limit for every outbound HTTP client.
pub const HTTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTP client with a connect limit and an overall request limit.
///
/// `request_timeout` is a backstop above the retry policy's per-call
/// timeout, so a stalled body read is cut even when nothing else fires.
pub fn http_client(request_timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .connect_timeout(HTTP_CONNECT_TIMEOUT)
        .timeout(request_timeout)
        .pool_idle_timeout(Duration::from_secs(30))
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

/// Configuration for the metadata-resolution pipeline.
///
/// # Example
/// ```rust
/// use edgequake_bookmeta::PipelineConfig;
///
/// let config = PipelineConfig::builder()
///     .bibliography_chunk_pages(10)
///     .title_match_threshold(0.85)
///     .crossref_mailto("librarian@example.org")
///     .build()
///     .unwrap();
/// assert_eq!(config.front_scan_pages, 50);
/// ```
#[derive(Clone)]
pub struct PipelineConfig {
    // ── Locator ──────────────────────────────────────────────────────────
    /// Pages scanned from the start for a table-of-contents heading. Default: 50.
    pub front_scan_pages: usize,

    /// Pages scanned from the end for a bibliography heading. Default: 150.
    pub back_scan_pages: usize,

    /// Length of the front-matter range, also counted from the ToC page when
    /// one is found. Default: 20.
    pub front_matter_pages: usize,

    /// A heading only counts when it appears within this many characters
    /// from the top of the page. Default: 500.
    pub marker_window_chars: usize,

    /// Average characters per page below which a document is treated as a
    /// scan without a text layer. Default: 40.
    pub scanned_chars_per_page: usize,

    /// Tail pages sent as bibliography when no bibliography heading was
    /// found. Default: 30.
    pub fallback_tail_pages: usize,

    // ── Extraction ───────────────────────────────────────────────────────
    /// Bibliography chunk size in pages. Range: 1–50. Default: 10.
    pub bibliography_chunk_pages: usize,

    /// Pages shared between consecutive bibliography chunks. Default: 0.
    ///
    /// With overlap enabled, a citation identical to one in the previous
    /// chunk is dropped; otherwise boundary citations are kept as read.
    pub chunk_overlap_pages: usize,

    /// Model identifier for extraction and reflection. Default: [`DEFAULT_MODEL`].
    pub model: String,

    /// Sampling temperature. Default: 0.1.
    pub temperature: f32,

    /// Maximum tokens the model may generate per slice. Default: 8192.
    pub max_output_tokens: usize,

    /// Retry policy for upload and generation calls.
    pub extraction_retry: RetryPolicy,

    // ── Verification ─────────────────────────────────────────────────────
    /// Retry policy for registry calls. Default: 2 attempts, 20 s timeout.
    pub registry_retry: RetryPolicy,

    /// Minimum spacing between calls to one registry. Default: 1 s.
    pub registry_min_interval: Duration,

    /// Contact address sent in the registry `User-Agent`.
    pub crossref_mailto: Option<String>,

    /// Title similarity (0–1) above which a registry record is the same work.
    /// Default: 0.80.
    pub title_match_threshold: f64,

    /// Upper bound on registry searches for bibliography entries. Default: 50.
    ///
    /// Entries past the bound are stored with confidence 0.0.
    pub max_citation_lookups: usize,

    // ── Reflection ───────────────────────────────────────────────────────
    /// Run the reflection pass when conflicts remain. Default: true.
    pub reflection_enabled: bool,

    /// Attach a fresh front-matter slice to the reflection call. Default: true.
    pub reflection_grounding: bool,

    // ── Persistence and enrichment ───────────────────────────────────────
    /// Commit attempts (initial + retries). Default: 2.
    pub persistence_attempts: u32,

    /// Compute a document embedding before commit. Default: true.
    pub embedding_enabled: bool,

    /// Retry policy for embedding calls.
    pub embedding_retry: RetryPolicy,

    /// Pages of text handed to the search indexer. Default: 5.
    pub index_sample_pages: usize,

    /// Documents processed concurrently by `run_batch`. Default: 2.
    pub document_concurrency: usize,

    /// Observer receiving run events. Default: none.
    pub observer: Option<Arc<dyn PipelineObserver>>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            front_scan_pages: 50,
            back_scan_pages: 150,
            front_matter_pages: 20,
            marker_window_chars: 500,
            scanned_chars_per_page: 40,
            fallback_tail_pages: 30,
            bibliography_chunk_pages: 10,
            chunk_overlap_pages: 0,
            model: DEFAULT_MODEL.to_string(),
            temperature: 0.1,
            max_output_tokens: 8192,
            extraction_retry: RetryPolicy::default(),
            registry_retry: RetryPolicy {
                max_attempts: 2,
                timeout: Duration::from_secs(20),
                ..RetryPolicy::default()
            },
            registry_min_interval: Duration::from_secs(1),
            crossref_mailto: None,
            title_match_threshold: 0.80,
            max_citation_lookups: 50,
            reflection_enabled: true,
            reflection_grounding: true,
            persistence_attempts: 2,
            embedding_enabled: true,
            embedding_retry: RetryPolicy {
                max_attempts: 2,
                timeout: Duration::from_secs(30),
                ..RetryPolicy::default()
            },
            index_sample_pages: 5,
            document_concurrency: 2,
            observer: None,
        }
    }
}

impl fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfig")
            .field("front_scan_pages", &self.front_scan_pages)
            .field("back_scan_pages", &self.back_scan_pages)
            .field("front_matter_pages", &self.front_matter_pages)
            .field("fallback_tail_pages", &self.fallback_tail_pages)
            .field("bibliography_chunk_pages", &self.bibliography_chunk_pages)
            .field("chunk_overlap_pages", &self.chunk_overlap_pages)
            .field("model", &self.model)
            .field("extraction_retry", &self.extraction_retry)
            .field("registry_retry", &self.registry_retry)
            .field("crossref_mailto", &self.crossref_mailto.as_ref().map(|_| "<set>"))
            .field("title_match_threshold", &self.title_match_threshold)
            .field("max_citation_lookups", &self.max_citation_lookups)
            .field("reflection_enabled", &self.reflection_enabled)
            .field("persistence_attempts", &self.persistence_attempts)
            .field("document_concurrency", &self.document_concurrency)
            .field("observer", &self.observer.as_ref().map(|_| "<dyn PipelineObserver>"))
            .finish()
    }
}

impl PipelineConfig {
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: Self::default(),
        }
    }

    pub(crate) fn plan_limits(&self) -> PlanLimits {
        PlanLimits {
            front_matter_pages: self.front_matter_pages,
            fallback_tail_pages: self.fallback_tail_pages,
            chunk_pages: self.bibliography_chunk_pages,
            chunk_overlap_pages: self.chunk_overlap_pages,
        }
    }
}

/// Builder for [`PipelineConfig`].
#[derive(Debug)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    pub fn front_scan_pages(mut self, n: usize) -> Self {
        self.config.front_scan_pages = n.max(1);
        self
    }

    pub fn back_scan_pages(mut self, n: usize) -> Self {
        self.config.back_scan_pages = n.max(1);
        self
    }

    pub fn front_matter_pages(mut self, n: usize) -> Self {
        self.config.front_matter_pages = n.max(1);
        self
    }

    pub fn marker_window_chars(mut self, n: usize) -> Self {
        self.config.marker_window_chars = n.max(20);
        self
    }

    pub fn scanned_chars_per_page(mut self, n: usize) -> Self {
        self.config.scanned_chars_per_page = n;
        self
    }

    pub fn fallback_tail_pages(mut self, n: usize) -> Self {
        self.config.fallback_tail_pages = n;
        self
    }

    pub fn bibliography_chunk_pages(mut self, n: usize) -> Self {
        self.config.bibliography_chunk_pages = n.clamp(1, 50);
        self
    }

    pub fn chunk_overlap_pages(mut self, n: usize) -> Self {
        self.config.chunk_overlap_pages = n;
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = model.into();
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_output_tokens(mut self, n: usize) -> Self {
        self.config.max_output_tokens = n;
        self
    }

    pub fn extraction_retry(mut self, policy: RetryPolicy) -> Self {
        self.config.extraction_retry = policy;
        self
    }

    pub fn registry_retry(mut self, policy: RetryPolicy) -> Self {
        self.config.registry_retry = policy;
        self
    }

    pub fn registry_min_interval(mut self, interval: Duration) -> Self {
        self.config.registry_min_interval = interval;
        self
    }

    pub fn crossref_mailto(mut self, mailto: impl Into<String>) -> Self {
        self.config.crossref_mailto = Some(mailto.into());
        self
    }

    pub fn title_match_threshold(mut self, t: f64) -> Self {
        self.config.title_match_threshold = t.clamp(0.0, 1.0);
        self
    }

    pub fn max_citation_lookups(mut self, n: usize) -> Self {
        self.config.max_citation_lookups = n;
        self
    }

    pub fn reflection_enabled(mut self, v: bool) -> Self {
        self.config.reflection_enabled = v;
        self
    }

    pub fn reflection_grounding(mut self, v: bool) -> Self {
        self.config.reflection_grounding = v;
        self
    }

    pub fn persistence_attempts(mut self, n: u32) -> Self {
        self.config.persistence_attempts = n.max(1);
        self
    }

    pub fn embedding_enabled(mut self, v: bool) -> Self {
        self.config.embedding_enabled = v;
        self
    }

    pub fn embedding_retry(mut self, policy: RetryPolicy) -> Self {
        self.config.embedding_retry = policy;
        self
    }

    pub fn index_sample_pages(mut self, n: usize) -> Self {
        self.config.index_sample_pages = n;
        self
    }

    pub fn document_concurrency(mut self, n: usize) -> Self {
        self.config.document_concurrency = n.max(1);
        self
    }

    pub fn observer(mut self, observer: Arc<dyn PipelineObserver>) -> Self {
        self.config.observer = Some(observer);
        self
    }

    /// Overlay the values present in a [`ConfigFile`].
    pub fn apply_file(mut self, file: &ConfigFile) -> Self {
        if let Some(l) = &file.locator {
            if let Some(v) = l.front_scan_pages {
                self = self.front_scan_pages(v);
            }
            if let Some(v) = l.back_scan_pages {
                self = self.back_scan_pages(v);
            }
            if let Some(v) = l.front_matter_pages {
                self = self.front_matter_pages(v);
            }
            if let Some(v) = l.fallback_tail_pages {
                self = self.fallback_tail_pages(v);
            }
        }
        if let Some(e) = &file.extraction {
            if let Some(v) = &e.model {
                self = self.model(v.clone());
            }
            if let Some(v) = e.bibliography_chunk_pages {
                self = self.bibliography_chunk_pages(v);
            }
            if let Some(v) = e.chunk_overlap_pages {
                self = self.chunk_overlap_pages(v);
            }
            if let Some(v) = e.max_attempts {
                self.config.extraction_retry.max_attempts = v.max(1);
            }
            if let Some(v) = e.timeout_secs {
                self.config.extraction_retry.timeout = Duration::from_secs(v.max(1));
            }
        }
        if let Some(v) = &file.verification {
            if let Some(m) = &v.crossref_mailto {
                self = self.crossref_mailto(m.clone());
            }
            if let Some(t) = v.title_match_threshold {
                self = self.title_match_threshold(t);
            }
            if let Some(n) = v.max_citation_lookups {
                self = self.max_citation_lookups(n);
            }
            if let Some(ms) = v.min_interval_ms {
                self = self.registry_min_interval(Duration::from_millis(ms));
            }
        }
        if let Some(p) = &file.pipeline {
            if let Some(v) = p.reflection_enabled {
                self = self.reflection_enabled(v);
            }
            if let Some(v) = p.embedding_enabled {
                self = self.embedding_enabled(v);
            }
            if let Some(v) = p.document_concurrency {
                self = self.document_concurrency(v);
            }
        }
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<PipelineConfig, PipelineError> {
        let c = &self.config;
        if c.chunk_overlap_pages >= c.bibliography_chunk_pages {
            return Err(PipelineError::InvalidConfig(format!(
                "chunk overlap ({}) must be smaller than the chunk size ({})",
                c.chunk_overlap_pages, c.bibliography_chunk_pages
            )));
        }
        if c.model.trim().is_empty() {
            return Err(PipelineError::InvalidConfig("model must not be empty".into()));
        }
        if c.registry_min_interval.is_zero() {
            return Err(PipelineError::InvalidConfig(
                "registry_min_interval must be > 0".into(),
            ));
        }
        if !(0.0..=1.0).contains(&c.title_match_threshold) {
            return Err(PipelineError::InvalidConfig(format!(
                "title_match_threshold must be 0–1, got {}",
                c.title_match_threshold
            )));
        }
        Ok(self.config)
    }
}

// ── TOML overlay ─────────────────────────────────────────────────────────

/// On-disk configuration. Every field is optional; absent values keep the
/// builder defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    pub locator: Option<LocatorSection>,
    pub extraction: Option<ExtractionSection>,
    pub verification: Option<VerificationSection>,
    pub pipeline: Option<PipelineSection>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LocatorSection {
    pub front_scan_pages: Option<usize>,
    pub back_scan_pages: Option<usize>,
    pub front_matter_pages: Option<usize>,
    pub fallback_tail_pages: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractionSection {
    pub model: Option<String>,
    pub bibliography_chunk_pages: Option<usize>,
    pub chunk_overlap_pages: Option<usize>,
    pub max_attempts: Option<u32>,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VerificationSection {
    pub crossref_mailto: Option<String>,
    pub title_match_threshold: Option<f64>,
    pub max_citation_lookups: Option<usize>,
    pub min_interval_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineSection {
    pub reflection_enabled: Option<bool>,
    pub embedding_enabled: Option<bool>,
    pub document_concurrency: Option<usize>,
}

impl ConfigFile {
    pub fn from_toml(content: &str) -> Result<Self, PipelineError> {
        toml::from_str(content).map_err(|e| PipelineError::InvalidConfig(e.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self, PipelineError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::InvalidConfig(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&content)
    }

    /// `overlay` values win over `self`, section by section.
    pub fn merge(self, overlay: ConfigFile) -> ConfigFile {
        ConfigFile {
            locator: merge_section(self.locator, overlay.locator, |b, o| LocatorSection {
                front_scan_pages: o.front_scan_pages.or(b.front_scan_pages),
                back_scan_pages: o.back_scan_pages.or(b.back_scan_pages),
                front_matter_pages: o.front_matter_pages.or(b.front_matter_pages),
                fallback_tail_pages: o.fallback_tail_pages.or(b.fallback_tail_pages),
            }),
            extraction: merge_section(self.extraction, overlay.extraction, |b, o| ExtractionSection {
                model: o.model.or(b.model),
                bibliography_chunk_pages: o.bibliography_chunk_pages.or(b.bibliography_chunk_pages),
                chunk_overlap_pages: o.chunk_overlap_pages.or(b.chunk_overlap_pages),
                max_attempts: o.max_attempts.or(b.max_attempts),
                timeout_secs: o.timeout_secs.or(b.timeout_secs),
            }),
            verification: merge_section(self.verification, overlay.verification, |b, o| {
                VerificationSection {
                    crossref_mailto: o.crossref_mailto.or(b.crossref_mailto),
                    title_match_threshold: o.title_match_threshold.or(b.title_match_threshold),
                    max_citation_lookups: o.max_citation_lookups.or(b.max_citation_lookups),
                    min_interval_ms: o.min_interval_ms.or(b.min_interval_ms),
                }
            }),
            pipeline: merge_section(self.pipeline, overlay.pipeline, |b, o| PipelineSection {
                reflection_enabled: o.reflection_enabled.or(b.reflection_enabled),
                embedding_enabled: o.embedding_enabled.or(b.embedding_enabled),
                document_concurrency: o.document_concurrency.or(b.document_concurrency),
            }),
        }
    }
}

fn merge_section<T>(base: Option<T>, overlay: Option<T>, f: impl FnOnce(T, T) -> T) -> Option<T> {
    match (base, overlay) {
        (None, None) => None,
        (Some(b), None) => Some(b),
        (None, Some(o)) => Some(o),
        (Some(b), Some(o)) => Some(f(b, o)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let c = PipelineConfig::default();
        assert_eq!(c.front_scan_pages, 50);
        assert_eq!(c.back_scan_pages, 150);
        assert_eq!(c.bibliography_chunk_pages, 10);
        assert_eq!(c.registry_min_interval, Duration::from_secs(1));
        assert_eq!(c.persistence_attempts, 2);
        assert!((c.title_match_threshold - 0.80).abs() < f64::EPSILON);
    }

    #[test]
    fn builder_clamps() {
        let c = PipelineConfig::builder()
            .bibliography_chunk_pages(500)
            .title_match_threshold(3.0)
            .document_concurrency(0)
            .build()
            .unwrap();
        assert_eq!(c.bibliography_chunk_pages, 50);
        assert_eq!(c.title_match_threshold, 1.0);
        assert_eq!(c.document_concurrency, 1);
    }

    #[test]
    fn overlap_must_be_smaller_than_chunk() {
        let err = PipelineConfig::builder()
            .bibliography_chunk_pages(5)
            .chunk_overlap_pages(5)
            .build()
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidConfig(_)));
    }

    #[test]
    fn debug_hides_mailto() {
        let c = PipelineConfig::builder()
            .crossref_mailto("secret@example.org")
            .build()
            .unwrap();
        let dbg = format!("{:?}", c);
        assert!(!dbg.contains("secret@example.org"));
    }

    #[test]
    fn toml_overlay_applies_present_values_only() {
        let file = ConfigFile::from_toml(
            r#"
            [extraction]
            bibliography_chunk_pages = 8
            max_attempts = 5

            [verification]
            crossref_mailto = "ops@example.org"
            "#,
        )
        .unwrap();
        let c = PipelineConfig::builder().apply_file(&file).build().unwrap();
        assert_eq!(c.bibliography_chunk_pages, 8);
        assert_eq!(c.extraction_retry.max_attempts, 5);
        assert_eq!(c.crossref_mailto.as_deref(), Some("ops@example.org"));
        assert_eq!(c.front_scan_pages, 50);
    }

    #[test]
    fn merge_prefers_overlay() {
        let base = ConfigFile::from_toml("[extraction]\nmodel = \"a\"\nchunk_overlap_pages = 1").unwrap();
        let overlay = ConfigFile::from_toml("[extraction]\nmodel = \"b\"").unwrap();
        let merged = base.merge(overlay);
        let e = merged.extraction.unwrap();
        assert_eq!(e.model.as_deref(), Some("b"));
        assert_eq!(e.chunk_overlap_pages, Some(1));
    }

    #[test]
    fn bad_toml_is_invalid_config() {
        assert!(matches!(
            ConfigFile::from_toml("[extraction\n"),
            Err(PipelineError::InvalidConfig(_))
        ));
    }
}
