//! Error types for the edgequake-bookmeta library.
//!
//! Two tiers of failure, mirroring the two tiers of the pipeline:
//!
//! * [`PipelineError`]: **Fatal** for one run: the document cannot be opened,
//!   no slice produced usable metadata, persistence failed twice, or the run
//!   was cancelled. Returned inside [`crate::orchestrator::RunFailure`].
//!
//! * Phase-local errors: [`SliceError`], [`ModelError`], [`RegistryError`],
//!   [`PersistenceError`] and [`ExtractionFailure`]. A single bad slice or a
//!   single unreachable registry never aborts the run; these are recorded
//!   as reduced-confidence data instead.
//!
//! Every error maps onto one [`FailureKind`] so logs and reports can be
//! grouped by the recovery policy that applies to them.

use crate::model::{Field, PageRange};
use crate::state::Phase;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Recovery class of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum FailureKind {
    /// Slice creation failed; the range is skipped.
    RecoverableIo,
    /// Network hiccup, 5xx, 429 or timeout; retried with backoff.
    TransientNetwork,
    /// The model answered with something that is not the expected JSON.
    ParseFailure,
    /// A registry could not be reached; treated as neutral evidence.
    VerificationUnavailable,
    /// A field stayed ambiguous after reflection and precedence.
    IrreconcilableConflict,
    /// The atomic commit failed.
    PersistenceFailure,
    /// Anything that is neither transient nor recoverable.
    Fatal,
}

impl FailureKind {
    /// Short stable code used in structured log fields.
    pub fn code(&self) -> &'static str {
        match self {
            FailureKind::RecoverableIo => "recoverable_io",
            FailureKind::TransientNetwork => "transient_network",
            FailureKind::ParseFailure => "parse_failure",
            FailureKind::VerificationUnavailable => "verification_unavailable",
            FailureKind::IrreconcilableConflict => "irreconcilable_conflict",
            FailureKind::PersistenceFailure => "persistence_failure",
            FailureKind::Fatal => "fatal",
        }
    }
}

/// All run-level errors.
#[derive(Debug, Error)]
pub enum PipelineError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("Document not found: '{path}'")]
    FileNotFound { path: PathBuf },

    /// Process does not have read permission on the file.
    #[error("Permission denied reading '{path}'")]
    PermissionDenied { path: PathBuf },

    /// The file exists but is neither a PDF nor a DjVu document.
    #[error("Unsupported document format for '{path}' (first bytes: {magic:?})")]
    UnsupportedFormat { path: PathBuf, magic: [u8; 4] },

    /// The source could not be opened at all (corrupt header, conversion failed).
    #[error("Document '{path}' could not be opened: {detail}")]
    Unreadable { path: PathBuf, detail: String },

    // ── Run errors ────────────────────────────────────────────────────────
    /// Every slice failed; there is nothing to resolve.
    #[error("No usable metadata: all {total} slices failed. First error: {first_error}")]
    NoUsableMetadata { total: usize, first_error: String },

    /// The atomic commit failed on the initial attempt and on the retry.
    #[error("Persistence failed after {attempts} attempts: {source}")]
    PersistenceExhausted {
        attempts: u32,
        #[source]
        source: PersistenceError,
    },

    /// The run was cancelled between phases.
    #[error("Run cancelled before entering {phase:?}")]
    Cancelled { phase: Phase },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A backend (model, registry, storage) is not configured.
    #[error("Backend '{backend}' is not configured.\n{hint}")]
    BackendNotConfigured { backend: String, hint: String },

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error (task panic, runtime failure).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    pub fn kind(&self) -> FailureKind {
        match self {
            PipelineError::PersistenceExhausted { .. } => FailureKind::PersistenceFailure,
            PipelineError::NoUsableMetadata { .. } => FailureKind::ParseFailure,
            _ => FailureKind::Fatal,
        }
    }
}

/// Slicing and page-text failures. Always recoverable at run level.
#[derive(Debug, Clone, Error)]
pub enum SliceError {
    /// Range lies (partly) outside the document.
    #[error("Range {range} is out of bounds (document has {total} pages)")]
    OutOfRange { range: PageRange, total: usize },

    /// The source file is corrupt or could not be parsed.
    #[error("Source '{path}' is corrupt: {detail}")]
    CorruptSource { path: PathBuf, detail: String },

    /// Writing the sub-document or reading text failed.
    #[error("I/O error while slicing {range}: {detail}")]
    Io { range: PageRange, detail: String },

    /// pdfium could not be bound.
    #[error("Failed to bind to pdfium library: {0}")]
    Binding(String),
}

impl SliceError {
    pub fn kind(&self) -> FailureKind {
        FailureKind::RecoverableIo
    }
}

/// Failures talking to the reasoning model.
#[derive(Debug, Clone, Error)]
pub enum ModelError {
    /// Network error or 5xx. Retryable.
    #[error("Transient model error{}: {detail}", status.map(|s| format!(" (HTTP {s})")).unwrap_or_default())]
    Transient { status: Option<u16>, detail: String },

    /// HTTP 429. Retryable.
    #[error("Model rate limit exceeded")]
    RateLimited { retry_after: Option<Duration> },

    /// The call exceeded its timeout. Retryable.
    #[error("Model call timed out after {}ms", elapsed.as_millis())]
    Timeout { elapsed: Duration },

    /// 401/403. Not retryable.
    #[error("Authentication error from model provider: {detail}")]
    Auth { detail: String },

    /// Response body was not the expected JSON. Not retryable.
    #[error("Malformed model response: {detail}")]
    Malformed { detail: String },

    /// Anything else the provider rejects (400, unsupported file). Not retryable.
    #[error("Model request rejected{}: {detail}", status.map(|s| format!(" (HTTP {s})")).unwrap_or_default())]
    Rejected { status: Option<u16>, detail: String },

    /// Local I/O while preparing an upload.
    #[error("Upload preparation failed: {detail}")]
    Io { detail: String },
}

impl ModelError {
    pub fn kind(&self) -> FailureKind {
        match self {
            ModelError::Transient { .. } | ModelError::RateLimited { .. } | ModelError::Timeout { .. } => {
                FailureKind::TransientNetwork
            }
            ModelError::Malformed { .. } => FailureKind::ParseFailure,
            ModelError::Io { .. } => FailureKind::RecoverableIo,
            ModelError::Auth { .. } | ModelError::Rejected { .. } => FailureKind::Fatal,
        }
    }

    /// Classify an HTTP status returned by a provider.
    pub fn from_status(status: u16, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        match status {
            429 => ModelError::RateLimited { retry_after: None },
            401 | 403 => ModelError::Auth { detail },
            500..=599 => ModelError::Transient {
                status: Some(status),
                detail,
            },
            _ => ModelError::Rejected {
                status: Some(status),
                detail,
            },
        }
    }
}

impl From<reqwest::Error> for ModelError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ModelError::Timeout {
                elapsed: Duration::ZERO,
            }
        } else if let Some(status) = e.status() {
            ModelError::from_status(status.as_u16(), e.to_string())
        } else if e.is_decode() {
            ModelError::Malformed {
                detail: e.to_string(),
            }
        } else {
            ModelError::Transient {
                status: None,
                detail: e.to_string(),
            }
        }
    }
}

/// Registry lookup failures. Never turned into a contradiction.
#[derive(Debug, Clone, Error)]
pub enum RegistryError {
    /// HTTP 429.
    #[error("{registry}: rate limited (429)")]
    RateLimited {
        registry: &'static str,
        retry_after: Option<Duration>,
    },

    /// Network error, 5xx or timeout.
    #[error("{registry}: unavailable: {detail}")]
    Unavailable { registry: &'static str, detail: String },

    /// The registry answered but the payload could not be read.
    #[error("{registry}: unexpected response: {detail}")]
    BadResponse { registry: &'static str, detail: String },
}

impl RegistryError {
    pub fn kind(&self) -> FailureKind {
        FailureKind::VerificationUnavailable
    }

    pub fn registry(&self) -> &'static str {
        match self {
            RegistryError::RateLimited { registry, .. }
            | RegistryError::Unavailable { registry, .. }
            | RegistryError::BadResponse { registry, .. } => registry,
        }
    }
}

/// Failures of the atomic commit.
#[derive(Debug, Clone, Error)]
pub enum PersistenceError {
    /// The DOI already anchors a different book.
    #[error("DOI '{doi}' already belongs to document '{existing}'")]
    DuplicateDoi { doi: String, existing: String },

    /// Storage backend error (locked database, disk full, …).
    #[error("Storage error: {0}")]
    Storage(String),
}

impl From<rusqlite::Error> for PersistenceError {
    fn from(e: rusqlite::Error) -> Self {
        PersistenceError::Storage(e.to_string())
    }
}

/// Why a single slice produced no batch.
///
/// Stored per slice in [`crate::state::SliceOutcome`]; the run continues
/// unless every slice fails.
#[derive(Debug, Clone, Error, serde::Serialize, serde::Deserialize)]
pub enum ExtractionFailure {
    /// The slice file could not be created.
    #[error("{range}: slice creation failed: {detail}")]
    SliceFailed { range: PageRange, detail: String },

    /// Upload or generation failed after all retries.
    #[error("{range}: model call failed after {attempts} attempts: {detail}")]
    ModelFailed {
        range: PageRange,
        attempts: u32,
        detail: String,
    },

    /// The response did not match the schema. Never retried.
    #[error("{range}: parse failure: {detail}")]
    ParseFailure { range: PageRange, detail: String },
}

impl ExtractionFailure {
    pub fn kind(&self) -> FailureKind {
        match self {
            ExtractionFailure::SliceFailed { .. } => FailureKind::RecoverableIo,
            ExtractionFailure::ModelFailed { .. } => FailureKind::TransientNetwork,
            ExtractionFailure::ParseFailure { .. } => FailureKind::ParseFailure,
        }
    }

    pub fn range(&self) -> PageRange {
        match self {
            ExtractionFailure::SliceFailed { range, .. }
            | ExtractionFailure::ModelFailed { range, .. }
            | ExtractionFailure::ParseFailure { range, .. } => *range,
        }
    }
}

/// A field that could not be settled; persisted as null with a review flag.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Field '{field}' is irreconcilable across {candidates} candidate values")]
pub struct IrreconcilableConflict {
    pub field: Field,
    pub candidates: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RangePurpose;

    #[test]
    fn status_classification() {
        assert!(matches!(
            ModelError::from_status(503, "overloaded"),
            ModelError::Transient { status: Some(503), .. }
        ));
        assert!(matches!(
            ModelError::from_status(429, ""),
            ModelError::RateLimited { .. }
        ));
        assert!(matches!(
            ModelError::from_status(401, "bad key"),
            ModelError::Auth { .. }
        ));
        assert!(matches!(
            ModelError::from_status(400, "bad request"),
            ModelError::Rejected { status: Some(400), .. }
        ));
    }

    #[test]
    fn failure_kinds_follow_recovery_policy() {
        assert_eq!(
            ModelError::Timeout {
                elapsed: Duration::from_secs(60)
            }
            .kind(),
            FailureKind::TransientNetwork
        );
        assert_eq!(
            ModelError::Malformed { detail: "x".into() }.kind(),
            FailureKind::ParseFailure
        );
        assert_eq!(
            RegistryError::Unavailable {
                registry: "Crossref",
                detail: "dns".into()
            }
            .kind(),
            FailureKind::VerificationUnavailable
        );
    }

    #[test]
    fn extraction_failure_display_carries_range() {
        let range = PageRange::new(10, 19, RangePurpose::Bibliography);
        let e = ExtractionFailure::ParseFailure {
            range,
            detail: "not json".into(),
        };
        let msg = e.to_string();
        assert!(msg.contains("11-20"), "got: {msg}");
        assert_eq!(e.range(), range);
    }

    #[test]
    fn transient_display_includes_status() {
        let e = ModelError::Transient {
            status: Some(502),
            detail: "bad gateway".into(),
        };
        assert!(e.to_string().contains("HTTP 502"));
    }
}
