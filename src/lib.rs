//! # edgequake-bookmeta
//!
//! Resolve verified bibliographic metadata, tables of contents and
//! bibliographies for a library of PDF and DjVu books.
//!
//! ## Why this crate?
//!
//! File names lie, embedded PDF metadata is usually empty, and OCR text of a
//! title page is too noisy to trust. Instead this crate cuts the pages that
//! matter (front matter, table of contents, bibliography) out of each book,
//! lets a vision model read them, and then checks every identifier the model
//! reports against Crossref and zbMATH before anything is written.
//!
//! ## Pipeline Overview
//!
//! ```text
//! Book
//!  │
//!  ├─ 1. Locate   find ToC and bibliography markers in the text layer
//!  ├─ 2. Slice    cut page ranges into standalone PDFs (pdfium, spawn_blocking)
//!  ├─ 3. Extract  upload → generate → delete, strict JSON per slice
//!  ├─ 4. Verify   DOI / ISBN / title against Crossref, MSC from zbMATH
//!  ├─ 5. Reflect  one more model call for fields that still disagree
//!  ├─ 6. Resolve  registry > model > file name; ties flagged for review
//!  └─ 7. Persist  one atomic commit per book (SQLite)
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgequake_bookmeta::{Orchestrator, PipelineConfig};
//! use std::path::Path;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // GEMINI_API_KEY for the model, CROSSREF_MAILTO for the polite pool.
//!     let config = PipelineConfig::builder()
//!         .crossref_mailto("librarian@example.org")
//!         .build()?;
//!     let orchestrator = Orchestrator::from_env(config, "library.db")?;
//!     let report = orchestrator
//!         .run(Path::new("Engelking - General Topology (1989).pdf"), "engelking-1989")
//!         .await?;
//!     println!("{:?} ({})", report.record.book.title, report.record.book.status.as_str());
//!     Ok(())
//! }
//! ```
//!
//! ## Backends
//!
//! | Seam | Production | Alternatives |
//! |------|------------|--------------|
//! | [`pipeline::slice::DocumentBackend`] | pdfium (+ `ddjvu` for DjVu) | test fakes |
//! | [`vision::VisionModel`] | Gemini Files API | any `edgequake-llm` provider (pages sent as images) |
//! | [`registry::Registry`] | Crossref | |
//! | [`registry::ReviewIndex`] | zbMATH Open | |
//! | [`persist::PersistenceGateway`] | SQLite | |
//! | [`embed::Embedder`] | `gemini-embedding-001` (768 dims) | |

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod embed;
pub mod error;
pub mod model;
pub mod normalize;
pub mod orchestrator;
pub mod persist;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod registry;
pub mod retry;
pub mod state;
pub mod vision;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{ConfigFile, PipelineConfig, PipelineConfigBuilder};
pub use error::{
    ExtractionFailure, FailureKind, ModelError, PersistenceError, PipelineError, RegistryError, SliceError,
};
pub use model::{
    Audience, BibEntryRecord, BookRecord, ChapterRecord, Citation, ConflictRecord, DocumentFormat, DocumentKind, Field,
    FieldValue, MetadataClaim, PageRange, Provenance, RangePurpose, ResolvedField, RunRecord, VerificationOutcome,
    VerificationResult, VerificationStatus,
};
pub use orchestrator::{Orchestrator, RunFailure, RunReport};
pub use persist::{PersistenceGateway, SearchIndexer, SqliteGateway};
pub use progress::{NoopObserver, PipelineObserver};
pub use retry::RetryPolicy;
pub use state::Phase;
