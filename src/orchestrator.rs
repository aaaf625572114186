//! Run orchestration: one document from path to committed record.
//!
//! ```text
//! open ─▶ locate ─▶ plan ─▶ extract (slice by slice) ─▶ verify ─▶ [reflect]
//!      ─▶ resolve ─▶ build record ─▶ commit (one retry) ─▶ index
//! ```
//!
//! The orchestrator owns every piece of data that crosses a phase boundary;
//! the transition rules live in [`crate::state`]. Slices of one document are
//! processed sequentially. Documents are independent: [`Orchestrator::run_batch`]
//! runs several at once and shares nothing between them but the
//! collaborators (model, registry, gateway), which are all `Send + Sync`.
//!
//! Cancellation is checked before each phase and never once the commit has
//! started. A re-run always starts from the beginning.

use crate::config::PipelineConfig;
use crate::embed::{embed_or_skip, embedding_text, Embedder, GeminiEmbedder};
use crate::error::{ExtractionFailure, FailureKind, PersistenceError, PipelineError};
use crate::model::{
    BibEntryRecord, BookRecord, ChapterRecord, ConflictRecord, Field, FieldValue, Provenance, Resolution, RunRecord,
    TocEntry,
};
use crate::persist::{PersistenceGateway, SearchIndexer, SqliteGateway};
use crate::pipeline::extract::{run_job, ExtractionClient};
use crate::pipeline::filename::claims_from_filename;
use crate::pipeline::locate::{locate, LocatorReport, LocatorSettings};
use crate::pipeline::reflect::{reflect, ReflectionOutcome};
use crate::pipeline::resolve::{
    collect_claims, find_conflicts, merge_citations, merge_descriptive, merge_toc, resolve_fields, review_fields,
    verification_status,
};
use crate::pipeline::slice::{DocumentBackend, PdfiumBackend, Slicer};
use crate::pipeline::source::{sample_pages, SourceDocument};
use crate::pipeline::verify::{VerificationReport, Verifier};
use crate::progress::{NoopObserver, PipelineObserver};
use crate::registry::crossref::Crossref;
use crate::registry::zbmath::ZbMath;
use crate::registry::{Registry, ReviewIndex};
use crate::state::{after_commit, after_verification, finish_extraction, plan_slices, Phase, RunState, SliceOutcome};
use crate::vision::gemini::GeminiVision;
use crate::vision::VisionModel;
use futures::stream::{self, StreamExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Everything a successful run produced.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub document_id: String,
    /// The committed record.
    pub record: RunRecord,
    /// Slices that produced no batch.
    pub slice_failures: Vec<ExtractionFailure>,
    pub slices_total: usize,
    /// Conflicts that were open after verification.
    pub conflicts: Vec<ConflictRecord>,
    pub reflection: Option<ReflectionOutcome>,
    /// `(chapter_doi, work_doi)` replacements made by the verifier.
    pub doi_upgrades: Vec<(String, String)>,
    pub commit_attempts: u32,
    pub history: Vec<Phase>,
    pub duration: Duration,
}

impl RunReport {
    pub fn is_partial(&self) -> bool {
        !self.slice_failures.is_empty()
    }
}

/// A run that ended in [`Phase::Failed`].
#[derive(Debug, Error)]
#[error("Run '{document_id}' failed after {phase}: {error}")]
pub struct RunFailure {
    pub document_id: String,
    /// Last phase reached before the failure.
    pub phase: Phase,
    #[source]
    pub error: PipelineError,
    pub slice_failures: Vec<ExtractionFailure>,
    pub history: Vec<Phase>,
}

impl RunFailure {
    pub fn kind(&self) -> FailureKind {
        self.error.kind()
    }
}

/// Per-run bookkeeping.
struct RunCtx {
    document_id: String,
    state: RunState,
    slice_failures: Vec<ExtractionFailure>,
}

impl RunCtx {
    fn new(document_id: &str) -> Self {
        Self {
            document_id: document_id.to_string(),
            state: RunState::default(),
            slice_failures: Vec::new(),
        }
    }
}

/// Drives runs with one set of collaborators and one configuration.
pub struct Orchestrator {
    config: PipelineConfig,
    backend: Arc<dyn DocumentBackend>,
    vision: Arc<dyn VisionModel>,
    registry: Arc<dyn Registry>,
    review: Option<Arc<dyn ReviewIndex>>,
    gateway: Arc<dyn PersistenceGateway>,
    embedder: Option<Arc<dyn Embedder>>,
    indexer: Option<Arc<dyn SearchIndexer>>,
    observer: Arc<dyn PipelineObserver>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("config", &self.config)
            .field("vision", &self.vision.name())
            .field("registry", &self.registry.name())
            .field("review", &self.review.as_ref().map(|r| r.name()))
            .field("embedder", &self.embedder.as_ref().map(|e| e.name().to_string()))
            .field("indexer", &self.indexer.is_some())
            .finish()
    }
}

impl Orchestrator {
    pub fn new(
        config: PipelineConfig,
        backend: Arc<dyn DocumentBackend>,
        vision: Arc<dyn VisionModel>,
        registry: Arc<dyn Registry>,
        gateway: Arc<dyn PersistenceGateway>,
    ) -> Self {
        let observer = config
            .observer
            .clone()
            .unwrap_or_else(|| Arc::new(NoopObserver));
        Self {
            config,
            backend,
            vision,
            registry,
            review: None,
            gateway,
            embedder: None,
            indexer: None,
            observer,
            cancel: CancellationToken::new(),
        }
    }

    /// Production wiring: pdfium, Gemini, Crossref, zbMATH and a SQLite
    /// library at `db_path` (also used as the page-text indexer).
    ///
    /// Embeddings are enabled when the config asks for them and a Gemini key
    /// is present.
    pub fn from_env(config: PipelineConfig, db_path: impl AsRef<Path>) -> Result<Self, PipelineError> {
        let vision = GeminiVision::from_env(Some(&config.model))?;
        let crossref = Crossref::from_env(config.crossref_mailto.clone(), config.registry_min_interval);
        let zbmath = ZbMath::from_env(config.crossref_mailto.clone(), config.registry_min_interval);
        let store = SqliteGateway::open(db_path.as_ref()).map_err(|e| PipelineError::BackendNotConfigured {
            backend: "sqlite".into(),
            hint: format!("Could not open {}: {}", db_path.as_ref().display(), e),
        })?;
        let store = Arc::new(store);
        let embedder = if config.embedding_enabled {
            match GeminiEmbedder::from_env() {
                Ok(e) => Some(Arc::new(e) as Arc<dyn Embedder>),
                Err(e) => {
                    warn!("Embeddings disabled: {}", e);
                    None
                }
            }
        } else {
            None
        };

        let mut orchestrator = Self::new(
            config,
            Arc::new(PdfiumBackend::from_env()),
            Arc::new(vision),
            Arc::new(crossref),
            store.clone(),
        )
        .with_review_index(Arc::new(zbmath))
        .with_indexer(store);
        orchestrator.embedder = embedder;
        Ok(orchestrator)
    }

    pub fn with_review_index(mut self, review: Arc<dyn ReviewIndex>) -> Self {
        self.review = Some(review);
        self
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn with_indexer(mut self, indexer: Arc<dyn SearchIndexer>) -> Self {
        self.indexer = Some(indexer);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Token that cancels every run of this orchestrator between phases.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run one document.
    ///
    /// `Ok` means the record was committed, possibly with a partial flag.
    /// Every `Err` leaves the library untouched.
    pub async fn run(&self, path: &Path, document_id: &str) -> Result<RunReport, RunFailure> {
        let started = Instant::now();
        info!("Starting run {} for {}", document_id, path.display());
        let mut ctx = RunCtx::new(document_id);

        match self.drive(path, &mut ctx, started).await {
            Ok(report) => {
                self.observer.on_run_complete(document_id, Phase::Persisted);
                Ok(report)
            }
            Err(err) => {
                let phase = ctx.state.phase();
                if !phase.is_terminal() {
                    let _ = ctx.state.advance(Phase::Failed);
                }
                self.observer.on_phase(document_id, Phase::Failed);
                self.observer.on_run_complete(document_id, Phase::Failed);
                error!(
                    phase = phase.as_str(),
                    code = err.kind().code(),
                    "Run {} failed after {:.1}s: {}",
                    document_id,
                    started.elapsed().as_secs_f64(),
                    err
                );
                Err(RunFailure {
                    document_id: ctx.document_id,
                    phase,
                    error: err,
                    slice_failures: ctx.slice_failures,
                    history: ctx.state.history().to_vec(),
                })
            }
        }
    }

    /// Run several documents, at most `document_concurrency` at a time.
    /// Results come back in input order.
    pub async fn run_batch(&self, documents: Vec<(PathBuf, String)>) -> Vec<Result<RunReport, RunFailure>> {
        let concurrency = self.config.document_concurrency.max(1);
        info!("Starting batch of {} documents ({} at a time)", documents.len(), concurrency);
        let mut results: Vec<(usize, Result<RunReport, RunFailure>)> = stream::iter(documents.into_iter().enumerate())
            .map(|(i, (path, id))| async move { (i, self.run(&path, &id).await) })
            .buffer_unordered(concurrency)
            .collect()
            .await;
        results.sort_by_key(|(i, _)| *i);
        results.into_iter().map(|(_, r)| r).collect()
    }

    fn checkpoint(&self, next: Phase) -> Result<(), PipelineError> {
        if self.cancel.is_cancelled() {
            return Err(PipelineError::Cancelled { phase: next });
        }
        Ok(())
    }

    fn advance(&self, ctx: &mut RunCtx, next: Phase) -> Result<(), PipelineError> {
        ctx.state.advance(next)?;
        debug!("{}: → {}", ctx.document_id, next);
        self.observer.on_phase(&ctx.document_id, next);
        Ok(())
    }

    async fn drive(&self, path: &Path, ctx: &mut RunCtx, started: Instant) -> Result<RunReport, PipelineError> {
        let config = &self.config;
        let document_id = ctx.document_id.clone();

        // ── Located ──────────────────────────────────────────────────────
        let document = SourceDocument::open(
            path,
            &document_id,
            self.backend.as_ref(),
            config.scanned_chars_per_page,
        )
        .await?;
        self.observer.on_run_start(&document_id, document.page_count);
        self.observer.on_phase(&document_id, Phase::Located);

        let settings = LocatorSettings {
            front_scan_pages: config.front_scan_pages,
            back_scan_pages: config.back_scan_pages,
            front_matter_pages: config.front_matter_pages,
            marker_window_chars: config.marker_window_chars,
        };
        let located = match locate(&document, self.backend.as_ref(), &settings).await {
            Ok(report) => report,
            Err(e) => {
                warn!(
                    phase = Phase::Located.as_str(),
                    code = e.kind().code(),
                    "{}: locator could not read page text, using fallback plan: {}",
                    document_id,
                    e
                );
                LocatorReport::no_text_layer()
            }
        };

        // ── Sliced ───────────────────────────────────────────────────────
        self.checkpoint(Phase::Sliced)?;
        let jobs = plan_slices(&located, document.page_count, &config.plan_limits());
        self.advance(ctx, Phase::Sliced)?;
        info!(
            "{}: {} slices planned ({})",
            document_id,
            jobs.len(),
            if located.ranges.is_empty() { "fallback" } else { "located" }
        );

        // ── Extracted ────────────────────────────────────────────────────
        self.checkpoint(Phase::Extracted)?;
        let slicer = Slicer::new(Arc::clone(&self.backend));
        let client = ExtractionClient::new(Arc::clone(&self.vision), config);
        let total = jobs.len();
        let mut outcomes = Vec::with_capacity(total);
        for job in jobs {
            self.observer
                .on_slice_start(&document_id, job.index, total, &job.range.to_string());
            let outcome = run_job(&slicer, &client, &document, job).await;
            match &outcome {
                SliceOutcome::Batch { .. } => self.observer.on_slice_complete(&document_id, job.index, total),
                SliceOutcome::Failed { failure, .. } => {
                    warn!(
                        phase = Phase::Extracted.as_str(),
                        range = %job.range,
                        code = failure.kind().code(),
                        "{}: slice skipped: {}",
                        document_id,
                        failure
                    );
                    self.observer
                        .on_slice_error(&document_id, job.index, total, &failure.to_string());
                    ctx.slice_failures.push(failure.clone());
                }
            }
            outcomes.push(outcome);
        }
        let extraction = finish_extraction(outcomes)?;
        self.advance(ctx, Phase::Extracted)?;
        info!(
            "{}: {}/{} slices extracted",
            document_id,
            extraction.batches.len(),
            extraction.total
        );

        // ── Verified ─────────────────────────────────────────────────────
        self.checkpoint(Phase::Verified)?;
        let verifier = Verifier::new(Arc::clone(&self.registry), self.review.clone(), config);
        let claims = collect_claims(&claims_from_filename(path), &extraction.batches);
        let verification = verifier.verify_claims(&claims).await;
        let citations = merge_citations(&extraction.batches, config.chunk_overlap_pages);
        let bib_entries = verifier.resolve_citations(&citations).await;
        let conflicts = find_conflicts(&verification.claims, &verification.results);
        self.advance(ctx, Phase::Verified)?;

        // ── ReflectionPending ────────────────────────────────────────────
        let mut reflection = None;
        if after_verification(&conflicts) == Phase::ReflectionPending {
            self.checkpoint(Phase::ReflectionPending)?;
            self.advance(ctx, Phase::ReflectionPending)?;
            info!("{}: {} conflicting fields", document_id, conflicts.len());
            if config.reflection_enabled {
                let grounding = config
                    .reflection_grounding
                    .then_some((&slicer, &document, config.front_matter_pages));
                reflection = Some(reflect(&client, &conflicts, grounding).await);
            }
        }

        // ── Resolved ─────────────────────────────────────────────────────
        self.checkpoint(Phase::Resolved)?;
        let choices = reflection.as_ref().map(|r| r.choices.clone()).unwrap_or_default();
        let resolution = resolve_fields(&verification.claims, &verification.results, &choices);
        self.advance(ctx, Phase::Resolved)?;
        for field in review_fields(&resolution) {
            warn!(
                phase = Phase::Resolved.as_str(),
                code = FailureKind::IrreconcilableConflict.code(),
                "{}: field '{}' left for review",
                document_id,
                field
            );
        }

        let mut record = self.build_record(
            &document,
            &resolution,
            &verification,
            &extraction.batches,
            bib_entries,
            !ctx.slice_failures.is_empty(),
        );
        if config.embedding_enabled {
            if let Some(embedder) = &self.embedder {
                let text = embedding_text(&record.book, &record.chapters);
                record.book.embedding = embed_or_skip(embedder.as_ref(), &config.embedding_retry, &text).await;
            }
        }

        // ── Persisted ────────────────────────────────────────────────────
        let commit_attempts = self.commit(ctx, &record).await?;
        info!(
            "{}: persisted as {} in {:.1}s ({} chapters, {} citations{})",
            document_id,
            record.book.status.as_str(),
            started.elapsed().as_secs_f64(),
            record.chapters.len(),
            record.bib_entries.len(),
            if record.book.partial_extraction { ", partial" } else { "" }
        );

        if let Some(indexer) = &self.indexer {
            self.feed_indexer(indexer.as_ref(), &document, &record.book).await;
        }

        Ok(RunReport {
            document_id,
            record,
            slice_failures: ctx.slice_failures.clone(),
            slices_total: extraction.total,
            conflicts,
            reflection,
            doi_upgrades: verification.doi_upgrades,
            commit_attempts,
            history: ctx.state.history().to_vec(),
            duration: started.elapsed(),
        })
    }

    /// Resolved → Persisted, with one retry. A DOI collision is final.
    async fn commit(&self, ctx: &mut RunCtx, record: &RunRecord) -> Result<u32, PipelineError> {
        let max_attempts = self.config.persistence_attempts.max(1);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let error = match self.gateway.commit(record).await {
                Ok(()) => {
                    self.advance(ctx, after_commit(attempt, max_attempts, true))?;
                    return Ok(attempt);
                }
                Err(e) => e,
            };
            warn!(
                phase = Phase::Resolved.as_str(),
                code = FailureKind::PersistenceFailure.code(),
                "{}: commit attempt {}/{} failed: {}",
                ctx.document_id,
                attempt,
                max_attempts,
                error
            );
            let final_attempt = matches!(error, PersistenceError::DuplicateDoi { .. });
            match after_commit(attempt, max_attempts, false) {
                Phase::Resolved if !final_attempt => self.advance(ctx, Phase::Resolved)?,
                _ => {
                    return Err(PipelineError::PersistenceExhausted {
                        attempts: attempt,
                        source: error,
                    })
                }
            }
        }
    }

    async fn feed_indexer(&self, indexer: &dyn SearchIndexer, document: &SourceDocument, book: &BookRecord) {
        let pages = sample_pages(document.page_count, self.config.index_sample_pages);
        let texts = match document.page_texts(self.backend.as_ref(), &pages).await {
            Ok(t) => t,
            Err(e) => {
                warn!(phase = Phase::Persisted.as_str(), code = e.kind().code(), "{}: no page text for indexer: {}", book.document_id, e);
                return;
            }
        };
        let pairs: Vec<(usize, String)> = pages.into_iter().zip(texts).collect();
        if let Err(e) = indexer.index(book, &pairs).await {
            warn!(
                phase = Phase::Persisted.as_str(),
                code = FailureKind::PersistenceFailure.code(),
                "{}: indexer failed: {}",
                book.document_id,
                e
            );
        }
    }

    fn build_record(
        &self,
        document: &SourceDocument,
        resolution: &Resolution,
        verification: &VerificationReport,
        batches: &[(crate::state::SliceJob, crate::pipeline::response::ExtractionBatch)],
        bib_entries: Vec<BibEntryRecord>,
        partial: bool,
    ) -> RunRecord {
        let value = |field: Field| resolution.get(&field).and_then(|r| r.value.clone());
        let text = |field: Field| match value(field) {
            Some(FieldValue::Title(s) | FieldValue::Publisher(s) | FieldValue::Isbn(s) | FieldValue::Doi(s)) => Some(s),
            _ => None,
        };
        let list = |field: Field| match value(field) {
            Some(FieldValue::Author(v) | FieldValue::Msc(v)) => v,
            _ => Vec::new(),
        };
        let year = match value(Field::Year) {
            Some(FieldValue::Year(y)) => Some(y),
            _ => None,
        };

        let provenance = resolution
            .iter()
            .filter_map(|(f, r)| r.provenance.map(|p| (*f, p)))
            .collect();
        let registry_backed = resolution
            .values()
            .any(|r| r.provenance == Some(Provenance::RegistryLookup));
        let descriptive = merge_descriptive(batches);
        let (toc, page_offset) = merge_toc(batches);

        let book = BookRecord {
            document_id: document.document_id.clone(),
            path: document.path.clone(),
            file_name: document.file_name(),
            format: document.format,
            kind: document.kind,
            page_count: document.page_count,
            fingerprint: document.fingerprint.clone(),
            title: text(Field::Title),
            authors: list(Field::Author),
            year,
            isbn: text(Field::Isbn),
            doi: text(Field::Doi),
            publisher: text(Field::Publisher),
            msc: list(Field::Msc),
            zbl_id: verification.zbl_id.clone(),
            trust_score: verification.trust_score,
            summary: descriptive.summary,
            description: descriptive.description,
            audience: descriptive.audience,
            has_exercises: descriptive.has_exercises.unwrap_or(false),
            has_solutions: descriptive.has_solutions.unwrap_or(false),
            index_terms: descriptive.index_terms,
            provenance,
            needs_review: review_fields(resolution),
            partial_extraction: partial,
            status: verification_status(
                resolution,
                verification.any_confirmed() || registry_backed,
                verification.review_trusted(),
            ),
            embedding: None,
            updated_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default(),
        };

        RunRecord {
            book,
            chapters: chapters_from_toc(&toc, page_offset),
            bib_entries,
        }
    }
}

/// Chapters in ToC order; printed pages shifted by the page offset.
pub fn chapters_from_toc(toc: &[TocEntry], page_offset: Option<i64>) -> Vec<ChapterRecord> {
    let offset = page_offset.unwrap_or(0);
    toc.iter()
        .enumerate()
        .map(|(position, entry)| ChapterRecord {
            position,
            title: entry.title.clone(),
            level: entry.level,
            page: entry.page.map(|p| p + offset),
        })
        .collect()
}
