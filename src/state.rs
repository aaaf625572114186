//! Run state machine.
//!
//! ```text
//! Located ─▶ Sliced ─▶ Extracted ─▶ Verified ─┬─▶ ReflectionPending ─┐
//!                                             └──────────────────────┴─▶ Resolved ─▶ Persisted
//!                                   (any non-terminal) ─▶ Failed
//! ```
//!
//! The orchestrator owns the data; this module owns the rules. Every
//! transition decision is a pure function of the data the phase produced,
//! so the decisions are unit-testable without a document, a model or a
//! database.

use crate::error::{ExtractionFailure, PipelineError};
use crate::model::{ConflictRecord, PageRange, RangePurpose};
use crate::pipeline::locate::LocatorReport;
use crate::pipeline::response::ExtractionBatch;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A state of one run. `Persisted` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    Located,
    Sliced,
    Extracted,
    Verified,
    ReflectionPending,
    Resolved,
    Persisted,
    Failed,
}

impl Phase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Persisted | Phase::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Located => "located",
            Phase::Sliced => "sliced",
            Phase::Extracted => "extracted",
            Phase::Verified => "verified",
            Phase::ReflectionPending => "reflection_pending",
            Phase::Resolved => "resolved",
            Phase::Persisted => "persisted",
            Phase::Failed => "failed",
        }
    }

    /// Whether `next` is a legal successor of `self`.
    pub fn can_advance_to(&self, next: Phase) -> bool {
        use Phase::*;
        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (_, Failed) => true,
            (Located, Sliced)
            | (Sliced, Extracted)
            | (Extracted, Verified)
            | (Verified, ReflectionPending)
            | (Verified, Resolved)
            | (ReflectionPending, Resolved)
            | (Resolved, Persisted) => true,
            // A failed commit returns to Resolved for the retry.
            (Resolved, Resolved) => true,
            _ => false,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tracks the current phase and rejects illegal transitions.
#[derive(Debug, Clone)]
pub struct RunState {
    phase: Phase,
    history: Vec<Phase>,
}

impl Default for RunState {
    fn default() -> Self {
        Self {
            phase: Phase::Located,
            history: vec![Phase::Located],
        }
    }
}

impl RunState {
    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn history(&self) -> &[Phase] {
        &self.history
    }

    pub fn advance(&mut self, next: Phase) -> Result<Phase, PipelineError> {
        if !self.phase.can_advance_to(next) {
            return Err(PipelineError::Internal(format!(
                "illegal transition {} -> {}",
                self.phase, next
            )));
        }
        self.phase = next;
        self.history.push(next);
        Ok(next)
    }
}

// ── Slicing plan ─────────────────────────────────────────────────────────

/// Knobs of the slicing plan, copied out of [`crate::config::PipelineConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanLimits {
    pub front_matter_pages: usize,
    pub fallback_tail_pages: usize,
    pub chunk_pages: usize,
    pub chunk_overlap_pages: usize,
}

/// One unit of extraction work: a page range plus its position in the plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SliceJob {
    /// Position in the overall plan; batches are applied in this order.
    pub index: usize,
    pub range: PageRange,
    /// Ordinal among the bibliography chunks (0 for non-bibliography jobs).
    pub chunk: usize,
}

/// Located → Sliced: turn the locator's ranges into ordered jobs.
///
/// Bibliography ranges are split into fixed-size chunks. An empty range set
/// (no text layer, or nothing found) yields the full-document fallback: a
/// full-scan of the opening pages plus the tail of the document as
/// bibliography chunks.
pub fn plan_slices(report: &LocatorReport, page_count: usize, limits: &PlanLimits) -> Vec<SliceJob> {
    if page_count == 0 {
        return Vec::new();
    }
    let ranges = if report.ranges.is_empty() {
        fallback_ranges(page_count, limits)
    } else {
        report.ranges.clone()
    };

    let mut jobs = Vec::new();
    for range in ranges {
        let range = PageRange::new(range.start, range.end.min(page_count - 1), range.purpose);
        if range.start >= page_count {
            continue;
        }
        if range.purpose == RangePurpose::Bibliography {
            for (chunk, piece) in range
                .chunks(limits.chunk_pages, limits.chunk_overlap_pages)
                .into_iter()
                .enumerate()
            {
                jobs.push(SliceJob {
                    index: jobs.len(),
                    range: piece,
                    chunk,
                });
            }
        } else {
            jobs.push(SliceJob {
                index: jobs.len(),
                range,
                chunk: 0,
            });
        }
    }
    jobs
}

fn fallback_ranges(page_count: usize, limits: &PlanLimits) -> Vec<PageRange> {
    let front_end = limits.front_matter_pages.max(1).min(page_count) - 1;
    let mut ranges = vec![PageRange::new(0, front_end, RangePurpose::FullScan)];
    let tail_start = page_count.saturating_sub(limits.fallback_tail_pages).max(front_end + 1);
    if limits.fallback_tail_pages > 0 && tail_start < page_count {
        ranges.push(PageRange::new(tail_start, page_count - 1, RangePurpose::Bibliography));
    }
    ranges
}

// ── Extraction outcome ───────────────────────────────────────────────────

/// Result of one slice: a parsed batch or a recorded failure.
#[derive(Debug, Clone)]
pub enum SliceOutcome {
    Batch { job: SliceJob, batch: ExtractionBatch },
    Failed { job: SliceJob, failure: ExtractionFailure },
}

impl SliceOutcome {
    pub fn job(&self) -> &SliceJob {
        match self {
            SliceOutcome::Batch { job, .. } | SliceOutcome::Failed { job, .. } => job,
        }
    }
}

/// Everything the Extracted state carries forward.
#[derive(Debug, Clone, Default)]
pub struct ExtractionSummary {
    /// Successful batches in plan order.
    pub batches: Vec<(SliceJob, ExtractionBatch)>,
    pub failures: Vec<ExtractionFailure>,
    pub total: usize,
}

impl ExtractionSummary {
    pub fn is_partial(&self) -> bool {
        !self.failures.is_empty()
    }
}

/// Sliced → Extracted (or Failed when no slice produced anything).
pub fn finish_extraction(mut outcomes: Vec<SliceOutcome>) -> Result<ExtractionSummary, PipelineError> {
    let total = outcomes.len();
    outcomes.sort_by_key(|o| o.job().index);

    let mut summary = ExtractionSummary {
        total,
        ..Default::default()
    };
    for outcome in outcomes {
        match outcome {
            SliceOutcome::Batch { job, batch } => summary.batches.push((job, batch)),
            SliceOutcome::Failed { failure, .. } => summary.failures.push(failure),
        }
    }

    if summary.batches.is_empty() {
        let first_error = summary
            .failures
            .first()
            .map(|f| f.to_string())
            .unwrap_or_else(|| "no slices were planned".to_string());
        return Err(PipelineError::NoUsableMetadata { total, first_error });
    }
    Ok(summary)
}

/// Verified → ReflectionPending iff conflicts remain.
pub fn after_verification(conflicts: &[ConflictRecord]) -> Phase {
    if conflicts.is_empty() {
        Phase::Resolved
    } else {
        Phase::ReflectionPending
    }
}

/// Resolved → Persisted, back to Resolved for one retry, or Failed.
pub fn after_commit(attempt: u32, max_attempts: u32, committed: bool) -> Phase {
    if committed {
        Phase::Persisted
    } else if attempt < max_attempts {
        Phase::Resolved
    } else {
        Phase::Failed
    }
}
