//! Data model shared by every pipeline phase.
//!
//! Claims are strongly typed: a [`FieldValue`] is a tagged variant per field
//! type, so a DOI can never end up in the year column and the resolver can
//! compare values through [`FieldValue::comparison_key`] without knowing
//! which field it is looking at.

use crate::normalize;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

// ── Documents and ranges ─────────────────────────────────────────────────

/// On-disk container format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DocumentFormat {
    Pdf,
    Djvu,
}

impl DocumentFormat {
    pub fn mime_type(&self) -> &'static str {
        match self {
            DocumentFormat::Pdf => "application/pdf",
            DocumentFormat::Djvu => "image/vnd.djvu",
        }
    }
}

/// Whether the document carries a usable text layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DocumentKind {
    /// Paginated, text-bearing document.
    TextLayer,
    /// Image-only scan; every phase is vision-only.
    Scanned,
}

/// Why a page range was selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RangePurpose {
    FrontMatter,
    TableOfContents,
    Bibliography,
    Body,
    /// No markers found: sampled pages, asked for everything.
    FullScan,
}

impl RangePurpose {
    /// Whether a slice with this purpose must return a `metadata` section.
    pub fn expects_metadata(&self) -> bool {
        matches!(
            self,
            RangePurpose::FrontMatter | RangePurpose::TableOfContents | RangePurpose::FullScan
        )
    }

    /// Whether a slice with this purpose must return a `citations` section.
    pub fn expects_citations(&self) -> bool {
        matches!(self, RangePurpose::Bibliography)
    }
}

/// Contiguous inclusive page interval, 0-based.
///
/// Displayed 1-based (`"11-20"`) because that is what a human reads in the
/// document viewer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PageRange {
    pub start: usize,
    pub end: usize,
    pub purpose: RangePurpose,
}

impl PageRange {
    /// Build a range; `start` and `end` are swapped if given backwards.
    pub fn new(start: usize, end: usize, purpose: RangePurpose) -> Self {
        let (start, end) = if start <= end { (start, end) } else { (end, start) };
        Self {
            start,
            end,
            purpose,
        }
    }

    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.end - self.start + 1
    }

    pub fn contains(&self, page: usize) -> bool {
        page >= self.start && page <= self.end
    }

    /// Split into consecutive chunks of at most `size` pages. Each chunk
    /// after the first starts `overlap` pages before the previous chunk's end.
    pub fn chunks(&self, size: usize, overlap: usize) -> Vec<PageRange> {
        let size = size.max(1);
        let overlap = overlap.min(size - 1);
        let mut out = Vec::new();
        let mut start = self.start;
        loop {
            let end = (start + size - 1).min(self.end);
            out.push(PageRange::new(start, end, self.purpose));
            if end >= self.end {
                break;
            }
            start = end + 1 - overlap;
        }
        out
    }
}

impl fmt::Display for PageRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start + 1, self.end + 1)
    }
}

// ── Claims ───────────────────────────────────────────────────────────────

/// Resolvable metadata fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    Title,
    Author,
    Isbn,
    Doi,
    Year,
    Publisher,
    Msc,
}

impl Field {
    pub const ALL: [Field; 7] = [
        Field::Title,
        Field::Author,
        Field::Isbn,
        Field::Doi,
        Field::Year,
        Field::Publisher,
        Field::Msc,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Field::Title => "title",
            Field::Author => "author",
            Field::Isbn => "isbn",
            Field::Doi => "doi",
            Field::Year => "year",
            Field::Publisher => "publisher",
            Field::Msc => "msc",
        }
    }

    pub fn parse(s: &str) -> Option<Field> {
        Field::ALL
            .iter()
            .copied()
            .find(|f| f.as_str().eq_ignore_ascii_case(s.trim()))
    }

    /// Fields the verifier can look up or search for.
    pub fn is_identifier_bearing(&self) -> bool {
        matches!(self, Field::Title | Field::Author | Field::Isbn | Field::Doi)
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed candidate value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "field", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Title(String),
    Author(Vec<String>),
    /// Digits (and a trailing `X`) only; length 10 or 13.
    Isbn(String),
    /// Lower-cased, without resolver prefix.
    Doi(String),
    Year(u16),
    Publisher(String),
    /// MSC 2020 codes, e.g. `54-01`.
    Msc(Vec<String>),
}

impl FieldValue {
    pub fn field(&self) -> Field {
        match self {
            FieldValue::Title(_) => Field::Title,
            FieldValue::Author(_) => Field::Author,
            FieldValue::Isbn(_) => Field::Isbn,
            FieldValue::Doi(_) => Field::Doi,
            FieldValue::Year(_) => Field::Year,
            FieldValue::Publisher(_) => Field::Publisher,
            FieldValue::Msc(_) => Field::Msc,
        }
    }

    /// Key under which two values count as "the same answer".
    pub fn comparison_key(&self) -> String {
        match self {
            FieldValue::Title(t) | FieldValue::Publisher(t) => normalize::normalize_title(t),
            FieldValue::Author(names) => {
                let mut keys: Vec<String> = names
                    .iter()
                    .map(|n| normalize::author_key(n))
                    .filter(|k| !k.is_empty())
                    .collect();
                keys.sort();
                keys.dedup();
                keys.join(";")
            }
            FieldValue::Isbn(i) => i.to_ascii_uppercase(),
            FieldValue::Doi(d) => d.to_ascii_lowercase(),
            FieldValue::Year(y) => y.to_string(),
            FieldValue::Msc(codes) => {
                let mut codes: Vec<String> = codes.iter().map(|c| c.trim().to_ascii_uppercase()).collect();
                codes.sort();
                codes.dedup();
                codes.join(",")
            }
        }
    }

    /// Human-readable rendering (used in prompts and the book row).
    pub fn display(&self) -> String {
        match self {
            FieldValue::Title(s) | FieldValue::Publisher(s) | FieldValue::Isbn(s) | FieldValue::Doi(s) => {
                s.clone()
            }
            FieldValue::Author(names) => names.join(", "),
            FieldValue::Year(y) => y.to_string(),
            FieldValue::Msc(codes) => codes.join(", "),
        }
    }

    pub fn is_blank(&self) -> bool {
        match self {
            FieldValue::Author(v) | FieldValue::Msc(v) => v.iter().all(|s| s.trim().is_empty()),
            FieldValue::Year(_) => false,
            other => other.display().trim().is_empty(),
        }
    }
}

/// Where a claim came from. Declaration order is precedence order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    FilenameHeuristic,
    AiExtraction,
    RegistryLookup,
}

/// One candidate value for one field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataClaim {
    pub value: FieldValue,
    pub provenance: Provenance,
    /// Slice the claim was read from (AI claims only).
    pub source: Option<PageRange>,
}

impl MetadataClaim {
    pub fn new(value: FieldValue, provenance: Provenance) -> Self {
        Self {
            value,
            provenance,
            source: None,
        }
    }

    pub fn from_slice(value: FieldValue, range: PageRange) -> Self {
        Self {
            value,
            provenance: Provenance::AiExtraction,
            source: Some(range),
        }
    }

    pub fn field(&self) -> Field {
        self.value.field()
    }
}

// ── Verification and conflicts ───────────────────────────────────────────

/// Outcome of checking one claim against a registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum VerificationOutcome {
    Confirmed,
    Contradicted { counter_value: FieldValue },
    Unverifiable { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub claim: MetadataClaim,
    pub outcome: VerificationOutcome,
    pub registry: String,
}

impl VerificationResult {
    pub fn is_confirmed(&self) -> bool {
        matches!(self.outcome, VerificationOutcome::Confirmed)
    }
}

/// A field whose claims still disagree after verification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub field: Field,
    pub claims: Vec<MetadataClaim>,
    pub verifications: Vec<VerificationResult>,
}

impl ConflictRecord {
    /// Highest provenance among the competing claims.
    pub fn best_provenance(&self) -> Option<Provenance> {
        self.claims.iter().map(|c| c.provenance).max()
    }
}

/// Final answer for one field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedField {
    pub value: Option<FieldValue>,
    pub provenance: Option<Provenance>,
    pub needs_review: bool,
}

impl ResolvedField {
    pub fn settled(value: FieldValue, provenance: Provenance) -> Self {
        Self {
            value: Some(value),
            provenance: Some(provenance),
            needs_review: false,
        }
    }

    pub fn needs_review() -> Self {
        Self {
            value: None,
            provenance: None,
            needs_review: true,
        }
    }
}

/// One final claim (or review flag) per field.
pub type Resolution = BTreeMap<Field, ResolvedField>;

// ── Extraction payloads ──────────────────────────────────────────────────

/// Table-of-contents entry as read by the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TocEntry {
    pub title: String,
    pub page: Option<i64>,
    pub level: u8,
}

/// One bibliography entry as read by the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Citation {
    pub raw_text: String,
    pub title: Option<String>,
    pub author: Option<String>,
    pub year: Option<u16>,
    /// Index of the chunk it came from; chunk order is application order.
    pub chunk: usize,
}

/// Readership a book is written for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Audience {
    Undergraduate,
    Graduate,
    Research,
    Popular,
}

impl Audience {
    pub fn as_str(&self) -> &'static str {
        match self {
            Audience::Undergraduate => "undergraduate",
            Audience::Graduate => "graduate",
            Audience::Research => "research",
            Audience::Popular => "popular",
        }
    }

    /// Lenient parse of what a model writes: `"Grad"`, `"Undergrad"`,
    /// `"graduate students"`, `"Research"` ...
    pub fn parse(s: &str) -> Option<Audience> {
        let s = s.trim().to_lowercase();
        if s.contains("undergrad") || s.contains("bachelor") {
            Some(Audience::Undergraduate)
        } else if s.contains("grad") || s.contains("master") || s.contains("phd") {
            Some(Audience::Graduate)
        } else if s.contains("research") || s.contains("specialist") {
            Some(Audience::Research)
        } else if s.contains("popular") || s.contains("general reader") {
            Some(Audience::Popular)
        } else {
            None
        }
    }
}

/// Fields that pass through unverified.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Descriptive {
    pub summary: Option<String>,
    pub description: Option<String>,
    pub audience: Option<Audience>,
    pub has_exercises: Option<bool>,
    pub has_solutions: Option<bool>,
    /// Key terms from the subject index, in reading order.
    pub index_terms: Vec<String>,
}

// ── Persisted records ────────────────────────────────────────────────────

/// How far the resolved metadata is backed by a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    /// At least one identifier claim was confirmed by a registry.
    Verified,
    /// Some field needs human review.
    Conflict,
    /// Nothing could be verified.
    Raw,
}

impl VerificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerificationStatus::Verified => "verified",
            VerificationStatus::Conflict => "conflict",
            VerificationStatus::Raw => "raw",
        }
    }
}

/// One row per physical document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookRecord {
    pub document_id: String,
    pub path: PathBuf,
    pub file_name: String,
    pub format: DocumentFormat,
    pub kind: DocumentKind,
    pub page_count: usize,
    /// SHA-256 of the source file, lower-case hex.
    pub fingerprint: String,

    pub title: Option<String>,
    pub authors: Vec<String>,
    pub year: Option<u16>,
    pub isbn: Option<String>,
    /// Work-level DOI; unique across the library.
    pub doi: Option<String>,
    pub publisher: Option<String>,
    pub msc: Vec<String>,
    pub zbl_id: Option<String>,
    /// Title similarity between the book and its review-index entry.
    pub trust_score: Option<f64>,
    pub summary: Option<String>,
    pub description: Option<String>,
    pub audience: Option<Audience>,
    pub has_exercises: bool,
    pub has_solutions: bool,
    pub index_terms: Vec<String>,

    pub provenance: BTreeMap<Field, Provenance>,
    pub needs_review: Vec<Field>,
    pub partial_extraction: bool,
    pub status: VerificationStatus,
    pub embedding: Option<Vec<f32>>,
    /// Unix seconds; excluded from run-to-run comparisons.
    pub updated_at: u64,
}

/// Ordered ToC entry owned by a book.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChapterRecord {
    pub position: usize,
    pub title: String,
    pub level: u8,
    pub page: Option<i64>,
}

/// Confidence attached to a resolved citation identifier.
pub mod confidence {
    pub const CONFIRMED: f64 = 1.0;
    pub const NOT_ATTEMPTED: f64 = 0.0;
    pub const LOOKUP_FAILED: f64 = -1.0;
}

/// One citation owned by a book.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BibEntryRecord {
    pub position: usize,
    pub raw_text: String,
    pub title: Option<String>,
    pub author: Option<String>,
    pub year: Option<u16>,
    pub resolved_doi: Option<String>,
    /// zbMATH identifier of the cited work, reached through `resolved_doi`.
    pub resolved_zbl_id: Option<String>,
    /// 1.0 confirmed, 0.0 no match / not attempted, −1.0 lookup failed.
    pub confidence: f64,
}

/// Everything one run commits, as a single unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub book: BookRecord,
    pub chapters: Vec<ChapterRecord>,
    pub bib_entries: Vec<BibEntryRecord>,
}
