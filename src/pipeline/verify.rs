//! Deterministic verification of extracted claims.
//!
//! Identifier-bearing claims are checked against the registry:
//!
//! | claim  | how                                   | contradiction when              |
//! |--------|---------------------------------------|---------------------------------|
//! | DOI    | direct lookup (chapter → parent work) | registry title differs          |
//! | ISBN   | ISBN filter                           | registry title differs          |
//! | title  | bibliographic search                  | never (no match = unverifiable) |
//! | author | against the records accepted above    | no shared surname               |
//!
//! A search hit is only accepted when it also shares a surname with some
//! author claim: two books can carry the same title. Accepted registry
//! records become claims of their own with [`Provenance::RegistryLookup`].
//! A registry that cannot be reached yields `Unverifiable`, never a
//! contradiction.
//!
//! The review index is asked by DOI, then by title and author. Its title is
//! compared with the book's to give a trust score; below
//! [`REVIEW_TRUST_THRESHOLD`] its MSC codes are not adopted.

use crate::config::PipelineConfig;
use crate::error::RegistryError;
use crate::model::{
    confidence, BibEntryRecord, Citation, Field, FieldValue, MetadataClaim, Provenance, VerificationOutcome,
    VerificationResult,
};
use crate::normalize::{author_key, clean_citation_query, normalize_doi, normalize_title, title_similarity};
use crate::registry::{Registry, RegistryRecord, ReviewIndex, ReviewRecord};
use crate::retry::{call_with_policy, RetryPolicy};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Output of the Verified phase.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VerificationReport {
    /// One result per identifier-bearing input claim, in input order.
    pub results: Vec<VerificationResult>,
    /// Claim set after verification: superseded chapter DOIs removed,
    /// registry claims appended.
    pub claims: Vec<MetadataClaim>,
    /// `(chapter_doi, work_doi)` for every upgrade performed.
    pub doi_upgrades: Vec<(String, String)>,
    pub zbl_id: Option<String>,
    /// Title similarity between the claims and the review-index entry.
    pub trust_score: Option<f64>,
}

/// Review-index entries titled less alike than this are kept but flagged.
pub const REVIEW_TRUST_THRESHOLD: f64 = 0.85;

impl VerificationReport {
    pub fn any_confirmed(&self) -> bool {
        self.results.iter().any(VerificationResult::is_confirmed)
    }

    /// False when the review index files the book under another title.
    pub fn review_trusted(&self) -> bool {
        self.trust_score.is_none_or(|t| t >= REVIEW_TRUST_THRESHOLD)
    }
}

/// A registry record after the chapter upgrade.
#[derive(Debug, Clone)]
struct Settled {
    record: RegistryRecord,
    /// Set when `record` is the parent of the record first returned.
    upgraded_from: Option<String>,
}

pub struct Verifier {
    registry: Arc<dyn Registry>,
    review: Option<Arc<dyn ReviewIndex>>,
    policy: RetryPolicy,
    threshold: f64,
    max_citation_lookups: usize,
}

impl std::fmt::Debug for Verifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Verifier")
            .field("registry", &self.registry.name())
            .field("review", &self.review.as_ref().map(|r| r.name()))
            .field("threshold", &self.threshold)
            .finish()
    }
}

impl Verifier {
    pub fn new(registry: Arc<dyn Registry>, review: Option<Arc<dyn ReviewIndex>>, config: &PipelineConfig) -> Self {
        Self {
            registry,
            review,
            policy: config.registry_retry,
            threshold: config.title_match_threshold,
            max_citation_lookups: config.max_citation_lookups,
        }
    }

    async fn lookup_doi(&self, doi: &str) -> Result<Option<RegistryRecord>, RegistryError> {
        let label = format!("{} doi {}", self.registry.name(), doi);
        call_with_policy(&self.policy, &label, |_| self.registry.lookup_doi(doi))
            .await
            .map_err(|e| e.error)
    }

    async fn lookup_isbn(&self, isbn: &str) -> Result<Option<RegistryRecord>, RegistryError> {
        let label = format!("{} isbn {}", self.registry.name(), isbn);
        call_with_policy(&self.policy, &label, |_| self.registry.lookup_isbn(isbn))
            .await
            .map_err(|e| e.error)
    }

    async fn search(&self, query: &str) -> Result<Option<RegistryRecord>, RegistryError> {
        let label = format!("{} search", self.registry.name());
        call_with_policy(&self.policy, &label, |_| self.registry.search(query))
            .await
            .map_err(|e| e.error)
    }

    /// Replace a chapter record by its parent work.
    ///
    /// A parent named by the registry relation is taken even when fetching
    /// it fails; a parent guessed from the DOI shape must be fetched.
    async fn settle(&self, record: RegistryRecord) -> Settled {
        if !record.is_chapter() {
            return Settled {
                record,
                upgraded_from: None,
            };
        }
        let Some(parent) = record.parent_candidate() else {
            return Settled {
                record,
                upgraded_from: None,
            };
        };
        let asserted = record.parent_doi.is_some();
        let chapter_doi = record.doi.clone();
        match self.lookup_doi(&parent).await {
            Ok(Some(parent_record)) if !parent_record.is_chapter() => {
                info!(
                    "DOI upgrade: chapter {} -> work {}",
                    chapter_doi.as_deref().unwrap_or("?"),
                    parent
                );
                Settled {
                    record: RegistryRecord {
                        doi: parent_record.doi.clone().or(Some(parent)),
                        ..parent_record
                    },
                    upgraded_from: chapter_doi,
                }
            }
            _ if asserted => Settled {
                record: RegistryRecord {
                    doi: Some(parent),
                    title: None,
                    authors: Vec::new(),
                    work_type: Some("book".into()),
                    parent_doi: None,
                    ..record
                },
                upgraded_from: chapter_doi,
            },
            _ => Settled {
                record,
                upgraded_from: None,
            },
        }
    }

    /// Check a looked-up record against the reference title.
    fn judge(&self, settled: &Settled, reference_title: Option<&str>) -> VerificationOutcome {
        match (reference_title, settled.record.title.as_deref()) {
            (Some(reference), Some(found)) if title_similarity(reference, found) < self.threshold => {
                VerificationOutcome::Contradicted {
                    counter_value: FieldValue::Title(found.to_string()),
                }
            }
            _ => VerificationOutcome::Confirmed,
        }
    }

    /// Verify every identifier-bearing claim and derive registry claims.
    pub async fn verify_claims(&self, claims: &[MetadataClaim]) -> VerificationReport {
        let registry_name = self.registry.name().to_string();
        let reference_title = best_value(claims, Field::Title).and_then(|v| match v {
            FieldValue::Title(t) => Some(t.clone()),
            _ => None,
        });
        let reference_title = reference_title.as_deref();

        let mut outcomes: HashMap<(Field, String), VerificationOutcome> = HashMap::new();
        let mut accepted: Vec<Settled> = Vec::new();
        let mut superseded: Vec<String> = Vec::new();

        // Anchors first: DOI, then ISBN.
        for claim in claims.iter().filter(|c| c.field() == Field::Doi) {
            let FieldValue::Doi(doi) = &claim.value else { continue };
            let key = (Field::Doi, claim.value.comparison_key());
            if outcomes.contains_key(&key) {
                continue;
            }
            let outcome = match self.lookup_doi(doi).await {
                Ok(Some(record)) => {
                    let settled = self.settle(record).await;
                    let outcome = self.judge(&settled, reference_title);
                    if matches!(outcome, VerificationOutcome::Confirmed) {
                        if settled.upgraded_from.is_some() {
                            superseded.push(doi.clone());
                        }
                        accepted.push(settled);
                    }
                    outcome
                }
                Ok(None) => unverifiable("DOI not registered"),
                Err(e) => unavailable(&e),
            };
            outcomes.insert(key, outcome);
        }

        for claim in claims.iter().filter(|c| c.field() == Field::Isbn) {
            let FieldValue::Isbn(isbn) = &claim.value else { continue };
            let key = (Field::Isbn, claim.value.comparison_key());
            if outcomes.contains_key(&key) {
                continue;
            }
            let outcome = match self.lookup_isbn(isbn).await {
                Ok(Some(record)) => {
                    let settled = self.settle(record).await;
                    let outcome = self.judge(&settled, reference_title);
                    if matches!(outcome, VerificationOutcome::Confirmed) && !already_accepted(&accepted, &settled) {
                        accepted.push(settled);
                    }
                    outcome
                }
                Ok(None) => unverifiable("ISBN not registered"),
                Err(e) => unavailable(&e),
            };
            outcomes.insert(key, outcome);
        }

        // Titles: an accepted record settles them, else search.
        let first_author = best_value(claims, Field::Author).and_then(|v| match v {
            FieldValue::Author(names) => names.first().cloned(),
            _ => None,
        });
        let claimed_surnames: Vec<String> = claims
            .iter()
            .filter_map(|c| match &c.value {
                FieldValue::Author(names) => Some(surnames(names)),
                _ => None,
            })
            .flatten()
            .collect();
        for claim in claims.iter().filter(|c| c.field() == Field::Title) {
            let FieldValue::Title(title) = &claim.value else { continue };
            let key = (Field::Title, claim.value.comparison_key());
            if outcomes.contains_key(&key) {
                continue;
            }
            let matched = accepted.iter().any(|s| {
                s.record
                    .title
                    .as_deref()
                    .is_some_and(|t| title_similarity(title, t) >= self.threshold)
            });
            let outcome = if matched {
                VerificationOutcome::Confirmed
            } else {
                let query = clean_citation_query(&match &first_author {
                    Some(author) => format!("{} {}", title, author),
                    None => title.clone(),
                });
                match self.search(&query).await {
                    Ok(Some(record)) => {
                        let settled = self.settle(record).await;
                        let similar = settled
                            .record
                            .title
                            .as_deref()
                            .is_some_and(|t| title_similarity(title, t) >= self.threshold);
                        if !similar {
                            unverifiable("no sufficiently similar record")
                        } else if !shares_author(&settled.record, &claimed_surnames) {
                            info!(
                                "{}: rejecting {} for '{}': authors {:?} match no claimed author",
                                registry_name,
                                settled.record.doi.as_deref().unwrap_or("record"),
                                title,
                                settled.record.authors
                            );
                            unverifiable("closest record is by other authors")
                        } else {
                            if !already_accepted(&accepted, &settled) {
                                accepted.push(settled);
                            }
                            VerificationOutcome::Confirmed
                        }
                    }
                    Ok(None) => unverifiable("no record found"),
                    Err(e) => unavailable(&e),
                }
            };
            outcomes.insert(key, outcome);
        }

        // Authors: only against what was accepted.
        for claim in claims.iter().filter(|c| c.field() == Field::Author) {
            let FieldValue::Author(names) = &claim.value else { continue };
            let key = (Field::Author, claim.value.comparison_key());
            if outcomes.contains_key(&key) {
                continue;
            }
            let with_authors: Vec<&RegistryRecord> = accepted
                .iter()
                .map(|s| &s.record)
                .filter(|r| !r.authors.is_empty())
                .collect();
            let outcome = match with_authors.first() {
                None => unverifiable("no registry record to compare against"),
                Some(first) => {
                    let ours = surnames(names);
                    if with_authors.iter().any(|r| surnames(&r.authors).iter().any(|s| ours.contains(s))) {
                        VerificationOutcome::Confirmed
                    } else {
                        VerificationOutcome::Contradicted {
                            counter_value: FieldValue::Author(first.authors.clone()),
                        }
                    }
                }
            };
            outcomes.insert(key, outcome);
        }

        let results: Vec<VerificationResult> = claims
            .iter()
            .filter(|c| c.field().is_identifier_bearing())
            .filter_map(|c| {
                outcomes
                    .get(&(c.field(), c.value.comparison_key()))
                    .map(|outcome| VerificationResult {
                        claim: c.clone(),
                        outcome: outcome.clone(),
                        registry: registry_name.clone(),
                    })
            })
            .collect();

        let claimed_isbns: Vec<String> = claims
            .iter()
            .filter_map(|c| match &c.value {
                FieldValue::Isbn(i) => Some(i.clone()),
                _ => None,
            })
            .collect();

        let mut out_claims: Vec<MetadataClaim> = claims
            .iter()
            .filter(|c| !matches!(&c.value, FieldValue::Doi(d) if superseded.contains(d)))
            .cloned()
            .collect();
        let mut registry_claims = Vec::new();
        for settled in &accepted {
            registry_claims.extend(claims_from_record(&settled.record, &claimed_isbns));
        }
        let mut doi_upgrades = Vec::new();
        for settled in &accepted {
            if let (Some(from), Some(to)) = (&settled.upgraded_from, &settled.record.doi) {
                doi_upgrades.push((from.clone(), to.clone()));
            }
        }

        let review_doi = registry_claims
            .iter()
            .chain(out_claims.iter())
            .find_map(|c| match &c.value {
                FieldValue::Doi(d) if c.provenance == Provenance::RegistryLookup => Some(d.clone()),
                _ => None,
            })
            .or_else(|| {
                results.iter().find_map(|r| match (&r.claim.value, &r.outcome) {
                    (FieldValue::Doi(d), VerificationOutcome::Confirmed) if !superseded.contains(d) => Some(d.clone()),
                    _ => None,
                })
            });

        let mut zbl_id = None;
        let mut trust_score = None;
        if let Some(review) = &self.review {
            // Compare against what will most likely be resolved.
            let title = registry_claims
                .iter()
                .find_map(|c| match &c.value {
                    FieldValue::Title(t) => Some(t.clone()),
                    _ => None,
                })
                .or_else(|| reference_title.map(str::to_string));
            let author = registry_claims
                .iter()
                .find_map(|c| match &c.value {
                    FieldValue::Author(names) => names.first().cloned(),
                    _ => None,
                })
                .or_else(|| first_author.clone());
            if let Some((rec, score)) = self
                .review_entry(review.as_ref(), review_doi.as_deref(), title.as_deref(), author.as_deref())
                .await
            {
                debug!(
                    "{}: zbl {} with {} MSC codes, trust {:.2}",
                    review.name(),
                    rec.zbl_id,
                    rec.msc.len(),
                    score
                );
                if score < REVIEW_TRUST_THRESHOLD {
                    warn!(
                        phase = "verify",
                        "{}: zbl {} is titled {:?}, trust {:.2}; MSC codes not adopted",
                        review.name(),
                        rec.zbl_id,
                        rec.title,
                        score
                    );
                } else if !rec.msc.is_empty() {
                    registry_claims.push(MetadataClaim::new(FieldValue::Msc(rec.msc), Provenance::RegistryLookup));
                }
                zbl_id = Some(rec.zbl_id);
                trust_score = Some(score);
            }
        }

        for claim in registry_claims {
            let key = claim.value.comparison_key();
            let duplicate = out_claims.iter().any(|c| {
                c.provenance == Provenance::RegistryLookup && c.field() == claim.field() && c.value.comparison_key() == key
            });
            if !duplicate {
                out_claims.push(claim);
            }
        }

        VerificationReport {
            results,
            claims: out_claims,
            doi_upgrades,
            zbl_id,
            trust_score,
        }
    }

    /// Review-index entry by DOI, else by title and author, with its trust
    /// score. A metadata hit below the title threshold is discarded.
    async fn review_entry(
        &self,
        review: &dyn ReviewIndex,
        doi: Option<&str>,
        title: Option<&str>,
        author: Option<&str>,
    ) -> Option<(ReviewRecord, f64)> {
        let trust = |rec: &ReviewRecord| match (title, rec.title.as_deref()) {
            (Some(ours), Some(theirs)) => title_similarity(ours, theirs),
            _ => 1.0,
        };
        if let Some(doi) = doi {
            let label = format!("{} doi {}", review.name(), doi);
            match call_with_policy(&self.policy, &label, |_| review.lookup_doi(doi)).await {
                Ok(Some(rec)) => {
                    let score = trust(&rec);
                    return Some((rec, score));
                }
                Ok(None) => debug!("{}: no record for {}", review.name(), doi),
                Err(e) => warn!(
                    phase = "verify",
                    code = e.error.kind().code(),
                    "{} unavailable: {}",
                    review.name(),
                    e
                ),
            }
        }
        let title = title?;
        let label = format!("{} metadata search", review.name());
        match call_with_policy(&self.policy, &label, |_| review.search_metadata(title, author)).await {
            Ok(Some(rec)) => {
                let score = trust(&rec);
                if score >= self.threshold {
                    Some((rec, score))
                } else {
                    debug!("{}: closest entry {:?} too far from '{}'", review.name(), rec.title, title);
                    None
                }
            }
            Ok(None) => None,
            Err(e) => {
                warn!(
                    phase = "verify",
                    code = e.error.kind().code(),
                    "{} unavailable: {}",
                    review.name(),
                    e
                );
                None
            }
        }
    }

    /// Resolve each citation to a registry identifier.
    ///
    /// Only the first `max_citation_lookups` citations are looked up; the
    /// rest are stored with confidence 0.0.
    pub async fn resolve_citations(&self, citations: &[Citation]) -> Vec<BibEntryRecord> {
        let mut out = Vec::with_capacity(citations.len());
        for (position, citation) in citations.iter().enumerate() {
            let mut entry = BibEntryRecord {
                position,
                raw_text: citation.raw_text.clone(),
                title: citation.title.clone(),
                author: citation.author.clone(),
                year: citation.year,
                resolved_doi: None,
                resolved_zbl_id: None,
                confidence: confidence::NOT_ATTEMPTED,
            };
            if position < self.max_citation_lookups {
                match self.resolve_citation(citation).await {
                    Ok(Some(doi)) => {
                        entry.resolved_zbl_id = self.citation_zbl_id(&doi, position).await;
                        entry.resolved_doi = Some(doi);
                        entry.confidence = confidence::CONFIRMED;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(
                            phase = "verify",
                            code = e.kind().code(),
                            "citation {} lookup failed: {}",
                            position + 1,
                            e
                        );
                        entry.confidence = confidence::LOOKUP_FAILED;
                    }
                }
            }
            out.push(entry);
        }
        let confirmed = out.iter().filter(|e| e.confidence == confidence::CONFIRMED).count();
        let reviewed = out.iter().filter(|e| e.resolved_zbl_id.is_some()).count();
        info!("Resolved {}/{} citations, {} with a zbl id", confirmed, out.len(), reviewed);
        out
    }

    /// zbl id of a resolved citation; a failed lookup leaves it unset.
    async fn citation_zbl_id(&self, doi: &str, position: usize) -> Option<String> {
        let review = self.review.as_ref()?;
        let label = format!("{} doi {}", review.name(), doi);
        match call_with_policy(&self.policy, &label, |_| review.lookup_doi(doi)).await {
            Ok(rec) => rec.map(|r| r.zbl_id),
            Err(e) => {
                warn!(
                    phase = "verify",
                    code = e.error.kind().code(),
                    "citation {} review lookup failed: {}",
                    position + 1,
                    e
                );
                None
            }
        }
    }

    async fn resolve_citation(&self, citation: &Citation) -> Result<Option<String>, RegistryError> {
        if let Some(doi) = normalize_doi(&citation.raw_text) {
            if let Some(record) = self.lookup_doi(&doi).await? {
                return Ok(record.doi.or(Some(doi)));
            }
        }
        let query = clean_citation_query(&citation.raw_text);
        if query.chars().filter(|c| c.is_alphanumeric()).count() < 3 {
            return Ok(None);
        }
        let Some(record) = self.search(&query).await? else {
            return Ok(None);
        };
        let Some(found) = record.title.as_deref() else {
            return Ok(None);
        };
        let matched = match citation.title.as_deref() {
            Some(title) => title_similarity(title, found) >= self.threshold,
            None => {
                let found = normalize_title(found);
                found.len() >= 8 && normalize_title(&citation.raw_text).contains(&found)
            }
        };
        Ok(if matched { record.doi } else { None })
    }
}

fn unverifiable(reason: &str) -> VerificationOutcome {
    VerificationOutcome::Unverifiable {
        reason: reason.to_string(),
    }
}

fn unavailable(e: &RegistryError) -> VerificationOutcome {
    warn!(phase = "verify", code = e.kind().code(), "{}", e);
    VerificationOutcome::Unverifiable { reason: e.to_string() }
}

fn already_accepted(accepted: &[Settled], candidate: &Settled) -> bool {
    match &candidate.record.doi {
        Some(doi) => accepted.iter().any(|s| s.record.doi.as_ref() == Some(doi)),
        None => false,
    }
}

/// Highest-provenance value for `field`, first in claim order on ties.
fn best_value(claims: &[MetadataClaim], field: Field) -> Option<&FieldValue> {
    let mut best: Option<&MetadataClaim> = None;
    for claim in claims.iter().filter(|c| c.field() == field) {
        if best.is_none_or(|b| claim.provenance > b.provenance) {
            best = Some(claim);
        }
    }
    best.map(|c| &c.value)
}

/// A record without authors cannot be told apart, so it passes; so does
/// any record when nobody claimed an author.
fn shares_author(record: &RegistryRecord, claimed_surnames: &[String]) -> bool {
    record.authors.is_empty()
        || claimed_surnames.is_empty()
        || surnames(&record.authors).iter().any(|s| claimed_surnames.contains(s))
}

fn surnames(names: &[String]) -> Vec<String> {
    names
        .iter()
        .filter_map(|n| author_key(n).split_whitespace().next().map(str::to_string))
        .collect()
}

/// Registry claims carried by an accepted record.
fn claims_from_record(record: &RegistryRecord, claimed_isbns: &[String]) -> Vec<MetadataClaim> {
    let mut values = Vec::new();
    if let Some(title) = &record.title {
        values.push(FieldValue::Title(title.clone()));
    }
    if !record.authors.is_empty() {
        values.push(FieldValue::Author(record.authors.clone()));
    }
    if let Some(doi) = &record.doi {
        values.push(FieldValue::Doi(doi.clone()));
    }
    if let Some(year) = record.year {
        values.push(FieldValue::Year(year));
    }
    if let Some(publisher) = &record.publisher {
        values.push(FieldValue::Publisher(publisher.clone()));
    }
    if let Some(isbn) = claimed_isbns.iter().find(|i| record.isbns.contains(i)) {
        values.push(FieldValue::Isbn(isbn.clone()));
    }
    values
        .into_iter()
        .filter(|v| !v.is_blank())
        .map(|v| MetadataClaim::new(v, Provenance::RegistryLookup))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ReviewRecord;
    use futures::future::BoxFuture;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Registry backed by fixed maps.
    #[derive(Default)]
    struct FixedRegistry {
        by_doi: HashMap<String, RegistryRecord>,
        by_isbn: HashMap<String, RegistryRecord>,
        search_hit: Option<RegistryRecord>,
        down: bool,
        calls: AtomicUsize,
        queries: Mutex<Vec<String>>,
    }

    impl Registry for FixedRegistry {
        fn name(&self) -> &'static str {
            "Fixed"
        }
        fn lookup_doi<'a>(&'a self, doi: &'a str) -> BoxFuture<'a, Result<Option<RegistryRecord>, RegistryError>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let r = if self.down {
                Err(RegistryError::Unavailable { registry: "Fixed", detail: "down".into() })
            } else {
                Ok(self.by_doi.get(doi).cloned())
            };
            Box::pin(async move { r })
        }
        fn lookup_isbn<'a>(&'a self, isbn: &'a str) -> BoxFuture<'a, Result<Option<RegistryRecord>, RegistryError>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let r = Ok(self.by_isbn.get(isbn).cloned());
            Box::pin(async move { r })
        }
        fn search<'a>(&'a self, query: &'a str) -> BoxFuture<'a, Result<Option<RegistryRecord>, RegistryError>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.queries.lock().unwrap().push(query.to_string());
            let r = if self.down {
                Err(RegistryError::Unavailable { registry: "Fixed", detail: "down".into() })
            } else {
                Ok(self.search_hit.clone())
            };
            Box::pin(async move { r })
        }
    }

    /// Review index answering from two fixed slots.
    #[derive(Default)]
    struct FixedReview {
        by_doi: Option<ReviewRecord>,
        by_metadata: Option<ReviewRecord>,
        searches: Mutex<Vec<(String, Option<String>)>>,
    }

    impl FixedReview {
        fn general_topology() -> Self {
            Self {
                by_doi: Some(ReviewRecord {
                    zbl_id: "0684.54001".into(),
                    msc: vec!["54-01".into()],
                    title: None,
                }),
                ..Default::default()
            }
        }
    }

    impl ReviewIndex for FixedReview {
        fn name(&self) -> &'static str {
            "Review"
        }
        fn lookup_doi<'a>(&'a self, _doi: &'a str) -> BoxFuture<'a, Result<Option<ReviewRecord>, RegistryError>> {
            let r = self.by_doi.clone();
            Box::pin(async move { Ok(r) })
        }
        fn search_metadata<'a>(
            &'a self,
            title: &'a str,
            author: Option<&'a str>,
        ) -> BoxFuture<'a, Result<Option<ReviewRecord>, RegistryError>> {
            self.searches
                .lock()
                .unwrap()
                .push((title.to_string(), author.map(str::to_string)));
            let r = self.by_metadata.clone();
            Box::pin(async move { Ok(r) })
        }
    }

    fn verifier(registry: FixedRegistry, review: Option<FixedReview>) -> Verifier {
        let config = PipelineConfig::builder()
            .registry_retry(RetryPolicy::no_retry(Duration::from_secs(1)))
            .build()
            .unwrap();
        Verifier::new(
            Arc::new(registry),
            review.map(|r| Arc::new(r) as Arc<dyn ReviewIndex>),
            &config,
        )
    }

    fn ai(value: FieldValue) -> MetadataClaim {
        MetadataClaim::new(value, Provenance::AiExtraction)
    }

    fn book(doi: &str, title: &str) -> RegistryRecord {
        RegistryRecord {
            doi: Some(doi.into()),
            title: Some(title.into()),
            authors: vec!["Ryszard Engelking".into()],
            year: Some(1989),
            work_type: Some("book".into()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn chapter_doi_is_upgraded_to_work() {
        let chapter = RegistryRecord {
            doi: Some("10.1007/978-3-642-10750-2_4".into()),
            title: Some("Compactness".into()),
            work_type: Some("book-chapter".into()),
            ..Default::default()
        };
        let mut registry = FixedRegistry::default();
        registry.by_doi.insert("10.1007/978-3-642-10750-2_4".into(), chapter);
        registry
            .by_doi
            .insert("10.1007/978-3-642-10750-2".into(), book("10.1007/978-3-642-10750-2", "General Topology"));

        let claims = vec![
            ai(FieldValue::Title("General Topology".into())),
            ai(FieldValue::Doi("10.1007/978-3-642-10750-2_4".into())),
        ];
        let report = verifier(registry, None).verify_claims(&claims).await;

        assert_eq!(
            report.doi_upgrades,
            vec![("10.1007/978-3-642-10750-2_4".to_string(), "10.1007/978-3-642-10750-2".to_string())]
        );
        let dois: Vec<_> = report.claims.iter().filter(|c| c.field() == Field::Doi).collect();
        assert_eq!(dois.len(), 1);
        assert_eq!(dois[0].value, FieldValue::Doi("10.1007/978-3-642-10750-2".into()));
        assert_eq!(dois[0].provenance, Provenance::RegistryLookup);
    }

    #[tokio::test]
    async fn doi_for_other_book_is_contradicted() {
        let mut registry = FixedRegistry::default();
        registry.by_doi.insert("10.1000/x".into(), book("10.1000/x", "Algebraic Number Theory"));
        let claims = vec![
            ai(FieldValue::Title("General Topology".into())),
            ai(FieldValue::Doi("10.1000/x".into())),
        ];
        let report = verifier(registry, None).verify_claims(&claims).await;
        let doi_result = report.results.iter().find(|r| r.claim.field() == Field::Doi).unwrap();
        assert!(matches!(doi_result.outcome, VerificationOutcome::Contradicted { .. }));
        assert!(report.claims.iter().all(|c| c.provenance != Provenance::RegistryLookup));
    }

    #[tokio::test]
    async fn unreachable_registry_is_neutral() {
        let registry = FixedRegistry {
            down: true,
            ..Default::default()
        };
        let claims = vec![
            ai(FieldValue::Title("General Topology".into())),
            ai(FieldValue::Doi("10.1000/x".into())),
        ];
        let report = verifier(registry, None).verify_claims(&claims).await;
        assert_eq!(report.results.len(), 2);
        assert!(report
            .results
            .iter()
            .all(|r| matches!(r.outcome, VerificationOutcome::Unverifiable { .. })));
        assert_eq!(report.claims, claims);
    }

    #[tokio::test]
    async fn title_search_adds_registry_claims_and_review_msc() {
        let registry = FixedRegistry {
            search_hit: Some(book("10.1000/gt", "General Topology, 2nd ed.")),
            ..Default::default()
        };
        let claims = vec![
            MetadataClaim::new(FieldValue::Title("Topology".into()), Provenance::FilenameHeuristic),
            ai(FieldValue::Title("General Topology".into())),
            ai(FieldValue::Author(vec!["R. Engelking".into()])),
        ];
        let report = verifier(registry, Some(FixedReview::general_topology())).verify_claims(&claims).await;
        assert!(report.any_confirmed());
        let author = report.results.iter().find(|r| r.claim.field() == Field::Author).unwrap();
        assert!(author.is_confirmed());
        assert!(report.claims.iter().any(|c| c.provenance == Provenance::RegistryLookup
            && c.value == FieldValue::Title("General Topology, 2nd ed.".into())));
        assert!(report
            .claims
            .iter()
            .any(|c| c.value == FieldValue::Msc(vec!["54-01".into()])));
        assert_eq!(report.zbl_id.as_deref(), Some("0684.54001"));
    }

    #[tokio::test]
    async fn citations_respect_lookup_bound_and_failures() {
        let registry = FixedRegistry {
            search_hit: Some(book("10.1000/kelley", "General Topology")),
            ..Default::default()
        };
        let mut v = verifier(registry, None);
        v.max_citation_lookups = 2;
        let cite = |raw: &str, title: Option<&str>| Citation {
            raw_text: raw.into(),
            title: title.map(str::to_string),
            author: None,
            year: None,
            chunk: 0,
        };
        let citations = vec![
            cite("[1] J. L. Kelley, General Topology, Van Nostrand, 1955.", Some("General Topology")),
            cite("[2] N. Bourbaki, Topologie générale, Hermann, 1940.", Some("Topologie générale")),
            cite("[3] J. L. Kelley, General Topology, Van Nostrand, 1955.", Some("General Topology")),
        ];
        let entries = v.resolve_citations(&citations).await;
        assert_eq!(entries[0].confidence, confidence::CONFIRMED);
        assert_eq!(entries[0].resolved_doi.as_deref(), Some("10.1000/kelley"));
        assert_eq!(entries[1].confidence, confidence::NOT_ATTEMPTED);
        assert_eq!(entries[2].confidence, confidence::NOT_ATTEMPTED);
        assert_eq!(entries[2].resolved_doi, None);
    }

    #[tokio::test]
    async fn citation_lookup_failure_is_minus_one() {
        let registry = FixedRegistry {
            down: true,
            ..Default::default()
        };
        let entries = verifier(registry, None)
            .resolve_citations(&[Citation {
                raw_text: "Munkres, Topology, 2000".into(),
                title: None,
                author: None,
                year: None,
                chunk: 0,
            }])
            .await;
        assert_eq!(entries[0].confidence, confidence::LOOKUP_FAILED);
    }

    #[tokio::test]
    async fn same_title_by_other_authors_is_not_adopted() {
        let registry = FixedRegistry {
            search_hit: Some(book("10.1000/engelking", "General Topology")),
            ..Default::default()
        };
        let claims = vec![
            ai(FieldValue::Title("General Topology".into())),
            ai(FieldValue::Author(vec!["John L. Kelley".into()])),
            ai(FieldValue::Year(1955)),
        ];
        let report = verifier(registry, None).verify_claims(&claims).await;

        let title = report.results.iter().find(|r| r.claim.field() == Field::Title).unwrap();
        assert!(matches!(title.outcome, VerificationOutcome::Unverifiable { .. }));
        let author = report.results.iter().find(|r| r.claim.field() == Field::Author).unwrap();
        assert!(matches!(author.outcome, VerificationOutcome::Unverifiable { .. }));
        assert_eq!(report.claims, claims);

        let resolution =
            crate::pipeline::resolve::resolve_fields(&report.claims, &report.results, &Default::default());
        assert_eq!(
            resolution[&Field::Author].value,
            Some(FieldValue::Author(vec!["John L. Kelley".into()]))
        );
        assert_eq!(resolution[&Field::Year].value, Some(FieldValue::Year(1955)));
        assert!(!resolution.contains_key(&Field::Doi));
        assert!(resolution.values().all(|r| r.provenance == Some(Provenance::AiExtraction)));
    }

    #[tokio::test]
    async fn search_hit_sharing_a_surname_is_adopted() {
        let registry = FixedRegistry {
            search_hit: Some(book("10.1000/engelking", "General Topology")),
            ..Default::default()
        };
        let claims = vec![
            MetadataClaim::new(FieldValue::Author(vec!["Engelking".into()]), Provenance::FilenameHeuristic),
            ai(FieldValue::Title("General Topology".into())),
            ai(FieldValue::Author(vec!["R. Engelking".into(), "K. Sieklucki".into()])),
        ];
        let report = verifier(registry, None).verify_claims(&claims).await;
        assert!(report
            .claims
            .iter()
            .any(|c| c.provenance == Provenance::RegistryLookup && c.value == FieldValue::Doi("10.1000/engelking".into())));
    }

    #[tokio::test]
    async fn review_index_falls_back_to_title_and_author() {
        let review = Arc::new(FixedReview {
            by_metadata: Some(ReviewRecord {
                zbl_id: "0102.37701".into(),
                msc: vec!["54-01".into()],
                title: Some("General topology".into()),
            }),
            ..Default::default()
        });
        let config = PipelineConfig::builder()
            .registry_retry(RetryPolicy::no_retry(Duration::from_secs(1)))
            .build()
            .unwrap();
        let v = Verifier::new(
            Arc::new(FixedRegistry::default()),
            Some(review.clone() as Arc<dyn ReviewIndex>),
            &config,
        );
        let claims = vec![
            ai(FieldValue::Title("General Topology".into())),
            ai(FieldValue::Author(vec!["John L. Kelley".into()])),
        ];
        let report = v.verify_claims(&claims).await;

        assert_eq!(report.zbl_id.as_deref(), Some("0102.37701"));
        assert!(report.review_trusted());
        assert!(report.claims.iter().any(|c| c.value == FieldValue::Msc(vec!["54-01".into()])));
        assert_eq!(
            review.searches.lock().unwrap().as_slice(),
            &[("General Topology".to_string(), Some("John L. Kelley".to_string()))]
        );
    }

    #[tokio::test]
    async fn review_entry_under_another_title_is_not_trusted() {
        let mut registry = FixedRegistry::default();
        registry.by_doi.insert("10.1000/gt".into(), book("10.1000/gt", "General Topology"));
        let review = FixedReview {
            by_doi: Some(ReviewRecord {
                zbl_id: "1234.00001".into(),
                msc: vec!["11-01".into()],
                title: Some("Algebraic number theory".into()),
            }),
            ..Default::default()
        };
        let claims = vec![
            ai(FieldValue::Title("General Topology".into())),
            ai(FieldValue::Doi("10.1000/gt".into())),
        ];
        let report = verifier(registry, Some(review)).verify_claims(&claims).await;

        assert_eq!(report.zbl_id.as_deref(), Some("1234.00001"));
        assert!(!report.review_trusted());
        assert!(report.claims.iter().all(|c| c.field() != Field::Msc));
    }

    #[tokio::test]
    async fn resolved_citations_carry_zbl_ids() {
        let registry = FixedRegistry {
            search_hit: Some(book("10.1000/kelley", "General Topology")),
            ..Default::default()
        };
        let entries = verifier(registry, Some(FixedReview::general_topology()))
            .resolve_citations(&[
                Citation {
                    raw_text: "J. L. Kelley, General Topology, Van Nostrand, 1955.".into(),
                    title: Some("General Topology".into()),
                    author: None,
                    year: Some(1955),
                    chunk: 0,
                },
                Citation {
                    raw_text: "[7]".into(),
                    title: None,
                    author: None,
                    year: None,
                    chunk: 0,
                },
            ])
            .await;
        assert_eq!(entries[0].resolved_zbl_id.as_deref(), Some("0684.54001"));
        assert_eq!(entries[1].resolved_doi, None);
        assert_eq!(entries[1].resolved_zbl_id, None);
    }
}
