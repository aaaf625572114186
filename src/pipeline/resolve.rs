//! Merging batches and settling fields.
//!
//! Pure functions over the data the earlier phases produced; nothing here
//! performs I/O, so identical inputs always resolve to identical fields.
//!
//! Precedence is `RegistryLookup > AiExtraction > FilenameHeuristic`. A
//! claim the registry contradicted never wins. When the top tier holds
//! more than one distinct value, a reflection choice may pick one of them;
//! otherwise the field is left empty and flagged for review.

use crate::model::{
    Citation, ConflictRecord, Descriptive, Field, FieldValue, MetadataClaim, Resolution, ResolvedField,
    TocEntry, VerificationOutcome, VerificationResult, VerificationStatus,
};
use crate::normalize::normalize_title;
use crate::pipeline::response::ExtractionBatch;
use crate::state::SliceJob;
use std::collections::{BTreeMap, HashSet};
use tracing::debug;

/// Filename claims followed by AI claims in plan order; blanks dropped.
pub fn collect_claims(filename_claims: &[MetadataClaim], batches: &[(SliceJob, ExtractionBatch)]) -> Vec<MetadataClaim> {
    filename_claims
        .iter()
        .chain(batches.iter().flat_map(|(_, b)| b.claims.iter()))
        .filter(|c| !c.value.is_blank())
        .cloned()
        .collect()
}

/// Citations in chunk order.
///
/// With `overlap_pages > 0` consecutive chunks share pages, so a citation
/// whose normalised text already appeared in the previous chunk is dropped.
/// Without overlap nothing is dropped: two identical entries in adjacent
/// chunks are two entries on the page.
pub fn merge_citations(batches: &[(SliceJob, ExtractionBatch)], overlap_pages: usize) -> Vec<Citation> {
    let mut out: Vec<Citation> = Vec::new();
    let mut previous_chunk: HashSet<String> = HashSet::new();
    let mut current_chunk: HashSet<String> = HashSet::new();
    let mut current_index: Option<usize> = None;

    for (job, batch) in batches {
        if current_index != Some(job.index) {
            previous_chunk = std::mem::take(&mut current_chunk);
            current_index = Some(job.index);
        }
        for citation in &batch.citations {
            let key = normalize_title(&citation.raw_text);
            if key.is_empty() {
                continue;
            }
            if overlap_pages > 0 && previous_chunk.contains(&key) {
                debug!("Dropping boundary duplicate from chunk {}: {}", citation.chunk, citation.raw_text);
                continue;
            }
            current_chunk.insert(key);
            out.push(citation.clone());
        }
    }
    out
}

/// ToC entries from every batch in plan order, exact repeats removed, plus
/// the first page offset any batch reported.
pub fn merge_toc(batches: &[(SliceJob, ExtractionBatch)]) -> (Vec<TocEntry>, Option<i64>) {
    let mut seen = HashSet::new();
    let mut entries = Vec::new();
    for (_, batch) in batches {
        for entry in &batch.toc {
            if seen.insert((normalize_title(&entry.title), entry.page)) {
                entries.push(entry.clone());
            }
        }
    }
    let offset = batches.iter().find_map(|(_, b)| b.page_offset);
    (entries, offset)
}

/// First non-empty text fields; a flag is set if any slice set it; index
/// terms from every slice, repeats dropped.
pub fn merge_descriptive(batches: &[(SliceJob, ExtractionBatch)]) -> Descriptive {
    let flag = |get: fn(&Descriptive) -> Option<bool>| {
        batches
            .iter()
            .filter_map(|(_, b)| get(&b.descriptive))
            .reduce(|a, b| a || b)
    };
    let mut seen = HashSet::new();
    let index_terms = batches
        .iter()
        .flat_map(|(_, b)| b.descriptive.index_terms.iter())
        .filter(|t| seen.insert(t.to_lowercase()))
        .cloned()
        .collect();
    Descriptive {
        summary: batches.iter().find_map(|(_, b)| b.descriptive.summary.clone()),
        description: batches.iter().find_map(|(_, b)| b.descriptive.description.clone()),
        audience: batches.iter().find_map(|(_, b)| b.descriptive.audience),
        has_exercises: flag(|d| d.has_exercises),
        has_solutions: flag(|d| d.has_solutions),
        index_terms,
    }
}

fn is_refuted(claim: &MetadataClaim, verifications: &[VerificationResult]) -> bool {
    let key = claim.value.comparison_key();
    let mut contradicted = false;
    for v in verifications
        .iter()
        .filter(|v| v.claim.field() == claim.field() && v.claim.value.comparison_key() == key)
    {
        match v.outcome {
            VerificationOutcome::Confirmed => return false,
            VerificationOutcome::Contradicted { .. } => contradicted = true,
            VerificationOutcome::Unverifiable { .. } => {}
        }
    }
    contradicted
}

/// One representative claim per distinct value, best provenance first.
fn distinct_claims(claims: &[&MetadataClaim]) -> Vec<MetadataClaim> {
    let mut sorted: Vec<&MetadataClaim> = claims.to_vec();
    // Stable: within a tier the earliest claim is the representative.
    sorted.sort_by(|a, b| b.provenance.cmp(&a.provenance));
    let mut seen = HashSet::new();
    sorted
        .into_iter()
        .filter(|c| seen.insert(c.value.comparison_key()))
        .cloned()
        .collect()
}

/// Fields whose claims still disagree after verification.
pub fn find_conflicts(claims: &[MetadataClaim], verifications: &[VerificationResult]) -> Vec<ConflictRecord> {
    let mut out = Vec::new();
    for field in Field::ALL {
        let of_field: Vec<&MetadataClaim> = claims.iter().filter(|c| c.field() == field).collect();
        let distinct = distinct_claims(&of_field);
        if distinct.len() < 2 {
            continue;
        }
        out.push(ConflictRecord {
            field,
            claims: distinct,
            verifications: verifications
                .iter()
                .filter(|v| v.claim.field() == field)
                .cloned()
                .collect(),
        });
    }
    out
}

/// Settle every field that has at least one claim.
///
/// `choices` are reflection answers; a choice only counts when it equals
/// one of the top-tier candidates.
pub fn resolve_fields(
    claims: &[MetadataClaim],
    verifications: &[VerificationResult],
    choices: &BTreeMap<Field, FieldValue>,
) -> Resolution {
    let mut resolution = Resolution::new();
    for field in Field::ALL {
        let of_field: Vec<&MetadataClaim> = claims.iter().filter(|c| c.field() == field).collect();
        if of_field.is_empty() {
            continue;
        }
        let candidates: Vec<&MetadataClaim> = of_field
            .iter()
            .copied()
            .filter(|c| !is_refuted(c, verifications))
            .collect();
        let Some(top) = candidates.iter().map(|c| c.provenance).max() else {
            resolution.insert(field, ResolvedField::needs_review());
            continue;
        };
        let top_tier: Vec<&MetadataClaim> = candidates.iter().copied().filter(|c| c.provenance == top).collect();
        let distinct = distinct_claims(&top_tier);

        let chosen = match choices.get(&field) {
            Some(choice) => {
                let key = choice.comparison_key();
                distinct.iter().find(|c| c.value.comparison_key() == key).cloned()
            }
            None => None,
        };
        let settled = match (chosen, distinct.len()) {
            (Some(claim), _) => ResolvedField::settled(claim.value, top),
            (None, 1) => ResolvedField::settled(distinct[0].value.clone(), top),
            _ => ResolvedField::needs_review(),
        };
        resolution.insert(field, settled);
    }
    resolution
}

/// Fields flagged for review, in field order.
pub fn review_fields(resolution: &Resolution) -> Vec<Field> {
    resolution
        .iter()
        .filter(|(_, r)| r.needs_review)
        .map(|(f, _)| *f)
        .collect()
}

/// `review_trusted` is false when the review index files the book under a
/// noticeably different title.
pub fn verification_status(resolution: &Resolution, any_confirmed: bool, review_trusted: bool) -> VerificationStatus {
    if !review_trusted || resolution.values().any(|r| r.needs_review) {
        VerificationStatus::Conflict
    } else if any_confirmed {
        VerificationStatus::Verified
    } else {
        VerificationStatus::Raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Audience, PageRange, Provenance, RangePurpose};

    fn claim(value: FieldValue, provenance: Provenance) -> MetadataClaim {
        MetadataClaim::new(value, provenance)
    }

    fn title(s: &str) -> FieldValue {
        FieldValue::Title(s.to_string())
    }

    #[test]
    fn registry_beats_ai_beats_filename() {
        let claims = vec![
            claim(title("Topology"), Provenance::FilenameHeuristic),
            claim(title("General Topology"), Provenance::AiExtraction),
            claim(title("General Topology, 2nd ed."), Provenance::RegistryLookup),
        ];
        let r = resolve_fields(&claims, &[], &BTreeMap::new());
        assert_eq!(r[&Field::Title].value, Some(title("General Topology, 2nd ed.")));
        assert_eq!(r[&Field::Title].provenance, Some(Provenance::RegistryLookup));
        assert_eq!(find_conflicts(&claims, &[])[0].claims.len(), 3);
    }

    #[test]
    fn contradicted_claim_never_wins() {
        let doi = claim(FieldValue::Doi("10.1000/x".into()), Provenance::AiExtraction);
        let verifications = vec![VerificationResult {
            claim: doi.clone(),
            outcome: VerificationOutcome::Contradicted {
                counter_value: title("Another Book"),
            },
            registry: "Crossref".into(),
        }];
        let r = resolve_fields(&[doi], &verifications, &BTreeMap::new());
        assert!(r[&Field::Doi].needs_review);
        assert_eq!(r[&Field::Doi].value, None);
    }

    #[test]
    fn tie_needs_review_unless_reflection_picks_a_candidate() {
        let claims = vec![
            claim(FieldValue::Year(1955), Provenance::AiExtraction),
            claim(FieldValue::Year(1975), Provenance::AiExtraction),
            claim(FieldValue::Year(2000), Provenance::FilenameHeuristic),
        ];
        let r = resolve_fields(&claims, &[], &BTreeMap::new());
        assert!(r[&Field::Year].needs_review);
        assert_eq!(review_fields(&r), vec![Field::Year]);

        let mut choices = BTreeMap::new();
        choices.insert(Field::Year, FieldValue::Year(1955));
        let r = resolve_fields(&claims, &[], &choices);
        assert_eq!(r[&Field::Year].value, Some(FieldValue::Year(1955)));

        // A choice outside the top tier is ignored.
        choices.insert(Field::Year, FieldValue::Year(2000));
        let r = resolve_fields(&claims, &[], &choices);
        assert!(r[&Field::Year].needs_review);
    }

    #[test]
    fn equivalent_values_are_not_a_conflict() {
        let claims = vec![
            claim(title("General Topology"), Provenance::AiExtraction),
            claim(title("GENERAL  TOPOLOGY"), Provenance::AiExtraction),
        ];
        assert!(find_conflicts(&claims, &[]).is_empty());
        let r = resolve_fields(&claims, &[], &BTreeMap::new());
        assert_eq!(r[&Field::Title].value, Some(title("General Topology")));
    }

    fn bib_batch(index: usize, chunk: usize, raws: &[&str]) -> (SliceJob, ExtractionBatch) {
        let range = PageRange::new(index * 10, index * 10 + 9, RangePurpose::Bibliography);
        let mut batch = ExtractionBatch::empty(range);
        batch.citations = raws
            .iter()
            .map(|r| Citation {
                raw_text: r.to_string(),
                title: None,
                author: None,
                year: None,
                chunk,
            })
            .collect();
        (SliceJob { index, range, chunk }, batch)
    }

    #[test]
    fn overlap_duplicates_are_dropped_only_with_overlap() {
        let batches = vec![
            bib_batch(0, 0, &["[1] Alexandroff, Urysohn.", "[2] Bourbaki, Topologie."]),
            bib_batch(1, 1, &["[2] Bourbaki, Topologie.", "[3] Cech, Bicompact spaces."]),
        ];
        assert_eq!(merge_citations(&batches, 0).len(), 4);
        let merged = merge_citations(&batches, 2);
        assert_eq!(merged.len(), 3);
        assert_eq!(merged[2].raw_text, "[3] Cech, Bicompact spaces.");
        assert_eq!(merged.iter().map(|c| c.chunk).collect::<Vec<_>>(), vec![0, 0, 1]);
    }

    #[test]
    fn toc_merge_keeps_order_and_first_offset() {
        let range = PageRange::new(0, 19, RangePurpose::TableOfContents);
        let mut a = ExtractionBatch::empty(range);
        a.toc = vec![
            TocEntry { title: "Introduction".into(), page: Some(1), level: 1 },
            TocEntry { title: "Compactness".into(), page: Some(120), level: 1 },
        ];
        a.page_offset = Some(12);
        let mut b = ExtractionBatch::empty(PageRange::new(0, 19, RangePurpose::FullScan));
        b.toc = vec![TocEntry { title: "Introduction".into(), page: Some(1), level: 1 }];
        b.page_offset = Some(14);
        let job = SliceJob { index: 0, range, chunk: 0 };
        let (toc, offset) = merge_toc(&[(job, a), (SliceJob { index: 1, ..job }, b)]);
        assert_eq!(toc.len(), 2);
        assert_eq!(offset, Some(12));
    }

    #[test]
    fn status_reflects_review_and_confirmation() {
        let mut r = Resolution::new();
        r.insert(Field::Title, ResolvedField::settled(title("X"), Provenance::AiExtraction));
        assert_eq!(verification_status(&r, false, true), VerificationStatus::Raw);
        assert_eq!(verification_status(&r, true, true), VerificationStatus::Verified);
        assert_eq!(verification_status(&r, true, false), VerificationStatus::Conflict);
        r.insert(Field::Year, ResolvedField::needs_review());
        assert_eq!(verification_status(&r, true, true), VerificationStatus::Conflict);
    }

    #[test]
    fn descriptive_merge_prefers_first_and_ors_flags() {
        let range = PageRange::new(0, 19, RangePurpose::FrontMatter);
        let job = SliceJob { index: 0, range, chunk: 0 };
        let mut a = ExtractionBatch::empty(range);
        a.descriptive = Descriptive {
            summary: Some("Point-set topology.".into()),
            has_exercises: Some(false),
            index_terms: vec!["nets".into(), "filters".into()],
            ..Default::default()
        };
        let mut b = ExtractionBatch::empty(range);
        b.descriptive = Descriptive {
            summary: Some("Ignored.".into()),
            audience: Some(Audience::Graduate),
            has_exercises: Some(true),
            index_terms: vec!["Filters".into(), "uniform spaces".into()],
            ..Default::default()
        };
        let merged = merge_descriptive(&[(job, a), (SliceJob { index: 1, ..job }, b)]);
        assert_eq!(merged.summary.as_deref(), Some("Point-set topology."));
        assert_eq!(merged.audience, Some(Audience::Graduate));
        assert_eq!(merged.has_exercises, Some(true));
        assert_eq!(merged.has_solutions, None);
        assert_eq!(merged.index_terms, vec!["nets", "filters", "uniform spaces"]);
    }
}
