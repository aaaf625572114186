//! Instructions sent to the reasoning model.
//!
//! Every prompt lives here so tests can inspect them without a model and so
//! a wording change never touches retry or parsing code. Each extraction
//! prompt names the exact JSON shape that [`crate::pipeline::response`]
//! accepts.

use crate::model::{ConflictRecord, RangePurpose, VerificationOutcome};

/// Shared preamble for every extraction call.
pub const LIBRARIAN_PREAMBLE: &str = "You are an expert mathematical librarian. \
You read scanned and digital book pages and return bibliographic data as strict JSON. \
Never invent values: use null for anything not printed on the pages you were given.";

/// JSON shape for front-matter, table-of-contents and full-scan slices.
pub const METADATA_SCHEMA: &str = r#"{
  "metadata": {
    "title": string | null,
    "author": [string] | null,
    "year": integer | null,
    "isbn": string | null,
    "doi": string | null,
    "msc": [string] | null,
    "publisher": string | null,
    "summary": string | null,
    "description": string | null,
    "audience": "undergraduate" | "graduate" | "research" | "popular" | null,
    "has_exercises": boolean | null,
    "has_solutions": boolean | null
  },
  "toc": [{"title": string, "page": integer | null, "level": integer}],
  "index_terms": [string],
  "page_offset": integer | null
}"#;

/// JSON shape for bibliography chunks.
pub const CITATIONS_SCHEMA: &str = r#"{
  "citations": [
    {"raw_text": string, "title": string | null, "author": string | null, "year": integer | null}
  ]
}"#;

/// JSON shape for the reflection answer.
pub const REFLECTION_SCHEMA: &str = r#"{
  "resolutions": [
    {"field": string, "value": string | [string] | integer | null, "reason": string}
  ]
}"#;

const METADATA_TASK: &str = "TASK: Extract the book's bibliographic metadata and its table of contents.\n\
- title: the full title as printed on the title page, including the subtitle.\n\
- author: every author or editor, one name per entry.\n\
- year, publisher, isbn, doi: from the title page or the copyright page.\n\
- msc: Mathematics Subject Classification 2020 codes (e.g. \"54-01\"), when printed or clearly implied.\n\
- summary: one or two sentences on the book's approach and key themes.\n\
- description: two or three paragraphs suitable for a research library catalogue.\n\
- audience: who the book is written for.\n\
- has_exercises, has_solutions: whether the book contains exercises, and worked solutions to them.\n\
- toc: every entry of the table of contents with its printed page number and nesting level (1 = chapter).\n\
- index_terms: key terms from the subject index if index pages are included, else the main topics of the table of contents.\n\
- page_offset: physical page index minus printed page number for the first numbered page, if you can tell.";

const CITATIONS_TASK: &str = "TASK: Transcribe every bibliography entry on these pages, in order.\n\
- raw_text: the entry verbatim, without its leading number or label.\n\
- title, author, year: parsed from the entry when present.\n\
- An entry cut off at the first or last page is still returned with the text that is visible.\n\
- Return an empty list if the pages contain no bibliography.";

/// Instruction string for a slice with the given purpose.
pub fn extraction_instructions(purpose: RangePurpose) -> String {
    match purpose {
        RangePurpose::Bibliography => format!(
            "{LIBRARIAN_PREAMBLE}\n\n{CITATIONS_TASK}\n\nReturn exactly this JSON object:\n{CITATIONS_SCHEMA}"
        ),
        RangePurpose::FullScan => format!(
            "{LIBRARIAN_PREAMBLE}\n\nThe location of the title page and bibliography is unknown; \
             these are the opening pages of the document.\n\n{METADATA_TASK}\n\n\
             If bibliography entries are visible, also return them under \"citations\" \
             in this form:\n{CITATIONS_SCHEMA}\n\nReturn exactly this JSON object:\n{METADATA_SCHEMA}"
        ),
        RangePurpose::FrontMatter | RangePurpose::TableOfContents | RangePurpose::Body => format!(
            "{LIBRARIAN_PREAMBLE}\n\n{METADATA_TASK}\n\nReturn exactly this JSON object:\n{METADATA_SCHEMA}"
        ),
    }
}

/// Reflection prompt listing every conflict with its claims and evidence.
pub fn reflection_prompt(conflicts: &[ConflictRecord], grounded: bool) -> String {
    let mut out = String::from(LIBRARIAN_PREAMBLE);
    out.push_str("\n\nTASK: Automated extraction produced conflicting values for the fields below. ");
    if grounded {
        out.push_str("The attached pages are the book's front matter. ");
    }
    out.push_str(
        "For each field choose the correct value from the listed candidates, \
         or null if none is supported by the evidence. Registry-confirmed values \
         are authoritative unless they clearly describe a different book.\n",
    );

    for conflict in conflicts {
        out.push_str(&format!("\nFIELD: {}\n", conflict.field));
        for claim in &conflict.claims {
            let evidence: Vec<String> = conflict
                .verifications
                .iter()
                .filter(|v| v.claim.value == claim.value)
                .map(|v| match &v.outcome {
                    VerificationOutcome::Confirmed => format!("confirmed by {}", v.registry),
                    VerificationOutcome::Contradicted { counter_value } => {
                        format!("{} says \"{}\"", v.registry, counter_value.display())
                    }
                    VerificationOutcome::Unverifiable { reason } => {
                        format!("{} could not verify ({})", v.registry, reason)
                    }
                })
                .collect();
            out.push_str(&format!(
                "- \"{}\" (source: {:?}{})\n",
                claim.value.display(),
                claim.provenance,
                if evidence.is_empty() {
                    String::new()
                } else {
                    format!("; {}", evidence.join("; "))
                }
            ));
        }
    }
    out.push_str(&format!("\nReturn exactly this JSON object:\n{REFLECTION_SCHEMA}"));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Field, FieldValue, MetadataClaim, Provenance, VerificationResult};

    #[test]
    fn bibliography_prompt_asks_for_citations_only() {
        let p = extraction_instructions(RangePurpose::Bibliography);
        assert!(p.contains("\"citations\""));
        assert!(!p.contains("\"metadata\""));
    }

    #[test]
    fn front_matter_prompt_asks_for_metadata_and_toc() {
        let p = extraction_instructions(RangePurpose::FrontMatter);
        assert!(p.contains("\"metadata\""));
        assert!(p.contains("\"toc\""));
        assert!(p.contains("\"index_terms\""));
        assert!(p.contains("\"has_exercises\""));
    }

    #[test]
    fn full_scan_prompt_asks_for_both() {
        let p = extraction_instructions(RangePurpose::FullScan);
        assert!(p.contains("\"metadata\""));
        assert!(p.contains("\"citations\""));
    }

    #[test]
    fn reflection_prompt_lists_claims_and_evidence() {
        let ai = MetadataClaim::new(FieldValue::Year(1955), Provenance::AiExtraction);
        let fname = MetadataClaim::new(FieldValue::Year(1975), Provenance::FilenameHeuristic);
        let conflict = ConflictRecord {
            field: Field::Year,
            claims: vec![ai.clone(), fname],
            verifications: vec![VerificationResult {
                claim: ai,
                outcome: VerificationOutcome::Unverifiable {
                    reason: "no match".into(),
                },
                registry: "Crossref".into(),
            }],
        };
        let p = reflection_prompt(&[conflict], true);
        assert!(p.contains("FIELD: year"));
        assert!(p.contains("\"1955\""));
        assert!(p.contains("\"1975\""));
        assert!(p.contains("Crossref could not verify"));
        assert!(p.contains("front matter"));
    }
}
