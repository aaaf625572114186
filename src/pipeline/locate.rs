//! Heuristic locator: find the table of contents and the bibliography.
//!
//! Only headings near the top of a page count (the first
//! `marker_window_chars` characters), which keeps running text such as
//! "see the references in chapter 3" from triggering a match.
//!
//! * Front matter: pages `0..20`, or up to the ToC page + 20 when a ToC
//!   heading appears in the first `front_scan_pages` pages.
//! * Bibliography: the first heading found in the last `back_scan_pages`
//!   pages, through the end of the document.
//!
//! No heading at all, or no text layer, yields an empty range set and the
//! orchestrator switches to its full-document fallback plan.

use crate::error::SliceError;
use crate::model::{PageRange, RangePurpose};
use crate::pipeline::slice::DocumentBackend;
use crate::pipeline::source::SourceDocument;
use tracing::{debug, info};

/// Table-of-contents headings (EN, DE, FR, IT, ES, RU).
pub const TOC_MARKERS: &[&str] = &[
    "contents",
    "table of contents",
    "inhaltsverzeichnis",
    "inhalt",
    "table des matières",
    "sommaire",
    "indice",
    "índice",
    "sommario",
    "contenido",
    "оглавление",
    "содержание",
];

/// Bibliography headings (EN, DE, FR, IT, ES, RU).
pub const BIB_MARKERS: &[&str] = &[
    "bibliography",
    "references",
    "literaturverzeichnis",
    "literatur",
    "bibliographie",
    "références",
    "bibliografia",
    "bibliografía",
    "referencias",
    "литература",
    "список литературы",
];

/// Locator tuning, copied out of the pipeline config.
#[derive(Debug, Clone, Copy)]
pub struct LocatorSettings {
    pub front_scan_pages: usize,
    pub back_scan_pages: usize,
    pub front_matter_pages: usize,
    pub marker_window_chars: usize,
}

/// Ranges found for one document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocatorReport {
    pub ranges: Vec<PageRange>,
    pub has_text_layer: bool,
    pub toc_page: Option<usize>,
    pub bibliography_start: Option<usize>,
}

impl LocatorReport {
    pub fn no_text_layer() -> Self {
        Self {
            ranges: Vec::new(),
            has_text_layer: false,
            toc_page: None,
            bibliography_start: None,
        }
    }
}

/// Scan the document and report its tagged ranges.
pub async fn locate(
    document: &SourceDocument,
    backend: &dyn DocumentBackend,
    settings: &LocatorSettings,
) -> Result<LocatorReport, SliceError> {
    if !document.has_text_layer() {
        info!("{}: no text layer, vision-only plan", document.document_id);
        return Ok(LocatorReport::no_text_layer());
    }
    let n = document.page_count;

    let front: Vec<usize> = (0..settings.front_scan_pages.min(n)).collect();
    let front_texts = document.page_texts(backend, &front).await?;
    let toc_page = find_marker(&front, &front_texts, TOC_MARKERS, settings.marker_window_chars);

    let back: Vec<usize> = (n.saturating_sub(settings.back_scan_pages)..n).collect();
    let back_texts = document.page_texts(backend, &back).await?;
    let bibliography_start = find_marker(&back, &back_texts, BIB_MARKERS, settings.marker_window_chars)
        .filter(|&p| toc_page.map_or(true, |t| p > t));

    let report = build_report(n, toc_page, bibliography_start, settings.front_matter_pages);
    debug!(
        "{}: toc={:?} bibliography={:?} ranges={:?}",
        document.document_id, report.toc_page, report.bibliography_start, report.ranges
    );
    Ok(report)
}

/// First page in `pages` whose opening characters contain a marker.
pub fn find_marker(pages: &[usize], texts: &[String], markers: &[&str], window: usize) -> Option<usize> {
    pages
        .iter()
        .zip(texts)
        .find(|(_, text)| has_heading(text, markers, window))
        .map(|(&page, _)| page)
}

fn has_heading(text: &str, markers: &[&str], window: usize) -> bool {
    let head: String = text.chars().take(window).collect::<String>().to_lowercase();
    markers.iter().any(|m| contains_word(&head, m))
}

/// `needle` occurs in `haystack` at word boundaries.
fn contains_word(haystack: &str, needle: &str) -> bool {
    let mut from = 0;
    while let Some(pos) = haystack[from..].find(needle) {
        let start = from + pos;
        let end = start + needle.len();
        let before_ok = haystack[..start]
            .chars()
            .next_back()
            .map_or(true, |c| !c.is_alphanumeric());
        let after_ok = haystack[end..].chars().next().map_or(true, |c| !c.is_alphanumeric());
        if before_ok && after_ok {
            return true;
        }
        from = end;
    }
    false
}

/// Pure range construction from the marker positions.
pub fn build_report(
    page_count: usize,
    toc_page: Option<usize>,
    bibliography_start: Option<usize>,
    front_matter_pages: usize,
) -> LocatorReport {
    let mut ranges = Vec::new();
    if page_count > 0 && (toc_page.is_some() || bibliography_start.is_some()) {
        let (end, purpose) = match toc_page {
            Some(t) => (t + front_matter_pages, RangePurpose::TableOfContents),
            None => (front_matter_pages, RangePurpose::FrontMatter),
        };
        let mut end = end.min(page_count).max(1) - 1;
        if let Some(b) = bibliography_start {
            if b > 0 && b <= end {
                end = b - 1;
            }
        }
        ranges.push(PageRange::new(0, end, purpose));

        if let Some(b) = bibliography_start {
            ranges.push(PageRange::new(b, page_count - 1, RangePurpose::Bibliography));
        }
    }
    LocatorReport {
        ranges,
        has_text_layer: true,
        toc_page,
        bibliography_start,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marker_must_be_near_top_of_page() {
        let pages = vec![3, 4];
        let texts = vec![
            format!("{}see the references below", "x ".repeat(400)),
            "References\n[1] Kelley".to_string(),
        ];
        assert_eq!(find_marker(&pages, &texts, BIB_MARKERS, 500), Some(4));
    }

    #[test]
    fn multilingual_markers() {
        let pages = vec![0, 1];
        let texts = vec!["Vorwort".to_string(), "INHALTSVERZEICHNIS\n1 Mengen".to_string()];
        assert_eq!(find_marker(&pages, &texts, TOC_MARKERS, 500), Some(1));
        let fr = vec!["Table des matières".to_string()];
        assert_eq!(find_marker(&[7], &fr, TOC_MARKERS, 500), Some(7));
    }

    #[test]
    fn markers_match_whole_words_only() {
        assert!(!contains_word("preferences", "references"));
        assert!(contains_word("7. references", "references"));
    }

    #[test]
    fn toc_extends_front_matter() {
        let r = build_report(400, Some(6), Some(380), 20);
        assert_eq!(r.ranges[0], PageRange::new(0, 25, RangePurpose::TableOfContents));
        assert_eq!(r.ranges[1], PageRange::new(380, 399, RangePurpose::Bibliography));
    }

    #[test]
    fn bibliography_only_uses_default_front_matter() {
        let r = build_report(300, None, Some(290), 20);
        assert_eq!(r.ranges[0], PageRange::new(0, 19, RangePurpose::FrontMatter));
    }

    #[test]
    fn no_markers_is_empty() {
        let r = build_report(300, None, None, 20);
        assert!(r.ranges.is_empty());
        assert!(r.has_text_layer);
    }

    #[test]
    fn short_document_ranges_do_not_overlap() {
        let r = build_report(15, Some(1), Some(10), 20);
        assert_eq!(r.ranges[0], PageRange::new(0, 9, RangePurpose::TableOfContents));
        assert_eq!(r.ranges[1], PageRange::new(10, 14, RangePurpose::Bibliography));
    }
}
