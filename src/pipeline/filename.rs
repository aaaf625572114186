//! Claims read from the file name.
//!
//! Library files are commonly named `Author - Title (Year).pdf`; each part
//! is optional. The resulting claims carry the lowest provenance and only
//! decide a field when nothing better exists.

use crate::model::{FieldValue, MetadataClaim, Provenance};
use crate::normalize::{normalize_isbn, split_authors};
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::Path;

static TRAILING_YEAR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s*[\(\[]((?:1[4-9]|20)\d{2})[\)\]]\s*$").unwrap());
static EDITION_OR_NOISE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\s*[\(\[](?:[^\)\]]*(?:ed\.|edition|auflage|scan|ocr)[^\)\]]*)[\)\]]\s*$").unwrap());
static ISBN_IN_NAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bisbn[\s_:-]*([\dxX-]{10,17})").unwrap());

/// Heuristic claims for `path`'s file name.
pub fn claims_from_filename(path: &Path) -> Vec<MetadataClaim> {
    let stem = match path.file_stem() {
        Some(s) => s.to_string_lossy().replace('_', " "),
        None => return Vec::new(),
    };
    let mut claims = Vec::new();
    let mut rest = stem.trim().to_string();

    if let Some(cap) = ISBN_IN_NAME.captures(&rest) {
        if let Some(isbn) = normalize_isbn(&cap[1]) {
            claims.push(claim(FieldValue::Isbn(isbn)));
        }
        rest = ISBN_IN_NAME.replace(&rest, "").trim().to_string();
    }
    loop {
        if let Some(cap) = TRAILING_YEAR.captures(&rest) {
            if let Ok(year) = cap[1].parse::<u16>() {
                if !claims.iter().any(|c: &MetadataClaim| matches!(c.value, FieldValue::Year(_))) {
                    claims.push(claim(FieldValue::Year(year)));
                }
            }
            rest = TRAILING_YEAR.replace(&rest, "").to_string();
            continue;
        }
        if EDITION_OR_NOISE.is_match(&rest) {
            rest = EDITION_OR_NOISE.replace(&rest, "").to_string();
            continue;
        }
        break;
    }

    let (author, title) = match rest.split_once(" - ") {
        Some((a, t)) => (Some(a.trim()), t.trim()),
        None => (None, rest.trim()),
    };

    if let Some(author) = author {
        let names = split_authors(author);
        if !names.is_empty() {
            claims.push(claim(FieldValue::Author(names)));
        }
    }
    if title.chars().filter(|c| c.is_alphabetic()).count() >= 3 {
        claims.push(claim(FieldValue::Title(title.to_string())));
    }
    claims
}

fn claim(value: FieldValue) -> MetadataClaim {
    MetadataClaim::new(value, Provenance::FilenameHeuristic)
}
