//! String normalisation for identifiers, titles and author names.
//!
//! Everything here is a pure `&str → T` function so the verifier, the
//! resolver and the response parser agree on what "the same value" means.

use once_cell::sync::Lazy;
use regex::Regex;
use unicode_normalization::UnicodeNormalization;

static NON_ALNUM: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^a-z0-9]+").unwrap());

/// Lower-case ASCII, alphanumeric words separated by single spaces.
///
/// Accents are folded (`"Topologie générale"` → `"topologie generale"`) and
/// the HTML entities registries like to return are unescaped first.
pub fn normalize_title(title: &str) -> String {
    let title = title
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'");
    let title = strip_invisible(&title);
    let ascii: String = title
        .nfkd()
        .filter(|c| !unicode_normalization::char::is_combining_mark(*c))
        .map(|c| if c.is_ascii() { c } else { ' ' })
        .collect();
    let lower = ascii.to_lowercase();
    NON_ALNUM.replace_all(&lower, " ").trim().to_string()
}

/// Comparison key for a person's name; `"Munkres, James R."` and
/// `"James R. Munkres"` map to the same key.
pub fn author_key(name: &str) -> String {
    let name = name.trim();
    let reordered = match name.split_once(',') {
        Some((family, given)) if !given.trim().is_empty() => format!("{} {}", given.trim(), family.trim()),
        _ => name.to_string(),
    };
    let norm = normalize_title(&reordered);
    let mut words: Vec<&str> = norm.split(' ').filter(|w| !w.is_empty()).collect();
    // Surname plus first initial: robust to middle names and initials.
    match (words.first().copied(), words.pop()) {
        (Some(first), Some(last)) if first != last => {
            format!("{} {}", last, first.chars().next().unwrap_or_default())
        }
        (_, Some(last)) => last.to_string(),
        _ => String::new(),
    }
}

/// Remove zero-width and formatting characters.
pub fn strip_invisible(input: &str) -> String {
    input.replace(
        ['\u{200B}', '\u{FEFF}', '\u{00AD}', '\u{200C}', '\u{200D}', '\u{2060}'],
        "",
    )
}

static DOI_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\b(10\.\d{4,9}/\S+)").unwrap());

/// Extract a bare, lower-cased DOI from a URL, a `doi:` prefix or free text.
pub fn normalize_doi(raw: &str) -> Option<String> {
    let raw = strip_invisible(raw);
    let caps = DOI_RE.captures(raw.trim())?;
    let doi = caps[1]
        .trim_end_matches(['.', ',', ';', ')', ']', '}', '"', '\''])
        .to_ascii_lowercase();
    if doi.len() > 8 {
        Some(doi)
    } else {
        None
    }
}

/// Digits (and a final `X`) only; `None` unless the result has 10 or 13 chars.
pub fn normalize_isbn(raw: &str) -> Option<String> {
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == 'x' || *c == 'X')
        .map(|c| c.to_ascii_uppercase())
        .collect();
    let x_ok = match cleaned.find('X') {
        None => true,
        Some(pos) => pos == 9 && cleaned.len() == 10,
    };
    if x_ok && (cleaned.len() == 10 || cleaned.len() == 13) {
        Some(cleaned)
    } else {
        None
    }
}

static YEAR_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b(1[4-9]\d{2}|20\d{2}|2100)\b").unwrap());

/// First plausible publication year (1400–2100) in the text.
pub fn parse_year(raw: &str) -> Option<u16> {
    YEAR_RE
        .captures(raw)
        .and_then(|c| c[1].parse::<u16>().ok())
}

static MSC_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(\d{2}(?:-XX|-\d{2}|[A-Z]\d{2}|[A-Z]xx))\b").unwrap());

/// MSC 2020 codes found in the text, de-duplicated, in order of appearance.
pub fn parse_msc(raw: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for cap in MSC_RE.captures_iter(raw) {
        let code = cap[1].to_string();
        if !out.contains(&code) {
            out.push(code);
        }
    }
    out
}

static AUTHOR_SPLIT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s*(?:;|\band\b|\bund\b|\bet\b|&)\s*").unwrap());

/// Split an author string the way title pages and filenames write them.
///
/// Commas only separate authors when none of the pieces looks like a
/// `Family, Given` pair.
pub fn split_authors(raw: &str) -> Vec<String> {
    let mut out = Vec::new();
    for part in AUTHOR_SPLIT.split(raw) {
        let part = part.trim().trim_matches(',').trim();
        if part.is_empty() {
            continue;
        }
        let pieces: Vec<&str> = part.split(',').map(str::trim).filter(|p| !p.is_empty()).collect();
        if pieces.len() > 1 && pieces.iter().all(|p| p.split_whitespace().count() >= 2) {
            out.extend(pieces.into_iter().map(str::to_string));
        } else {
            out.push(part.to_string());
        }
    }
    out
}

static CITATION_NUMBERING: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(?:\[\s*[\w\d+.-]+\s*\]|\(\d+\)|\d{1,4}\.)\s*").unwrap());
static PAGE_REFERENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(?:pp?\.|pages?|S\.)\s*\d+.*$").unwrap());
static QUERY_PUNCT: Lazy<Regex> = Lazy::new(|| Regex::new(r#"[\[\]{}()"“”„«»:;,.!?/\\]+"#).unwrap());
static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

/// Turn a raw citation into a bibliographic search query: leading numbering
/// (`[12]`, `12.`), trailing page references and punctuation are removed.
pub fn clean_citation_query(raw: &str) -> String {
    let s = strip_invisible(raw);
    let s = CITATION_NUMBERING.replace(&s, "");
    let s = PAGE_REFERENCE.replace(&s, "");
    let s = QUERY_PUNCT.replace_all(&s, " ");
    WHITESPACE.replace_all(s.trim(), " ").to_string()
}

/// Similarity of two titles in `0.0..=1.0` after normalisation.
///
/// A shorter title that is a word-prefix of the longer one (a missing
/// subtitle or edition suffix) scores at least 0.9.
pub fn title_similarity(a: &str, b: &str) -> f64 {
    let na = normalize_title(a);
    let nb = normalize_title(b);
    if na.is_empty() || nb.is_empty() {
        return 0.0;
    }
    let score = rapidfuzz::fuzz::ratio(na.chars(), nb.chars());
    let (shorter, longer) = if na.len() <= nb.len() { (&na, &nb) } else { (&nb, &na) };
    if shorter.len() >= 8 && longer.starts_with(shorter.as_str()) {
        let boundary = longer[shorter.len()..].starts_with(' ') || longer.len() == shorter.len();
        if boundary {
            return score.max(0.9);
        }
    }
    score
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn title_normalisation_folds_accents_and_punctuation() {
        assert_eq!(normalize_title("Topologie  Générale: Ch. 1–4"), "topologie generale ch 1 4");
        assert_eq!(normalize_title("Rings &amp; Modules"), "rings modules");
    }

    #[test]
    fn doi_forms() {
        assert_eq!(
            normalize_doi("https://doi.org/10.1007/978-3-642-61915-5_3").as_deref(),
            Some("10.1007/978-3-642-61915-5_3")
        );
        assert_eq!(normalize_doi("doi:10.1090/GSM/019.").as_deref(), Some("10.1090/gsm/019"));
        assert_eq!(normalize_doi("not a doi"), None);
    }

    #[test]
    fn isbn_forms() {
        assert_eq!(normalize_isbn("978-0-13-181629-9").as_deref(), Some("9780131816299"));
        assert_eq!(normalize_isbn("0-387-90125-x").as_deref(), Some("038790125X"));
        assert_eq!(normalize_isbn("12345"), None);
        assert_eq!(normalize_isbn("03X7901256"), None);
    }

    #[test]
    fn year_in_free_text() {
        assert_eq!(parse_year("Springer-Verlag, New York 1975"), Some(1975));
        assert_eq!(parse_year("ca. 300 BC"), None);
    }

    #[test]
    fn msc_codes() {
        assert_eq!(parse_msc("MSC: 54-01, 54A05; 54-01"), vec!["54-01", "54A05"]);
    }

    #[test]
    fn author_keys_match_across_orderings() {
        assert_eq!(author_key("Munkres, James R."), author_key("James Munkres"));
        assert_eq!(author_key("Bourbaki"), "bourbaki");
    }

    #[test]
    fn author_splitting() {
        assert_eq!(
            split_authors("John L. Kelley and Isaac Namioka"),
            vec!["John L. Kelley", "Isaac Namioka"]
        );
        assert_eq!(split_authors("Munkres, James"), vec!["Munkres, James"]);
        assert_eq!(
            split_authors("Serge Lang, Jean-Pierre Serre"),
            vec!["Serge Lang", "Jean-Pierre Serre"]
        );
    }

    #[test]
    fn citation_query_cleanup() {
        assert_eq!(
            clean_citation_query("[12] J. Munkres, Topology, Prentice Hall, 2000, p. 45-47"),
            "J Munkres Topology Prentice Hall 2000"
        );
        assert_eq!(clean_citation_query("3. Kelley: General Topology"), "Kelley General Topology");
    }

    #[test]
    fn similarity_prefix_rule() {
        assert!(title_similarity("General Topology", "General Topology, 2nd ed.") >= 0.9);
        assert!(title_similarity("General Topology", "Algebraic Geometry") < 0.8);
        assert_eq!(title_similarity("", "x"), 0.0);
    }
}
