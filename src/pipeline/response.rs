//! Response parsing: model text → validated [`ExtractionBatch`].
//!
//! Models wrap JSON in Markdown fences or prepend a sentence despite being
//! told not to, so the text is cleaned before parsing. After that the schema
//! is strict about structure and lenient about scalar forms:
//!
//! * a section the slice's purpose requires (`metadata` for front matter,
//!   `citations` for bibliography chunks) must be present, else the whole
//!   response is a parse failure;
//! * unknown keys are dropped;
//! * values are coerced per field (an author string becomes a list, a year
//!   string becomes a number, ISBNs and DOIs are normalised) and values that
//!   cannot be coerced are dropped.

use crate::error::ExtractionFailure;
use crate::model::{Audience, Citation, Descriptive, Field, FieldValue, MetadataClaim, PageRange, TocEntry};
use crate::normalize::{normalize_doi, normalize_isbn, parse_msc, parse_year, split_authors, strip_invisible};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

/// Validated content of one slice.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractionBatch {
    pub range: PageRange,
    pub claims: Vec<MetadataClaim>,
    pub descriptive: Descriptive,
    pub toc: Vec<TocEntry>,
    pub page_offset: Option<i64>,
    pub citations: Vec<Citation>,
}

impl ExtractionBatch {
    pub fn empty(range: PageRange) -> Self {
        Self {
            range,
            claims: Vec::new(),
            descriptive: Descriptive::default(),
            toc: Vec::new(),
            page_offset: None,
            citations: Vec::new(),
        }
    }
}

static RE_OUTER_FENCES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^```[a-zA-Z]*\s*\n(.*?)\n?```\s*$").unwrap());

/// Strip Markdown fences, invisible characters and any prose around the
/// outermost JSON object.
pub fn clean_json_text(raw: &str) -> String {
    let s = strip_invisible(raw).replace("\r\n", "\n");
    let s = s.trim();
    let s = match RE_OUTER_FENCES.captures(s) {
        Some(caps) => caps[1].to_string(),
        None => s.to_string(),
    };
    match (s.find('{'), s.rfind('}')) {
        (Some(start), Some(end)) if end > start => s[start..=end].to_string(),
        _ => s,
    }
}

/// Parse the cleaned text as a JSON object.
pub fn parse_object(raw: &str) -> Result<serde_json::Map<String, Value>, String> {
    let cleaned = clean_json_text(raw);
    match serde_json::from_str::<Value>(&cleaned) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(format!("expected a JSON object, got {}", type_name(&other))),
        Err(e) => Err(format!("invalid JSON: {}", e)),
    }
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Parse one slice response. `chunk` is stamped on every citation.
pub fn parse_extraction(raw: &str, range: PageRange, chunk: usize) -> Result<ExtractionBatch, ExtractionFailure> {
    let fail = |detail: String| ExtractionFailure::ParseFailure { range, detail };
    let root = parse_object(raw).map_err(fail)?;
    let mut batch = ExtractionBatch::empty(range);

    match root.get("metadata") {
        Some(Value::Object(meta)) => {
            for field in Field::ALL {
                let Some(v) = meta.get(field.as_str()).or_else(|| alias(meta, field)) else {
                    continue;
                };
                if let Some(value) = coerce_value(field, v) {
                    batch.claims.push(MetadataClaim::from_slice(value, range));
                }
            }
            batch.descriptive = Descriptive {
                summary: non_empty_str(meta.get("summary")),
                description: non_empty_str(meta.get("description")),
                audience: non_empty_str(meta.get("audience")).and_then(|a| Audience::parse(&a)),
                has_exercises: meta.get("has_exercises").and_then(coerce_flag),
                has_solutions: meta.get("has_solutions").and_then(coerce_flag),
                index_terms: meta.get("index_terms").map(index_terms).unwrap_or_default(),
            };
        }
        Some(other) if range.purpose.expects_metadata() => {
            return Err(fail(format!("\"metadata\" must be an object, got {}", type_name(other))));
        }
        None if range.purpose.expects_metadata() => {
            return Err(fail("missing required \"metadata\" section".into()));
        }
        _ => {}
    }

    if let Some(Value::Array(entries)) = root.get("toc") {
        batch.toc = entries.iter().filter_map(parse_toc_entry).collect();
    }
    if let Some(terms) = root.get("index_terms") {
        batch.descriptive.index_terms = index_terms(terms);
    }
    batch.page_offset = root.get("page_offset").and_then(Value::as_i64);

    match root.get("citations") {
        Some(Value::Array(entries)) => {
            batch.citations = entries.iter().filter_map(|e| parse_citation(e, chunk)).collect();
        }
        Some(other) if range.purpose.expects_citations() => {
            return Err(fail(format!("\"citations\" must be an array, got {}", type_name(other))));
        }
        None if range.purpose.expects_citations() => {
            return Err(fail("missing required \"citations\" section".into()));
        }
        _ => {}
    }

    Ok(batch)
}

fn alias<'a>(meta: &'a serde_json::Map<String, Value>, field: Field) -> Option<&'a Value> {
    match field {
        Field::Author => meta.get("authors"),
        Field::Msc => meta.get("msc_class"),
        _ => None,
    }
}

fn non_empty_str(v: Option<&Value>) -> Option<String> {
    v.and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// `true`/`false`, `"yes"`/`"no"`, `1`/`0`.
fn coerce_flag(v: &Value) -> Option<bool> {
    match v {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_i64().map(|n| n != 0),
        Value::String(s) => match s.trim().to_lowercase().as_str() {
            "true" | "yes" | "y" | "ja" | "1" => Some(true),
            "false" | "no" | "n" | "nein" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// A list or a comma-separated string; trimmed, repeats dropped ignoring case.
fn index_terms(v: &Value) -> Vec<String> {
    let raw: Vec<String> = match v {
        Value::String(s) => s.split([',', ';']).map(str::to_string).collect(),
        other => string_list(other),
    };
    let mut seen = std::collections::HashSet::new();
    raw.into_iter()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty() && seen.insert(t.to_lowercase()))
        .collect()
}

fn string_list(v: &Value) -> Vec<String> {
    match v {
        Value::String(s) => vec![s.clone()],
        Value::Array(items) => items
            .iter()
            .filter_map(|i| match i {
                Value::String(s) => Some(s.clone()),
                Value::Object(o) => non_empty_str(o.get("name")).or_else(|| {
                    let given = non_empty_str(o.get("given")).unwrap_or_default();
                    let family = non_empty_str(o.get("family"))?;
                    Some(format!("{} {}", given, family).trim().to_string())
                }),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

/// Coerce a loosely-typed JSON value into the typed value for `field`.
pub fn coerce_value(field: Field, v: &Value) -> Option<FieldValue> {
    if v.is_null() {
        return None;
    }
    let value = match field {
        Field::Title => FieldValue::Title(non_empty_str(Some(v))?),
        Field::Publisher => FieldValue::Publisher(non_empty_str(Some(v))?),
        Field::Author => {
            let names: Vec<String> = string_list(v)
                .iter()
                .flat_map(|s| split_authors(s))
                .collect();
            if names.is_empty() {
                return None;
            }
            FieldValue::Author(names)
        }
        Field::Year => {
            let year = match v {
                Value::Number(n) => n.as_u64().and_then(|y| u16::try_from(y).ok()),
                Value::String(s) => parse_year(s),
                _ => None,
            }?;
            if !(1400..=2100).contains(&year) {
                return None;
            }
            FieldValue::Year(year)
        }
        Field::Isbn => FieldValue::Isbn(string_list(v).iter().find_map(|s| normalize_isbn(s))?),
        Field::Doi => FieldValue::Doi(string_list(v).iter().find_map(|s| normalize_doi(s))?),
        Field::Msc => {
            let codes = parse_msc(&string_list(v).join(" "));
            if codes.is_empty() {
                return None;
            }
            FieldValue::Msc(codes)
        }
    };
    if value.is_blank() {
        None
    } else {
        Some(value)
    }
}

fn parse_toc_entry(v: &Value) -> Option<TocEntry> {
    let obj = v.as_object()?;
    let title = non_empty_str(obj.get("title"))?;
    let page = match obj.get("page") {
        Some(Value::Number(n)) => n.as_i64(),
        Some(Value::String(s)) => s.trim().parse::<i64>().ok(),
        _ => None,
    };
    let level = obj
        .get("level")
        .and_then(Value::as_u64)
        .map(|l| l.clamp(1, 9) as u8)
        .unwrap_or(1);
    Some(TocEntry { title, page, level })
}

fn parse_citation(v: &Value, chunk: usize) -> Option<Citation> {
    match v {
        Value::String(s) if !s.trim().is_empty() => Some(Citation {
            raw_text: s.trim().to_string(),
            title: None,
            author: None,
            year: parse_year(s),
            chunk,
        }),
        Value::Object(obj) => {
            let raw_text = non_empty_str(obj.get("raw_text"))?;
            let year = match obj.get("year") {
                Some(Value::Number(n)) => n.as_u64().and_then(|y| u16::try_from(y).ok()),
                Some(Value::String(s)) => parse_year(s),
                _ => None,
            };
            Some(Citation {
                raw_text,
                title: non_empty_str(obj.get("title")),
                author: non_empty_str(obj.get("author")),
                year,
                chunk,
            })
        }
        _ => None,
    }
}
