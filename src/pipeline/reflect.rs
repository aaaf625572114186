//! Reflection: one extra model call to arbitrate remaining conflicts.
//!
//! The model sees every conflicting field with its candidates and the
//! registry evidence, optionally alongside a freshly cut front-matter
//! slice. Its answers are only suggestions: the resolver accepts a choice
//! when it matches one of the top-precedence candidates. Any failure here
//! leaves the choices empty and precedence decides alone.

use crate::model::{ConflictRecord, Field, FieldValue, PageRange, RangePurpose};
use crate::pipeline::extract::ExtractionClient;
use crate::pipeline::response::{coerce_value, parse_object};
use crate::pipeline::slice::Slicer;
use crate::pipeline::source::SourceDocument;
use crate::prompts::reflection_prompt;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{info, warn};

/// What the reflection call produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReflectionOutcome {
    pub choices: BTreeMap<Field, FieldValue>,
    /// Whether the front-matter pages were attached.
    pub grounded: bool,
    /// Set when the call or its parsing failed.
    pub error: Option<String>,
}

/// Pages attached to a grounded reflection call.
pub fn grounding_range(page_count: usize, front_matter_pages: usize) -> Option<PageRange> {
    if page_count == 0 {
        return None;
    }
    let end = front_matter_pages.max(1).min(page_count) - 1;
    Some(PageRange::new(0, end, RangePurpose::FrontMatter))
}

/// Read `{"resolutions": [{"field", "value"}]}`. Null values and unknown
/// fields are skipped; a later answer for the same field wins.
pub fn parse_reflection(raw: &str) -> Result<BTreeMap<Field, FieldValue>, String> {
    let root = parse_object(raw)?;
    let entries = match root.get("resolutions") {
        Some(Value::Array(entries)) => entries,
        Some(_) => return Err("\"resolutions\" must be an array".into()),
        None => return Err("missing \"resolutions\"".into()),
    };
    let mut choices = BTreeMap::new();
    for entry in entries {
        let Some(field) = entry["field"].as_str().and_then(Field::parse) else {
            continue;
        };
        if let Some(value) = coerce_value(field, &entry["value"]) {
            choices.insert(field, value);
        }
    }
    Ok(choices)
}

/// Ask the model to arbitrate `conflicts`.
///
/// With `grounding` set, the front-matter slice is cut here and dropped
/// (with its temporary file) before this function returns.
pub async fn reflect(
    client: &ExtractionClient,
    conflicts: &[ConflictRecord],
    grounding: Option<(&Slicer, &SourceDocument, usize)>,
) -> ReflectionOutcome {
    if conflicts.is_empty() {
        return ReflectionOutcome::default();
    }

    let mut slice = None;
    if let Some((slicer, document, front_pages)) = grounding {
        if let Some(range) = grounding_range(document.page_count, front_pages) {
            match slicer.slice(document, range).await {
                Ok(s) => slice = Some(s),
                Err(e) => warn!("Reflection grounding slice {} failed, asking without pages: {}", range, e),
            }
        }
    }

    let grounded = slice.is_some();
    let prompt = reflection_prompt(conflicts, grounded);
    let answer = client
        .ask(slice.as_ref().map(|s| s.path.as_path()), &prompt, "reflection")
        .await;
    drop(slice);

    match answer {
        Ok(raw) => match parse_reflection(&raw) {
            Ok(choices) => {
                info!("Reflection answered {} of {} conflicting fields", choices.len(), conflicts.len());
                ReflectionOutcome {
                    choices,
                    grounded,
                    error: None,
                }
            }
            Err(detail) => {
                warn!("Reflection answer unusable, falling back to precedence: {}", detail);
                ReflectionOutcome {
                    choices: BTreeMap::new(),
                    grounded,
                    error: Some(detail),
                }
            }
        },
        Err(e) => {
            warn!(
                "Reflection call failed after {} attempts, falling back to precedence: {}",
                e.attempts, e.error
            );
            ReflectionOutcome {
                choices: BTreeMap::new(),
                grounded,
                error: Some(e.error.to_string()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolutions_are_coerced_per_field() {
        let raw = r#"```json
        {"resolutions": [
            {"field": "year", "value": "1955", "reason": "title page"},
            {"field": "author", "value": "John L. Kelley", "reason": ""},
            {"field": "doi", "value": null, "reason": "none supported"},
            {"field": "audience", "value": "graduate"}
        ]}
        ```"#;
        let choices = parse_reflection(raw).unwrap();
        assert_eq!(choices.len(), 2);
        assert_eq!(choices[&Field::Year], FieldValue::Year(1955));
        assert_eq!(choices[&Field::Author], FieldValue::Author(vec!["John L. Kelley".into()]));
    }

    #[test]
    fn missing_resolutions_is_an_error() {
        assert!(parse_reflection(r#"{"answer": 1}"#).is_err());
        assert!(parse_reflection("no idea").is_err());
    }

    #[test]
    fn grounding_range_is_clamped() {
        assert_eq!(
            grounding_range(8, 20),
            Some(PageRange::new(0, 7, RangePurpose::FrontMatter))
        );
        assert_eq!(grounding_range(0, 20), None);
    }
}
