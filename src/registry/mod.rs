//! Authoritative registries consulted by the verifier.
//!
//! [`Registry`] is the bibliographic registry (Crossref): DOI and ISBN
//! lookups plus free-text bibliographic search. [`ReviewIndex`] is the
//! review index (zbMATH) that maps a DOI, or failing that a title and
//! author, to MSC codes and a zbl id.
//!
//! Lookups return `Ok(None)` for "not found"; `Err` always means the
//! registry could not be asked, which the verifier treats as neutral.

pub mod crossref;
pub mod rate_limit;
pub mod zbmath;

use crate::error::RegistryError;
use crate::normalize::normalize_doi;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

/// One work as described by a registry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistryRecord {
    pub doi: Option<String>,
    pub title: Option<String>,
    pub authors: Vec<String>,
    pub year: Option<u16>,
    pub publisher: Option<String>,
    /// Every ISBN listed for the work (print, electronic), normalised.
    pub isbns: Vec<String>,
    /// Registry work type, e.g. `book`, `monograph`, `book-chapter`.
    pub work_type: Option<String>,
    /// DOI of the containing work, when the registry records one.
    pub parent_doi: Option<String>,
    /// Relevance score reported by a search, 0 for direct lookups.
    pub score: f64,
}

impl RegistryRecord {
    /// Whether this record is a part of a larger work rather than the work.
    pub fn is_chapter(&self) -> bool {
        matches!(
            self.work_type.as_deref(),
            Some("book-chapter" | "book-section" | "book-part" | "reference-entry")
        )
    }

    /// Parent DOI from the registry relation, else from the Springer
    /// `prefix_chapter` naming convention.
    pub fn parent_candidate(&self) -> Option<String> {
        if let Some(parent) = &self.parent_doi {
            return Some(parent.clone());
        }
        let doi = self.doi.as_deref()?;
        if !doi.starts_with("10.1007/") {
            return None;
        }
        let (prefix, _) = doi.split_once('_')?;
        normalize_doi(prefix)
    }
}

/// Bibliographic registry (Crossref).
pub trait Registry: Send + Sync {
    fn name(&self) -> &'static str;

    fn lookup_doi<'a>(&'a self, doi: &'a str) -> BoxFuture<'a, Result<Option<RegistryRecord>, RegistryError>>;

    fn lookup_isbn<'a>(&'a self, isbn: &'a str) -> BoxFuture<'a, Result<Option<RegistryRecord>, RegistryError>>;

    /// Best match for a normalised bibliographic query.
    fn search<'a>(&'a self, query: &'a str) -> BoxFuture<'a, Result<Option<RegistryRecord>, RegistryError>>;
}

/// What the review index knows about a work.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewRecord {
    pub zbl_id: String,
    pub msc: Vec<String>,
    pub title: Option<String>,
}

/// Review index (zbMATH).
pub trait ReviewIndex: Send + Sync {
    fn name(&self) -> &'static str;

    fn lookup_doi<'a>(&'a self, doi: &'a str) -> BoxFuture<'a, Result<Option<ReviewRecord>, RegistryError>>;

    /// Top hit for a title, narrowed by the first author's surname when
    /// given. The caller judges whether the hit is the same work.
    fn search_metadata<'a>(
        &'a self,
        title: &'a str,
        author: Option<&'a str>,
    ) -> BoxFuture<'a, Result<Option<ReviewRecord>, RegistryError>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn springer_chapter_parent_from_doi() {
        let rec = RegistryRecord {
            doi: Some("10.1007/978-3-642-10750-2_4".into()),
            work_type: Some("book-chapter".into()),
            ..Default::default()
        };
        assert!(rec.is_chapter());
        assert_eq!(rec.parent_candidate().as_deref(), Some("10.1007/978-3-642-10750-2"));
    }

    #[test]
    fn explicit_relation_wins() {
        let rec = RegistryRecord {
            doi: Some("10.1007/978-3-642-10750-2_4".into()),
            parent_doi: Some("10.1007/parent".into()),
            ..Default::default()
        };
        assert_eq!(rec.parent_candidate().as_deref(), Some("10.1007/parent"));
    }

    #[test]
    fn non_springer_chapter_has_no_guess() {
        let rec = RegistryRecord {
            doi: Some("10.1090/gsm/027_3".into()),
            work_type: Some("book-chapter".into()),
            ..Default::default()
        };
        assert_eq!(rec.parent_candidate(), None);
    }
}
