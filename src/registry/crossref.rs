//! Crossref REST client.
//!
//! * `GET /works/{doi}` for DOI lookups (404 is "not found");
//! * `GET /works?filter=isbn:{isbn}` for ISBN lookups;
//! * `GET /works?query.bibliographic={q}` for free-text search.
//!
//! Every request waits on the client's [`PoliteLimiter`] and identifies
//! itself with a `User-Agent` carrying the contact address, which routes
//! it to Crossref's "polite" pool.

use super::rate_limit::PoliteLimiter;
use super::{Registry, RegistryRecord};
use crate::config::http_client;
use crate::error::RegistryError;
use crate::normalize::{normalize_doi, normalize_isbn};
use futures::future::BoxFuture;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_BASE_URL: &str = "https://api.crossref.org";
const NAME: &str = "Crossref";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

pub struct Crossref {
    client: reqwest::Client,
    base_url: String,
    mailto: Option<String>,
    limiter: PoliteLimiter,
    rows: usize,
}

impl std::fmt::Debug for Crossref {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Crossref")
            .field("base_url", &self.base_url)
            .field("mailto", &self.mailto.as_ref().map(|_| "<set>"))
            .field("limiter", &self.limiter)
            .finish()
    }
}

impl Crossref {
    pub fn new(mailto: Option<String>, min_interval: Duration) -> Self {
        Self {
            client: http_client(REQUEST_TIMEOUT),
            base_url: DEFAULT_BASE_URL.to_string(),
            mailto: mailto.filter(|m| !m.trim().is_empty()),
            limiter: PoliteLimiter::new(min_interval),
            rows: 5,
        }
    }

    /// Contact address from the argument, else `CROSSREF_MAILTO`.
    pub fn from_env(mailto: Option<String>, min_interval: Duration) -> Self {
        let mailto = mailto.or_else(|| std::env::var("CROSSREF_MAILTO").ok());
        Self::new(mailto, min_interval)
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    fn user_agent(&self) -> String {
        match &self.mailto {
            Some(email) => format!("edgequake-bookmeta/{} (mailto:{})", env!("CARGO_PKG_VERSION"), email),
            None => format!("edgequake-bookmeta/{}", env!("CARGO_PKG_VERSION")),
        }
    }

    fn with_mailto(&self, mut url: String) -> String {
        if let Some(email) = &self.mailto {
            url.push(if url.contains('?') { '&' } else { '?' });
            url.push_str(&format!("mailto={}", urlencoding::encode(email)));
        }
        url
    }

    /// GET and decode JSON; `Ok(None)` on 404.
    async fn get_json(&self, url: String) -> Result<Option<Value>, RegistryError> {
        self.limiter.acquire().await;
        let url = self.with_mailto(url);
        debug!("Crossref GET {}", url);
        let resp = self
            .client
            .get(&url)
            .header("User-Agent", self.user_agent())
            .send()
            .await
            .map_err(|e| RegistryError::Unavailable {
                registry: NAME,
                detail: e.to_string(),
            })?;

        let status = resp.status();
        if status.as_u16() == 404 {
            return Ok(None);
        }
        if status.as_u16() == 429 {
            let retry_after = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(RegistryError::RateLimited {
                registry: NAME,
                retry_after,
            });
        }
        if !status.is_success() {
            return Err(RegistryError::Unavailable {
                registry: NAME,
                detail: format!("HTTP {}", status),
            });
        }
        resp.json::<Value>().await.map(Some).map_err(|e| RegistryError::BadResponse {
            registry: NAME,
            detail: e.to_string(),
        })
    }

    async fn first_item(&self, url: String, prefer_whole_work: bool) -> Result<Option<RegistryRecord>, RegistryError> {
        let Some(data) = self.get_json(url).await? else {
            return Ok(None);
        };
        let items = data["message"]["items"].as_array().cloned().unwrap_or_default();
        let records: Vec<RegistryRecord> = items.iter().map(record_from_work).collect();
        let pick = if prefer_whole_work {
            records.iter().position(|r| !r.is_chapter()).unwrap_or(0)
        } else {
            0
        };
        Ok(records.into_iter().nth(pick))
    }
}

/// Map one Crossref `work` object to a [`RegistryRecord`].
pub fn record_from_work(item: &Value) -> RegistryRecord {
    let first_str = |v: &Value| -> Option<String> {
        match v {
            Value::Array(a) => a.first().and_then(Value::as_str).map(str::to_string),
            Value::String(s) => Some(s.clone()),
            _ => None,
        }
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
    };

    let title = first_str(&item["title"]).map(|t| match first_str(&item["subtitle"]) {
        Some(sub) if !t.contains(':') => format!("{}: {}", t, sub),
        _ => t,
    });

    let people = if item["author"].as_array().is_some_and(|a| !a.is_empty()) {
        &item["author"]
    } else {
        &item["editor"]
    };
    let authors = people
        .as_array()
        .map(|arr| {
            arr.iter()
                .filter_map(|a| {
                    let given = a["given"].as_str().unwrap_or("");
                    let family = a["family"].as_str().or_else(|| a["name"].as_str())?;
                    Some(format!("{} {}", given, family).trim().to_string())
                })
                .collect()
        })
        .unwrap_or_default();

    let year = ["published-print", "published", "issued", "published-online"]
        .iter()
        .find_map(|k| item[*k]["date-parts"][0][0].as_u64())
        .and_then(|y| u16::try_from(y).ok());

    let isbns = item["ISBN"]
        .as_array()
        .map(|arr| arr.iter().filter_map(Value::as_str).filter_map(normalize_isbn).collect())
        .unwrap_or_default();

    let parent_doi = item["relation"]["is-part-of"]
        .as_array()
        .and_then(|rels| {
            rels.iter()
                .find(|r| r["id-type"].as_str() == Some("doi"))
                .and_then(|r| r["id"].as_str())
        })
        .and_then(normalize_doi);

    RegistryRecord {
        doi: item["DOI"].as_str().and_then(normalize_doi),
        title,
        authors,
        year,
        publisher: item["publisher"].as_str().map(str::to_string),
        isbns,
        work_type: item["type"].as_str().map(str::to_string),
        parent_doi,
        score: item["score"].as_f64().unwrap_or(0.0),
    }
}

impl Registry for Crossref {
    fn name(&self) -> &'static str {
        NAME
    }

    fn lookup_doi<'a>(&'a self, doi: &'a str) -> BoxFuture<'a, Result<Option<RegistryRecord>, RegistryError>> {
        Box::pin(async move {
            let url = format!("{}/works/{}", self.base_url, urlencoding::encode(doi));
            Ok(self.get_json(url).await?.map(|data| record_from_work(&data["message"])))
        })
    }

    fn lookup_isbn<'a>(&'a self, isbn: &'a str) -> BoxFuture<'a, Result<Option<RegistryRecord>, RegistryError>> {
        Box::pin(async move {
            let url = format!(
                "{}/works?filter=isbn:{}&rows={}",
                self.base_url,
                urlencoding::encode(isbn),
                self.rows
            );
            self.first_item(url, true).await
        })
    }

    fn search<'a>(&'a self, query: &'a str) -> BoxFuture<'a, Result<Option<RegistryRecord>, RegistryError>> {
        Box::pin(async move {
            if query.trim().is_empty() {
                return Ok(None);
            }
            let url = format!(
                "{}/works?query.bibliographic={}&rows=1",
                self.base_url,
                urlencoding::encode(query)
            );
            self.first_item(url, false).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn chapter_work_is_mapped() {
        let item = json!({
            "DOI": "10.1007/978-3-642-10750-2_4",
            "type": "book-chapter",
            "title": ["Compactness"],
            "author": [{"given": "Ryszard", "family": "Engelking"}],
            "published-print": {"date-parts": [[1989, 1]]},
            "publisher": "Heldermann",
            "ISBN": ["978-3-88538-006-1", "3-88538-006-4"],
            "relation": {"is-part-of": [{"id-type": "doi", "id": "10.1007/978-3-642-10750-2", "asserted-by": "subject"}]}
        });
        let rec = record_from_work(&item);
        assert_eq!(rec.doi.as_deref(), Some("10.1007/978-3-642-10750-2_4"));
        assert!(rec.is_chapter());
        assert_eq!(rec.parent_doi.as_deref(), Some("10.1007/978-3-642-10750-2"));
        assert_eq!(rec.authors, vec!["Ryszard Engelking"]);
        assert_eq!(rec.year, Some(1989));
        assert_eq!(rec.isbns, vec!["9783885380061", "3885380064"]);
    }

    #[test]
    fn editors_stand_in_for_missing_authors() {
        let item = json!({
            "DOI": "10.1016/b978-0-444-87689-1.50001-x",
            "type": "edited-book",
            "title": ["Handbook of Set-Theoretic Topology"],
            "editor": [{"given": "Kenneth", "family": "Kunen"}, {"given": "Jerry E.", "family": "Vaughan"}],
            "issued": {"date-parts": [[1984]]}
        });
        let rec = record_from_work(&item);
        assert_eq!(rec.authors, vec!["Kenneth Kunen", "Jerry E. Vaughan"]);
        assert_eq!(rec.year, Some(1984));
        assert!(!rec.is_chapter());
    }

    #[test]
    fn subtitle_is_joined() {
        let item = json!({"title": ["Topology"], "subtitle": ["A First Course"]});
        assert_eq!(record_from_work(&item).title.as_deref(), Some("Topology: A First Course"));
    }

    #[test]
    fn user_agent_carries_mailto() {
        let c = Crossref::new(Some("lib@example.org".into()), Duration::from_millis(1));
        assert!(c.user_agent().contains("mailto:lib@example.org"));
        let url = c.with_mailto("https://api.crossref.org/works?rows=1".into());
        assert!(url.ends_with("&mailto=lib%40example.org"));
    }
}
