//! zbMATH Open REST client: DOI, or title and author, → zbl identifier and
//! MSC codes.

use super::rate_limit::PoliteLimiter;
use super::{ReviewIndex, ReviewRecord};
use crate::config::http_client;
use crate::error::RegistryError;
use crate::normalize::author_key;
use futures::future::BoxFuture;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_BASE_URL: &str = "https://api.zbmath.org/v1";
const NAME: &str = "zbMATH";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Characters the zbMATH query parser treats as syntax.
static RE_QUERY_SYNTAX: Lazy<Regex> = Lazy::new(|| Regex::new(r#"[:/?#\[\]@!$&'()*+,;="]+"#).unwrap());

pub struct ZbMath {
    client: reqwest::Client,
    base_url: String,
    mailto: Option<String>,
    limiter: PoliteLimiter,
}

impl std::fmt::Debug for ZbMath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZbMath")
            .field("base_url", &self.base_url)
            .field("mailto", &self.mailto.as_ref().map(|_| "<set>"))
            .finish()
    }
}

impl ZbMath {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            client: http_client(REQUEST_TIMEOUT),
            base_url: DEFAULT_BASE_URL.to_string(),
            mailto: None,
            limiter: PoliteLimiter::new(min_interval),
        }
    }

    /// Contact address from the argument, else `CROSSREF_MAILTO`.
    pub fn from_env(mailto: Option<String>, min_interval: Duration) -> Self {
        let mailto = mailto.or_else(|| std::env::var("CROSSREF_MAILTO").ok());
        Self::new(min_interval).with_mailto(mailto)
    }

    pub fn with_mailto(mut self, mailto: Option<String>) -> Self {
        self.mailto = mailto.filter(|m| !m.trim().is_empty());
        self
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    fn user_agent(&self) -> String {
        match &self.mailto {
            Some(email) => format!("edgequake-bookmeta/{} (mailto:{})", env!("CARGO_PKG_VERSION"), email),
            None => format!("edgequake-bookmeta/{}", env!("CARGO_PKG_VERSION")),
        }
    }

    /// First document matching a zbMATH search string.
    async fn first_hit(&self, search_string: &str) -> Result<Option<ReviewRecord>, RegistryError> {
        self.limiter.acquire().await;
        let url = format!(
            "{}/document/_search?search_string={}&page=0&results_per_page=1",
            self.base_url,
            urlencoding::encode(search_string)
        );
        debug!("zbMATH GET {}", url);
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
        match resp.status().as_u16() {
            404 => return Ok(None),
            429 => {
                return Err(RegistryError::RateLimited {
                    registry: NAME,
                    retry_after: None,
                })
            }
            s if !(200..300).contains(&s) => {
                return Err(RegistryError::Unavailable {
                    registry: NAME,
                    detail: format!("HTTP {}", s),
                })
            }
            _ => {}
        }
        let data: Value = resp.json().await.map_err(|e| RegistryError::BadResponse {
            registry: NAME,
            detail: e.to_string(),
        })?;
        Ok(review_from_search(&data))
    }
}

/// `ti:<title> AND au:<surname>` with query syntax stripped from the title.
///
/// `None` for a title that is empty or a placeholder.
pub fn metadata_query(title: &str, author: Option<&str>) -> Option<String> {
    let cleaned = RE_QUERY_SYNTAX.replace_all(title, " ");
    let cleaned = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");
    if cleaned.is_empty() || matches!(cleaned.to_lowercase().as_str(), "unknown" | "untitled") {
        return None;
    }
    let mut query = format!("ti:{}", cleaned);
    let surname = author
        .map(author_key)
        .and_then(|k| k.split_whitespace().next().map(str::to_string));
    if let Some(surname) = surname.filter(|s| s != "unknown") {
        query.push_str(&format!(" AND au:{}", surname));
    }
    Some(query)
}

/// First document of a `_search` response.
pub fn review_from_search(data: &Value) -> Option<ReviewRecord> {
    let doc = data["result"].as_array()?.first()?;
    let zbl_id = match &doc["identifier"] {
        Value::String(s) if !s.trim().is_empty() => s.trim().to_string(),
        _ => doc["id"].as_u64()?.to_string(),
    };
    let mut msc: Vec<String> = Vec::new();
    for code in doc["msc"].as_array().into_iter().flatten().filter_map(|m| m["code"].as_str()) {
        if !msc.iter().any(|c| c == code) {
            msc.push(code.to_string());
        }
    }
    Some(ReviewRecord {
        zbl_id,
        msc,
        title: doc["title"]["title"].as_str().map(str::to_string),
    })
}

impl ReviewIndex for ZbMath {
    fn name(&self) -> &'static str {
        NAME
    }

    fn lookup_doi<'a>(&'a self, doi: &'a str) -> BoxFuture<'a, Result<Option<ReviewRecord>, RegistryError>> {
        Box::pin(async move { self.first_hit(&format!("doi:{}", doi)).await })
    }

    fn search_metadata<'a>(
        &'a self,
        title: &'a str,
        author: Option<&'a str>,
    ) -> BoxFuture<'a, Result<Option<ReviewRecord>, RegistryError>> {
        Box::pin(async move {
            match metadata_query(title, author) {
                Some(query) => self.first_hit(&query).await,
                None => Ok(None),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn search_result_is_read() {
        let data = json!({"result": [{
            "identifier": "0684.54001",
            "id": 4154279,
            "title": {"title": "General topology"},
            "msc": [{"code": "54-01", "scheme": "msc2020"}, {"code": "54-02"}, {"code": "54-01"}]
        }]});
        let rec = review_from_search(&data).unwrap();
        assert_eq!(rec.zbl_id, "0684.54001");
        assert_eq!(rec.msc, vec!["54-01", "54-02"]);
        assert_eq!(rec.title.as_deref(), Some("General topology"));
    }

    #[test]
    fn numeric_id_is_fallback() {
        let data = json!({"result": [{"id": 42, "msc": []}]});
        assert_eq!(review_from_search(&data).unwrap().zbl_id, "42");
    }

    #[test]
    fn empty_result_is_none() {
        assert_eq!(review_from_search(&json!({"result": []})), None);
        assert_eq!(review_from_search(&json!({})), None);
    }

    #[test]
    fn metadata_query_strips_syntax_and_adds_surname() {
        assert_eq!(
            metadata_query("Topology: A First Course (2nd ed.)", Some("James R. Munkres")).as_deref(),
            Some("ti:Topology A First Course 2nd ed. AND au:munkres")
        );
        assert_eq!(metadata_query("General Topology", None).as_deref(), Some("ti:General Topology"));
        assert_eq!(metadata_query("  Unknown ", Some("Kelley")), None);
        assert_eq!(metadata_query("", None), None);
    }

    #[test]
    fn user_agent_carries_contact() {
        let z = ZbMath::new(Duration::from_millis(1)).with_mailto(Some("librarian@example.org".into()));
        assert!(z.user_agent().ends_with("(mailto:librarian@example.org)"));
        let z = z.with_mailto(Some("  ".into()));
        assert!(!z.user_agent().contains("mailto"));
    }
}
