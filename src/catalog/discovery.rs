use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::config::DiscoveryConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::fetcher::HttpTransport;
use crate::models::BrandCandidate;

/// Resolves the search endpoint, which embeds its server-side key.
#[async_trait]
pub trait KeyStore: Send + Sync {
    async fn search_endpoint(&self) -> PipelineResult<String>;
}

/// Key store backed by one environment variable.
pub struct EnvKeyStore {
    variable: String,
}

impl EnvKeyStore {
    pub fn new(variable: &str) -> Self {
        EnvKeyStore {
            variable: variable.to_string(),
        }
    }
}

#[async_trait]
impl KeyStore for EnvKeyStore {
    async fn search_endpoint(&self) -> PipelineResult<String> {
        std::env::var(&self.variable)
            .map_err(|_| PipelineError::Discovery(format!("key not found in {}", self.variable)))
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    results: Vec<SearchResult>,
}

#[derive(Debug, Deserialize)]
struct SearchResult {
    #[serde(default)]
    hits: Vec<SearchHit>,
}

#[derive(Debug, Deserialize)]
struct SearchHit {
    #[serde(alias = "dizajner")]
    designer: String,
    url: HitUrl,
}

/// Hits carry either a plain URL or URLs per locale.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum HitUrl {
    Plain(String),
    Localized {
        #[serde(rename = "EN")]
        en: Vec<String>,
    },
}

impl HitUrl {
    fn first(&self) -> Option<&str> {
        match self {
            HitUrl::Plain(url) => Some(url.as_str()),
            HitUrl::Localized { en } => en.first().map(String::as_str),
        }
    }
}

/// Turns a user-entered name into brand candidates through the search index.
pub struct CatalogDiscovery {
    transport: Arc<dyn HttpTransport>,
    keys: Arc<dyn KeyStore>,
    config: DiscoveryConfig,
    limit: Duration,
}

impl CatalogDiscovery {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        keys: Arc<dyn KeyStore>,
        config: DiscoveryConfig,
        limit: Duration,
    ) -> Self {
        CatalogDiscovery {
            transport,
            keys,
            config,
            limit,
        }
    }

    /// Up to `max_candidates` brands, deduplicated by (designer, listing path).
    ///
    /// An index or key-store failure is `PipelineError::Discovery`, so callers
    /// can tell it apart from an empty result.
    pub async fn discover(&self, query_name: &str) -> PipelineResult<Vec<BrandCandidate>> {
        info!("Searching brands for '{}'", query_name);
        let endpoint = self.keys.search_endpoint().await?;

        let reply = self
            .transport
            .post(
                &endpoint,
                &[("content-type", "application/x-www-form-urlencoded")],
                self.request_body(query_name),
                self.limit,
            )
            .await
            .map_err(|e| PipelineError::Discovery(format!("search index unreachable: {}", e)))?;

        if !reply.is_ok() {
            error!("Search index returned status code: {}", reply.status);
            return Err(PipelineError::Discovery(format!(
                "search index returned status {}",
                reply.status
            )));
        }

        let response: SearchResponse = serde_json::from_str(&reply.body)
            .map_err(|e| PipelineError::Discovery(format!("unexpected search response: {}", e)))?;
        let hits = response
            .results
            .into_iter()
            .next()
            .map(|result| result.hits)
            .unwrap_or_default();

        let candidates = self.candidates(hits);
        info!("Found {} brand candidate(s) for '{}'", candidates.len(), query_name);
        Ok(candidates)
    }

    fn candidates(&self, hits: Vec<SearchHit>) -> Vec<BrandCandidate> {
        let mut seen = HashSet::new();
        let mut candidates = Vec::new();

        for hit in hits {
            let Some(slug) = hit.url.first().and_then(brand_slug_from_item_url) else {
                warn!("Skipping hit for {} without a usable url", hit.designer);
                continue;
            };
            let listing_path = format!("/designers/{}.html", slug);
            if !seen.insert((hit.designer.clone(), listing_path.clone())) {
                continue;
            }
            candidates.push(BrandCandidate {
                designer: hit.designer,
                slug,
                listing_path,
            });
        }

        candidates.truncate(self.config.max_candidates);
        candidates
    }

    fn request_body(&self, query_name: &str) -> String {
        let params = format!(
            "attributesToRetrieve=%5B%22naslov%22%2C%22dizajner%22%2C%22url.EN%22%5D&hitsPerPage={}&page=0&query={}",
            self.config.hits_per_page,
            encode_query(query_name)
        );
        json!({
            "requests": [{ "indexName": self.config.index_name, "params": params }]
        })
        .to_string()
    }
}

/// `https://host/perfume/<Brand>/<Item>.html` -> `<Brand>`.
fn brand_slug_from_item_url(url: &str) -> Option<String> {
    url.split('/')
        .nth(4)
        .filter(|slug| !slug.is_empty())
        .map(str::to_string)
}

fn encode_query(query: &str) -> String {
    urlencoding::encode(query.trim()).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetcher::fake_transport::ScriptedTransport;

    const ENDPOINT: &str = "https://search.test/1/indexes/*/queries?key=abc";

    struct FixedKey;

    #[async_trait]
    impl KeyStore for FixedKey {
        async fn search_endpoint(&self) -> PipelineResult<String> {
            Ok(ENDPOINT.to_string())
        }
    }

    fn discovery(transport: ScriptedTransport) -> CatalogDiscovery {
        CatalogDiscovery::new(
            Arc::new(transport),
            Arc::new(FixedKey),
            DiscoveryConfig::default(),
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn test_hits_are_deduplicated_and_truncated() {
        let body = r#"{"results":[{"hits":[
            {"dizajner":"Dior","url":{"EN":["https://origin.test/perfume/Dior/Sauvage-31861.html"]}},
            {"dizajner":"Dior","url":{"EN":["https://origin.test/perfume/Dior/Fahrenheit-228.html"]}},
            {"dizajner":"Chanel","url":{"EN":["https://origin.test/perfume/Chanel/Bleu-9099.html"]}},
            {"designer":"Guerlain","url":"https://origin.test/perfume/Guerlain/Habit-Rouge-1.html"},
            {"dizajner":"Creed","url":{"EN":["https://origin.test/perfume/Creed/Aventus-9828.html"]}}
        ]}]}"#;
        let candidates = discovery(ScriptedTransport::new().with_post(ENDPOINT, 200, body))
            .discover("Sauvage")
            .await
            .unwrap();

        assert_eq!(candidates.len(), 3);
        assert_eq!(candidates[0].designer, "Dior");
        assert_eq!(candidates[0].slug, "Dior");
        assert_eq!(candidates[0].listing_path, "/designers/Dior.html");
        assert_eq!(candidates[1].slug, "Chanel");
        assert_eq!(candidates[2].designer, "Guerlain");
    }

    #[tokio::test]
    async fn test_zero_hits_is_empty_not_error() {
        let candidates = discovery(ScriptedTransport::new().with_post(ENDPOINT, 200, r#"{"results":[{"hits":[]}]}"#))
            .discover("Nothing")
            .await
            .unwrap();
        assert!(candidates.is_empty());
    }

    #[tokio::test]
    async fn test_index_failures_are_discovery_errors() {
        let down = discovery(ScriptedTransport::new()).discover("Sauvage").await;
        assert!(matches!(down, Err(PipelineError::Discovery(_))));

        let refused = discovery(ScriptedTransport::new().with_post(ENDPOINT, 403, "forbidden"))
            .discover("Sauvage")
            .await;
        assert!(matches!(refused, Err(PipelineError::Discovery(_))));

        let garbled = discovery(ScriptedTransport::new().with_post(ENDPOINT, 200, "<html>"))
            .discover("Sauvage")
            .await;
        assert!(matches!(garbled, Err(PipelineError::Discovery(_))));
    }

    #[tokio::test]
    async fn test_missing_key_is_discovery_error() {
        let keys = EnvKeyStore::new("SCENT_TEST_UNSET_SEARCH_KEY");
        assert!(matches!(keys.search_endpoint().await, Err(PipelineError::Discovery(_))));
    }

    #[test]
    fn test_request_body_carries_index_and_query() {
        let body = discovery(ScriptedTransport::new()).request_body("Example Eau");
        let parsed: serde_json::Value = serde_json::from_str(&body).unwrap();
        let request = &parsed["requests"][0];
        assert_eq!(request["indexName"], "fragrantica_perfumes");
        let params = request["params"].as_str().unwrap();
        assert!(params.contains("hitsPerPage=80"));
        assert!(params.ends_with("query=Example%20Eau"));
    }

    #[test]
    fn test_query_reserved_characters_are_escaped() {
        assert_eq!(encode_query(" Rose+Oud "), "Rose%2BOud");
        assert_eq!(encode_query("100% Love"), "100%25%20Love");
        assert_eq!(encode_query("No#5"), "No%235");
        assert_eq!(encode_query("Hermès"), "Herm%C3%A8s");

        let body = discovery(ScriptedTransport::new()).request_body("Rose+Oud & Co");
        let parsed: serde_json::Value = serde_json::from_str(&body).unwrap();
        let params = parsed["requests"][0]["params"].as_str().unwrap();
        assert!(params.ends_with("query=Rose%2BOud%20%26%20Co"));
    }
}
