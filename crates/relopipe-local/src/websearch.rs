use crate::{api_key_from_env, env_nonempty, error_for_status, transport_error};
use relopipe_core::{
    Error, Provider, ProviderId, ProviderQuery, RawPayload, Result, WebResult, WebSearchPayload,
};
use serde::Deserialize;

fn brave_api_key_from_env() -> Option<String> {
    api_key_from_env("RELOPIPE_BRAVE_API_KEY", "BRAVE_SEARCH_API_KEY")
}

fn brave_endpoint_from_env() -> Option<String> {
    env_nonempty("RELOPIPE_BRAVE_ENDPOINT")
}

/// Web-search provider backed by the Brave Search API. Baseline enrichment
/// source: the orchestrator includes it for every intent.
#[derive(Debug, Clone)]
pub struct BraveSearchProvider {
    client: reqwest::Client,
    api_key: String,
    endpoint: String,
}

impl BraveSearchProvider {
    pub fn new(client: reqwest::Client, api_key: String, endpoint: String) -> Self {
        Self {
            client,
            api_key,
            endpoint,
        }
    }

    pub fn from_env(client: reqwest::Client) -> Result<Self> {
        let api_key = brave_api_key_from_env().ok_or_else(|| {
            Error::ConfigMissing(
                "missing RELOPIPE_BRAVE_API_KEY (or BRAVE_SEARCH_API_KEY)".to_string(),
            )
        })?;
        // Docs: https://api.search.brave.com/res/v1/web/search
        let endpoint = brave_endpoint_from_env()
            .unwrap_or_else(|| "https://api.search.brave.com/res/v1/web/search".to_string());
        Ok(Self::new(client, api_key, endpoint))
    }
}

#[derive(Debug, Deserialize)]
struct BraveWebSearchResponse {
    web: Option<BraveWeb>,
}

#[derive(Debug, Deserialize)]
struct BraveWeb {
    results: Option<Vec<BraveWebResult>>,
}

#[derive(Debug, Deserialize)]
struct BraveWebResult {
    url: String,
    title: Option<String>,
    description: Option<String>,
}

#[async_trait::async_trait]
impl Provider for BraveSearchProvider {
    fn id(&self) -> ProviderId {
        ProviderId::WebSearch
    }

    async fn fetch(&self, q: &ProviderQuery) -> Result<RawPayload> {
        let count = q.max_results.clamp(1, 20);
        let resp = self
            .client
            .get(&self.endpoint)
            .header("X-Subscription-Token", &self.api_key)
            .query(&[("q", q.query.as_str()), ("count", &count.to_string())])
            .send()
            .await
            .map_err(|e| transport_error("brave search", e))?;

        if !resp.status().is_success() {
            return Err(error_for_status("brave search", resp).await);
        }

        let parsed: BraveWebSearchResponse = resp
            .json()
            .await
            .map_err(|e| Error::Malformed(format!("brave search: {e}")))?;

        let mut out = Vec::new();
        if let Some(results) = parsed.web.and_then(|w| w.results) {
            for r in results.into_iter() {
                // Downstream summarization fetches these verbatim; drop
                // anything that is not an absolute http(s) URL.
                let parses_http = url::Url::parse(&r.url)
                    .map(|u| matches!(u.scheme(), "http" | "https"))
                    .unwrap_or(false);
                if !parses_http {
                    continue;
                }
                out.push(WebResult {
                    title: r.title.unwrap_or_default(),
                    url: r.url,
                    snippet: r.description.unwrap_or_default(),
                });
                if out.len() == count {
                    break;
                }
            }
        }

        Ok(RawPayload::WebSearch(WebSearchPayload { results: out }))
    }
}
