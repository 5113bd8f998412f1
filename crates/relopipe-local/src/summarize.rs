use crate::{api_key_from_env, env_nonempty, error_for_status, transport_error};
use relopipe_core::{
    Error, Provider, ProviderId, ProviderQuery, RawPayload, Result, SummaryPayload,
};
use serde::Deserialize;
use tracing::debug;

const MAX_SUMMARY_CHARS: usize = 1_200;

fn firecrawl_api_key_from_env() -> Option<String> {
    api_key_from_env("RELOPIPE_FIRECRAWL_API_KEY", "FIRECRAWL_API_KEY")
}

fn firecrawl_endpoint_from_env() -> Option<String> {
    env_nonempty("RELOPIPE_FIRECRAWL_ENDPOINT")
}

/// Collapse whitespace and cut at a sentence boundary near `max_chars`.
/// Favors a clean cut over completeness.
fn condense(text: &str, max_chars: usize) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= max_chars {
        return collapsed;
    }
    let head: String = collapsed.chars().take(max_chars).collect();
    match head.rfind(['.', '!', '?']) {
        Some(idx) if idx > max_chars / 2 => head[..=idx].to_string(),
        _ => head,
    }
}

/// Content summarization over an ordered candidate URL list.
///
/// Candidates are tried in order; the first URL that yields a non-empty
/// summary wins and the rest are never fetched. A deliberate
/// latency-over-completeness tradeoff.
#[derive(Debug, Clone)]
pub struct FirecrawlSummarizer {
    client: reqwest::Client,
    api_key: String,
    endpoint: String,
}

impl FirecrawlSummarizer {
    pub fn new(client: reqwest::Client, api_key: String, endpoint: String) -> Self {
        Self {
            client,
            api_key,
            endpoint,
        }
    }

    pub fn from_env(client: reqwest::Client) -> Result<Self> {
        let api_key = firecrawl_api_key_from_env().ok_or_else(|| {
            Error::ConfigMissing(
                "missing RELOPIPE_FIRECRAWL_API_KEY (or FIRECRAWL_API_KEY)".to_string(),
            )
        })?;
        // Docs: upstream Firecrawl v2 scrape endpoint.
        let endpoint = firecrawl_endpoint_from_env()
            .unwrap_or_else(|| "https://api.firecrawl.dev/v2/scrape".to_string());
        Ok(Self::new(client, api_key, endpoint))
    }

    async fn scrape(&self, url: &str) -> Result<String> {
        let body = serde_json::json!({
            "url": url,
            "formats": ["markdown"],
            "onlyMainContent": true,
        });

        let resp = self
            .client
            .post(&self.endpoint)
            .header(
                reqwest::header::AUTHORIZATION,
                format!("Bearer {}", self.api_key),
            )
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error("summarize scrape", e))?;

        if !resp.status().is_success() {
            return Err(error_for_status("summarize scrape", resp).await);
        }

        let parsed: FirecrawlScrapeResponse = resp
            .json()
            .await
            .map_err(|e| Error::Malformed(format!("summarize scrape: {e}")))?;
        if !parsed.success {
            return Err(Error::Unknown(
                "summarize scrape returned success=false".to_string(),
            ));
        }
        Ok(parsed.data.and_then(|d| d.markdown).unwrap_or_default())
    }
}

#[derive(Debug, Deserialize)]
struct FirecrawlScrapeResponse {
    success: bool,
    data: Option<FirecrawlScrapeData>,
}

#[derive(Debug, Deserialize)]
struct FirecrawlScrapeData {
    markdown: Option<String>,
}

#[async_trait::async_trait]
impl Provider for FirecrawlSummarizer {
    fn id(&self) -> ProviderId {
        ProviderId::Summarize
    }

    async fn fetch(&self, q: &ProviderQuery) -> Result<RawPayload> {
        let topic = q
            .topic
            .ok_or_else(|| Error::Malformed("summarize call without a topic".to_string()))?;
        if q.urls.is_empty() {
            return Err(Error::NotFound("no candidate urls to summarize".to_string()));
        }

        for url in &q.urls {
            match self.scrape(url).await {
                Ok(text) if !text.trim().is_empty() => {
                    debug!(url, "summary candidate succeeded");
                    return Ok(RawPayload::Summary(SummaryPayload {
                        topic,
                        text: condense(&text, MAX_SUMMARY_CHARS),
                        source_url: url.clone(),
                    }));
                }
                Ok(_) => {
                    debug!(url, "summary candidate was empty, trying next");
                }
                // A missing credential will fail every candidate identically.
                Err(e) if matches!(e, Error::ConfigMissing(_)) => return Err(e),
                Err(e) => {
                    debug!(url, error = %e, "summary candidate failed, trying next");
                }
            }
        }

        Err(Error::NotFound(
            "no candidate url yielded a summary".to_string(),
        ))
    }
}
