use crate::{api_key_from_env, env_nonempty, error_for_status, transport_error};
use relopipe_core::{
    Error, NewsItem, NewsPayload, Provider, ProviderId, ProviderQuery, RawPayload, Result,
};
use serde::Deserialize;

fn news_api_key_from_env() -> Option<String> {
    api_key_from_env("RELOPIPE_NEWS_API_KEY", "NEWS_API_KEY")
}

fn news_endpoint_from_env() -> Option<String> {
    env_nonempty("RELOPIPE_NEWS_ENDPOINT")
}

/// Recent-article search, NewsAPI-style wire shape.
#[derive(Debug, Clone)]
pub struct NewsSearchProvider {
    client: reqwest::Client,
    api_key: String,
    endpoint: String,
}

impl NewsSearchProvider {
    pub fn new(client: reqwest::Client, api_key: String, endpoint: String) -> Self {
        Self {
            client,
            api_key,
            endpoint,
        }
    }

    pub fn from_env(client: reqwest::Client) -> Result<Self> {
        let api_key = news_api_key_from_env().ok_or_else(|| {
            Error::ConfigMissing("missing RELOPIPE_NEWS_API_KEY (or NEWS_API_KEY)".to_string())
        })?;
        // Docs: https://newsapi.org/docs/endpoints/everything
        let endpoint = news_endpoint_from_env()
            .unwrap_or_else(|| "https://newsapi.org/v2/everything".to_string());
        Ok(Self::new(client, api_key, endpoint))
    }
}

#[derive(Debug, Deserialize)]
struct NewsApiResponse {
    status: String,
    code: Option<String>,
    message: Option<String>,
    #[serde(default)]
    articles: Vec<NewsApiArticle>,
}

#[derive(Debug, Deserialize)]
struct NewsApiArticle {
    title: Option<String>,
    url: Option<String>,
    source: Option<NewsApiSource>,
    #[serde(rename = "publishedAt")]
    published_at: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NewsApiSource {
    name: Option<String>,
}

#[async_trait::async_trait]
impl Provider for NewsSearchProvider {
    fn id(&self) -> ProviderId {
        ProviderId::News
    }

    async fn fetch(&self, q: &ProviderQuery) -> Result<RawPayload> {
        let page_size = q.max_results.clamp(1, 20);
        let resp = self
            .client
            .get(&self.endpoint)
            .header("X-Api-Key", &self.api_key)
            .query(&[
                ("q", q.query.as_str()),
                ("sortBy", "publishedAt"),
                ("pageSize", &page_size.to_string()),
            ])
            .send()
            .await
            .map_err(|e| transport_error("news search", e))?;

        if !resp.status().is_success() {
            return Err(error_for_status("news search", resp).await);
        }

        let parsed: NewsApiResponse = resp
            .json()
            .await
            .map_err(|e| Error::Malformed(format!("news search: {e}")))?;

        // NewsAPI reports some failures as 200 + status:"error".
        if parsed.status != "ok" {
            let detail = format!(
                "news search error {}: {}",
                parsed.code.as_deref().unwrap_or("unknown"),
                parsed.message.as_deref().unwrap_or("")
            );
            return Err(match parsed.code.as_deref() {
                Some("rateLimited") => Error::RateLimited {
                    detail,
                    retry_after_s: None,
                },
                Some("apiKeyInvalid") | Some("apiKeyMissing") => Error::ConfigMissing(detail),
                _ => Error::Unknown(detail),
            });
        }

        let mut articles = Vec::new();
        for a in parsed.articles.into_iter().take(page_size) {
            let Some(url) = a.url.filter(|u| !u.is_empty()) else {
                continue;
            };
            articles.push(NewsItem {
                title: a.title.unwrap_or_default(),
                url,
                source: a.source.and_then(|s| s.name).unwrap_or_default(),
                published_at: a.published_at.unwrap_or_default(),
            });
        }

        Ok(RawPayload::News(NewsPayload { articles }))
    }
}
