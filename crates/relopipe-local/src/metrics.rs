use crate::{env_nonempty, error_for_status, transport_error};
use relopipe_core::{
    CategoryScore, Error, MetricsPayload, Provider, ProviderId, ProviderQuery, RawPayload, Result,
};
use serde::Deserialize;

fn metrics_endpoint_from_env() -> Option<String> {
    env_nonempty("RELOPIPE_METRICS_ENDPOINT")
}

/// Turn a city name into the provider's slug form: "New York" -> "new-york".
fn city_slug(city: &str) -> String {
    let mut out = String::new();
    for ch in city.trim().chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
        } else if !out.ends_with('-') && !out.is_empty() {
            out.push('-');
        }
    }
    out.trim_end_matches('-').to_string()
}

/// Quality-of-life category scores (0–10) per urban area, Teleport-style.
/// Category names arrive in provider vocabulary ("Cost of Living",
/// "Housing"); normalization happens during fusion, not here.
#[derive(Debug, Clone)]
pub struct UrbanScoresProvider {
    client: reqwest::Client,
    endpoint: String,
}

impl UrbanScoresProvider {
    pub fn new(client: reqwest::Client, endpoint: String) -> Self {
        Self { client, endpoint }
    }

    pub fn from_env(client: reqwest::Client) -> Result<Self> {
        let endpoint = metrics_endpoint_from_env()
            .unwrap_or_else(|| "https://api.teleport.org/api/urban_areas".to_string());
        Ok(Self::new(client, endpoint))
    }

    fn scores_url(&self, city: &str) -> String {
        let base = self.endpoint.trim_end_matches('/');
        format!("{base}/slug:{}/scores/", city_slug(city))
    }
}

#[derive(Debug, Deserialize)]
struct UrbanScoresResponse {
    categories: Vec<UrbanScoreCategory>,
}

#[derive(Debug, Deserialize)]
struct UrbanScoreCategory {
    name: String,
    score_out_of_10: f64,
}

#[async_trait::async_trait]
impl Provider for UrbanScoresProvider {
    fn id(&self) -> ProviderId {
        ProviderId::Metrics
    }

    async fn fetch(&self, q: &ProviderQuery) -> Result<RawPayload> {
        let resp = self
            .client
            .get(self.scores_url(&q.city))
            .send()
            .await
            .map_err(|e| transport_error("urban scores", e))?;

        if !resp.status().is_success() {
            return Err(error_for_status("urban scores", resp).await);
        }

        let parsed: UrbanScoresResponse = resp
            .json()
            .await
            .map_err(|e| Error::Malformed(format!("urban scores: {e}")))?;

        let categories = parsed
            .categories
            .into_iter()
            .map(|c| CategoryScore {
                name: c.name,
                score: c.score_out_of_10.clamp(0.0, 10.0),
            })
            .collect();

        Ok(RawPayload::Metrics(MetricsPayload { categories }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{extract::Path, http::StatusCode, routing::get, Json, Router};
    use relopipe_core::ErrorKind;
    use std::net::SocketAddr;

    async fn serve(app: Router) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    fn query(city: &str) -> ProviderQuery {
        ProviderQuery {
            city: city.to_string(),
            query: city.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn slugs_are_lowercase_hyphenated() {
        assert_eq!(city_slug("Austin"), "austin");
        assert_eq!(city_slug("New York"), "new-york");
        assert_eq!(city_slug("  San José, CA "), "san-jos-ca");
    }

    #[test]
    fn parses_minimal_scores_shape() {
        let js = r#"
        {
          "categories": [
            {"name": "Cost of Living", "score_out_of_10": 6.4},
            {"name": "Housing", "score_out_of_10": 5.1}
          ]
        }
        "#;
        let parsed: UrbanScoresResponse = serde_json::from_str(js).unwrap();
        assert_eq!(parsed.categories.len(), 2);
        assert_eq!(parsed.categories[0].name, "Cost of Living");
    }

    #[tokio::test]
    async fn fetch_clamps_scores_into_range() {
        let app = Router::new().route(
            "/:seg/scores/",
            get(|Path(seg): Path<String>| async move {
                assert_eq!(seg, "slug:new-york");
                Json(serde_json::json!({
                    "categories": [
                        {"name": "Housing", "score_out_of_10": 11.2},
                        {"name": "Safety", "score_out_of_10": -0.5}
                    ]
                }))
            }),
        );
        let addr = serve(app).await;
        let p = UrbanScoresProvider::new(reqwest::Client::new(), format!("http://{addr}/"));
        let out = p.fetch(&query("New York")).await.unwrap();
        let RawPayload::Metrics(m) = out else {
            panic!("expected metrics payload");
        };
        assert_eq!(m.categories[0].score, 10.0);
        assert_eq!(m.categories[1].score, 0.0);
    }

    #[tokio::test]
    async fn unknown_city_maps_to_not_found() {
        let app = Router::new().route(
            "/:seg/scores/",
            get(|| async { (StatusCode::NOT_FOUND, "no such urban area") }),
        );
        let addr = serve(app).await;
        let p = UrbanScoresProvider::new(reqwest::Client::new(), format!("http://{addr}/"));
        let err = p.fetch(&query("Nowheresville")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
