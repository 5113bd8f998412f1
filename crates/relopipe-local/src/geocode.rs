use crate::{env_nonempty, error_for_status, transport_error};
use relopipe_core::{
    Error, GeocodePayload, Neighborhood, Provider, ProviderId, ProviderQuery, RawPayload, Result,
};
use serde::Deserialize;

fn nominatim_endpoint_from_env() -> Option<String> {
    env_nonempty("RELOPIPE_GEOCODE_ENDPOINT")
}

/// Place lookup backed by a Nominatim-compatible endpoint. Keyless; the
/// public instance enforces its own rate policy, which the rate controller's
/// quota table respects on our side.
#[derive(Debug, Clone)]
pub struct NominatimProvider {
    client: reqwest::Client,
    endpoint: String,
}

impl NominatimProvider {
    pub fn new(client: reqwest::Client, endpoint: String) -> Self {
        Self { client, endpoint }
    }

    pub fn from_env(client: reqwest::Client) -> Result<Self> {
        // Docs: https://nominatim.org/release-docs/latest/api/Search/
        let endpoint = nominatim_endpoint_from_env()
            .unwrap_or_else(|| "https://nominatim.openstreetmap.org/search".to_string());
        Ok(Self::new(client, endpoint))
    }
}

#[derive(Debug, Deserialize)]
struct NominatimPlace {
    display_name: Option<String>,
    name: Option<String>,
    #[serde(rename = "type")]
    place_type: Option<String>,
    address: Option<NominatimAddress>,
}

#[derive(Debug, Deserialize)]
struct NominatimAddress {
    city: Option<String>,
    town: Option<String>,
    suburb: Option<String>,
}

#[async_trait::async_trait]
impl Provider for NominatimProvider {
    fn id(&self) -> ProviderId {
        ProviderId::Geocode
    }

    async fn fetch(&self, q: &ProviderQuery) -> Result<RawPayload> {
        let limit = q.max_results.clamp(1, 20);
        let resp = self
            .client
            .get(&self.endpoint)
            .query(&[
                ("q", q.city.as_str()),
                ("format", "json"),
                ("addressdetails", "1"),
                ("limit", &limit.to_string()),
            ])
            .send()
            .await
            .map_err(|e| transport_error("geocode", e))?;

        if !resp.status().is_success() {
            return Err(error_for_status("geocode", resp).await);
        }

        let places: Vec<NominatimPlace> = resp
            .json()
            .await
            .map_err(|e| Error::Malformed(format!("geocode: {e}")))?;

        if places.is_empty() {
            return Err(Error::NotFound(format!("no places for {:?}", q.city)));
        }

        let display_name = places[0]
            .display_name
            .clone()
            .or_else(|| places[0].name.clone())
            .unwrap_or_else(|| q.city.clone());

        // Secondary hits at suburb/neighbourhood granularity become the
        // neighborhood list; city-level duplicates are skipped.
        let mut neighborhoods = Vec::new();
        for p in places.iter().skip(1) {
            let is_local = matches!(
                p.place_type.as_deref(),
                Some("suburb") | Some("neighbourhood") | Some("quarter") | Some("residential")
            );
            if !is_local {
                continue;
            }
            let Some(name) = p.name.clone().filter(|n| !n.is_empty()) else {
                continue;
            };
            let locality = p
                .address
                .as_ref()
                .and_then(|a| a.city.clone().or_else(|| a.town.clone()))
                .or_else(|| p.address.as_ref().and_then(|a| a.suburb.clone()))
                .unwrap_or_else(|| q.city.clone());
            neighborhoods.push(Neighborhood { name, locality });
        }

        Ok(RawPayload::Geocode(GeocodePayload {
            display_name,
            neighborhoods,
        }))
    }
}
