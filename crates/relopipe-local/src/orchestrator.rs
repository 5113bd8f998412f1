//! Fan-out of one structured request into per-(provider, city) calls.
//!
//! Every call goes through the same gauntlet: per-call cache, rate gate,
//! retry executor. Failures stay per-slot; one provider failing for one city
//! never aborts the request.

use crate::cache::{cache_key, ResponseCache};
use crate::rate::RateController;
use crate::retry;
use crate::{env_u64, env_usize};
use futures_util::stream::{self, StreamExt};
use relopipe_core::{
    Error, IntentKind, Provider, ProviderCallKey, ProviderId, ProviderQuery, ProviderResult,
    RawPayload, Result, RetryPolicy, StructuredRequest, SummaryTopic,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Aggregate per-city payload bundle, cached opportunistically on full
/// success so an unrelated later request for the same city can short-circuit.
pub type CityBundle = BTreeMap<ProviderId, RawPayload>;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Global cap on in-flight provider calls.
    pub max_in_flight: usize,
    /// Per-call deadline; also bounds how long we are willing to sleep on a
    /// full rate window before failing the call fast.
    pub call_timeout_ms: u64,
    pub retry: RetryPolicy,
    pub max_results: usize,
    /// Top web-search hits handed to the summarizer as candidates.
    pub summary_candidates: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 5,
            call_timeout_ms: 15_000,
            retry: RetryPolicy::default(),
            max_results: 5,
            summary_candidates: 3,
        }
    }
}

impl OrchestratorConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            max_in_flight: env_usize("RELOPIPE_MAX_IN_FLIGHT", d.max_in_flight).max(1),
            call_timeout_ms: env_u64("RELOPIPE_CALL_TIMEOUT_MS", d.call_timeout_ms),
            retry: RetryPolicy {
                timeout_ms: env_u64("RELOPIPE_CALL_TIMEOUT_MS", d.retry.timeout_ms),
                ..d.retry
            },
            max_results: env_usize("RELOPIPE_MAX_RESULTS", d.max_results),
            summary_candidates: env_usize("RELOPIPE_SUMMARY_CANDIDATES", d.summary_candidates),
        }
    }
}

/// Ordered provider set an intent needs. Web search rides along for every
/// intent as the baseline enrichment source.
pub fn required_providers(intent: IntentKind) -> Vec<ProviderId> {
    use ProviderId::*;
    match intent {
        IntentKind::CityInfo => vec![Geocode, Metrics, WebSearch, News],
        IntentKind::CityComparison => vec![Geocode, Metrics, WebSearch],
        IntentKind::NeighborhoodRecommendation => vec![Geocode, Metrics, WebSearch],
        IntentKind::HousingMarket => vec![Metrics, WebSearch, Summarize],
        IntentKind::JobOpportunities => vec![Metrics, WebSearch, Summarize],
        IntentKind::SchoolDistricts => vec![WebSearch, Summarize],
        IntentKind::Transportation => vec![Metrics, WebSearch, Summarize],
        IntentKind::CostOfLiving => vec![Metrics, WebSearch],
        IntentKind::LifestyleMatch => vec![Metrics, WebSearch, News],
        IntentKind::RelocationLogistics => vec![WebSearch, News],
        IntentKind::GeneralAdvice | IntentKind::Other => vec![WebSearch],
    }
}

/// Which `Summary` slot the summarizer fills for a topical intent.
pub fn topic_for(intent: IntentKind) -> Option<SummaryTopic> {
    match intent {
        IntentKind::HousingMarket => Some(SummaryTopic::Housing),
        IntentKind::JobOpportunities => Some(SummaryTopic::Jobs),
        IntentKind::SchoolDistricts => Some(SummaryTopic::Schools),
        IntentKind::Transportation => Some(SummaryTopic::Transportation),
        _ => None,
    }
}

fn search_text(intent: IntentKind, city: &str) -> String {
    match intent {
        IntentKind::HousingMarket => format!("{city} housing market trends"),
        IntentKind::JobOpportunities => format!("{city} job market outlook"),
        IntentKind::SchoolDistricts => format!("{city} best school districts"),
        IntentKind::Transportation => format!("{city} public transportation and commute"),
        IntentKind::CostOfLiving => format!("{city} cost of living"),
        IntentKind::NeighborhoodRecommendation => format!("{city} best neighborhoods to live"),
        IntentKind::RelocationLogistics => format!("moving to {city} checklist"),
        _ => format!("{city} relocation guide"),
    }
}

fn city_key(city: &str) -> String {
    format!("city:{}", city.trim().to_lowercase())
}

#[derive(Debug, Clone)]
pub struct CityProviderResults {
    pub city: String,
    pub results: BTreeMap<ProviderId, ProviderResult<RawPayload>>,
}

impl CityProviderResults {
    pub fn succeeded(&self) -> usize {
        self.results.values().filter(|r| r.is_ok()).count()
    }

    pub fn payload(&self, provider: ProviderId) -> Option<&RawPayload> {
        self.results.get(&provider).and_then(|r| r.as_ref().ok())
    }
}

pub struct Orchestrator {
    providers: BTreeMap<ProviderId, Arc<dyn Provider>>,
    rate: Arc<RateController>,
    cache: Arc<ResponseCache<RawPayload>>,
    city_cache: Arc<ResponseCache<CityBundle>>,
    cfg: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(
        providers: Vec<Arc<dyn Provider>>,
        rate: Arc<RateController>,
        cache: Arc<ResponseCache<RawPayload>>,
        city_cache: Arc<ResponseCache<CityBundle>>,
        cfg: OrchestratorConfig,
    ) -> Self {
        let providers = providers.into_iter().map(|p| (p.id(), p)).collect();
        Self {
            providers,
            rate,
            cache,
            city_cache,
            cfg,
        }
    }

    pub fn with_defaults(providers: Vec<Arc<dyn Provider>>) -> Self {
        Self::new(
            providers,
            Arc::new(RateController::new()),
            Arc::new(ResponseCache::default()),
            Arc::new(ResponseCache::default()),
            OrchestratorConfig::default(),
        )
    }

    fn query_for(&self, provider: ProviderId, intent: IntentKind, city: &str) -> ProviderQuery {
        let query = match provider {
            ProviderId::Geocode | ProviderId::Metrics => city.to_string(),
            ProviderId::WebSearch => search_text(intent, city),
            ProviderId::News => format!("{city} news"),
            // Summarize queries are built in wave two, from search results.
            ProviderId::Summarize => search_text(intent, city),
        };
        ProviderQuery {
            city: city.to_string(),
            query,
            max_results: self.cfg.max_results,
            urls: Vec::new(),
            topic: None,
        }
    }

    /// One gated provider call: cache lookup, rate gate, then the retry
    /// executor. Always resolves to a `ProviderResult`, never a panic.
    async fn call_provider(
        &self,
        provider_id: ProviderId,
        q: ProviderQuery,
    ) -> ProviderResult<RawPayload> {
        let Some(provider) = self.providers.get(&provider_id) else {
            return Err(Error::ConfigMissing(format!(
                "no adapter registered for {provider_id}"
            )));
        };

        let key = cache_key(&ProviderCallKey::new(provider_id, &q));
        if let Some(hit) = self.cache.get(&key) {
            debug!(provider = %provider_id, city = %q.city, "cache hit, skipping call");
            return Ok(hit);
        }

        if !self.rate.can_proceed(provider_id) {
            let wait = self.rate.wait_ms(provider_id);
            if wait > self.cfg.call_timeout_ms {
                return Err(Error::RateLimited {
                    detail: format!("{provider_id} quota window exhausted ({wait}ms to go)"),
                    retry_after_s: Some(wait.div_ceil(1_000)),
                });
            }
            debug!(provider = %provider_id, wait_ms = wait, "rate gate, waiting for a slot");
            tokio::time::sleep(Duration::from_millis(wait)).await;
        }
        self.rate.record_call(provider_id);

        let out = retry::execute(provider_id.as_str(), &self.cfg.retry, || provider.fetch(&q)).await;
        match &out {
            Ok(payload) => self.cache.put(&key, payload.clone()),
            Err(Error::RateLimited { retry_after_s, .. }) => {
                self.rate
                    .on_quota_rejected(provider_id, retry_after_s.unwrap_or(60));
            }
            Err(e) => {
                warn!(provider = %provider_id, city = %q.city, error = %e, "provider call failed");
            }
        }
        out
    }

    async fn dispatch(
        &self,
        calls: Vec<(usize, ProviderId, ProviderQuery)>,
        out: &mut [CityProviderResults],
    ) {
        let results: Vec<(usize, ProviderId, ProviderResult<RawPayload>)> = stream::iter(calls)
            .map(|(ci, provider_id, q)| async move {
                (ci, provider_id, self.call_provider(provider_id, q).await)
            })
            .buffer_unordered(self.cfg.max_in_flight.max(1))
            .collect()
            .await;

        // Assembly is slot-keyed; arrival order carries no meaning.
        for (ci, provider_id, result) in results {
            out[ci].results.insert(provider_id, result);
        }
    }

    /// Fan out all required (provider, city) calls for the request and
    /// collect per-slot results. Fails only when a requested city ends up
    /// with zero successful providers.
    pub async fn fetch_for_request(
        &self,
        req: &StructuredRequest,
    ) -> Result<Vec<CityProviderResults>> {
        if req.cities.is_empty() {
            return Err(Error::Malformed("request names no cities".to_string()));
        }

        let required = required_providers(req.intent);
        let mut out: Vec<CityProviderResults> = req
            .cities
            .iter()
            .map(|c| CityProviderResults {
                city: c.clone(),
                results: BTreeMap::new(),
            })
            .collect();

        // Whole-city short-circuit from a previous fully-successful request.
        let mut done = vec![false; req.cities.len()];
        for (ci, city) in req.cities.iter().enumerate() {
            if let Some(bundle) = self.city_cache.get(&city_key(city)) {
                if required.iter().all(|p| bundle.contains_key(p)) {
                    debug!(city = %city, "aggregate cache hit, skipping dispatch");
                    for (p, payload) in bundle {
                        out[ci].results.insert(p, Ok(payload));
                    }
                    done[ci] = true;
                }
            }
        }

        // Wave one: everything that does not depend on other results.
        let mut calls = Vec::new();
        for (ci, city) in req.cities.iter().enumerate() {
            if done[ci] {
                continue;
            }
            for p in required.iter().filter(|p| **p != ProviderId::Summarize) {
                calls.push((ci, *p, self.query_for(*p, req.intent, city)));
            }
        }
        self.dispatch(calls, &mut out).await;

        // Wave two: summarization over the top search hits, when the intent
        // calls for it.
        if required.contains(&ProviderId::Summarize) {
            let topic = topic_for(req.intent);
            let mut calls = Vec::new();
            for (ci, city) in req.cities.iter().enumerate() {
                if done[ci] {
                    continue;
                }
                let urls: Vec<String> = match out[ci].payload(ProviderId::WebSearch) {
                    Some(RawPayload::WebSearch(ws)) => ws
                        .results
                        .iter()
                        .take(self.cfg.summary_candidates)
                        .map(|r| r.url.clone())
                        .collect(),
                    _ => Vec::new(),
                };
                if urls.is_empty() {
                    out[ci].results.insert(
                        ProviderId::Summarize,
                        Err(Error::NotFound("no web results to summarize".to_string())),
                    );
                    continue;
                }
                let mut q = self.query_for(ProviderId::Summarize, req.intent, city);
                q.urls = urls;
                q.topic = topic;
                calls.push((ci, ProviderId::Summarize, q));
            }
            self.dispatch(calls, &mut out).await;
        }

        // A single successful provider is enough for a (sparse) record;
        // zero successes for a requested city is the only overall failure.
        for city_results in &out {
            if city_results.succeeded() == 0 {
                return Err(Error::NoData(city_results.city.clone()));
            }
        }

        for (ci, city_results) in out.iter().enumerate() {
            if done[ci] {
                continue;
            }
            let all_ok = required.len() == city_results.results.len()
                && city_results.results.values().all(|r| r.is_ok());
            if all_ok {
                let bundle: CityBundle = city_results
                    .results
                    .iter()
                    .filter_map(|(p, r)| r.as_ref().ok().map(|v| (*p, v.clone())))
                    .collect();
                self.city_cache.put(&city_key(&city_results.city), bundle);
            }
        }

        info!(
            cities = out.len(),
            providers = required.len(),
            succeeded = out.iter().map(|c| c.succeeded()).sum::<usize>(),
            "provider fan-out complete"
        );
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relopipe_core::{
        ErrorKind, IntentKind, PreferenceSet, SummaryPayload, WebResult, WebSearchPayload,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct ScriptedProvider {
        id: ProviderId,
        result: ProviderResult<RawPayload>,
        calls: AtomicUsize,
        seen_urls: Mutex<Vec<String>>,
    }

    impl ScriptedProvider {
        fn new(id: ProviderId, result: ProviderResult<RawPayload>) -> Arc<Self> {
            Arc::new(Self {
                id,
                result,
                calls: AtomicUsize::new(0),
                seen_urls: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait::async_trait]
    impl Provider for ScriptedProvider {
        fn id(&self) -> ProviderId {
            self.id
        }

        async fn fetch(&self, q: &ProviderQuery) -> ProviderResult<RawPayload> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen_urls.lock().unwrap().extend(q.urls.clone());
            self.result.clone()
        }
    }

    struct SlowProvider {
        id: ProviderId,
        in_flight: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl Provider for SlowProvider {
        fn id(&self) -> ProviderId {
            self.id
        }

        async fn fetch(&self, _q: &ProviderQuery) -> ProviderResult<RawPayload> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(RawPayload::WebSearch(WebSearchPayload {
                results: Vec::new(),
            }))
        }
    }

    fn geocode_ok() -> RawPayload {
        RawPayload::Geocode(relopipe_core::GeocodePayload {
            display_name: "Austin, Texas".to_string(),
            neighborhoods: Vec::new(),
        })
    }

    fn websearch_ok(urls: &[&str]) -> RawPayload {
        RawPayload::WebSearch(WebSearchPayload {
            results: urls
                .iter()
                .map(|u| WebResult {
                    title: "t".to_string(),
                    url: u.to_string(),
                    snippet: "s".to_string(),
                })
                .collect(),
        })
    }

    fn request(intent: IntentKind, cities: &[&str]) -> StructuredRequest {
        StructuredRequest::new(
            intent,
            cities.iter().map(|c| c.to_string()).collect(),
            PreferenceSet::default(),
            "test".to_string(),
        )
    }

    fn fast_cfg() -> OrchestratorConfig {
        OrchestratorConfig {
            retry: RetryPolicy {
                max_retries: 0,
                base_delay_ms: 1,
                max_delay_ms: 1,
                timeout_ms: 1_000,
            },
            call_timeout_ms: 1_000,
            ..Default::default()
        }
    }

    fn orchestrator_with(
        providers: Vec<Arc<dyn Provider>>,
        cfg: OrchestratorConfig,
    ) -> Orchestrator {
        Orchestrator::new(
            providers,
            Arc::new(RateController::new()),
            Arc::new(ResponseCache::default()),
            Arc::new(ResponseCache::default()),
            cfg,
        )
    }

    #[test]
    fn every_intent_requires_web_search() {
        for intent in [
            IntentKind::CityInfo,
            IntentKind::CityComparison,
            IntentKind::NeighborhoodRecommendation,
            IntentKind::HousingMarket,
            IntentKind::JobOpportunities,
            IntentKind::SchoolDistricts,
            IntentKind::Transportation,
            IntentKind::CostOfLiving,
            IntentKind::LifestyleMatch,
            IntentKind::RelocationLogistics,
            IntentKind::GeneralAdvice,
            IntentKind::Other,
        ] {
            assert!(
                required_providers(intent).contains(&ProviderId::WebSearch),
                "{intent:?} should include web search"
            );
        }
    }

    #[tokio::test]
    async fn one_successful_provider_is_enough_for_a_record() {
        let geocode = ScriptedProvider::new(ProviderId::Geocode, Ok(geocode_ok()));
        let metrics = ScriptedProvider::new(
            ProviderId::Metrics,
            Err(Error::ServerError("boom".to_string())),
        );
        let search = ScriptedProvider::new(
            ProviderId::WebSearch,
            Err(Error::ServerError("boom".to_string())),
        );
        let orch = orchestrator_with(
            vec![geocode.clone(), metrics, search],
            fast_cfg(),
        );

        let out = orch
            .fetch_for_request(&request(IntentKind::CityComparison, &["Austin"]))
            .await
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].results.len(), 3);
        assert_eq!(out[0].succeeded(), 1);
        assert!(out[0].payload(ProviderId::Geocode).is_some());
    }

    #[tokio::test]
    async fn zero_successes_for_a_city_fails_with_no_data() {
        let search = ScriptedProvider::new(
            ProviderId::WebSearch,
            Err(Error::ServerError("down".to_string())),
        );
        let orch = orchestrator_with(vec![search], fast_cfg());
        let err = orch
            .fetch_for_request(&request(IntentKind::GeneralAdvice, &["Austin"]))
            .await
            .unwrap_err();
        assert_eq!(err, Error::NoData("Austin".to_string()));
    }

    #[tokio::test]
    async fn a_request_without_cities_is_rejected_before_dispatch() {
        let search = ScriptedProvider::new(ProviderId::WebSearch, Ok(websearch_ok(&[])));
        let orch = orchestrator_with(vec![search.clone()], fast_cfg());
        let err = orch
            .fetch_for_request(&request(IntentKind::GeneralAdvice, &[]))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Malformed);
        assert_eq!(search.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn repeat_requests_short_circuit_through_the_caches() {
        let search = ScriptedProvider::new(
            ProviderId::WebSearch,
            Ok(websearch_ok(&["https://a.example"])),
        );
        let orch = orchestrator_with(vec![search.clone()], fast_cfg());
        let req = request(IntentKind::GeneralAdvice, &["Austin"]);

        orch.fetch_for_request(&req).await.unwrap();
        assert_eq!(search.calls.load(Ordering::SeqCst), 1);
        let out = orch.fetch_for_request(&req).await.unwrap();
        assert_eq!(search.calls.load(Ordering::SeqCst), 1, "second run is cached");
        assert_eq!(out[0].succeeded(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn in_flight_calls_never_exceed_the_cap() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let providers: Vec<Arc<dyn Provider>> = [
            ProviderId::Geocode,
            ProviderId::Metrics,
            ProviderId::WebSearch,
        ]
        .into_iter()
        .map(|id| {
            Arc::new(SlowProvider {
                id,
                in_flight: in_flight.clone(),
                peak: peak.clone(),
            }) as Arc<dyn Provider>
        })
        .collect();

        let cfg = OrchestratorConfig {
            max_in_flight: 2,
            ..fast_cfg()
        };
        let orch = orchestrator_with(providers, cfg);
        orch.fetch_for_request(&request(IntentKind::CityComparison, &["Austin", "Denver"]))
            .await
            .unwrap();
        assert!(
            peak.load(Ordering::SeqCst) <= 2,
            "peak in-flight was {}",
            peak.load(Ordering::SeqCst)
        );
    }

    #[tokio::test]
    async fn summarize_runs_in_wave_two_over_top_search_hits() {
        let metrics = ScriptedProvider::new(
            ProviderId::Metrics,
            Err(Error::ServerError("down".to_string())),
        );
        let search = ScriptedProvider::new(
            ProviderId::WebSearch,
            Ok(websearch_ok(&[
                "https://a.example",
                "https://b.example",
                "https://c.example",
                "https://d.example",
            ])),
        );
        let summarize = ScriptedProvider::new(
            ProviderId::Summarize,
            Ok(RawPayload::Summary(SummaryPayload {
                topic: SummaryTopic::Housing,
                text: "rising".to_string(),
                source_url: "https://a.example".to_string(),
            })),
        );
        let orch = orchestrator_with(
            vec![metrics, search, summarize.clone()],
            fast_cfg(),
        );

        let out = orch
            .fetch_for_request(&request(IntentKind::HousingMarket, &["Austin"]))
            .await
            .unwrap();
        assert!(out[0].payload(ProviderId::Summarize).is_some());
        let seen = summarize.seen_urls.lock().unwrap().clone();
        // Default candidate cap is 3: the fourth hit is never offered.
        assert_eq!(
            seen,
            vec![
                "https://a.example".to_string(),
                "https://b.example".to_string(),
                "https://c.example".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn summarize_is_skipped_when_search_gave_nothing() {
        let search = ScriptedProvider::new(
            ProviderId::WebSearch,
            Ok(websearch_ok(&[])),
        );
        let summarize = ScriptedProvider::new(
            ProviderId::Summarize,
            Ok(RawPayload::Summary(SummaryPayload {
                topic: SummaryTopic::Schools,
                text: "t".to_string(),
                source_url: "u".to_string(),
            })),
        );
        let orch = orchestrator_with(vec![search, summarize.clone()], fast_cfg());

        let out = orch
            .fetch_for_request(&request(IntentKind::SchoolDistricts, &["Austin"]))
            .await
            .unwrap();
        assert_eq!(summarize.calls.load(Ordering::SeqCst), 0);
        let err = out[0].results.get(&ProviderId::Summarize).unwrap();
        assert_eq!(err.as_ref().unwrap_err().kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn an_exhausted_quota_window_fails_fast_without_a_network_call() {
        let search = ScriptedProvider::new(
            ProviderId::WebSearch,
            Ok(websearch_ok(&["https://a.example"])),
        );
        let mut quotas = BTreeMap::new();
        quotas.insert(ProviderId::WebSearch, 0u32);
        let orch = Orchestrator::new(
            vec![search.clone()],
            Arc::new(RateController::with_quotas(quotas)),
            Arc::new(ResponseCache::default()),
            Arc::new(ResponseCache::default()),
            fast_cfg(),
        );

        let err = orch
            .fetch_for_request(&request(IntentKind::GeneralAdvice, &["Austin"]))
            .await
            .unwrap_err();
        // The only provider was gated, so the city has zero successes.
        assert_eq!(err.kind(), ErrorKind::NoData);
        assert_eq!(search.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn a_quota_rejection_backs_off_the_provider() {
        let search = ScriptedProvider::new(
            ProviderId::WebSearch,
            Err(Error::RateLimited {
                detail: "429".to_string(),
                retry_after_s: Some(120),
            }),
        );
        let rate = Arc::new(RateController::new());
        let orch = Orchestrator::new(
            vec![search],
            rate.clone(),
            Arc::new(ResponseCache::default()),
            Arc::new(ResponseCache::default()),
            fast_cfg(),
        );

        let _ = orch
            .fetch_for_request(&request(IntentKind::GeneralAdvice, &["Austin"]))
            .await;
        assert!(!rate.can_proceed(ProviderId::WebSearch));
        assert!(rate.wait_ms(ProviderId::WebSearch) > 0);
    }
}
