use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("not configured: {0}")]
    ConfigMissing(String),
    #[error("rate limited: {detail}")]
    RateLimited {
        detail: String,
        /// Server-suggested backoff, when the provider sent one.
        retry_after_s: Option<u64>,
    },
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("server error: {0}")]
    ServerError(String),
    #[error("malformed payload: {0}")]
    Malformed(String),
    #[error("no provider returned data for city: {0}")]
    NoData(String),
    #[error("empty query")]
    EmptyQuery,
    #[error("provider failure: {0}")]
    Unknown(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    ConfigMissing,
    RateLimited,
    Timeout,
    NotFound,
    ServerError,
    Malformed,
    NoData,
    EmptyQuery,
    Unknown,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::ConfigMissing(_) => ErrorKind::ConfigMissing,
            Error::RateLimited { .. } => ErrorKind::RateLimited,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::ServerError(_) => ErrorKind::ServerError,
            Error::Malformed(_) => ErrorKind::Malformed,
            Error::NoData(_) => ErrorKind::NoData,
            Error::EmptyQuery => ErrorKind::EmptyQuery,
            Error::Unknown(_) => ErrorKind::Unknown,
        }
    }

    /// Whether a retry has any chance of helping.
    ///
    /// Timeouts, 5xx, and unclassified network-level failures are worth
    /// retrying. Missing credentials, 404s, and unparsable payloads are not.
    /// Rate-limit rejections are handled by backoff shaping, not retries.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_) | Error::ServerError(_) | Error::Unknown(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Per-(provider, city) outcome carried from dispatch into fusion.
/// An `Err` means "this slot is unavailable", never a request-level abort.
pub type ProviderResult<T> = Result<T>;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum ProviderId {
    Geocode,
    Metrics,
    WebSearch,
    News,
    Summarize,
}

impl ProviderId {
    pub const ALL: [ProviderId; 5] = [
        ProviderId::Geocode,
        ProviderId::Metrics,
        ProviderId::WebSearch,
        ProviderId::News,
        ProviderId::Summarize,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderId::Geocode => "geocode",
            ProviderId::Metrics => "metrics",
            ProviderId::WebSearch => "websearch",
            ProviderId::News => "news",
            ProviderId::Summarize => "summarize",
        }
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntentKind {
    CityInfo,
    CityComparison,
    NeighborhoodRecommendation,
    HousingMarket,
    JobOpportunities,
    SchoolDistricts,
    Transportation,
    CostOfLiving,
    LifestyleMatch,
    RelocationLogistics,
    GeneralAdvice,
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetRange {
    pub min: Option<u64>,
    pub max: Option<u64>,
    pub currency: String,
}

/// Attributes extracted from free text. Every field is optional; an absent
/// field means "unconstrained", never "false".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PreferenceSet {
    pub budget: Option<BudgetRange>,
    pub housing_types: Vec<String>,
    pub school_quality: Option<bool>,
    pub safety_priority: Option<bool>,
    pub job_industries: Vec<String>,
    pub transport_modes: Vec<String>,
    pub lifestyle: Vec<String>,
    pub climate: Vec<String>,
}

impl PreferenceSet {
    pub fn is_empty(&self) -> bool {
        self.budget.is_none()
            && self.housing_types.is_empty()
            && self.school_quality.is_none()
            && self.safety_priority.is_none()
            && self.job_industries.is_empty()
            && self.transport_modes.is_empty()
            && self.lifestyle.is_empty()
            && self.climate.is_empty()
    }

    /// Fill fields the current extraction left empty from a prior session's
    /// preferences. Freshly-extracted values always win.
    pub fn merge_missing_from(&mut self, prior: &PreferenceSet) {
        if self.budget.is_none() {
            self.budget = prior.budget.clone();
        }
        if self.housing_types.is_empty() {
            self.housing_types = prior.housing_types.clone();
        }
        if self.school_quality.is_none() {
            self.school_quality = prior.school_quality;
        }
        if self.safety_priority.is_none() {
            self.safety_priority = prior.safety_priority;
        }
        if self.job_industries.is_empty() {
            self.job_industries = prior.job_industries.clone();
        }
        if self.transport_modes.is_empty() {
            self.transport_modes = prior.transport_modes.clone();
        }
        if self.lifestyle.is_empty() {
            self.lifestyle = prior.lifestyle.clone();
        }
        if self.climate.is_empty() {
            self.climate = prior.climate.clone();
        }
    }
}

/// Immutable structured form of one incoming query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredRequest {
    pub intent: IntentKind,
    /// 1–2 city names, first occurrence wins on case-insensitive duplicates.
    pub cities: Vec<String>,
    pub preferences: PreferenceSet,
    pub raw_query: String,
}

impl StructuredRequest {
    pub fn new(
        intent: IntentKind,
        cities: Vec<String>,
        preferences: PreferenceSet,
        raw_query: String,
    ) -> Self {
        let mut seen: Vec<String> = Vec::new();
        let mut deduped: Vec<String> = Vec::new();
        for c in cities {
            let norm = c.trim().to_lowercase();
            if norm.is_empty() || seen.contains(&norm) {
                continue;
            }
            seen.push(norm);
            deduped.push(c.trim().to_string());
            if deduped.len() == 2 {
                break;
            }
        }
        Self {
            intent,
            cities: deduped,
            preferences,
            raw_query,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SummaryTopic {
    Housing,
    Jobs,
    Schools,
    Transportation,
}

/// Normalized parameters for one provider call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderQuery {
    pub city: String,
    pub query: String,
    pub max_results: usize,
    /// Candidate URLs for summarization, tried in order.
    pub urls: Vec<String>,
    pub topic: Option<SummaryTopic>,
}

impl ProviderQuery {
    /// Deterministic encoding of the parameter set: serde_json maps are
    /// key-sorted, so equivalent calls collide regardless of construction
    /// order.
    pub fn canonical_params(&self) -> String {
        serde_json::to_value(self)
            .map(|v| v.to_string())
            .unwrap_or_default()
    }
}

/// Quota bucket key (by provider) and cache entry key (full tuple).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderCallKey {
    pub provider: ProviderId,
    pub params: String,
}

impl ProviderCallKey {
    pub fn new(provider: ProviderId, query: &ProviderQuery) -> Self {
        Self {
            provider,
            params: query.canonical_params(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Neighborhood {
    pub name: String,
    pub locality: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeocodePayload {
    pub display_name: String,
    pub neighborhoods: Vec<Neighborhood>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryScore {
    /// Provider vocabulary, e.g. "Cost of Living". Normalized during fusion.
    pub name: String,
    /// 0–10.
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsPayload {
    pub categories: Vec<CategoryScore>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebResult {
    pub title: String,
    pub url: String,
    pub snippet: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebSearchPayload {
    pub results: Vec<WebResult>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewsItem {
    pub title: String,
    pub url: String,
    pub source: String,
    pub published_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewsPayload {
    pub articles: Vec<NewsItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryPayload {
    pub topic: SummaryTopic,
    pub text: String,
    pub source_url: String,
}

/// Tagged per-provider payload. Untyped maps never cross into fusion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RawPayload {
    Geocode(GeocodePayload),
    Metrics(MetricsPayload),
    WebSearch(WebSearchPayload),
    News(NewsPayload),
    Summary(SummaryPayload),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub text: String,
    pub highlights: Vec<String>,
    pub sources: Vec<String>,
}

/// Canonical fused per-city record. Built fresh per request; rebuilt rather
/// than patched. Absent score categories mean "unknown", not zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CityRecord {
    pub name: String,
    pub display_name: String,
    pub scores: BTreeMap<String, f64>,
    pub housing: Option<Summary>,
    pub jobs: Option<Summary>,
    pub schools: Option<Summary>,
    pub transportation: Option<Summary>,
    pub neighborhoods: Vec<Neighborhood>,
    pub news: Vec<NewsItem>,
    pub web_results: Vec<WebResult>,
}

impl CityRecord {
    pub fn empty(name: &str) -> Self {
        Self {
            name: name.to_string(),
            display_name: name.to_string(),
            scores: BTreeMap::new(),
            housing: None,
            jobs: None,
            schools: None,
            transportation: None,
            neighborhoods: Vec::new(),
            news: Vec::new(),
            web_results: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryOutcome {
    /// City name, or "tie" on equal scores.
    pub winner: String,
    /// |score_a - score_b|, one decimal place.
    pub magnitude: f64,
}

/// Present only when exactly two city records were fused. Computed over the
/// categories present in both records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonResult {
    pub winner: String,
    pub per_category: BTreeMap<String, CategoryOutcome>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Hard deadline for a single attempt.
    pub timeout_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay_ms: 500,
            max_delay_ms: 8_000,
            timeout_ms: 15_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry `n` (1-based): `min(max_delay, base * 2^(n-1))`.
    /// No jitter.
    pub fn delay_before_retry(&self, n: u32) -> Duration {
        let factor = 1u64.checked_shl(n.saturating_sub(1)).unwrap_or(u64::MAX);
        let ms = self
            .base_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms);
        Duration::from_millis(ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[async_trait::async_trait]
pub trait Provider: Send + Sync {
    fn id(&self) -> ProviderId;
    async fn fetch(&self, q: &ProviderQuery) -> Result<RawPayload>;
}

/// Turns free text (plus optional explicit city hints) into a structured
/// request. The rule-based implementation is one valid extractor; an
/// LLM-backed one is another. Orchestration must not care which is used.
pub trait IntentExtractor: Send + Sync {
    fn extract(&self, raw_query: &str, city_hints: &[String]) -> Result<StructuredRequest>;
}

/// Optional persisted-memory collaborator, keyed by session id. The pipeline
/// must function with it entirely absent.
pub trait MemoryStore: Send + Sync {
    fn get(&self, session_id: &str, key: &str) -> Option<String>;
    fn set(&self, session_id: &str, key: &str, value: String);
}
