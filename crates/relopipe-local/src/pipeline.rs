//! End-to-end pipeline: free text in, fused records (and, for two cities,
//! a comparison) out.
//!
//! The pipeline owns the wiring between the extractor, the orchestrator, and
//! the optional session memory. It carries no provider logic of its own.

use crate::cache::ResponseCache;
use crate::fusion;
use crate::intent::RuleBasedExtractor;
use crate::orchestrator::{Orchestrator, OrchestratorConfig};
use crate::rate::RateController;
use relopipe_core::{
    CityRecord, ComparisonResult, IntentExtractor, MemoryStore, PreferenceSet, Provider, Result,
    StructuredRequest,
};
use std::sync::Arc;
use tracing::{info, warn};

/// Memory key under which a session's extracted preferences live.
const PREFS_KEY: &str = "preferences";

/// One answered query.
#[derive(Debug, Clone, PartialEq)]
pub struct Answer {
    /// The structured request actually executed, after any memory merge.
    pub request: StructuredRequest,
    pub records: Vec<CityRecord>,
    /// Present only when exactly two cities were fused.
    pub comparison: Option<ComparisonResult>,
}

pub struct Pipeline {
    extractor: Box<dyn IntentExtractor>,
    orchestrator: Orchestrator,
    memory: Option<Box<dyn MemoryStore>>,
}

impl Pipeline {
    pub fn new(
        extractor: Box<dyn IntentExtractor>,
        orchestrator: Orchestrator,
        memory: Option<Box<dyn MemoryStore>>,
    ) -> Self {
        Self {
            extractor,
            orchestrator,
            memory,
        }
    }

    /// Production wiring: rule-based extraction, env-configured adapters,
    /// no session memory. Keyed providers whose credentials are absent are
    /// skipped with a warning; their slots will fail as unconfigured only if
    /// an intent actually needs them.
    pub fn from_env() -> Result<Self> {
        let client = crate::default_client()?;
        let orchestrator = Orchestrator::new(
            providers_from_env(&client),
            Arc::new(RateController::from_env()),
            Arc::new(ResponseCache::default()),
            Arc::new(ResponseCache::default()),
            OrchestratorConfig::from_env(),
        );
        Ok(Self::new(
            Box::new(RuleBasedExtractor::new()),
            orchestrator,
            None,
        ))
    }

    pub fn with_memory(mut self, memory: Box<dyn MemoryStore>) -> Self {
        self.memory = Some(memory);
        self
    }

    fn recall_preferences(&self, session_id: &str) -> Option<PreferenceSet> {
        let memory = self.memory.as_ref()?;
        let stored = memory.get(session_id, PREFS_KEY)?;
        match serde_json::from_str(&stored) {
            Ok(prefs) => Some(prefs),
            Err(e) => {
                warn!(session_id, error = %e, "stored preferences unreadable, ignoring");
                None
            }
        }
    }

    fn persist_preferences(&self, session_id: &str, prefs: &PreferenceSet) {
        let Some(memory) = self.memory.as_ref() else {
            return;
        };
        if prefs.is_empty() {
            return;
        }
        match serde_json::to_string(prefs) {
            Ok(encoded) => memory.set(session_id, PREFS_KEY, encoded),
            Err(e) => warn!(session_id, error = %e, "could not encode preferences"),
        }
    }

    /// Answer one free-text query. `city_hints` short-circuits city
    /// extraction; `session_id` enables preference recall and store-back.
    pub async fn answer(
        &self,
        raw_query: &str,
        city_hints: &[String],
        session_id: Option<&str>,
    ) -> Result<Answer> {
        let mut request = self.extractor.extract(raw_query, city_hints)?;

        // Prior preferences fill gaps only; this turn's extraction wins.
        if let Some(sid) = session_id {
            if let Some(prior) = self.recall_preferences(sid) {
                request.preferences.merge_missing_from(&prior);
            }
        }

        info!(
            intent = ?request.intent,
            cities = ?request.cities,
            "executing structured request"
        );
        let results = self.orchestrator.fetch_for_request(&request).await?;
        let (records, comparison) = fusion::fuse_all(&results);

        if let Some(sid) = session_id {
            self.persist_preferences(sid, &request.preferences);
        }

        Ok(Answer {
            request,
            records,
            comparison,
        })
    }
}

/// Build every adapter that can be configured from the environment. The two
/// keyless adapters are always present.
pub fn providers_from_env(client: &reqwest::Client) -> Vec<Arc<dyn Provider>> {
    let mut providers: Vec<Arc<dyn Provider>> = Vec::new();

    match crate::geocode::NominatimProvider::from_env(client.clone()) {
        Ok(p) => providers.push(Arc::new(p)),
        Err(e) => warn!(error = %e, "geocode adapter unavailable"),
    }
    match crate::metrics::UrbanScoresProvider::from_env(client.clone()) {
        Ok(p) => providers.push(Arc::new(p)),
        Err(e) => warn!(error = %e, "metrics adapter unavailable"),
    }
    match crate::websearch::BraveSearchProvider::from_env(client.clone()) {
        Ok(p) => providers.push(Arc::new(p)),
        Err(e) => warn!(error = %e, "web search adapter unavailable"),
    }
    match crate::news::NewsSearchProvider::from_env(client.clone()) {
        Ok(p) => providers.push(Arc::new(p)),
        Err(e) => warn!(error = %e, "news adapter unavailable"),
    }
    match crate::summarize::FirecrawlSummarizer::from_env(client.clone()) {
        Ok(p) => providers.push(Arc::new(p)),
        Err(e) => warn!(error = %e, "summarize adapter unavailable"),
    }

    providers
}
