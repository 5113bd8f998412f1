//! Rule-based intent/preference extraction.
//!
//! Keyword and regex matching over the raw query. Deliberately behind the
//! `IntentExtractor` trait: an LLM-backed extractor can replace this without
//! the orchestrator or fusion noticing.

use regex_lite::Regex;
use relopipe_core::{
    BudgetRange, Error, IntentExtractor, IntentKind, PreferenceSet, Result, StructuredRequest,
};

const STOPWORDS: &[&str] = &[
    "I", "A", "An", "The", "What", "Where", "Which", "How", "Is", "Are", "Should", "Tell", "My",
    "Can", "Does", "Do", "Will", "When", "Why", "Me", "About", "And", "Or", "Best", "Good",
    "Compare", "Moving", "Looking", "Homes", "Apartments", "Under",
];

const HOUSING_TYPES: &[&str] = &["apartment", "condo", "house", "townhouse", "studio", "duplex"];
const JOB_INDUSTRIES: &[&str] = &[
    "tech",
    "software",
    "finance",
    "healthcare",
    "education",
    "energy",
    "biotech",
];
const TRANSPORT_MODES: &[&str] = &["bike", "walk", "transit", "bus", "train", "car"];
const LIFESTYLE_TAGS: &[&str] = &[
    "nightlife", "outdoors", "arts", "music", "food", "quiet", "family",
];
const CLIMATE_TAGS: &[&str] = &[
    "warm", "sunny", "mild", "cold", "snowy", "dry", "humid", "rainy",
];

pub struct RuleBasedExtractor {
    vs_re: Regex,
    from_to_re: Regex,
    prep_re: Regex,
    cap_run_re: Regex,
    money_re: Regex,
}

impl Default for RuleBasedExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl RuleBasedExtractor {
    pub fn new() -> Self {
        // City names are matched as capitalized runs; lowercase-only queries
        // fall back to explicit hints.
        let name = r"[A-Z][a-zA-Z]+(?: [A-Z][a-zA-Z]+)*";
        Self {
            vs_re: Regex::new(&format!(r"({name})\s+(?i:vs\.?|versus)\s+({name})")).unwrap(),
            from_to_re: Regex::new(&format!(r"(?i:from)\s+({name})\s+(?i:to)\s+({name})")).unwrap(),
            prep_re: Regex::new(&format!(r"(?i:in|to|near|about)\s+({name})")).unwrap(),
            cap_run_re: Regex::new(&format!(r"({name})")).unwrap(),
            money_re: Regex::new(r"\$\s*([0-9][0-9,]*)\s*([kK])?").unwrap(),
        }
    }

    /// Drop question-word noise a greedy capitalized-run capture may have
    /// glued on at either end ("Compare Austin" -> "Austin",
    /// "Denver What" -> "Denver").
    fn trim_name(name: &str) -> String {
        let mut words: Vec<&str> = name.split(' ').collect();
        while matches!(words.first(), Some(w) if STOPWORDS.contains(w)) {
            words.remove(0);
        }
        while matches!(words.last(), Some(w) if STOPWORDS.contains(w)) {
            words.pop();
        }
        words.join(" ")
    }

    fn cities_from(&self, query: &str, hints: &[String]) -> Vec<String> {
        if !hints.is_empty() {
            return hints.to_vec();
        }

        for re in [&self.vs_re, &self.from_to_re] {
            if let Some(c) = re.captures(query) {
                let a = Self::trim_name(&c[1]);
                let b = Self::trim_name(&c[2]);
                if !a.is_empty() && !b.is_empty() {
                    return vec![a, b];
                }
            }
        }

        if let Some(c) = self.prep_re.captures(query) {
            let name = Self::trim_name(&c[1]);
            if !name.is_empty() {
                return vec![name];
            }
        }

        // Last resort: capitalized runs that survive stopword trimming.
        let mut out = Vec::new();
        for c in self.cap_run_re.captures_iter(query) {
            let name = Self::trim_name(&c[1]);
            if name.is_empty() || STOPWORDS.contains(&name.as_str()) {
                continue;
            }
            out.push(name);
            if out.len() == 2 {
                break;
            }
        }
        out
    }

    fn classify(lc: &str, city_count: usize) -> IntentKind {
        let has = |needle: &str| lc.contains(needle);

        if has("compare") || has(" vs ") || has(" vs. ") || has("versus") || city_count == 2 {
            return IntentKind::CityComparison;
        }
        if has("neighborhood") || has("neighbourhood") || has("where to live") || has("area to live")
        {
            return IntentKind::NeighborhoodRecommendation;
        }
        if has("cost of living") || has("affordab") || has("expensive") || has("cheap") {
            return IntentKind::CostOfLiving;
        }
        if has("housing market")
            || has("home price")
            || has("house price")
            || has("real estate")
            || has("rent price")
            || has("buy a home")
            || has("buy a house")
        {
            return IntentKind::HousingMarket;
        }
        if has("job") || has("employment") || has("career") || has("salary") || has("hiring") {
            return IntentKind::JobOpportunities;
        }
        if has("school") {
            return IntentKind::SchoolDistricts;
        }
        if has("commute")
            || has("transit")
            || has("public transport")
            || has("transportation")
            || has("traffic")
        {
            return IntentKind::Transportation;
        }
        if has("nightlife") || has("lifestyle") || has("culture") || has("vibe") || has("weather")
            || has("climate")
        {
            return IntentKind::LifestyleMatch;
        }
        if has("movers") || has("moving company") || has("checklist") || has("utilities")
            || has("logistic") || has("lease")
        {
            return IntentKind::RelocationLogistics;
        }
        if has("tell me about") || has("what is it like") || has("living in") {
            return IntentKind::CityInfo;
        }
        if has("advice") || has("should i move") || has("worth moving") || has("recommend") {
            return IntentKind::GeneralAdvice;
        }
        if city_count > 0 {
            IntentKind::CityInfo
        } else {
            IntentKind::Other
        }
    }

    fn budget_from(&self, query: &str) -> Option<BudgetRange> {
        let mut amounts: Vec<u64> = Vec::new();
        for c in self.money_re.captures_iter(query) {
            let digits: String = c[1].chars().filter(|ch| ch.is_ascii_digit()).collect();
            let Ok(mut n) = digits.parse::<u64>() else {
                continue;
            };
            if c.get(2).is_some() {
                n = n.saturating_mul(1_000);
            }
            amounts.push(n);
        }
        match amounts.len() {
            0 => None,
            1 => Some(BudgetRange {
                min: None,
                max: Some(amounts[0]),
                currency: "USD".to_string(),
            }),
            _ => {
                let lo = amounts.iter().copied().min().unwrap_or(0);
                let hi = amounts.iter().copied().max().unwrap_or(0);
                Some(BudgetRange {
                    min: Some(lo),
                    max: Some(hi),
                    currency: "USD".to_string(),
                })
            }
        }
    }

    fn preferences_from(&self, query: &str) -> PreferenceSet {
        let lc = query.to_lowercase();
        let tokens: Vec<&str> = lc
            .split(|ch: char| !ch.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .collect();
        let has_token = |t: &str| tokens.contains(&t);
        let collect_tags = |tags: &[&str]| -> Vec<String> {
            tags.iter()
                .filter(|t| has_token(t))
                .map(|t| t.to_string())
                .collect()
        };

        PreferenceSet {
            budget: self.budget_from(query),
            housing_types: collect_tags(HOUSING_TYPES),
            school_quality: if has_token("school") || has_token("schools") {
                Some(true)
            } else {
                None
            },
            safety_priority: if has_token("safe") || has_token("safety") || has_token("crime") {
                Some(true)
            } else {
                None
            },
            job_industries: collect_tags(JOB_INDUSTRIES),
            transport_modes: collect_tags(TRANSPORT_MODES),
            lifestyle: collect_tags(LIFESTYLE_TAGS),
            climate: collect_tags(CLIMATE_TAGS),
        }
    }
}

impl IntentExtractor for RuleBasedExtractor {
    fn extract(&self, raw_query: &str, city_hints: &[String]) -> Result<StructuredRequest> {
        let query = raw_query.trim();
        if query.is_empty() {
            return Err(Error::EmptyQuery);
        }

        let cities = self.cities_from(query, city_hints);
        let intent = Self::classify(&query.to_lowercase(), cities.len().min(2));
        let preferences = self.preferences_from(query);

        Ok(StructuredRequest::new(
            intent,
            cities,
            preferences,
            query.to_string(),
        ))
    }
}
