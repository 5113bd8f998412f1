//! Fusion of raw provider payloads into canonical `CityRecord`s, plus the
//! two-city comparison over fused score maps.
//!
//! Records are rebuilt from scratch on every request. Fusion never fails:
//! missing slots simply leave their fields empty.

use crate::orchestrator::CityProviderResults;
use relopipe_core::{
    CategoryOutcome, CityRecord, ComparisonResult, RawPayload, Summary, SummaryPayload,
    SummaryTopic,
};
use std::collections::BTreeMap;
use tracing::debug;

/// Provider score vocabulary mapped to canonical camelCase keys. Categories
/// outside the table fall back to a lowercased, space-stripped form so an
/// upstream vocabulary addition degrades to a stable key instead of being
/// dropped.
pub fn canonical_category(name: &str) -> String {
    match name.trim() {
        "Housing" => "housing",
        "Cost of Living" => "costOfLiving",
        "Startups" => "startups",
        "Venture Capital" => "ventureCapital",
        "Travel Connectivity" => "travelConnectivity",
        "Commute" => "commute",
        "Business Freedom" => "businessFreedom",
        "Safety" => "safety",
        "Healthcare" => "healthcare",
        "Education" => "education",
        "Environmental Quality" => "environmentalQuality",
        "Economy" => "economy",
        "Taxation" => "taxation",
        "Internet Access" => "internetAccess",
        "Leisure & Culture" => "leisureCulture",
        "Tolerance" => "tolerance",
        "Outdoors" => "outdoors",
        other => {
            return other
                .chars()
                .filter(|c| !c.is_whitespace())
                .collect::<String>()
                .to_lowercase();
        }
    }
    .to_string()
}

/// First few sentences of a summary, used as scannable highlights.
fn highlights_from(text: &str, max: usize) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        current.push(ch);
        if matches!(ch, '.' | '!' | '?') {
            let s = current.trim().to_string();
            if !s.is_empty() {
                out.push(s);
            }
            current.clear();
            if out.len() == max {
                return out;
            }
        }
    }
    let tail = current.trim();
    if !tail.is_empty() && out.len() < max {
        out.push(tail.to_string());
    }
    out
}

fn summary_from(p: &SummaryPayload) -> Summary {
    Summary {
        text: p.text.clone(),
        highlights: highlights_from(&p.text, 3),
        sources: vec![p.source_url.clone()],
    }
}

/// Fold one city's per-provider results into a canonical record. Failed
/// slots contribute nothing; the record is as sparse as the fetch was.
pub fn fuse_city(results: &CityProviderResults) -> CityRecord {
    let mut record = CityRecord::empty(&results.city);
    for (provider, result) in &results.results {
        let Ok(payload) = result else {
            debug!(city = %results.city, provider = %provider, "slot unavailable, skipping");
            continue;
        };
        match payload {
            RawPayload::Geocode(g) => {
                record.display_name = g.display_name.clone();
                record.neighborhoods = g.neighborhoods.clone();
            }
            RawPayload::Metrics(m) => {
                for c in &m.categories {
                    record.scores.insert(canonical_category(&c.name), c.score);
                }
            }
            RawPayload::WebSearch(ws) => {
                record.web_results = ws.results.clone();
            }
            RawPayload::News(n) => {
                record.news = n.articles.clone();
            }
            RawPayload::Summary(s) => {
                let slot = match s.topic {
                    SummaryTopic::Housing => &mut record.housing,
                    SummaryTopic::Jobs => &mut record.jobs,
                    SummaryTopic::Schools => &mut record.schools,
                    SummaryTopic::Transportation => &mut record.transportation,
                };
                *slot = Some(summary_from(s));
            }
        }
    }
    record
}

/// Head-to-head over the score categories both records carry. Categories
/// known for only one city are skipped rather than scored against an
/// implicit zero. Exact ties score neither city.
pub fn compare(a: &CityRecord, b: &CityRecord) -> ComparisonResult {
    let mut per_category = BTreeMap::new();
    let mut wins_a = 0u32;
    let mut wins_b = 0u32;

    for (category, score_a) in &a.scores {
        let Some(score_b) = b.scores.get(category) else {
            continue;
        };
        let magnitude = ((score_a - score_b).abs() * 10.0).round() / 10.0;
        let winner = if score_a > score_b {
            wins_a += 1;
            a.name.clone()
        } else if score_b > score_a {
            wins_b += 1;
            b.name.clone()
        } else {
            "tie".to_string()
        };
        per_category.insert(category.clone(), CategoryOutcome { winner, magnitude });
    }

    let winner = if wins_a > wins_b {
        a.name.clone()
    } else if wins_b > wins_a {
        b.name.clone()
    } else {
        "tie".to_string()
    };

    ComparisonResult {
        winner,
        per_category,
    }
}

/// Fuse every city and, when exactly two records came out, attach the
/// head-to-head comparison.
pub fn fuse_all(results: &[CityProviderResults]) -> (Vec<CityRecord>, Option<ComparisonResult>) {
    let records: Vec<CityRecord> = results.iter().map(fuse_city).collect();
    let comparison = match records.as_slice() {
        [a, b] => Some(compare(a, b)),
        _ => None,
    };
    (records, comparison)
}
