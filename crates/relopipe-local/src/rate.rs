//! Client-side rate shaping, one quota bucket per provider.
//!
//! Purely advisory: it reduces wasted calls against providers we already
//! know will reject us, it does not guarantee server-side compliance.

use relopipe_core::ProviderId;
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

const WINDOW: Duration = Duration::from_secs(60);

/// Rolling-window quota for providers without an explicit entry.
const DEFAULT_QUOTA: u32 = 20;

#[derive(Debug)]
struct Bucket {
    count: u32,
    window_start: Instant,
    backoff_until: Option<Instant>,
}

impl Bucket {
    fn new(now: Instant) -> Self {
        Self {
            count: 0,
            window_start: now,
            backoff_until: None,
        }
    }

    fn roll_window(&mut self, now: Instant) {
        if now.duration_since(self.window_start) >= WINDOW {
            self.count = 0;
            self.window_start = now;
        }
    }
}

#[derive(Debug)]
pub struct RateController {
    quotas: BTreeMap<ProviderId, u32>,
    buckets: Mutex<BTreeMap<ProviderId, Bucket>>,
}

impl Default for RateController {
    fn default() -> Self {
        Self::new()
    }
}

impl RateController {
    pub fn new() -> Self {
        let mut quotas = BTreeMap::new();
        quotas.insert(ProviderId::Geocode, 60);
        quotas.insert(ProviderId::Metrics, 30);
        quotas.insert(ProviderId::WebSearch, 50);
        quotas.insert(ProviderId::News, 50);
        quotas.insert(ProviderId::Summarize, 15);
        Self::with_quotas(quotas)
    }

    /// Defaults with per-provider overrides, e.g. `RELOPIPE_QUOTA_WEBSEARCH=10`.
    pub fn from_env() -> Self {
        let mut quotas = Self::new().quotas;
        for provider in ProviderId::ALL {
            let key = format!("RELOPIPE_QUOTA_{}", provider.as_str().to_uppercase());
            if let Some(q) = crate::env_nonempty(&key).and_then(|v| v.parse::<u32>().ok()) {
                quotas.insert(provider, q);
            }
        }
        Self::with_quotas(quotas)
    }

    pub fn with_quotas(quotas: BTreeMap<ProviderId, u32>) -> Self {
        Self {
            quotas,
            buckets: Mutex::new(BTreeMap::new()),
        }
    }

    fn quota(&self, provider: ProviderId) -> u32 {
        self.quotas.get(&provider).copied().unwrap_or(DEFAULT_QUOTA)
    }

    pub fn can_proceed(&self, provider: ProviderId) -> bool {
        self.can_proceed_at(provider, Instant::now())
    }

    pub(crate) fn can_proceed_at(&self, provider: ProviderId, now: Instant) -> bool {
        // Lock poisoning degrades to "no throttling", never to an error.
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        let bucket = buckets.entry(provider).or_insert_with(|| Bucket::new(now));
        if let Some(until) = bucket.backoff_until {
            if now < until {
                return false;
            }
            bucket.backoff_until = None;
        }
        bucket.roll_window(now);
        bucket.count < self.quota(provider)
    }

    pub fn record_call(&self, provider: ProviderId) {
        self.record_call_at(provider, Instant::now())
    }

    pub(crate) fn record_call_at(&self, provider: ProviderId, now: Instant) {
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        let bucket = buckets.entry(provider).or_insert_with(|| Bucket::new(now));
        bucket.roll_window(now);
        bucket.count = bucket.count.saturating_add(1);
    }

    /// Milliseconds until a call could proceed. Zero when it can proceed now.
    pub fn wait_ms(&self, provider: ProviderId) -> u64 {
        self.wait_ms_at(provider, Instant::now())
    }

    pub(crate) fn wait_ms_at(&self, provider: ProviderId, now: Instant) -> u64 {
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        let bucket = buckets.entry(provider).or_insert_with(|| Bucket::new(now));
        bucket.roll_window(now);

        let backoff_ms = bucket
            .backoff_until
            .filter(|until| *until > now)
            .map(|until| until.duration_since(now).as_millis() as u64)
            .unwrap_or(0);

        let window_ms = if bucket.count >= self.quota(provider) {
            let elapsed = now.duration_since(bucket.window_start);
            WINDOW.saturating_sub(elapsed).as_millis() as u64
        } else {
            0
        };

        backoff_ms.max(window_ms)
    }

    /// Called when a provider rejected us with a quota signal (HTTP 429 or a
    /// quota phrase). Subsequent `can_proceed` calls short-circuit without
    /// touching the network until the backoff expires.
    pub fn on_quota_rejected(&self, provider: ProviderId, retry_after_s: u64) {
        self.on_quota_rejected_at(provider, retry_after_s, Instant::now())
    }

    pub(crate) fn on_quota_rejected_at(
        &self,
        provider: ProviderId,
        retry_after_s: u64,
        now: Instant,
    ) {
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        let bucket = buckets.entry(provider).or_insert_with(|| Bucket::new(now));
        bucket.backoff_until = Some(now + Duration::from_secs(retry_after_s));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller_with(provider: ProviderId, quota: u32) -> RateController {
        let mut quotas = BTreeMap::new();
        quotas.insert(provider, quota);
        RateController::with_quotas(quotas)
    }

    #[test]
    fn excess_calls_within_one_window_are_rejected() {
        let rc = controller_with(ProviderId::WebSearch, 3);
        let t0 = Instant::now();
        for _ in 0..3 {
            assert!(rc.can_proceed_at(ProviderId::WebSearch, t0));
            rc.record_call_at(ProviderId::WebSearch, t0);
        }
        assert!(!rc.can_proceed_at(ProviderId::WebSearch, t0));
        assert!(!rc.can_proceed_at(ProviderId::WebSearch, t0 + Duration::from_secs(59)));
    }

    #[test]
    fn window_reset_clears_the_count() {
        let rc = controller_with(ProviderId::News, 1);
        let t0 = Instant::now();
        rc.record_call_at(ProviderId::News, t0);
        assert!(!rc.can_proceed_at(ProviderId::News, t0));
        assert!(rc.can_proceed_at(ProviderId::News, t0 + Duration::from_secs(60)));
    }

    #[test]
    fn wait_ms_is_monotonically_non_increasing_toward_the_boundary() {
        let rc = controller_with(ProviderId::Metrics, 1);
        let t0 = Instant::now();
        rc.record_call_at(ProviderId::Metrics, t0);

        let mut prev = u64::MAX;
        for s in [0u64, 10, 20, 30, 45, 59] {
            let w = rc.wait_ms_at(ProviderId::Metrics, t0 + Duration::from_secs(s));
            assert!(w <= prev, "wait went up at t+{s}s: {w} > {prev}");
            assert!(w > 0);
            prev = w;
        }
        assert_eq!(
            rc.wait_ms_at(ProviderId::Metrics, t0 + Duration::from_secs(60)),
            0
        );
    }

    #[test]
    fn wait_is_zero_while_under_quota() {
        let rc = controller_with(ProviderId::Geocode, 5);
        let t0 = Instant::now();
        rc.record_call_at(ProviderId::Geocode, t0);
        assert_eq!(rc.wait_ms_at(ProviderId::Geocode, t0), 0);
    }

    #[test]
    fn quota_rejection_short_circuits_until_backoff_expires() {
        let rc = controller_with(ProviderId::Summarize, 10);
        let t0 = Instant::now();
        rc.on_quota_rejected_at(ProviderId::Summarize, 30, t0);

        assert!(!rc.can_proceed_at(ProviderId::Summarize, t0));
        assert!(!rc.can_proceed_at(ProviderId::Summarize, t0 + Duration::from_secs(29)));
        let w = rc.wait_ms_at(ProviderId::Summarize, t0 + Duration::from_secs(10));
        assert_eq!(w, 20_000);
        assert!(rc.can_proceed_at(ProviderId::Summarize, t0 + Duration::from_secs(30)));
    }

    #[test]
    fn unknown_provider_gets_the_conservative_default() {
        let rc = RateController::with_quotas(BTreeMap::new());
        let t0 = Instant::now();
        for _ in 0..DEFAULT_QUOTA {
            assert!(rc.can_proceed_at(ProviderId::Geocode, t0));
            rc.record_call_at(ProviderId::Geocode, t0);
        }
        assert!(!rc.can_proceed_at(ProviderId::Geocode, t0));
    }
}
