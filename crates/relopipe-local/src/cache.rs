//! Time-bounded memoization of provider responses.
//!
//! The cache is never a source of truth: internal failures degrade to
//! "always miss". Eviction is lazy — an expired entry is removed on the next
//! lookup, not by a background sweep. Callers always receive clones, never
//! references into the map.

use relopipe_core::ProviderCallKey;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Cache key for a provider call: provider id + SHA-256 over the
/// canonicalized parameter set. Equivalent calls collide regardless of how
/// the parameter object was built.
pub fn cache_key(key: &ProviderCallKey) -> String {
    let mut h = Sha256::new();
    h.update(key.params.as_bytes());
    format!("{}:{}", key.provider, hex::encode(h.finalize()))
}

#[derive(Debug, Clone)]
struct Entry<T> {
    value: T,
    stored_at: Instant,
    ttl: Duration,
}

impl<T> Entry<T> {
    fn expired(&self, now: Instant) -> bool {
        now.duration_since(self.stored_at) >= self.ttl
    }
}

#[derive(Debug)]
struct State<T> {
    entries: BTreeMap<String, Entry<T>>,
    hits: u64,
    misses: u64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CacheStats {
    pub entries: usize,
    pub hit_rate: f64,
}

#[derive(Debug)]
pub struct ResponseCache<T: Clone> {
    default_ttl: Duration,
    state: Mutex<State<T>>,
}

impl<T: Clone> Default for ResponseCache<T> {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

impl<T: Clone> ResponseCache<T> {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            default_ttl,
            state: Mutex::new(State {
                entries: BTreeMap::new(),
                hits: 0,
                misses: 0,
            }),
        }
    }

    pub fn get(&self, key: &str) -> Option<T> {
        self.get_at(key, Instant::now())
    }

    pub(crate) fn get_at(&self, key: &str, now: Instant) -> Option<T> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match state.entries.get(key) {
            Some(entry) if !entry.expired(now) => {
                let value = entry.value.clone();
                state.hits += 1;
                Some(value)
            }
            Some(_) => {
                state.entries.remove(key);
                state.misses += 1;
                None
            }
            None => {
                state.misses += 1;
                None
            }
        }
    }

    pub fn put(&self, key: &str, value: T) {
        self.put_with_ttl(key, value, self.default_ttl)
    }

    pub fn put_with_ttl(&self, key: &str, value: T, ttl: Duration) {
        self.put_with_ttl_at(key, value, ttl, Instant::now())
    }

    pub(crate) fn put_with_ttl_at(&self, key: &str, value: T, ttl: Duration, now: Instant) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.entries.insert(
            key.to_string(),
            Entry {
                value,
                stored_at: now,
                ttl,
            },
        );
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let lookups = state.hits + state.misses;
        CacheStats {
            entries: state.entries.len(),
            hit_rate: if lookups == 0 {
                0.0
            } else {
                state.hits as f64 / lookups as f64
            },
        }
    }
}
