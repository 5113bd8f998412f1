use relopipe_core::{Error, Result};
use std::time::Duration;

pub mod cache;
pub mod fusion;
pub mod geocode;
pub mod intent;
pub mod memory;
pub mod metrics;
pub mod news;
pub mod orchestrator;
pub mod pipeline;
pub mod rate;
pub mod retry;
pub mod summarize;
pub mod websearch;

/// Shared HTTP client for all provider adapters.
pub fn default_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent("relopipe-local/0.1")
        .redirect(reqwest::redirect::Policy::limited(10))
        // Safety defaults: avoid “hang forever” on DNS/TLS/body stalls.
        // The retry executor still enforces its own per-attempt deadline.
        .connect_timeout(Duration::from_secs(10))
        .timeout(Duration::from_secs(30))
        .build()
        .map_err(|e| Error::Unknown(e.to_string()))
}

pub(crate) fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Read an API key from a `RELOPIPE_`-prefixed var with an unprefixed
/// fallback. Empty/whitespace values behave the same as "unset".
pub(crate) fn api_key_from_env(primary: &str, fallback: &str) -> Option<String> {
    env_nonempty(primary).or_else(|| env_nonempty(fallback))
}

pub(crate) fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

pub(crate) fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(default)
}

fn quota_phrase_in(body: &str) -> bool {
    let lc = body.to_ascii_lowercase();
    lc.contains("quota") || lc.contains("rate limit") || lc.contains("too many requests")
}

fn retry_after_seconds(resp: &reqwest::Response) -> Option<u64> {
    resp.headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
}

/// Map a non-success HTTP response into the shared error vocabulary.
/// Consumes the response: the body is read (bounded) to detect quota
/// phrasing that some providers put behind a 403.
pub(crate) async fn error_for_status(what: &str, resp: reqwest::Response) -> Error {
    let status = resp.status();
    let retry_after = retry_after_seconds(&resp);
    let body: String = resp
        .text()
        .await
        .unwrap_or_default()
        .chars()
        .take(512)
        .collect();

    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        return Error::RateLimited {
            detail: format!("{what} HTTP 429"),
            retry_after_s: retry_after,
        };
    }
    if status == reqwest::StatusCode::NOT_FOUND {
        return Error::NotFound(format!("{what} HTTP 404"));
    }
    if status.is_server_error() {
        return Error::ServerError(format!("{what} HTTP {status}"));
    }
    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        // Some providers report exhausted quotas as 403 with a quota phrase
        // in the body; everything else here is a credential problem.
        if quota_phrase_in(&body) {
            return Error::RateLimited {
                detail: format!("{what} HTTP {status}: {body}"),
                retry_after_s: retry_after,
            };
        }
        return Error::ConfigMissing(format!("{what} rejected credentials (HTTP {status})"));
    }
    Error::Unknown(format!("{what} HTTP {status}"))
}

/// Map a reqwest transport error into the shared error vocabulary.
pub(crate) fn transport_error(what: &str, e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Timeout(format!("{what}: {e}"))
    } else {
        Error::Unknown(format!("{what}: {e}"))
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    pub struct EnvGuard {
        k: &'static str,
        prev: Option<String>,
    }

    impl EnvGuard {
        pub fn set(k: &'static str, v: &str) -> Self {
            let prev = std::env::var(k).ok();
            std::env::set_var(k, v);
            Self { k, prev }
        }

        pub fn unset(k: &'static str) -> Self {
            let prev = std::env::var(k).ok();
            std::env::remove_var(k);
            Self { k, prev }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            if let Some(v) = self.prev.take() {
                std::env::set_var(self.k, v);
            } else {
                std::env::remove_var(self.k);
            }
        }
    }
}
