//! Bounded retries with exponential backoff around a single provider call.
//!
//! Every terminal outcome is a `Result` value; nothing panics or propagates
//! past this boundary.

use relopipe_core::{Error, Result, RetryPolicy};
use std::future::Future;
use tracing::{debug, warn};

/// Run `op` under `policy`: a hard per-attempt deadline, then up to
/// `max_retries` further attempts with `min(max_delay, base * 2^(n-1))`
/// sleeps in between. Non-retryable failures short-circuit immediately.
pub async fn execute<T, F, Fut>(what: &str, policy: &RetryPolicy, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = policy.max_retries.saturating_add(1);
    let mut last_err = Error::Unknown(format!("{what}: no attempt ran"));

    for attempt in 1..=attempts {
        if attempt > 1 {
            let delay = policy.delay_before_retry(attempt - 1);
            debug!(what, attempt, delay_ms = delay.as_millis() as u64, "retrying");
            tokio::time::sleep(delay).await;
        }

        match tokio::time::timeout(policy.timeout(), op()).await {
            Ok(Ok(v)) => return Ok(v),
            Ok(Err(e)) => {
                if !e.is_retryable() {
                    return Err(e);
                }
                warn!(what, attempt, error = %e, "attempt failed");
                last_err = e;
            }
            Err(_) => {
                // The underlying call may still be running; we stop waiting.
                warn!(what, attempt, timeout_ms = policy.timeout_ms, "attempt timed out");
                last_err = Error::Timeout(format!(
                    "{what}: attempt {attempt} exceeded {}ms",
                    policy.timeout_ms
                ));
            }
        }
    }

    Err(last_err)
}
