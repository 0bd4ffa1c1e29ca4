//! Bounded retry with a per-attempt timeout for collaborator calls.

use crate::error::{MixerError, Result};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub attempts: u32,
    /// Pause between attempts
    #[serde(with = "crate::util::time::serde_millis")]
    pub backoff: Duration,
    /// Upper bound on a single attempt
    #[serde(with = "crate::util::time::serde_millis")]
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(200),
            timeout: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Single attempt, still bounded by the timeout.
    pub fn once(timeout: Duration) -> Self {
        Self {
            attempts: 1,
            backoff: Duration::ZERO,
            timeout,
        }
    }
}

/// Await one collaborator call, failing with [`MixerError::Timeout`] after `limit`.
///
/// The call future is dropped on timeout, so callers only wrap calls whose
/// cancellation leaves their own state untouched.
pub async fn bounded<T, Fut>(limit: Duration, label: &str, call: Fut) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    match timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(MixerError::Timeout(label.to_string())),
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or attempts run out.
///
/// No timeout is put around an attempt. Use this for operations that bound
/// their own collaborator calls and roll back when one of them times out.
pub async fn retry<F, Fut, T>(policy: &RetryPolicy, label: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = policy.attempts.max(1);
    let mut last_err = None;
    for attempt in 1..=attempts {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < attempts => {
                warn!("{} attempt {}/{} failed: {}", label, attempt, attempts, err);
                last_err = Some(err);
                sleep(policy.backoff).await;
            }
            Err(err) => return Err(err),
        }
    }
    Err(last_err.unwrap_or_else(|| MixerError::Timeout(label.to_string())))
}

/// [`retry`] with every attempt bounded by `policy.timeout`.
///
/// An attempt exceeding the timeout counts as [`MixerError::Timeout`].
pub async fn with_retry<F, Fut, T>(policy: &RetryPolicy, label: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    retry(policy, label, || bounded(policy.timeout, label, op())).await
}
