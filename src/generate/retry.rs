use std::future::Future;
use std::time::Duration;

use crate::error::{EntigraphError, Result};

/// Retry budget for generator calls.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub retries: usize,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 2,
            base_delay: Duration::from_millis(200),
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            retries: 0,
            base_delay: Duration::ZERO,
        }
    }
}

/// Longest pause between two attempts.
const MAX_BACKOFF: Duration = Duration::from_secs(60);

fn next_delay(delay: Duration) -> Duration {
    delay.checked_mul(2).unwrap_or(MAX_BACKOFF).min(MAX_BACKOFF)
}

/// Run `op` until it succeeds or the budget is spent. Only generation
/// errors are retried; anything else returns immediately. Backoff doubles
/// after every attempt.
pub async fn with_retry<T, F, Fut>(policy: RetryPolicy, label: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    let mut delay = policy.base_delay;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_generation() && attempt < policy.retries => {
                log::warn!("{}: retry {}/{} after error: {}", label, attempt + 1, policy.retries, e);
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                delay = next_delay(delay);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Await `fut`; past `limit` it is dropped and the call fails with `Timeout`.
pub async fn with_timeout<T, Fut>(limit: Option<Duration>, fut: Fut) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| EntigraphError::Timeout(limit))?,
        None => fut.await,
    }
}
