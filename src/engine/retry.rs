//! Backoff for transient failures on request paths.
//!
//! Reads go through here, and so do store writes that are safe to repeat:
//! inserts keyed by position id and terminal writes made under the position
//! lock. Balance movements are not idempotent and are attempted once.

use super::results::EngineError;
use crate::config::RetryConfig;
use std::future::Future;

pub async fn with_retry<T, F, Fut>(policy: &RetryConfig, operation: &str, mut attempt: F) -> Result<T, EngineError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, EngineError>>,
{
    let mut backoff = policy.initial_backoff;
    let mut tries = 1;
    loop {
        match attempt().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && tries < policy.max_attempts => {
                tracing::warn!(operation, attempt = tries, error = %err, "transient failure, retrying");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(policy.max_backoff);
                tries += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
