use crate::config::RetryConfig;
use crate::error::{SyncError, SyncResult};
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Runs a network call under a deadline, retrying transient failures.
///
/// Each attempt waits `retry.delay_for_attempt(n)` first. A missed deadline
/// counts as [`SyncError::Timeout`], which is retryable like any transient
/// error. Non-retryable errors return immediately.
pub(crate) async fn call_with_retry<T, F, Fut>(
    retry: &RetryConfig,
    deadline: Duration,
    what: &'static str,
    call: F,
) -> SyncResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = SyncResult<T>>,
{
    call_counted(retry, retry.max_attempts, deadline, what, call)
        .await
        .0
}

/// Like [`call_with_retry`], making at most `max_calls` calls and
/// returning how many were made.
pub(crate) async fn call_counted<T, F, Fut>(
    retry: &RetryConfig,
    max_calls: u32,
    deadline: Duration,
    what: &'static str,
    mut call: F,
) -> (SyncResult<T>, u32)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = SyncResult<T>>,
{
    let max_calls = max_calls.max(1);
    let mut attempt = 0u32;
    loop {
        let delay = retry.delay_for_attempt(attempt);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let result = match tokio::time::timeout(deadline, call()).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::Timeout),
        };

        match result {
            Err(err) if err.is_retryable() && attempt + 1 < max_calls => {
                attempt += 1;
                debug!(call = what, attempt, error = %err, "retrying network call");
            }
            result => return (result, attempt + 1),
        }
    }
}
