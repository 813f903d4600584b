// src/store/retry.rs
// Exponential-backoff wrapper for the store's file operations (spec §4.1).
// Errors are partitioned into permanent (re-raised immediately) and transient
// (retried within budget); unrecognized failure shapes are treated as
// transient but logged, matching the teacher's "fail open on the side of a
// retry, but make noise about it" posture in its own retry helpers.

use std::time::Duration;

use crate::error::AppError;

/// Whether `err` should be retried by the backoff wrapper, per spec §4.1:
/// not-found / permission-denied / ownership-mismatch / validation are
/// permanent; busy / locked / i/o / network / timeout are transient.
fn is_retryable(err: &AppError) -> bool {
    match err {
        AppError::NotFound(_) | AppError::Auth(_) | AppError::Input(_) | AppError::Conflict(_) => false,
        AppError::Transient(_) => true,
        // Unrecognized codes default to transient but are logged by the caller.
        _ => true,
    }
}

/// Runs `f`, retrying on transient failures up to `max_attempts` total calls,
/// with a doubling delay starting at `initial_delay`.
pub async fn with_retry<F, Fut, T>(max_attempts: u32, initial_delay: Duration, mut f: F) -> Result<T, AppError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, AppError>>,
{
    let mut delay = initial_delay;
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        match f().await {
            Ok(v) => return Ok(v),
            Err(e) if is_retryable(&e) && attempt < max_attempts => {
                if !matches!(e, AppError::Transient(_)) {
                    tracing::warn!(error = %e, attempt, "unrecognized error class in store retry, treating as transient");
                }
                tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "retrying store operation");
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retries_transient_until_success() {
        let calls = AtomicU32::new(0);
        let result = with_retry(5, Duration::from_millis(1), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(AppError::Transient("busy".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), AppError> = with_retry(5, Duration::from_millis(1), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { Err(AppError::NotFound("gone".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausting_budget_surfaces_last_error() {
        let calls = AtomicU32::new(0);
        let result: Result<(), AppError> = with_retry(3, Duration::from_millis(1), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { Err(AppError::Transient("still busy".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
