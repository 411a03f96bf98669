//! Fixed-delay retry helper shared by the consumer's process/commit retries,
//! the sink's batch-insert retries, and the bus client's publish retries.
//! Unlike the exponential-backoff helper this pattern is usually built from,
//! the spec calls for a fixed delay distinct from the watcher's restart
//! delay, so there is no jitter/backoff growth here.

use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::error::{PipelineError, Result};

/// Retry `f` up to `attempts` times with a fixed `delay` between attempts.
/// A cancelled token aborts immediately without spending a retry.
pub async fn retry_fixed<F, Fut, T>(
    attempts: u32,
    delay: Duration,
    cancel: &CancellationToken,
    mut f: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut last_err = None;
    for attempt in 0..attempts.max(1) {
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        match f().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_cancellation() => return Err(e),
            Err(e) => {
                tracing::debug!(attempt, error = %e, "retry_fixed attempt failed");
                last_err = Some(e);
                if attempt + 1 < attempts {
                    tokio::select! {
                        _ = sleep(delay) => {}
                        _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
                    }
                }
            }
        }
    }
    Err(last_err.unwrap_or_else(|| PipelineError::internal("retry_fixed: no attempts made")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn succeeds_on_third_attempt() {
        let counter = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();
        let c = counter.clone();
        let result = retry_fixed(5, Duration::from_millis(1), &cancel, || {
            let c = c.clone();
            async move {
                let n = c.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(PipelineError::timeout("not yet"))
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausts_attempts_and_surfaces_last_error() {
        let cancel = CancellationToken::new();
        let result: Result<()> = retry_fixed(3, Duration::from_millis(1), &cancel, || async {
            Err(PipelineError::timeout("always fails"))
        })
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn cancellation_short_circuits_retries() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result: Result<()> = retry_fixed(5, Duration::from_millis(1), &cancel, || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(PipelineError::timeout("unused"))
            }
        })
        .await;
        assert!(matches!(result, Err(PipelineError::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn validation_errors_are_not_retried_by_caller_convention() {
        // retry_fixed itself retries any Err; callers are expected to only
        // wrap transient calls. This test documents that non-retriable
        // classification lives in PipelineError::is_retriable, not here.
        assert!(!PipelineError::validation("bad").is_retriable());
    }
}
