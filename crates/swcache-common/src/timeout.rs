//! Timeout utilities.

use std::future::Future;
use std::time::Duration;
use tracing::debug;

use crate::CommonError;

/// Run an operation with a timeout.
pub async fn with_timeout<T, F, Fut>(timeout: Duration, operation: F) -> Result<T, CommonError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = T>,
{
    tokio::time::timeout(timeout, operation()).await.map_err(|_| {
        debug!(?timeout, "Operation timed out");
        CommonError::Timeout(timeout)
    })
}

/// Run an operation, bounding it only when a timeout is given.
pub async fn maybe_with_timeout<T, F, Fut>(
    timeout: Option<Duration>,
    operation: F,
) -> Result<T, CommonError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = T>,
{
    match timeout {
        Some(timeout) => with_timeout(timeout, operation).await,
        None => Ok(operation().await),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    #[tokio::test]
    async fn test_timeout_elapses() {
        let result = with_timeout(Duration::from_millis(10), || async {
            sleep(Duration::from_secs(1)).await;
            42
        })
        .await;

        assert!(matches!(result, Err(CommonError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_timeout_completes() {
        let result = with_timeout(Duration::from_secs(1), || async { 42 }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_no_timeout_runs_to_completion() {
        let result = maybe_with_timeout(None, || async {
            sleep(Duration::from_millis(20)).await;
            "done"
        })
        .await;
        assert_eq!(result.unwrap(), "done");
    }
}
