//! Bounded retry over retryable client errors.

use std::future::Future;

use crate::error::ClientError;

/// Run `attempt` up to `max_attempts` times, stopping early on success or on
/// a non-retryable error. The closure receives the 1-based attempt number so
/// callers can rotate resources between attempts. The last error surfaces
/// when every attempt fails.
pub async fn with_retries<T, F, Fut>(max_attempts: u32, mut attempt: F) -> Result<T, ClientError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, ClientError>>,
{
    let max_attempts = max_attempts.max(1);
    let mut tries = 0;
    loop {
        tries += 1;
        match attempt(tries).await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && tries < max_attempts => {
                tracing::warn!(attempt = tries, error = %err, "attempt failed, retrying");
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[tokio::test]
    async fn retries_transport_errors_up_to_the_budget() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, _> = with_retries(3, |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 3 {
                    Err(ClientError::Transport("reset".to_string()))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;
        assert_eq!(result.expect("third attempt succeeds"), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn surfaces_the_last_error_after_exhaustion() {
        let result: Result<(), _> = with_retries(3, |attempt| async move {
            Err(ClientError::Transport(format!("attempt {attempt}")))
        })
        .await;
        match result {
            Err(ClientError::Transport(message)) => assert_eq!(message, "attempt 3"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn does_not_retry_server_errors() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retries(3, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ClientError::Server("nope".to_string())) }
        })
        .await;
        assert!(matches!(result, Err(ClientError::Server(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
