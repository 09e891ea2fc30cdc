// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::time::Duration;

use futures::Future;
use rand::Rng;
use tonic::{Code, Status};

pub fn status_is_retryable(status: &Status) -> bool {
    matches!(
        status.code(),
        Code::Aborted
            | Code::Cancelled
            | Code::Internal
            | Code::ResourceExhausted
            | Code::Unavailable
            | Code::Unknown
    )
}

///
/// Retry a gRPC client operation using exponential back-off (with jitter) to delay between
/// attempts. Deterministic failures are returned immediately: only errors for which
/// `is_retryable` returns true are retried, up to a bounded number of attempts.
///
pub async fn retry_call<T, E, C, F, G, Fut>(client: C, f: F, is_retryable: G) -> Result<T, E>
where
    C: Clone,
    F: Fn(C, u32) -> Fut,
    G: Fn(&E) -> bool,
    Fut: Future<Output = Result<T, E>>,
{
    const INTERVAL_DURATION: Duration = Duration::from_millis(20);
    const MAX_RETRIES: u32 = 3;
    const MAX_BACKOFF_DURATION: Duration = Duration::from_secs(5);

    let mut num_retries = 0;
    let last_error = loop {
        // Delay before the next send attempt if this is a retry.
        if num_retries > 0 {
            let multiplier = rand::rng().random_range(0..2_u32.pow(num_retries) + 1);
            let sleep_time = INTERVAL_DURATION * multiplier;
            let sleep_time = sleep_time.min(MAX_BACKOFF_DURATION);
            tokio::time::sleep(sleep_time).await;
        }

        let client2 = client.clone();
        match f(client2, num_retries).await {
            Ok(r) => return Ok(r),
            Err(err) => {
                if !is_retryable(&err) {
                    return Err(err);
                }
                if num_retries >= MAX_RETRIES {
                    break err;
                }
            }
        }

        num_retries += 1;
    };

    Err(last_error)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::retry_call;

    #[tokio::test]
    async fn retries_retryable_errors() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let result = retry_call(
            attempts.clone(),
            |attempts, _| async move {
                if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err("transient")
                } else {
                    Ok(42)
                }
            },
            |_| true,
        )
        .await;
        assert_eq!(result, Ok(42));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn does_not_retry_deterministic_errors() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let result: Result<u32, &str> = retry_call(
            attempts.clone(),
            |attempts, _| async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err("deterministic")
            },
            |_| false,
        )
        .await;
        assert_eq!(result, Err("deterministic"));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn gives_up_after_bounded_attempts() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let result: Result<u32, &str> = retry_call(
            attempts.clone(),
            |attempts, _| async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err("transient")
            },
            |_| true,
        )
        .await;
        assert_eq!(result, Err("transient"));
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }
}
