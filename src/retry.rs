//! Retry with exponential backoff for transient transfer failures.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::config::RetryConfig;
use crate::error::DownloadError;

/// Classifies errors as transient (worth retrying) or permanent
pub trait IsRetryable {
    fn is_retryable(&self) -> bool;
}

impl IsRetryable for DownloadError {
    fn is_retryable(&self) -> bool {
        match self {
            DownloadError::HttpFailed { source, .. } | DownloadError::StreamFailed { source, .. } => {
                source.is_timeout() || source.is_connect() || source.is_request() || source.is_body()
            }
            // Server busy or throttling
            DownloadError::HttpStatus { status, .. } => *status == 429 || *status >= 500,
            // Stalls are re-queued at the back of the admission queue instead
            DownloadError::Stalled { .. } => false,
            DownloadError::FileCreateFailed { .. }
            | DownloadError::FileWriteFailed { .. }
            | DownloadError::FinalizeFailed { .. }
            | DownloadError::Cancelled
            | DownloadError::UnknownEpisode(_)
            | DownloadError::Store(_) => false,
        }
    }
}

/// Run `operation` until it succeeds, fails permanently, or runs out of attempts.
///
/// `on_retry` is called with the attempt number and error before each backoff.
/// Backoff sleeps end early with `DownloadError::Cancelled` when `cancel` fires.
pub async fn download_with_retry<F, Fut, T, R>(
    config: &RetryConfig,
    cancel: &CancellationToken,
    mut on_retry: R,
    mut operation: F,
) -> Result<T, DownloadError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, DownloadError>>,
    R: FnMut(u32, &DownloadError),
{
    let mut attempt = 0;
    let mut delay = config.initial_delay;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    tracing::info!(attempts = attempt + 1, "Transfer succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if e.is_retryable() && attempt < config.max_attempts => {
                attempt += 1;

                tracing::warn!(
                    error = %e,
                    attempt,
                    max_attempts = config.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "Transfer failed, retrying"
                );
                on_retry(attempt, &e);

                let wait = if config.jitter { add_jitter(delay) } else { delay };
                tokio::select! {
                    _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
                    _ = tokio::time::sleep(wait) => {}
                }

                delay = next_delay(delay, config);
            }
            Err(e) => {
                if e.is_retryable() {
                    tracing::error!(
                        error = %e,
                        attempts = attempt + 1,
                        "Transfer failed after all retry attempts exhausted"
                    );
                }
                return Err(e);
            }
        }
    }
}

fn next_delay(delay: Duration, config: &RetryConfig) -> Duration {
    Duration::from_secs_f64(delay.as_secs_f64() * config.backoff_multiplier).min(config.max_delay)
}

/// Up to 25% extra delay so parallel workers don't retry in lockstep
fn add_jitter(delay: Duration) -> Duration {
    let jitter = rand::thread_rng().gen_range(0.0..=0.25);
    delay.mul_f64(1.0 + jitter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_config(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(40),
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }

    fn busy() -> DownloadError {
        DownloadError::HttpStatus {
            url: "https://example.com/ep.mp3".to_string(),
            status: 503,
        }
    }

    #[test]
    fn classifies_statuses() {
        assert!(busy().is_retryable());
        assert!(
            DownloadError::HttpStatus {
                url: String::new(),
                status: 429
            }
            .is_retryable()
        );
        assert!(
            !DownloadError::HttpStatus {
                url: String::new(),
                status: 404
            }
            .is_retryable()
        );
        assert!(!DownloadError::Cancelled.is_retryable());
    }

    #[test]
    fn backoff_grows_and_caps() {
        let config = fast_config(5);
        let d1 = next_delay(config.initial_delay, &config);
        let d2 = next_delay(d1, &config);
        let d3 = next_delay(d2, &config);
        assert_eq!(d1, Duration::from_millis(20));
        assert_eq!(d2, Duration::from_millis(40));
        assert_eq!(d3, Duration::from_millis(40));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let base = Duration::from_millis(100);
        for _ in 0..50 {
            let d = add_jitter(base);
            assert!(d >= base && d <= Duration::from_millis(125));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_errors_then_succeeds() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut retries = Vec::new();

        let result = download_with_retry(
            &fast_config(3),
            &CancellationToken::new(),
            |attempt, _| retries.push(attempt),
            || {
                let calls = calls.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(busy())
                    } else {
                        Ok(42)
                    }
                }
            },
        )
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(retries, vec![1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));

        let result: Result<(), _> = download_with_retry(
            &fast_config(2),
            &CancellationToken::new(),
            |_, _| {},
            || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(busy())
                }
            },
        )
        .await;

        assert!(matches!(result, Err(DownloadError::HttpStatus { status: 503, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));

        let result: Result<(), _> = download_with_retry(
            &fast_config(5),
            &CancellationToken::new(),
            |_, _| {},
            || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(DownloadError::HttpStatus {
                        url: String::new(),
                        status: 404,
                    })
                }
            },
        )
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellation_interrupts_backoff() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let config = RetryConfig {
            initial_delay: Duration::from_secs(3600),
            ..fast_config(3)
        };
        let result: Result<(), _> =
            download_with_retry(&config, &cancel, |_, _| {}, || async { Err(busy()) }).await;

        assert!(matches!(result, Err(DownloadError::Cancelled)));
    }
}
