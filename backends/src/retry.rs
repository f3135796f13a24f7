use rand::Rng;
use std::future::Future;
use std::io::ErrorKind;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};
use vaultkeep_core::Error;

/// Exponential backoff settings for operations against flaky storage.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
    /// Adds up to 25% random delay to each backoff.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Settings for network-mounted directories: a handful of attempts, short waits.
    pub fn mount() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
            ..Default::default()
        }
    }

    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    fn backoff_duration(&self, attempt: u32) -> Duration {
        let base_ms = self.initial_backoff.as_millis() as f64
            * self.backoff_multiplier.powi(attempt as i32);
        let capped_ms = base_ms.min(self.max_backoff.as_millis() as f64) as u64;

        let jitter_ms = if self.jitter && capped_ms >= 4 {
            rand::thread_rng().gen_range(0..=capped_ms / 4)
        } else {
            0
        };
        Duration::from_millis(capped_ms + jitter_ms)
    }
}

pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for Error {
    fn is_retryable(&self) -> bool {
        match self {
            // A vanished or forbidden path will not come back by waiting.
            Error::Io(e) => !matches!(
                e.kind(),
                ErrorKind::NotFound
                    | ErrorKind::AlreadyExists
                    | ErrorKind::PermissionDenied
                    | ErrorKind::InvalidInput
                    | ErrorKind::Unsupported
            ),
            Error::Backend(msg) => {
                let msg = msg.to_ascii_lowercase();
                ["timed out", "timeout", "temporarily unavailable", "try again", "stale"]
                    .iter()
                    .any(|needle| msg.contains(needle))
            }
            _ => false,
        }
    }
}

/// Runs `operation` until it succeeds, fails with a non-retryable error, or runs out of
/// attempts. The last error is returned.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + std::fmt::Display,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        let error = match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!(operation = operation_name, attempt = attempt + 1, "succeeded after retry");
                }
                return Ok(value);
            }
            Err(error) => error,
        };

        if !error.is_retryable() {
            debug!(operation = operation_name, error = %error, "not retryable");
            return Err(error);
        }

        attempt += 1;
        if attempt >= max_attempts {
            warn!(
                operation = operation_name,
                max_attempts,
                error = %error,
                "giving up after all retry attempts"
            );
            return Err(error);
        }

        let backoff = config.backoff_duration(attempt - 1);
        warn!(
            operation = operation_name,
            attempt,
            max_attempts,
            backoff_ms = backoff.as_millis() as u64,
            error = %error,
            "operation failed, retrying"
        );
        sleep(backoff).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(20),
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }

    #[tokio::test]
    async fn test_retry_succeeds_eventually() {
        let attempts = Arc::new(AtomicU32::new(0));

        let result = retry_with_backoff(&fast(), "store", || {
            let attempts = attempts.clone();
            async move {
                if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Error::Io(io::Error::new(io::ErrorKind::TimedOut, "mount hiccup")))
                } else {
                    Ok("stored")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "stored");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_gives_up() {
        let attempts = Arc::new(AtomicU32::new(0));

        let result = retry_with_backoff(&fast(), "store", || {
            let attempts = attempts.clone();
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(Error::Backend("connection timed out".to_string()))
            }
        })
        .await;

        assert!(matches!(result, Err(Error::Backend(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_errors_fail_immediately() {
        for error in [
            Error::EmptyKey,
            Error::Io(io::Error::new(io::ErrorKind::NotFound, "gone")),
            Error::Backend("cloud mount path is not configured".to_string()),
        ] {
            let attempts = Arc::new(AtomicU32::new(0));
            let mut error = Some(error);
            let result = retry_with_backoff(&fast(), "delete", || {
                attempts.fetch_add(1, Ordering::SeqCst);
                let error = error.take();
                async move {
                    match error {
                        Some(error) => Err::<(), _>(error),
                        None => Ok(()),
                    }
                }
            })
            .await;

            assert!(result.is_err());
            assert_eq!(attempts.load(Ordering::SeqCst), 1);
        }
    }

    #[test]
    fn test_backoff_duration() {
        let config = RetryConfig {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(1),
            jitter: false,
            ..Default::default()
        };

        assert_eq!(config.backoff_duration(0), Duration::from_millis(100));
        assert_eq!(config.backoff_duration(2), Duration::from_millis(400));
        assert_eq!(config.backoff_duration(8), Duration::from_secs(1));

        let jittered = RetryConfig { jitter: true, ..config };
        let d = jittered.backoff_duration(0);
        assert!(d >= Duration::from_millis(100) && d <= Duration::from_millis(125));
    }
}
