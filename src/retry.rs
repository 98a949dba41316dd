//! Re-runs a transactional step that lost a write race.
//!
//! The retried step opens a fresh transaction and re-reads the rows, so the
//! loser of a race sees the winner's state and fails with the guard error
//! for that state instead of a raw lock error.

use crate::errors::ServiceError;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Configuration for retry behavior
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, the first one included
    pub max_attempts: u32,
    /// Initial delay between attempts
    pub initial_delay: Duration,
    /// Maximum delay between attempts
    pub max_delay: Duration,
    /// Factor to multiply delay by after each attempt
    pub backoff_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 6,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(250),
            backoff_factor: 2.0,
        }
    }
}

/// Runs `operation` until it succeeds, fails with something other than a
/// write conflict, or runs out of attempts.
///
/// Only wrap steps that have not committed anything when they fail with a
/// conflict.
pub async fn with_retry<F, Fut, T>(config: &RetryConfig, mut operation: F) -> Result<T, ServiceError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ServiceError>>,
{
    let mut delay = config.initial_delay;
    let mut attempts = 0;

    loop {
        attempts += 1;

        match operation().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!("Operation succeeded after {} attempts", attempts);
                }
                return Ok(result);
            }
            Err(error) => {
                if attempts >= config.max_attempts || !error.is_write_conflict() {
                    if error.is_write_conflict() {
                        warn!("Write conflict persisted after {} attempts: {}", attempts, error);
                    }
                    return Err(error);
                }

                // Jitter keeps two losers from colliding again in lockstep.
                let jitter_ms = rand::thread_rng().gen_range(0..=delay.as_millis() as u64);
                let wait = delay + Duration::from_millis(jitter_ms);
                debug!(
                    "Attempt {} lost a write race: {}. Retrying in {:?}",
                    attempts, error, wait
                );

                sleep(wait).await;

                delay = Duration::from_secs_f64(
                    (delay.as_secs_f64() * config.backoff_factor).min(config.max_delay.as_secs_f64()),
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::sync::atomic::{AtomicU32, Ordering};
    use uuid::Uuid;

    fn quick() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            backoff_factor: 2.0,
        }
    }

    #[tokio::test]
    async fn conflicts_are_retried_until_the_step_settles() {
        let calls = AtomicU32::new(0);
        let result = with_retry(&quick(), || async {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(ServiceError::ConcurrentModification(Uuid::new_v4()))
            } else {
                Err::<(), _>(ServiceError::InvalidTransition("already picked".into()))
            }
        })
        .await;

        assert_matches!(result, Err(ServiceError::InvalidTransition(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let result = with_retry(&quick(), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(ServiceError::database_error_message("database is locked"))
        })
        .await;

        assert_matches!(result, Err(ServiceError::DatabaseError(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn guard_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result = with_retry(&quick(), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(ServiceError::NotEligible("window closed".into()))
        })
        .await;

        assert_matches!(result, Err(ServiceError::NotEligible(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
