use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tracing::{error, info, warn};

/// Bounded, fixed-interval connection retry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total connection attempts; values below 1 are treated as 1
    pub max_retries: u32,
    /// Delay between attempts
    pub retry_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            retry_interval: Duration::from_secs(5),
        }
    }
}

/// A successful connection and how many attempts failed before it
#[derive(Debug)]
pub struct Connected<T> {
    pub value: T,
    pub failed_attempts: u32,
}

#[derive(Debug)]
pub enum RetryFailure<E> {
    /// Non-retryable error; returned on first occurrence
    Fatal(E),
    /// Every attempt failed with a retryable error
    Exhausted { attempts: u32, last: E },
}

/// Run `attempt` until it succeeds, fails fatally, or the budget runs out.
///
/// Each retryable failure before the last is logged at warn.
pub async fn connect_with_retry<T, E, F, Fut>(
    component: &str,
    policy: RetryPolicy,
    is_retryable: impl Fn(&E) -> bool,
    mut attempt: F,
) -> Result<Connected<T>, RetryFailure<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let max_attempts = policy.max_retries.max(1);
    let mut failed = 0u32;

    loop {
        match attempt().await {
            Ok(value) => {
                info!(component, failed_attempts = failed, "Successfully connected");
                return Ok(Connected {
                    value,
                    failed_attempts: failed,
                });
            }
            Err(e) if is_retryable(&e) => {
                failed += 1;
                if failed >= max_attempts {
                    error!(component, attempts = failed, error = %e, "Failed to connect after multiple attempts");
                    return Err(RetryFailure::Exhausted {
                        attempts: failed,
                        last: e,
                    });
                }
                warn!(
                    component,
                    attempt = failed,
                    max_attempts,
                    retry_in_secs = policy.retry_interval.as_secs_f64(),
                    error = %e,
                    "Not available, retrying"
                );
                tokio::time::sleep(policy.retry_interval).await;
            }
            Err(e) => {
                error!(component, error = %e, "Connection setup failed");
                return Err(RetryFailure::Fatal(e));
            }
        }
    }
}
