//! Bounded retry for single remote calls.
//!
//! Attempts run back-to-back: pacing towards the control plane is done once
//! per dispatched operation by the applier's rate limiter, not here.
//! Every error counts as retryable; callers that want to treat a failure as
//! success (e.g. an already deleted sub-rule) map it before it reaches
//! [`retry`].

use std::fmt::Display;
use std::future::Future;

use tracing::{error, warn};

use crate::config::RetryConfig;

/// Run `operation` up to `config.max_attempts` times.
///
/// Returns the first success, or the last error once the budget is used up.
/// A budget of zero is treated as a single attempt.
pub async fn retry<F, Fut, T, E>(config: &RetryConfig, operation_name: &str, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if attempt >= max_attempts {
                    error!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                }

                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    "Operation failed, retrying"
                );
            }
        }
    }
}
