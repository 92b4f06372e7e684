//! Per-call timeout and bounded exponential backoff.
//!
//! Every external capability call (`embed`, `generate`, `judge`) goes
//! through [`with_retry`]. A timeout is reported as
//! [`CapabilityError::Timeout`] and is transient, so it is retried under the
//! same budget as rate limits and server errors.
//!
//! Backoff doubles from `base_delay` and is capped at `2^5 × base_delay`
//! (1s, 2s, 4s, ... 32s with the default base).

use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::error::CapabilityError;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Deadline for a single attempt.
    pub timeout: Duration,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, timeout_secs: u64) -> Self {
        Self {
            max_retries,
            timeout: Duration::from_secs(timeout_secs),
            base_delay: Duration::from_secs(1),
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base_delay * (1u32 << (attempt.saturating_sub(1)).min(5))
    }
}

/// Run `op` until it succeeds, fails permanently, or the budget runs out.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    capability: &'static str,
    mut op: F,
) -> Result<T, CapabilityError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, CapabilityError>>,
{
    let mut attempt = 0u32;
    loop {
        if attempt > 0 {
            tokio::time::sleep(policy.delay(attempt)).await;
        }

        let result = match tokio::time::timeout(policy.timeout, op()).await {
            Ok(r) => r,
            Err(_) => Err(CapabilityError::Timeout {
                capability,
                timeout_secs: policy.timeout.as_secs(),
            }),
        };

        match result {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() && attempt < policy.max_retries => {
                attempt += 1;
                warn!(capability, attempt, error = %e, "transient failure, retrying");
            }
            Err(e) => return Err(e),
        }
    }
}
