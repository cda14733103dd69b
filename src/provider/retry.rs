//! Uniform retry wrapper for provider operations.
//!
//! Transient errors (see [`ProviderError::is_transient`]) are retried up to
//! [`RetryPolicy::max_retries`] times. The delay before attempt `n` is
//!
//! ```text
//! max(retry_after, base_delay * 2^n) * jitter    jitter ∈ [0.5, 1.0)
//! ```
//!
//! where a server-supplied `Retry-After` is honored only when it falls in
//! `(0s, 300s)`. Non-transient errors surface immediately.

use std::future::Future;
use std::time::Duration;

use rand::Rng as _;
use tracing::debug;

use super::error::ProviderError;

/// The longest server `Retry-After` hint that is honored.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(300);

/// Retry knobs. The defaults match the provider contract.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    /// Retries after the initial attempt.
    pub max_retries: u32,
    /// Base for the exponential delay.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying after `attempt` (0-based) failed with `error`.
    #[must_use]
    pub fn delay_for(&self, attempt: u32, error: &ProviderError) -> Duration {
        let backoff = self.base_delay * 2u32.saturating_pow(attempt.min(16));
        let base = match error.retry_after() {
            Some(hint) if hint > Duration::ZERO && hint < MAX_RETRY_AFTER => backoff.max(hint),
            _ => backoff,
        };
        base.mul_f64(rand::rng().random_range(0.5..1.0))
    }
}

/// Run `f`, retrying transient failures per `policy`.
///
/// # Errors
/// The final error once the retry budget is exhausted, or the first
/// non-transient error.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    op: &str,
    mut f: F,
) -> Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let mut attempt = 0;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < policy.max_retries => {
                let delay = policy.delay_for(attempt, &e);
                debug!("{op} failed (attempt {}): {e}; retrying in {delay:?}", attempt + 1);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
