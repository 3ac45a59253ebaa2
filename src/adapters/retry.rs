//! Exponential backoff retry for adapter calls.
//!
//! [`RetryingAdapter`] is a decorator: it implements [`PlatformAdapter`] by
//! delegating to an inner adapter and retrying failures that
//! [`AdapterError::is_transient`] marks as worth another attempt.
//!
//! # Retry Strategy
//!
//! - Only transient errors (request failures, timeouts, 5xx) are retried
//! - `RateLimited` is returned immediately so the scheduler can back off the source
//! - Delay doubles from `base_delay`, capped at `max_delay`
//! - Random jitter (0-250ms) is added to every delay

use std::fmt;
use std::future::Future;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::{Rng, rng};
use tokio::time::sleep;
use tracing::{error, instrument, warn};

use super::PlatformAdapter;
use crate::error::AdapterError;
use crate::models::{NormalizedItem, Platform, Source};

/// Wrapper that adds exponential backoff retry logic to any [`PlatformAdapter`].
///
/// The delay between retries follows:
/// ```text
/// delay = min(base_delay * 2^(attempt-1), max_delay) + random_jitter(0..250ms)
/// ```
pub struct RetryingAdapter<T> {
    inner: T,
    /// Retries after the first attempt.
    max_retries: usize,
    base_delay: Duration,
    max_delay: Duration,
}

impl<T> RetryingAdapter<T>
where
    T: PlatformAdapter,
{
    pub fn new(inner: T, max_retries: usize, base_delay: Duration) -> Self {
        Self {
            inner,
            max_retries,
            base_delay,
            max_delay: Duration::from_secs(10),
        }
    }

    /// Two retries starting at 500ms.
    pub fn with_defaults(inner: T) -> Self {
        Self::new(inner, 2, Duration::from_millis(500))
    }

    fn delay_for(&self, attempt: usize) -> Duration {
        let shift = (attempt.saturating_sub(1)).min(16) as u32;
        let delay = self.base_delay.saturating_mul(1 << shift).min(self.max_delay);
        let jitter_ms: u64 = rng().random_range(0..=250);
        delay + Duration::from_millis(jitter_ms)
    }

    async fn run<F, Fut>(&self, op: &'static str, mut call: F) -> Result<Vec<NormalizedItem>, AdapterError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Vec<NormalizedItem>, AdapterError>>,
    {
        let total_t0 = Instant::now();
        let mut attempt = 0usize;

        loop {
            let attempt_t0 = Instant::now();
            match call().await {
                Ok(items) => return Ok(items),
                Err(e) if !e.is_transient() => return Err(e),
                Err(e) => {
                    attempt += 1;
                    let attempt_dt = attempt_t0.elapsed();
                    let total_dt = total_t0.elapsed();

                    if attempt > self.max_retries {
                        error!(
                            op,
                            platform = %self.inner.platform(),
                            attempt,
                            max = self.max_retries,
                            elapsed_ms_total = total_dt.as_millis() as u64,
                            error = %e,
                            "Adapter call exhausted retries"
                        );
                        return Err(e);
                    }

                    let delay = self.delay_for(attempt);
                    warn!(
                        op,
                        platform = %self.inner.platform(),
                        attempt,
                        max = self.max_retries,
                        elapsed_ms_attempt = attempt_dt.as_millis() as u64,
                        ?delay,
                        error = %e,
                        "Adapter call failed; backing off"
                    );
                    sleep(delay).await;
                }
            }
        }
    }
}

impl<T> fmt::Debug for RetryingAdapter<T>
where
    T: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryingAdapter")
            .field("inner", &self.inner)
            .field("max_retries", &self.max_retries)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .finish()
    }
}

#[async_trait]
impl<T> PlatformAdapter for RetryingAdapter<T>
where
    T: PlatformAdapter,
{
    fn platform(&self) -> Platform {
        self.inner.platform()
    }

    #[instrument(level = "info", skip_all, fields(platform = %self.inner.platform(), handle = %source.handle))]
    async fn fetch(&self, source: &Source, limit: usize) -> Result<Vec<NormalizedItem>, AdapterError> {
        self.run("fetch", || self.inner.fetch(source, limit)).await
    }

    #[instrument(level = "info", skip_all, fields(platform = %self.inner.platform(), %term))]
    async fn search(&self, term: &str, limit: usize) -> Result<Vec<NormalizedItem>, AdapterError> {
        self.run("search", || self.inner.search(term, limit)).await
    }
}
