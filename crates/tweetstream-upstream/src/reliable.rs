use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tracing::warn;

use tweetstream_core::{Credential, FilterParams, StreamSource, UpstreamError, UpstreamStream};

/// Retry policy for opening the upstream stream.
///
/// Only the open call is retried. Once a stream has been handed out, a
/// failure ends the session.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Additional attempts after the first. Zero disables retrying.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter_factor: 0.2,
        }
    }
}

/// Wraps a [`StreamSource`] with bounded retry and exponential backoff.
///
/// - Fatal errors (bad credential, rejected request) are returned at once.
/// - Rate-limit responses honor the upstream's suggested delay.
pub struct RetryingSource<S: StreamSource> {
    inner: S,
    config: RetryConfig,
    total_retries: AtomicU64,
}

impl<S: StreamSource> RetryingSource<S> {
    pub fn new(inner: S, config: RetryConfig) -> Self {
        Self {
            inner,
            config,
            total_retries: AtomicU64::new(0),
        }
    }

    pub fn total_retries(&self) -> u64 {
        self.total_retries.load(Ordering::Relaxed)
    }

    fn retry_delay(&self, attempt: u32, suggested: Option<Duration>) -> Duration {
        if let Some(delay) = suggested {
            return delay;
        }

        // base * 2^attempt, capped, then +/- jitter
        let exp_delay = self.config.base_delay.as_millis() as f64 * 2.0_f64.powi(attempt as i32);
        let capped = exp_delay.min(self.config.max_delay.as_millis() as f64);
        let jitter_range = capped * self.config.jitter_factor;
        let jitter = if jitter_range > 0.0 {
            rand::thread_rng().gen_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };

        Duration::from_millis((capped + jitter).max(0.0) as u64)
    }
}

#[async_trait]
impl<S: StreamSource> StreamSource for RetryingSource<S> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn open(
        &self,
        credential: &Credential,
        filter: &FilterParams,
    ) -> Result<UpstreamStream, UpstreamError> {
        let mut attempt = 0;
        loop {
            match self.inner.open(credential, filter).await {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    if e.is_fatal() || !e.is_retryable() || attempt >= self.config.max_retries {
                        return Err(e);
                    }

                    let delay = self.retry_delay(attempt, e.suggested_delay());
                    self.total_retries.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        attempt = attempt + 1,
                        max_retries = self.config.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying upstream open"
                    );

                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
