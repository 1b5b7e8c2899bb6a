//! Exponential-backoff retry for fallible async operations.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Errors that may carry an HTTP status code from an upstream service.
pub trait HttpStatus {
    fn http_status(&self) -> Option<u16>;
}

/// Default classification: retry on 429 and 5xx, never on other 4xx,
/// and retry anything without a status (network failures, bad replies).
pub fn is_retryable_status(status: Option<u16>) -> bool {
    match status {
        Some(429) => true,
        Some(code) if (500..600).contains(&code) => true,
        Some(code) if (400..500).contains(&code) => false,
        Some(_) => true,
        None => true,
    }
}

pub type RetryPredicate<E> = Arc<dyn Fn(&E) -> bool + Send + Sync>;

pub struct RetryOptions<E> {
    /// Total invocations including the first. Values below 1 are treated as 1.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    pub retry_if: RetryPredicate<E>,
}

impl<E> Clone for RetryOptions<E> {
    fn clone(&self) -> Self {
        Self {
            max_attempts: self.max_attempts,
            initial_delay: self.initial_delay,
            max_delay: self.max_delay,
            backoff_multiplier: self.backoff_multiplier,
            retry_if: Arc::clone(&self.retry_if),
        }
    }
}

impl<E: HttpStatus + 'static> Default for RetryOptions<E> {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(10_000),
            backoff_multiplier: 2.0,
            retry_if: Arc::new(|e: &E| is_retryable_status(e.http_status())),
        }
    }
}

impl<E> RetryOptions<E> {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_delays(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_delay = initial;
        self.max_delay = max;
        self
    }

    pub fn with_predicate(mut self, retry_if: impl Fn(&E) -> bool + Send + Sync + 'static) -> Self {
        self.retry_if = Arc::new(retry_if);
        self
    }

    /// Delay before the attempt following `attempt` (1-based):
    /// `min(initial * multiplier^(attempt-1), max)`.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let scaled = self.initial_delay.as_nanos() as f64 * self.backoff_multiplier.powi(exponent);
        let capped = scaled.min(self.max_delay.as_nanos() as f64);
        if capped.is_finite() && capped > 0.0 {
            Duration::from_nanos(capped.round() as u64)
        } else {
            Duration::ZERO
        }
    }
}

/// Run `operation` until it succeeds, the predicate rejects its error, or
/// `max_attempts` invocations have been made. Attempts never overlap. The
/// last error is returned unchanged.
pub async fn with_retry<T, E, F, Fut>(options: &RetryOptions<E>, mut operation: F) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let max_attempts = options.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) => {
                if attempt >= max_attempts || !(options.retry_if)(&e) {
                    return Err(e);
                }

                let delay = options.delay_after(attempt);
                tracing::debug!(
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Retrying after failure"
                );
                metrics::counter!("inference_retries_total").increment(1);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
