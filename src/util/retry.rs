//! Transport retry with exponential backoff and jitter.

use std::future::Future;
use std::time::Duration;

use crate::error::StewardError;

/// Retry policy for model-service requests.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first).
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Execute an async operation, retrying transport-class failures.
    pub async fn execute<F, Fut, T>(&self, operation: F) -> Result<T, StewardError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StewardError>>,
    {
        self.execute_notify(operation, |_, _, _| {}).await
    }

    /// Like [`execute`](Self::execute), calling `on_retry(attempt, error, delay)`
    /// before each backoff sleep.
    pub async fn execute_notify<F, Fut, T, N>(
        &self,
        mut operation: F,
        mut on_retry: N,
    ) -> Result<T, StewardError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StewardError>>,
        N: FnMut(u32, &StewardError, Duration),
    {
        let mut backoff = self.initial_backoff;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let err = match operation().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            if !err.is_retryable() || attempt >= self.max_attempts {
                return Err(err);
            }

            let delay = match &err {
                StewardError::RateLimited {
                    retry_after_ms: Some(ms),
                } => Duration::from_millis(*ms).min(self.max_backoff),
                _ => Duration::from_secs_f64(backoff.as_secs_f64() * (0.75 + jitter() * 0.5)),
            };
            tracing::warn!(
                attempt,
                max_attempts = self.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "retrying model request"
            );
            on_retry(attempt, &err, delay);
            tokio::time::sleep(delay).await;

            backoff = Duration::from_secs_f64(
                (backoff.as_secs_f64() * self.multiplier).min(self.max_backoff.as_secs_f64()),
            );
        }
    }
}

/// Pseudo-random factor in [0, 1).
fn jitter() -> f64 {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let mut hasher = DefaultHasher::new();
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
        .hash(&mut hasher);
    std::thread::current().id().hash(&mut hasher);
    (hasher.finish() % 10_000) as f64 / 10_000.0
}
