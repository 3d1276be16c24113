//! Retry with exponential backoff.
//!
//! The delay before retry `n` (1-based) is `initial × multiplier^(n-1)`,
//! clamped to `max_delay`. A per-attempt timeout, when set, races each
//! attempt against a timer and turns expiry into a retryable
//! [`UpstreamError::Timeout`].

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use flowcast_core::settings::RetrySettings;
use flowcast_core::UpstreamError;
use tracing::{debug, warn};

/// Decides whether an error is worth another attempt.
pub type RetryPredicate = Arc<dyn Fn(&UpstreamError) -> bool + Send + Sync>;

/// Observes `(error, failed_attempt, delay_before_next_attempt)` before each
/// backoff sleep. Diagnostics only; it cannot influence the retry loop.
pub type RetryObserver = Arc<dyn Fn(&UpstreamError, u32, Duration) + Send + Sync>;

#[derive(Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    pub timeout: Option<Duration>,
    /// `None` retries every error.
    pub should_retry: Option<RetryPredicate>,
    pub on_retry: Option<RetryObserver>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            timeout: None,
            should_retry: None,
            on_retry: None,
        }
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_retries", &self.max_retries)
            .field("initial_delay", &self.initial_delay)
            .field("max_delay", &self.max_delay)
            .field("backoff_multiplier", &self.backoff_multiplier)
            .field("timeout", &self.timeout)
            .field("should_retry", &self.should_retry.is_some())
            .field("on_retry", &self.on_retry.is_some())
            .finish()
    }
}

impl RetryPolicy {
    /// Policy for upstream calls: settings values plus a predicate that
    /// skips retries for permanent failures (4xx other than 429).
    pub fn from_settings(settings: &RetrySettings) -> Self {
        Self {
            max_retries: settings.max_retries,
            initial_delay: Duration::from_millis(settings.initial_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms),
            backoff_multiplier: settings.backoff_multiplier,
            timeout: settings.timeout_ms.map(Duration::from_millis),
            should_retry: Some(Arc::new(UpstreamError::is_retryable)),
            on_retry: None,
        }
    }

    pub fn with_should_retry<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&UpstreamError) -> bool + Send + Sync + 'static,
    {
        self.should_retry = Some(Arc::new(predicate));
        self
    }

    pub fn with_on_retry<F>(mut self, observer: F) -> Self
    where
        F: Fn(&UpstreamError, u32, Duration) + Send + Sync + 'static,
    {
        self.on_retry = Some(Arc::new(observer));
        self
    }

    /// Delay before retry `n` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(i32::MAX as u32) as i32;
        let millis = self.initial_delay.as_millis() as f64 * self.backoff_multiplier.powi(exponent);
        let max_millis = self.max_delay.as_millis() as f64;

        if !millis.is_finite() || millis < 0.0 || millis > max_millis {
            self.max_delay
        } else {
            Duration::from_millis(millis.round() as u64)
        }
    }
}

/// Runs an operation under a [`RetryPolicy`].
pub struct BackoffExecutor {
    policy: RetryPolicy,
    total_retries: AtomicU64,
}

impl fmt::Debug for BackoffExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackoffExecutor")
            .field("policy", &self.policy)
            .field("total_retries", &self.total_retries())
            .finish()
    }
}

impl BackoffExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            total_retries: AtomicU64::new(0),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Retries performed over the executor's lifetime.
    pub fn total_retries(&self) -> u64 {
        self.total_retries.load(Ordering::Relaxed)
    }

    /// Run `operation` up to `max_retries + 1` times, returning the first
    /// success or the last error.
    pub async fn run<T, F, Fut>(&self, mut operation: F) -> Result<T, UpstreamError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, UpstreamError>>,
    {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;

            let outcome = match self.policy.timeout {
                Some(limit) => match tokio::time::timeout(limit, operation()).await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(UpstreamError::Timeout(limit)),
                },
                None => operation().await,
            };

            let error = match outcome {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            if attempt > self.policy.max_retries {
                return Err(error);
            }
            if let Some(should_retry) = &self.policy.should_retry {
                if !should_retry(&error) {
                    debug!(attempt, error = %error, "error is not retryable");
                    return Err(error);
                }
            }

            let delay = self.policy.delay_for(attempt);
            if let Some(on_retry) = &self.policy.on_retry {
                on_retry(&error, attempt, delay);
            }
            self.total_retries.fetch_add(1, Ordering::Relaxed);

            warn!(
                attempt,
                max_retries = self.policy.max_retries,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "retrying upstream call"
            );

            tokio::time::sleep(delay).await;
        }
    }
}
