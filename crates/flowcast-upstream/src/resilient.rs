use std::future::Future;

use flowcast_core::settings::{BreakerSettings, RetrySettings};
use flowcast_core::UpstreamError;

use crate::backoff::{BackoffExecutor, RetryPolicy};
use crate::breaker::{BreakerConfig, BreakerStats, CircuitBreaker, CircuitState};

/// Circuit breaker around a retry loop.
///
/// The breaker decides whether a whole retry sequence runs at all; the
/// sequence's final outcome counts as a single success or failure against
/// the breaker, however many attempts it took.
#[derive(Debug)]
pub struct ResilientClient {
    breaker: CircuitBreaker,
    executor: BackoffExecutor,
}

impl ResilientClient {
    pub fn new(breaker: CircuitBreaker, policy: RetryPolicy) -> Self {
        Self {
            breaker,
            executor: BackoffExecutor::new(policy),
        }
    }

    pub fn from_settings(
        name: impl Into<String>,
        breaker: &BreakerSettings,
        retry: &RetrySettings,
    ) -> Self {
        Self::new(
            CircuitBreaker::new(name, BreakerConfig::from_settings(breaker)),
            RetryPolicy::from_settings(retry),
        )
    }

    pub async fn execute<T, F, Fut>(&self, operation: F) -> Result<T, UpstreamError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, UpstreamError>>,
    {
        self.breaker
            .execute(move || self.executor.run(operation))
            .await
    }

    pub fn stats(&self) -> BreakerStats {
        self.breaker.stats()
    }

    pub fn state(&self) -> CircuitState {
        self.breaker.state()
    }

    pub fn reset(&self) {
        self.breaker.reset();
    }

    pub fn total_retries(&self) -> u64 {
        self.executor.total_retries()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use super::*;

    fn client(failure_threshold: u32, max_retries: u32) -> ResilientClient {
        ResilientClient::new(
            CircuitBreaker::new(
                "upstream",
                BreakerConfig {
                    failure_threshold,
                    success_threshold: 1,
                    open_timeout: Duration::from_secs(30),
                },
            ),
            RetryPolicy {
                max_retries,
                initial_delay: Duration::from_millis(100),
                max_delay: Duration::from_millis(400),
                ..Default::default()
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_sequence_counts_once_against_breaker() {
        let client = client(2, 3);
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = client
            .execute(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(UpstreamError::Network("refused".into())) }
            })
            .await;

        assert!(matches!(result, Err(UpstreamError::Network(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        let stats = client.stats();
        assert_eq!(stats.failure_count, 1);
        assert_eq!(stats.state, CircuitState::Closed);
        assert_eq!(client.total_retries(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retried_success_is_one_success() {
        let client = client(2, 3);
        let calls = AtomicU32::new(0);

        let value = client
            .execute(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(UpstreamError::Timeout(Duration::from_secs(1)))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 1);
        assert_eq!(client.stats().failure_count, 0);
        assert_eq!(client.stats().total_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn open_circuit_skips_retry_loop() {
        let client = client(1, 2);
        let _: Result<(), _> = client
            .execute(|| async { Err(UpstreamError::Network("down".into())) })
            .await;
        assert_eq!(client.state(), CircuitState::Open);

        let calls = AtomicU32::new(0);
        let result: Result<(), _> = client
            .execute(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await;

        assert!(result.unwrap_err().is_circuit_open());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_reopens_the_path() {
        let client = client(1, 0);
        let _: Result<(), _> = client
            .execute(|| async { Err(UpstreamError::from_status(503, "busy".into())) })
            .await;
        assert_eq!(client.state(), CircuitState::Open);

        client.reset();
        let ok = client.execute(|| async { Ok("fresh") }).await.unwrap();
        assert_eq!(ok, "fresh");
        assert_eq!(client.state(), CircuitState::Closed);
    }

    #[test]
    fn from_settings_uses_configured_thresholds() {
        let breaker = BreakerSettings {
            failure_threshold: 9,
            ..Default::default()
        };
        let client = ResilientClient::from_settings("flows", &breaker, &RetrySettings::default());
        let stats = client.stats();
        assert_eq!(stats.name, "flows");
        assert_eq!(stats.state, CircuitState::Closed);
    }
}
