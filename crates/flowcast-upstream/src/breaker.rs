use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use flowcast_core::settings::BreakerSettings;
use flowcast_core::UpstreamError;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

/// Circuit breaker state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half-open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug)]
pub struct BreakerConfig {
    /// Consecutive failures in closed state before opening.
    pub failure_threshold: u32,
    /// Consecutive successes in half-open state before closing.
    pub success_threshold: u32,
    /// How long the circuit stays open before allowing a trial call.
    pub open_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_timeout: Duration::from_secs(60),
        }
    }
}

impl BreakerConfig {
    pub fn from_settings(settings: &BreakerSettings) -> Self {
        Self {
            failure_threshold: settings.failure_threshold.max(1),
            success_threshold: settings.success_threshold.max(1),
            open_timeout: Duration::from_millis(settings.open_timeout_ms),
        }
    }
}

/// Point-in-time view of a breaker, serialized for the operator API.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub total_calls: u64,
    pub total_failures: u64,
    pub rejected_calls: u64,
    /// Milliseconds until an open circuit admits its next trial call.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_attempt_in_ms: Option<u64>,
}

pub type StateListener = Arc<dyn Fn(CircuitState) + Send + Sync>;

struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    next_attempt_at: Option<Instant>,
    total_calls: u64,
    total_failures: u64,
    rejected_calls: u64,
}

impl BreakerInner {
    fn closed() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            next_attempt_at: None,
            total_calls: 0,
            total_failures: 0,
            rejected_calls: 0,
        }
    }

    /// Move to `next`, returning it when the state actually changed.
    fn transition(&mut self, next: CircuitState) -> Option<CircuitState> {
        if self.state == next {
            return None;
        }
        self.state = next;
        Some(next)
    }
}

/// Three-state circuit breaker guarding one upstream resource.
///
/// - closed: calls pass; `failure_threshold` consecutive failures open it
/// - open: calls are rejected with [`UpstreamError::CircuitOpen`] until the
///   open timeout elapses, then the next call moves it to half-open
/// - half-open: any failure reopens it; `success_threshold` successes close it
///
/// Counters and state live behind one mutex so a transition and the counter
/// update that caused it are observed together. The guarded operation runs
/// with the lock released.
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
    on_state_change: Option<StateListener>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("state", &self.state())
            .finish()
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner::closed()),
            on_state_change: None,
        }
    }

    /// Register a callback invoked after every state transition.
    pub fn with_state_listener<F>(mut self, listener: F) -> Self
    where
        F: Fn(CircuitState) + Send + Sync + 'static,
    {
        self.on_state_change = Some(Arc::new(listener));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Run `operation` if the circuit admits it, recording the outcome.
    pub async fn execute<T, F, Fut>(&self, operation: F) -> Result<T, UpstreamError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, UpstreamError>>,
    {
        self.acquire()?;
        let outcome = operation().await;
        match &outcome {
            Ok(_) => self.record_success(),
            Err(_) => self.record_failure(),
        }
        outcome
    }

    /// Force the circuit closed with cleared counters.
    pub fn reset(&self) {
        let changed = {
            let mut inner = self.inner.lock();
            inner.failure_count = 0;
            inner.success_count = 0;
            inner.next_attempt_at = None;
            inner.transition(CircuitState::Closed)
        };
        info!(breaker = %self.name, "circuit breaker reset");
        self.notify(changed);
    }

    pub fn stats(&self) -> BreakerStats {
        let inner = self.inner.lock();
        let next_attempt_in_ms = match (inner.state, inner.next_attempt_at) {
            (CircuitState::Open, Some(at)) => {
                Some(at.saturating_duration_since(Instant::now()).as_millis() as u64)
            }
            _ => None,
        };
        BreakerStats {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            total_calls: inner.total_calls,
            total_failures: inner.total_failures,
            rejected_calls: inner.rejected_calls,
            next_attempt_in_ms,
        }
    }

    fn acquire(&self) -> Result<(), UpstreamError> {
        let changed = {
            let mut inner = self.inner.lock();
            inner.total_calls += 1;
            if inner.state != CircuitState::Open {
                return Ok(());
            }
            let now = Instant::now();
            match inner.next_attempt_at {
                Some(at) if now < at => {
                    inner.rejected_calls += 1;
                    return Err(UpstreamError::CircuitOpen {
                        retry_in: at - now,
                    });
                }
                _ => {
                    inner.success_count = 0;
                    inner.transition(CircuitState::HalfOpen)
                }
            }
        };
        self.notify(changed);
        Ok(())
    }

    fn record_success(&self) {
        let changed = {
            let mut inner = self.inner.lock();
            match inner.state {
                CircuitState::HalfOpen => {
                    inner.success_count += 1;
                    if inner.success_count >= self.config.success_threshold {
                        inner.failure_count = 0;
                        inner.success_count = 0;
                        inner.next_attempt_at = None;
                        inner.transition(CircuitState::Closed)
                    } else {
                        None
                    }
                }
                _ => {
                    inner.failure_count = 0;
                    None
                }
            }
        };
        self.notify(changed);
    }

    fn record_failure(&self) {
        let changed = {
            let mut inner = self.inner.lock();
            inner.failure_count += 1;
            inner.total_failures += 1;
            let trip = match inner.state {
                CircuitState::HalfOpen => true,
                CircuitState::Closed => inner.failure_count >= self.config.failure_threshold,
                // A call admitted before another caller opened the circuit.
                CircuitState::Open => false,
            };
            if trip {
                inner.success_count = 0;
                inner.next_attempt_at = Some(Instant::now() + self.config.open_timeout);
                inner.transition(CircuitState::Open)
            } else {
                None
            }
        };
        self.notify(changed);
    }

    fn notify(&self, changed: Option<CircuitState>) {
        let Some(state) = changed else {
            return;
        };
        match state {
            CircuitState::Open => warn!(
                breaker = %self.name,
                state = %state,
                cooldown_ms = self.config.open_timeout.as_millis() as u64,
                "circuit breaker opened"
            ),
            _ => info!(breaker = %self.name, state = %state, "circuit breaker state changed"),
        }
        if let Some(listener) = &self.on_state_change {
            listener(state);
        }
    }
}
