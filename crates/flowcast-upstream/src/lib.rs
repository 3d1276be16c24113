pub mod backoff;
pub mod breaker;
pub mod flows;
pub mod resilient;

pub mod mock;

pub use backoff::{BackoffExecutor, RetryPolicy};
pub use breaker::{BreakerConfig, BreakerStats, CircuitBreaker, CircuitState};
pub use flows::{FlowNode, FlowSource, HttpFlowSource};
pub use resilient::ResilientClient;
