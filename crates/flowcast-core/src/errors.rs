use std::time::Duration;

use crate::ids::ConnectionId;

/// Errors surfaced by the broadcast hub's management operations.
///
/// Write failures on individual connections are not represented here: they
/// are contained inside the dispatcher and only show up in the stats.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum HubError {
    #[error("connection limit reached ({max} active)")]
    CapacityExceeded { max: usize },

    #[error("connection not found: {0}")]
    ConnectionNotFound(ConnectionId),

    #[error("hub is shutting down")]
    ShuttingDown,
}

impl HubError {
    /// Stable machine-readable code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            Self::CapacityExceeded { .. } => "CAPACITY_EXCEEDED",
            Self::ConnectionNotFound(_) => "CONNECTION_NOT_FOUND",
            Self::ShuttingDown => "SHUTTING_DOWN",
        }
    }
}

/// Typed error hierarchy for calls to the upstream automation API.
///
/// `CircuitOpen` is produced locally by the circuit breaker and never reaches
/// the network; callers can branch on it to serve a fallback.
#[derive(Clone, Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("circuit open, next attempt in {retry_in:?}")]
    CircuitOpen { retry_in: Duration },

    #[error("timeout after {0:?}")]
    Timeout(Duration),

    #[error("rate limited")]
    RateLimited,

    #[error("upstream returned {status}: {body}")]
    Http { status: u16, body: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("decode error: {0}")]
    Decode(String),
}

impl UpstreamError {
    /// Whether another attempt may succeed. Client errors (4xx other than
    /// 429) and decode failures are permanent.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::RateLimited | Self::Network(_) => true,
            Self::Http { status, .. } => !(400..500).contains(status),
            Self::CircuitOpen { .. } | Self::Decode(_) => false,
        }
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    /// Classify an HTTP status code into the appropriate error variant.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            429 => Self::RateLimited,
            _ => Self::Http { status, body },
        }
    }

    /// Short classification string for logging and event payloads.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::CircuitOpen { .. } => "circuit_open",
            Self::Timeout(_) => "timeout",
            Self::RateLimited => "rate_limited",
            Self::Http { status, .. } if *status >= 500 => "server_error",
            Self::Http { .. } => "client_error",
            Self::Network(_) => "network_error",
            Self::Decode(_) => "decode_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(UpstreamError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(UpstreamError::RateLimited.is_retryable());
        assert!(UpstreamError::Network("reset".into()).is_retryable());
        assert!(UpstreamError::from_status(500, "boom".into()).is_retryable());
        assert!(UpstreamError::from_status(503, "down".into()).is_retryable());
    }

    #[test]
    fn client_errors_are_permanent() {
        assert!(!UpstreamError::from_status(400, "bad".into()).is_retryable());
        assert!(!UpstreamError::from_status(401, "auth".into()).is_retryable());
        assert!(!UpstreamError::from_status(404, "missing".into()).is_retryable());
        assert!(UpstreamError::from_status(429, "slow down".into()).is_retryable());
    }

    #[test]
    fn circuit_open_is_distinct_from_server_error() {
        let open = UpstreamError::CircuitOpen {
            retry_in: Duration::from_secs(30),
        };
        assert!(open.is_circuit_open());
        assert!(!open.is_retryable());
        assert_eq!(open.error_kind(), "circuit_open");

        let down = UpstreamError::from_status(502, "bad gateway".into());
        assert!(!down.is_circuit_open());
        assert_eq!(down.error_kind(), "server_error");
    }

    #[test]
    fn hub_error_codes() {
        assert_eq!(
            HubError::CapacityExceeded { max: 2 }.code(),
            "CAPACITY_EXCEEDED"
        );
        assert_eq!(
            HubError::ConnectionNotFound(ConnectionId::from_raw("conn_x")).code(),
            "CONNECTION_NOT_FOUND"
        );
        assert_eq!(
            HubError::CapacityExceeded { max: 2 }.to_string(),
            "connection limit reached (2 active)"
        );
    }
}
