use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{Result, SettingsError};

/// Root settings type.
///
/// All field names are camelCase and every section tolerates partial JSON:
///
/// ```json
/// { "hub": { "maxConnections": 250 }, "upstream": { "baseUrl": "http://nodered:1880" } }
/// ```
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FlowcastSettings {
    pub server: ServerSettings,
    pub hub: HubSettings,
    pub breaker: BreakerSettings,
    pub retry: RetrySettings,
    pub upstream: UpstreamSettings,
    pub logging: LoggingSettings,
}

impl FlowcastSettings {
    /// Reject values the subsystems cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.hub.max_connections == 0 {
            return Err(SettingsError::InvalidValue(
                "hub.maxConnections must be at least 1".into(),
            ));
        }
        if self.hub.heartbeat_interval_ms == 0 || self.hub.health_check_interval_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "hub intervals must be non-zero".into(),
            ));
        }
        if self.breaker.failure_threshold == 0 || self.breaker.success_threshold == 0 {
            return Err(SettingsError::InvalidValue(
                "breaker thresholds must be at least 1".into(),
            ));
        }
        if self.retry.backoff_multiplier < 1.0 || !self.retry.backoff_multiplier.is_finite() {
            return Err(SettingsError::InvalidValue(
                "retry.backoffMultiplier must be a finite number >= 1".into(),
            ));
        }
        if self.upstream.poll_interval_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "upstream.pollIntervalMs must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

/// HTTP listener settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3001,
        }
    }
}

/// Broadcast hub settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HubSettings {
    /// Interval between heartbeat events, in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// Interval between liveness sweeps, in milliseconds. Expected to be at
    /// least the heartbeat interval.
    pub health_check_interval_ms: u64,
    /// Maximum number of simultaneously open connections.
    pub max_connections: usize,
    /// Reconnect hint sent to clients in the `retry:` field, in milliseconds.
    pub retry_hint_ms: u64,
    /// Frames buffered per connection before writes start failing.
    pub send_queue_capacity: usize,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 30_000,
            health_check_interval_ms: 60_000,
            max_connections: 100,
            retry_hint_ms: 5_000,
            send_queue_capacity: 256,
        }
    }
}

impl HubSettings {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    /// Non-fatal configuration smells, meant to be logged at startup.
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.health_check_interval_ms < self.heartbeat_interval_ms {
            warnings.push(format!(
                "healthCheckIntervalMs ({}) is shorter than heartbeatIntervalMs ({}); idle connections may be reclaimed early",
                self.health_check_interval_ms, self.heartbeat_interval_ms
            ));
        }
        if self.send_queue_capacity < 8 {
            warnings.push(format!(
                "sendQueueCapacity ({}) is very small; bursts will be dropped",
                self.send_queue_capacity
            ));
        }
        warnings
    }
}

/// Circuit breaker settings for the upstream client.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub open_timeout_ms: u64,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_timeout_ms: 60_000,
        }
    }
}

/// Retry settings for the upstream client.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    /// Per-attempt timeout. `None` lets each attempt run until it resolves.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 1_000,
            max_delay_ms: 10_000,
            backoff_multiplier: 2.0,
            timeout_ms: None,
        }
    }
}

/// Upstream automation API settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UpstreamSettings {
    pub base_url: String,
    /// Bearer token sent with every request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    pub request_timeout_ms: u64,
    /// How often the event listener polls for flow changes.
    pub poll_interval_ms: u64,
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:1880".to_string(),
            token: None,
            request_timeout_ms: 10_000,
            poll_interval_ms: 10_000,
        }
    }
}

/// Logging settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    pub level: String,
    /// Emit JSON lines instead of the human formatter.
    pub json: bool,
    /// Per-module level overrides, e.g. `{"flowcast_hub": "debug"}`.
    pub modules: BTreeMap<String, String>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            modules: BTreeMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let s = FlowcastSettings::default();
        assert_eq!(s.hub.heartbeat_interval_ms, 30_000);
        assert_eq!(s.hub.max_connections, 100);
        assert_eq!(s.hub.retry_hint_ms, 5_000);
        assert_eq!(s.breaker.failure_threshold, 5);
        assert_eq!(s.breaker.success_threshold, 2);
        assert_eq!(s.breaker.open_timeout_ms, 60_000);
        assert_eq!(s.retry.max_retries, 3);
        assert_eq!(s.retry.initial_delay_ms, 1_000);
        assert_eq!(s.retry.max_delay_ms, 10_000);
        assert!((s.retry.backoff_multiplier - 2.0).abs() < f64::EPSILON);
        assert!(s.validate().is_ok());
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let s: FlowcastSettings =
            serde_json::from_str(r#"{"hub":{"maxConnections":7}}"#).unwrap();
        assert_eq!(s.hub.max_connections, 7);
        assert_eq!(s.hub.heartbeat_interval_ms, 30_000);
        assert_eq!(s.server.port, 3001);
    }

    #[test]
    fn camel_case_wire_names() {
        let json = serde_json::to_value(FlowcastSettings::default()).unwrap();
        assert!(json["hub"].get("heartbeatIntervalMs").is_some());
        assert!(json["breaker"].get("openTimeoutMs").is_some());
        assert!(json["retry"].get("timeoutMs").is_none());
    }

    #[test]
    fn validate_rejects_zero_capacity() {
        let mut s = FlowcastSettings::default();
        s.hub.max_connections = 0;
        assert!(matches!(s.validate(), Err(SettingsError::InvalidValue(_))));
    }

    #[test]
    fn validate_rejects_shrinking_backoff() {
        let mut s = FlowcastSettings::default();
        s.retry.backoff_multiplier = 0.5;
        assert!(s.validate().is_err());
    }

    #[test]
    fn warns_when_health_check_outpaces_heartbeat() {
        let hub = HubSettings {
            heartbeat_interval_ms: 30_000,
            health_check_interval_ms: 10_000,
            ..Default::default()
        };
        let warnings = hub.warnings();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("healthCheckIntervalMs"));

        assert!(HubSettings::default().warnings().is_empty());
    }
}
