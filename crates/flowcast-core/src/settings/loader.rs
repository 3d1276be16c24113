//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`FlowcastSettings::default()`]
//! 2. If a settings file exists, deep-merge its values over the defaults
//! 3. Apply `FLOWCAST_*` environment overrides (highest priority)

use std::path::Path;

use serde_json::Value;
use tracing::debug;

use super::types::FlowcastSettings;
use super::Result;

/// Load settings from a file with env var overrides.
///
/// A missing file yields defaults; a malformed one is an error.
pub fn load_settings_from_path(path: &Path) -> Result<FlowcastSettings> {
    let defaults = serde_json::to_value(FlowcastSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: FlowcastSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

/// Recursive deep merge of two JSON values.
///
/// - Objects are merged recursively (source overrides target per-key)
/// - Arrays and primitives are replaced entirely by source
/// - Null values in source are skipped (preserving target)
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply overrides from the process environment.
pub fn apply_env_overrides(settings: &mut FlowcastSettings) {
    apply_overrides(settings, |name| std::env::var(name).ok());
}

/// Apply overrides from an arbitrary key lookup.
///
/// Invalid or out-of-range values are logged and ignored.
pub fn apply_overrides<F>(settings: &mut FlowcastSettings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let env = Env { lookup };

    // ── Server ──────────────────────────────────────────────────────
    if let Some(v) = env.string("FLOWCAST_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = env.parsed("FLOWCAST_PORT", |s| parse_u16_range(s, 1, 65535)) {
        settings.server.port = v;
    }

    // ── Hub ─────────────────────────────────────────────────────────
    if let Some(v) = env.parsed("FLOWCAST_HEARTBEAT_INTERVAL_MS", |s| {
        parse_u64_range(s, 100, 3_600_000)
    }) {
        settings.hub.heartbeat_interval_ms = v;
    }
    if let Some(v) = env.parsed("FLOWCAST_HEALTH_CHECK_INTERVAL_MS", |s| {
        parse_u64_range(s, 100, 3_600_000)
    }) {
        settings.hub.health_check_interval_ms = v;
    }
    if let Some(v) = env.parsed("FLOWCAST_MAX_CONNECTIONS", |s| {
        parse_usize_range(s, 1, 100_000)
    }) {
        settings.hub.max_connections = v;
    }
    if let Some(v) = env.parsed("FLOWCAST_RETRY_HINT_MS", |s| parse_u64_range(s, 0, 3_600_000)) {
        settings.hub.retry_hint_ms = v;
    }

    // ── Circuit breaker ─────────────────────────────────────────────
    if let Some(v) = env.parsed("FLOWCAST_BREAKER_FAILURE_THRESHOLD", |s| {
        parse_u32_range(s, 1, 1_000)
    }) {
        settings.breaker.failure_threshold = v;
    }
    if let Some(v) = env.parsed("FLOWCAST_BREAKER_SUCCESS_THRESHOLD", |s| {
        parse_u32_range(s, 1, 1_000)
    }) {
        settings.breaker.success_threshold = v;
    }
    if let Some(v) = env.parsed("FLOWCAST_BREAKER_OPEN_TIMEOUT_MS", |s| {
        parse_u64_range(s, 1, 86_400_000)
    }) {
        settings.breaker.open_timeout_ms = v;
    }

    // ── Retry ───────────────────────────────────────────────────────
    if let Some(v) = env.parsed("FLOWCAST_RETRY_MAX_RETRIES", |s| parse_u32_range(s, 0, 100)) {
        settings.retry.max_retries = v;
    }
    if let Some(v) = env.parsed("FLOWCAST_RETRY_INITIAL_DELAY_MS", |s| {
        parse_u64_range(s, 0, 3_600_000)
    }) {
        settings.retry.initial_delay_ms = v;
    }
    if let Some(v) = env.parsed("FLOWCAST_RETRY_MAX_DELAY_MS", |s| {
        parse_u64_range(s, 0, 3_600_000)
    }) {
        settings.retry.max_delay_ms = v;
    }
    if let Some(v) = env.parsed("FLOWCAST_RETRY_MULTIPLIER", |s| parse_f64_range(s, 1.0, 100.0)) {
        settings.retry.backoff_multiplier = v;
    }
    if let Some(v) = env.parsed("FLOWCAST_RETRY_TIMEOUT_MS", |s| {
        parse_u64_range(s, 1, 3_600_000)
    }) {
        settings.retry.timeout_ms = Some(v);
    }

    // ── Upstream ────────────────────────────────────────────────────
    if let Some(v) = env.string("FLOWCAST_UPSTREAM_URL") {
        settings.upstream.base_url = v;
    }
    if let Some(v) = env.string("FLOWCAST_UPSTREAM_TOKEN") {
        settings.upstream.token = Some(v);
    }
    if let Some(v) = env.parsed("FLOWCAST_POLL_INTERVAL_MS", |s| {
        parse_u64_range(s, 100, 3_600_000)
    }) {
        settings.upstream.poll_interval_ms = v;
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = env.string("FLOWCAST_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = env.parsed("FLOWCAST_LOG_JSON", parse_bool) {
        settings.logging.json = v;
    }
}

struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn parsed<T>(&self, name: &str, parse: impl Fn(&str) -> Option<T>) -> Option<T> {
        let val = self.string(name)?;
        let result = parse(&val);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid env override, ignoring");
        }
        result
    }
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

pub fn parse_u32_range(val: &str, min: u32, max: u32) -> Option<u32> {
    let n: u32 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

pub fn parse_f64_range(val: &str, min: f64, max: f64) -> Option<f64> {
    let n: f64 = val.parse().ok()?;
    (n.is_finite() && n >= min && n <= max).then_some(n)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::settings::SettingsError;

    fn temp_path(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("flowcast-settings-{}", uuid::Uuid::now_v7()));
        std::fs::create_dir_all(&dir).unwrap();
        dir.join(name)
    }

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn merge_nested_override() {
        let target = serde_json::json!({"hub": {"maxConnections": 100, "retryHintMs": 5000}});
        let source = serde_json::json!({"hub": {"maxConnections": 5}});
        let merged = deep_merge(target, source);
        assert_eq!(merged["hub"]["maxConnections"], 5);
        assert_eq!(merged["hub"]["retryHintMs"], 5000);
    }

    #[test]
    fn merge_skips_null_and_replaces_arrays() {
        let target = serde_json::json!({"a": 1, "list": [1, 2, 3]});
        let source = serde_json::json!({"a": null, "list": [9]});
        let merged = deep_merge(target, source);
        assert_eq!(merged["a"], 1);
        assert_eq!(merged["list"], serde_json::json!([9]));
    }

    #[test]
    fn missing_file_yields_defaults() {
        let path = temp_path("absent.json");
        let settings = load_settings_from_path(&path).unwrap();
        assert_eq!(settings.hub.max_connections, 100);
    }

    #[test]
    fn file_values_override_defaults() {
        let path = temp_path("settings.json");
        std::fs::write(
            &path,
            r#"{"breaker":{"failureThreshold":9},"upstream":{"baseUrl":"http://nr:1880"}}"#,
        )
        .unwrap();
        let settings = load_settings_from_path(&path).unwrap();
        assert_eq!(settings.breaker.failure_threshold, 9);
        assert_eq!(settings.breaker.success_threshold, 2);
        assert_eq!(settings.upstream.base_url, "http://nr:1880");
    }

    #[test]
    fn malformed_file_is_an_error() {
        let path = temp_path("broken.json");
        std::fs::write(&path, "{not json").unwrap();
        let err = load_settings_from_path(&path).unwrap_err();
        assert!(matches!(err, SettingsError::Json(_)));
    }

    #[test]
    fn invalid_file_values_fail_validation() {
        let path = temp_path("zero.json");
        std::fs::write(&path, r#"{"breaker":{"successThreshold":0}}"#).unwrap();
        let err = load_settings_from_path(&path).unwrap_err();
        assert!(matches!(err, SettingsError::InvalidValue(_)));
    }

    #[test]
    fn overrides_apply_in_range_values() {
        let mut settings = FlowcastSettings::default();
        apply_overrides(
            &mut settings,
            lookup(&[
                ("FLOWCAST_PORT", "8080"),
                ("FLOWCAST_MAX_CONNECTIONS", "2"),
                ("FLOWCAST_RETRY_MULTIPLIER", "1.5"),
                ("FLOWCAST_RETRY_TIMEOUT_MS", "2500"),
                ("FLOWCAST_UPSTREAM_TOKEN", "secret"),
                ("FLOWCAST_LOG_JSON", "yes"),
            ]),
        );
        assert_eq!(settings.server.port, 8080);
        assert_eq!(settings.hub.max_connections, 2);
        assert!((settings.retry.backoff_multiplier - 1.5).abs() < f64::EPSILON);
        assert_eq!(settings.retry.timeout_ms, Some(2500));
        assert_eq!(settings.upstream.token.as_deref(), Some("secret"));
        assert!(settings.logging.json);
    }

    #[test]
    fn overrides_ignore_invalid_values() {
        let mut settings = FlowcastSettings::default();
        apply_overrides(
            &mut settings,
            lookup(&[
                ("FLOWCAST_PORT", "0"),
                ("FLOWCAST_MAX_CONNECTIONS", "lots"),
                ("FLOWCAST_BREAKER_FAILURE_THRESHOLD", "0"),
                ("FLOWCAST_HOST", ""),
            ]),
        );
        assert_eq!(settings.server.port, 3001);
        assert_eq!(settings.hub.max_connections, 100);
        assert_eq!(settings.breaker.failure_threshold, 5);
        assert_eq!(settings.server.host, "127.0.0.1");
    }

    #[test]
    fn parse_helpers() {
        assert_eq!(parse_bool("ON"), Some(true));
        assert_eq!(parse_bool("off"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
        assert_eq!(parse_u64_range("500", 100, 1000), Some(500));
        assert_eq!(parse_u64_range("50", 100, 1000), None);
        assert_eq!(parse_f64_range("NaN", 1.0, 10.0), None);
        assert_eq!(parse_u32_range("-1", 0, 10), None);
    }
}
