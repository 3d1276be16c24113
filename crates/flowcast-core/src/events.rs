use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::ids::ConnectionId;

/// Event type tags understood by the hub and its clients.
pub mod event_types {
    /// Subscribing to this tag receives every event type.
    pub const WILDCARD: &str = "*";
    pub const HEARTBEAT: &str = "heartbeat";
    pub const SYSTEM_INFO: &str = "system-info";
    pub const CONNECTION_STATUS: &str = "connection-status";
    pub const FLOW: &str = "flow";
    pub const NODE: &str = "node";
    pub const RUNTIME: &str = "runtime";
    pub const ERROR: &str = "error";
}

/// A broadcastable event.
///
/// Immutable once built; the dispatcher serializes it once and writes the
/// same payload to every matching connection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub data: Map<String, Value>,
}

impl Event {
    /// Build an event from any JSON payload. Non-object payloads are stored
    /// under a `value` key so `data` is always a map.
    pub fn new(event_type: impl Into<String>, data: Value) -> Self {
        let data = match data {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("value".into(), other);
                map
            }
        };
        Self {
            event_type: event_type.into(),
            timestamp: Utc::now(),
            data,
        }
    }

    pub fn heartbeat(connections: usize) -> Self {
        Self::new(
            event_types::HEARTBEAT,
            json!({
                "serverTime": Utc::now().to_rfc3339(),
                "connections": connections,
            }),
        )
    }

    pub fn connection_status(
        status: &str,
        connection_id: &ConnectionId,
        reason: Option<&str>,
    ) -> Self {
        let mut data = json!({
            "status": status,
            "connectionId": connection_id,
        });
        if let Some(reason) = reason {
            data["reason"] = Value::String(reason.to_string());
        }
        Self::new(event_types::CONNECTION_STATUS, data)
    }

    pub fn flow_id(&self) -> Option<&str> {
        self.data.get("flowId").and_then(Value::as_str)
    }

    pub fn node_id(&self) -> Option<&str> {
        self.data.get("nodeId").and_then(Value::as_str)
    }
}
