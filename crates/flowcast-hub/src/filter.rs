use std::collections::BTreeSet;

use flowcast_core::Event;
use serde::{Deserialize, Serialize};

/// Narrows delivery within a subscribed event type.
///
/// Each dimension left unset matches everything; set dimensions are ANDed.
/// A node or flow dimension only matches events that carry that attribute.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_ids: Option<BTreeSet<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow_ids: Option<BTreeSet<String>>,
}

impl EventFilter {
    pub fn for_user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            ..Default::default()
        }
    }

    pub fn with_node_ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.node_ids = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_flow_ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.flow_ids = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.user_id.is_none() && self.node_ids.is_none() && self.flow_ids.is_none()
    }

    /// Whether `event` may be delivered to a connection owned by `owner`.
    pub fn matches(&self, owner: Option<&str>, event: &Event) -> bool {
        if let Some(user_id) = &self.user_id {
            if owner != Some(user_id.as_str()) {
                return false;
            }
        }
        if let Some(node_ids) = &self.node_ids {
            match event.node_id() {
                Some(id) if node_ids.contains(id) => {}
                _ => return false,
            }
        }
        if let Some(flow_ids) = &self.flow_ids {
            match event.flow_id() {
                Some(id) if flow_ids.contains(id) => {}
                _ => return false,
            }
        }
        true
    }
}
