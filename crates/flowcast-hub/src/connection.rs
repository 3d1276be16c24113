use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use flowcast_core::{event_types, ConnectionId, Event};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Instant;

use crate::filter::EventFilter;
use crate::frame::SseFrame;

/// Metadata captured from the client handshake.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClientInfo {
    /// Authenticated user id; `None` for anonymous clients.
    pub owner: Option<String>,
    pub user_agent: Option<String>,
    pub remote_addr: Option<String>,
}

impl ClientInfo {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn owned_by(owner: impl Into<String>) -> Self {
        Self {
            owner: Some(owner.into()),
            ..Default::default()
        }
    }
}

/// Outcome of queueing one frame on a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum WriteOutcome {
    Delivered,
    /// Send queue full; the frame was dropped but the client is still there.
    Dropped,
    /// Receiving side is gone.
    Closed,
}

/// One registered client session. Owned by the hub's registry.
pub(crate) struct Connection {
    pub id: ConnectionId,
    pub info: ClientInfo,
    pub connected_at: DateTime<Utc>,
    pub last_activity: Instant,
    pub last_activity_at: DateTime<Utc>,
    pub subscriptions: BTreeSet<String>,
    pub filters: BTreeMap<String, EventFilter>,
    pub alive: bool,
    tx: mpsc::Sender<Arc<SseFrame>>,
}

impl Connection {
    pub fn new(id: ConnectionId, info: ClientInfo, tx: mpsc::Sender<Arc<SseFrame>>) -> Self {
        let now = Utc::now();
        Self {
            id,
            info,
            connected_at: now,
            last_activity: Instant::now(),
            last_activity_at: now,
            subscriptions: BTreeSet::new(),
            filters: BTreeMap::new(),
            alive: true,
            tx,
        }
    }

    pub fn owner(&self) -> Option<&str> {
        self.info.owner.as_deref()
    }

    /// Subscription and per-type filter check. The filter that applies is
    /// the one stored under the subscription that admitted the event: the
    /// event's own type when subscribed to it explicitly, otherwise `*`.
    pub fn wants(&self, event: &Event) -> bool {
        if !self.alive {
            return false;
        }
        let filter = if self.subscriptions.contains(&event.event_type) {
            self.filters.get(&event.event_type)
        } else if self.subscriptions.contains(event_types::WILDCARD) {
            self.filters.get(event_types::WILDCARD)
        } else {
            return false;
        };
        match filter {
            Some(filter) => filter.matches(self.owner(), event),
            None => true,
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
        self.last_activity_at = Utc::now();
    }

    /// Queue a rendered frame without waiting. Successful writes count as
    /// activity.
    pub fn write(&mut self, frame: Arc<SseFrame>) -> WriteOutcome {
        if !self.alive {
            return WriteOutcome::Closed;
        }
        match self.tx.try_send(frame) {
            Ok(()) => {
                self.touch();
                WriteOutcome::Delivered
            }
            Err(TrySendError::Full(_)) => WriteOutcome::Dropped,
            Err(TrySendError::Closed(_)) => WriteOutcome::Closed,
        }
    }

    pub fn summary(&self) -> ConnectionSummary {
        ConnectionSummary {
            id: self.id.clone(),
            owner: self.info.owner.clone(),
            user_agent: self.info.user_agent.clone(),
            remote_addr: self.info.remote_addr.clone(),
            connected_at: self.connected_at,
            last_activity: self.last_activity_at,
            subscriptions: self.subscriptions.iter().cloned().collect(),
            alive: self.alive,
        }
    }

    pub fn subscription_set(&self) -> SubscriptionSet {
        SubscriptionSet {
            connection_id: self.id.clone(),
            event_types: self.subscriptions.iter().cloned().collect(),
            filters: self.filters.clone(),
        }
    }
}

/// Operator view of one connection.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSummary {
    pub id: ConnectionId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_addr: Option<String>,
    pub connected_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub subscriptions: Vec<String>,
    pub alive: bool,
}

/// A connection's subscriptions and their filters.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionSet {
    pub connection_id: ConnectionId,
    pub event_types: Vec<String>,
    pub filters: BTreeMap<String, EventFilter>,
}
