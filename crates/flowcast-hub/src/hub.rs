//! Connection registry and broadcast dispatcher.
//!
//! Every registry mutation (connect, disconnect, subscription changes,
//! dispatch, heartbeat and health sweeps) happens under a single mutex, so
//! the connection map and the counters always change together. Dispatch only
//! performs non-blocking queue writes while holding it.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use flowcast_core::settings::HubSettings;
use flowcast_core::{ConnectionId, Event, HubError};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::connection::{ClientInfo, Connection, ConnectionSummary, SubscriptionSet, WriteOutcome};
use crate::filter::EventFilter;
use crate::frame::{FrameReceiver, SseFrame};
use crate::monitor;

/// Hub configuration, built once at startup.
#[derive(Clone, Debug)]
pub struct HubConfig {
    pub heartbeat_interval: Duration,
    pub health_check_interval: Duration,
    /// A connection idle for longer than `heartbeat_interval × this` is
    /// reclaimed by the health check.
    pub health_timeout_multiplier: u32,
    pub max_connections: usize,
    pub retry_hint_ms: u64,
    pub send_queue_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self::from_settings(&HubSettings::default())
    }
}

/// Floor for the loop periods; `tokio::time::interval` rejects zero.
const MIN_INTERVAL: Duration = Duration::from_millis(1);

impl HubConfig {
    pub fn from_settings(settings: &HubSettings) -> Self {
        Self {
            heartbeat_interval: settings.heartbeat_interval(),
            health_check_interval: settings.health_check_interval(),
            health_timeout_multiplier: 3,
            max_connections: settings.max_connections,
            retry_hint_ms: settings.retry_hint_ms,
            send_queue_capacity: settings.send_queue_capacity.max(1),
        }
    }

    pub fn health_timeout(&self) -> Duration {
        self.heartbeat_interval * self.health_timeout_multiplier
    }

    /// Raise zero periods and a zero queue capacity to their minimums.
    fn normalized(mut self) -> Self {
        if self.heartbeat_interval < MIN_INTERVAL || self.health_check_interval < MIN_INTERVAL {
            warn!(
                heartbeat = ?self.heartbeat_interval,
                health_check = ?self.health_check_interval,
                "hub intervals below 1ms raised to 1ms"
            );
            self.heartbeat_interval = self.heartbeat_interval.max(MIN_INTERVAL);
            self.health_check_interval = self.health_check_interval.max(MIN_INTERVAL);
        }
        self.send_queue_capacity = self.send_queue_capacity.max(1);
        self
    }
}

/// Counters exposed through `stats()`.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastStats {
    pub total_connections: u64,
    pub active_connections: usize,
    pub messages_sent: u64,
    pub errors: u64,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: i64,
    pub subscriber_counts: BTreeMap<String, usize>,
}

#[derive(Default)]
struct Registry {
    connections: HashMap<ConnectionId, Connection>,
    total_connections: u64,
    messages_sent: u64,
    errors: u64,
    subscriber_counts: BTreeMap<String, usize>,
}

impl Registry {
    fn add_subscriber(&mut self, event_type: &str) {
        *self
            .subscriber_counts
            .entry(event_type.to_string())
            .or_insert(0) += 1;
    }

    fn remove_subscriber(&mut self, event_type: &str) {
        if let Some(count) = self.subscriber_counts.get_mut(event_type) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.subscriber_counts.remove(event_type);
            }
        }
    }

    /// The single removal path for a connection. Unknown ids are a no-op.
    fn remove(&mut self, id: &ConnectionId) -> Option<Connection> {
        let mut conn = self.connections.remove(id)?;
        conn.alive = false;
        for event_type in &conn.subscriptions {
            self.remove_subscriber(event_type);
        }
        Some(conn)
    }

    fn get(&self, id: &ConnectionId) -> Result<&Connection, HubError> {
        self.connections
            .get(id)
            .ok_or_else(|| HubError::ConnectionNotFound(id.clone()))
    }

    fn get_mut(&mut self, id: &ConnectionId) -> Result<&mut Connection, HubError> {
        self.connections
            .get_mut(id)
            .ok_or_else(|| HubError::ConnectionNotFound(id.clone()))
    }
}

/// In-process SSE broadcast hub.
pub struct SseHub {
    config: HubConfig,
    started_at: DateTime<Utc>,
    registry: Mutex<Registry>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<AbortHandle>>,
}

impl SseHub {
    /// Build a hub without background loops. Use [`SseHub::start`] for a
    /// running hub.
    pub fn new(config: HubConfig) -> Self {
        Self {
            config: config.normalized(),
            started_at: Utc::now(),
            registry: Mutex::new(Registry::default()),
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Build a hub and spawn its heartbeat and health-check loops.
    pub fn start(config: HubConfig) -> Arc<Self> {
        let hub = Arc::new(Self::new(config));
        let heartbeat = monitor::spawn_heartbeat(&hub);
        let health = monitor::spawn_health_check(&hub);
        hub.track_task(heartbeat.abort_handle());
        hub.track_task(health.abort_handle());
        info!(
            heartbeat_ms = hub.config.heartbeat_interval.as_millis() as u64,
            health_check_ms = hub.config.health_check_interval.as_millis() as u64,
            max_connections = hub.config.max_connections,
            "sse hub started"
        );
        hub
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Token cancelled when the hub shuts down. Producers feeding the hub
    /// should stop on it.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Tie a background task to the hub's lifetime; it is aborted on
    /// [`SseHub::destroy`].
    pub fn track_task(&self, handle: AbortHandle) {
        // Checked under the lock `destroy` drains with, so a handle is
        // either drained or aborted here.
        let mut tasks = self.tasks.lock();
        if self.is_shutting_down() {
            handle.abort();
            return;
        }
        tasks.push(handle);
    }

    /// Register a client. The returned receiver yields rendered SSE frames,
    /// starting with a `connection-status: connected` frame carrying the
    /// reconnect hint.
    pub fn connect(
        &self,
        info: ClientInfo,
    ) -> Result<(ConnectionId, FrameReceiver), HubError> {
        if self.is_shutting_down() {
            return Err(HubError::ShuttingDown);
        }

        let id = ConnectionId::new();
        let (tx, rx) = mpsc::channel(self.config.send_queue_capacity);
        let mut conn = Connection::new(id.clone(), info, tx);

        let greeting = Event::connection_status("connected", &id, None);
        let frame = render(&greeting, Some(Duration::from_millis(self.config.retry_hint_ms)));

        let active = {
            let mut registry = self.registry.lock();
            if registry.connections.len() >= self.config.max_connections {
                drop(registry);
                warn!(max = self.config.max_connections, "connection rejected at capacity");
                return Err(HubError::CapacityExceeded {
                    max: self.config.max_connections,
                });
            }
            if let Some(frame) = frame {
                if conn.write(frame) == WriteOutcome::Delivered {
                    registry.messages_sent += 1;
                }
            }
            registry.total_connections += 1;
            registry.connections.insert(id.clone(), conn);
            registry.connections.len()
        };

        info!(connection_id = %id, active, "client connected");
        Ok((id, rx))
    }

    /// Remove a connection. Idempotent; unknown ids are ignored.
    pub fn disconnect(&self, id: &ConnectionId) {
        let (removed, active) = {
            let mut registry = self.registry.lock();
            let removed = registry.remove(id).is_some();
            (removed, registry.connections.len())
        };
        if removed {
            info!(connection_id = %id, active, "client disconnected");
        }
    }

    pub fn subscribe<I, S>(&self, id: &ConnectionId, event_types: I) -> Result<(), HubError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut registry = self.registry.lock();
        let conn = registry.get_mut(id)?;
        let added: Vec<String> = event_types
            .into_iter()
            .map(Into::into)
            .filter(|event_type| conn.subscriptions.insert(event_type.clone()))
            .collect();
        for event_type in &added {
            registry.add_subscriber(event_type);
        }
        debug!(connection_id = %id, added = ?added, "subscribed");
        Ok(())
    }

    /// Subscribe to one type and store (or replace) its filter.
    pub fn subscribe_with_filter(
        &self,
        id: &ConnectionId,
        event_type: &str,
        filter: EventFilter,
    ) -> Result<(), HubError> {
        let mut registry = self.registry.lock();
        let conn = registry.get_mut(id)?;
        let added = conn.subscriptions.insert(event_type.to_string());
        conn.filters.insert(event_type.to_string(), filter);
        if added {
            registry.add_subscriber(event_type);
        }
        debug!(connection_id = %id, event_type, "subscribed with filter");
        Ok(())
    }

    pub fn unsubscribe<I, S>(&self, id: &ConnectionId, event_types: I) -> Result<(), HubError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut registry = self.registry.lock();
        let conn = registry.get_mut(id)?;
        let removed: Vec<String> = event_types
            .into_iter()
            .filter_map(|event_type| {
                let event_type = event_type.as_ref();
                conn.filters.remove(event_type);
                conn.subscriptions
                    .remove(event_type)
                    .then(|| event_type.to_string())
            })
            .collect();
        for event_type in &removed {
            registry.remove_subscriber(event_type);
        }
        debug!(connection_id = %id, removed = ?removed, "unsubscribed");
        Ok(())
    }

    pub fn subscriptions(&self, id: &ConnectionId) -> Result<SubscriptionSet, HubError> {
        Ok(self.registry.lock().get(id)?.subscription_set())
    }

    /// Deliver `event` to every live, subscribed connection whose filters
    /// match. Returns the number of connections the frame was queued on.
    ///
    /// A full queue drops the frame for that connection only; a closed queue
    /// disconnects it. Neither aborts delivery to the others.
    pub fn broadcast(&self, event: &Event, filter: Option<&EventFilter>) -> usize {
        let Some(frame) = render(event, None) else {
            return 0;
        };

        let mut delivered = 0;
        let mut dropped = Vec::new();
        let mut closed = Vec::new();
        {
            let mut registry = self.registry.lock();
            let mut sent = 0u64;
            for conn in registry.connections.values_mut() {
                if !conn.wants(event) {
                    continue;
                }
                if let Some(filter) = filter {
                    if !filter.matches(conn.owner(), event) {
                        continue;
                    }
                }
                match conn.write(Arc::clone(&frame)) {
                    WriteOutcome::Delivered => {
                        delivered += 1;
                        sent += 1;
                    }
                    WriteOutcome::Dropped => dropped.push(conn.id.clone()),
                    WriteOutcome::Closed => closed.push(conn.id.clone()),
                }
            }
            registry.messages_sent += sent;
            registry.errors += (dropped.len() + closed.len()) as u64;
            for id in &closed {
                registry.remove(id);
            }
        }

        for id in &dropped {
            warn!(connection_id = %id, event_type = %event.event_type, "send queue full, frame dropped");
        }
        for id in &closed {
            warn!(connection_id = %id, event_type = %event.event_type, "write failed, client disconnected");
        }
        trace!(event_type = %event.event_type, delivered, "broadcast");
        delivered
    }

    /// Deliver `event` to one connection regardless of its subscriptions.
    /// Returns whether the frame was queued.
    pub fn send_to_connection(&self, id: &ConnectionId, event: &Event) -> Result<bool, HubError> {
        let frame = render(event, None);
        let outcome = {
            let mut registry = self.registry.lock();
            let conn = registry.get_mut(id)?;
            if !conn.alive {
                return Ok(false);
            }
            let Some(frame) = frame else {
                return Ok(false);
            };
            let outcome = conn.write(frame);
            match outcome {
                WriteOutcome::Delivered => registry.messages_sent += 1,
                WriteOutcome::Dropped => registry.errors += 1,
                WriteOutcome::Closed => {
                    registry.errors += 1;
                    registry.remove(id);
                }
            }
            outcome
        };
        if outcome == WriteOutcome::Closed {
            warn!(connection_id = %id, "write failed, client disconnected");
        }
        Ok(outcome == WriteOutcome::Delivered)
    }

    /// Tell the client why it is being dropped, then disconnect it.
    pub fn force_disconnect(&self, id: &ConnectionId, reason: &str) -> Result<(), HubError> {
        let notice = Event::connection_status("disconnected", id, Some(reason));
        let frame = render(&notice, None);
        {
            let mut registry = self.registry.lock();
            let conn = registry.get_mut(id)?;
            if let Some(frame) = frame {
                if conn.write(frame) == WriteOutcome::Delivered {
                    registry.messages_sent += 1;
                }
            }
            registry.remove(id);
        }
        info!(connection_id = %id, reason, "client force-disconnected");
        Ok(())
    }

    /// Record a heartbeat acknowledgement from the client.
    pub fn touch(&self, id: &ConnectionId) -> Result<(), HubError> {
        let mut registry = self.registry.lock();
        registry.get_mut(id)?.touch();
        Ok(())
    }

    pub fn stats(&self) -> BroadcastStats {
        let registry = self.registry.lock();
        let now = Utc::now();
        BroadcastStats {
            total_connections: registry.total_connections,
            active_connections: registry.connections.len(),
            messages_sent: registry.messages_sent,
            errors: registry.errors,
            started_at: self.started_at,
            uptime_secs: (now - self.started_at).num_seconds(),
            subscriber_counts: registry.subscriber_counts.clone(),
        }
    }

    pub fn active_connections(&self) -> usize {
        self.registry.lock().connections.len()
    }

    pub fn clients(&self) -> Vec<ConnectionSummary> {
        let registry = self.registry.lock();
        let mut clients: Vec<_> = registry.connections.values().map(Connection::summary).collect();
        clients.sort_by(|a, b| a.id.cmp(&b.id));
        clients
    }

    /// Send one heartbeat to `heartbeat` and `*` subscribers.
    pub fn heartbeat_tick(&self) -> usize {
        let event = Event::heartbeat(self.active_connections());
        let delivered = self.broadcast(&event, None);
        trace!(delivered, "heartbeat sent");
        delivered
    }

    /// Reclaim connections idle past the health timeout. Returns how many
    /// were removed.
    pub fn check_health(&self) -> usize {
        let timeout = self.config.health_timeout();
        let now = Instant::now();
        let reclaimed: Vec<(ConnectionId, Duration)> = {
            let mut registry = self.registry.lock();
            let stale: Vec<(ConnectionId, Duration)> = registry
                .connections
                .values_mut()
                .filter_map(|conn| {
                    let idle = now.saturating_duration_since(conn.last_activity);
                    if idle > timeout {
                        conn.alive = false;
                        Some((conn.id.clone(), idle))
                    } else {
                        None
                    }
                })
                .collect();
            for (id, _) in &stale {
                registry.remove(id);
            }
            stale
        };
        for (id, idle) in &reclaimed {
            info!(connection_id = %id, idle_ms = idle.as_millis() as u64, "reclaimed idle connection");
        }
        reclaimed.len()
    }

    /// Stop the background loops and close every connection. Nothing is
    /// written after this returns.
    pub fn destroy(&self) {
        {
            let mut tasks = self.tasks.lock();
            self.shutdown.cancel();
            for handle in tasks.drain(..) {
                handle.abort();
            }
        }

        let closed = {
            let mut registry = self.registry.lock();
            let ids: Vec<ConnectionId> = registry.connections.keys().cloned().collect();
            for id in &ids {
                let notice = Event::connection_status("disconnected", id, Some("server shutdown"));
                if let (Some(frame), Some(conn)) =
                    (render(&notice, None), registry.connections.get_mut(id))
                {
                    let _ = conn.write(frame);
                }
                registry.remove(id);
            }
            ids.len()
        };
        info!(closed, "sse hub destroyed");
    }
}

impl Drop for SseHub {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Encode once; recipients share the frame.
fn render(event: &Event, retry: Option<Duration>) -> Option<Arc<SseFrame>> {
    match SseFrame::from_event(event) {
        Ok(frame) => {
            let frame = match retry {
                Some(retry) => frame.with_retry(retry),
                None => frame,
            };
            Some(Arc::new(frame))
        }
        Err(e) => {
            warn!(event_type = %event.event_type, error = %e, "failed to encode event");
            None
        }
    }
}
