//! Polls the upstream automation API and turns configuration changes and
//! availability transitions into hub events.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use flowcast_core::{event_types, Event, UpstreamError};
use flowcast_upstream::{FlowNode, FlowSource};
use serde_json::json;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::hub::SseHub;

#[derive(Clone, Debug, PartialEq)]
struct FlowEntry {
    tab: FlowNode,
    /// Nodes on this tab, keyed by id.
    nodes: BTreeMap<String, FlowNode>,
}

/// Flow configuration as seen by one poll.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FlowSnapshot {
    flows: BTreeMap<String, FlowEntry>,
    /// Every node that lives on some tab or subflow, keyed by id.
    nodes: BTreeMap<String, FlowNode>,
}

impl FlowSnapshot {
    pub fn from_nodes(nodes: Vec<FlowNode>) -> Self {
        let mut snapshot = Self::default();
        for node in nodes {
            if node.is_tab() {
                snapshot.flows.insert(
                    node.id.clone(),
                    FlowEntry {
                        tab: node,
                        nodes: BTreeMap::new(),
                    },
                );
            } else if node.flow_id().is_some() {
                snapshot.nodes.insert(node.id.clone(), node);
            }
        }
        for node in snapshot.nodes.values() {
            if let Some(entry) = node.flow_id().and_then(|z| snapshot.flows.get_mut(z)) {
                entry.nodes.insert(node.id.clone(), node.clone());
            }
        }
        snapshot
    }

    pub fn flow_count(&self) -> usize {
        self.flows.len()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}

fn flow_event(action: &str, id: &str, entry: &FlowEntry) -> Event {
    Event::new(
        event_types::FLOW,
        json!({
            "action": action,
            "flowId": id,
            "label": entry.tab.display_name(),
            "nodeCount": entry.nodes.len(),
        }),
    )
}

fn node_event(action: &str, node: &FlowNode) -> Event {
    Event::new(
        event_types::NODE,
        json!({
            "action": action,
            "nodeId": node.id,
            "flowId": node.flow_id(),
            "nodeType": node.node_type,
        }),
    )
}

/// Events describing the change from `prev` to `next`: flow events first
/// (added, updated, removed), then node events.
pub fn diff_snapshots(prev: &FlowSnapshot, next: &FlowSnapshot) -> Vec<Event> {
    let mut events = Vec::new();

    for (id, entry) in &next.flows {
        match prev.flows.get(id) {
            None => events.push(flow_event("added", id, entry)),
            Some(old) if old != entry => events.push(flow_event("updated", id, entry)),
            Some(_) => {}
        }
    }
    for (id, entry) in &prev.flows {
        if !next.flows.contains_key(id) {
            events.push(flow_event("removed", id, entry));
        }
    }

    for (id, node) in &next.nodes {
        if !prev.nodes.contains_key(id) {
            events.push(node_event("added", node));
        }
    }
    for (id, node) in &prev.nodes {
        if !next.nodes.contains_key(id) {
            events.push(node_event("removed", node));
        }
    }

    events
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Availability {
    Unknown,
    Available,
    Unavailable,
}

const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Polling producer feeding the hub.
pub struct EventListener {
    source: Arc<dyn FlowSource>,
    hub: Arc<SseHub>,
    poll_interval: Duration,
    snapshot: Option<FlowSnapshot>,
    availability: Availability,
}

impl EventListener {
    /// `poll_interval` is raised to at least 1ms.
    pub fn new(source: Arc<dyn FlowSource>, hub: Arc<SseHub>, poll_interval: Duration) -> Self {
        Self {
            source,
            hub,
            poll_interval: poll_interval.max(MIN_POLL_INTERVAL),
            snapshot: None,
            availability: Availability::Unknown,
        }
    }

    /// Poll once and broadcast whatever changed. The first successful poll
    /// only records a baseline. Returns the events that were broadcast.
    pub async fn poll_once(&mut self) -> Vec<Event> {
        let events = match self.source.fetch_flows().await {
            Ok(nodes) => self.on_flows(nodes),
            Err(e) => self.on_error(&e),
        };
        for event in &events {
            let delivered = self.hub.broadcast(event, None);
            debug!(event_type = %event.event_type, delivered, "listener event");
        }
        events
    }

    fn on_flows(&mut self, nodes: Vec<FlowNode>) -> Vec<Event> {
        let next = FlowSnapshot::from_nodes(nodes);
        let mut events = Vec::new();

        if self.availability != Availability::Available {
            info!(flows = next.flow_count(), "upstream available");
            events.push(Event::new(
                event_types::RUNTIME,
                json!({
                    "state": "available",
                    "flowCount": next.flow_count(),
                    "nodeCount": next.node_count(),
                }),
            ));
            self.availability = Availability::Available;
        }

        if let Some(prev) = &self.snapshot {
            events.extend(diff_snapshots(prev, &next));
        }
        self.snapshot = Some(next);
        events
    }

    fn on_error(&mut self, error: &UpstreamError) -> Vec<Event> {
        if self.availability == Availability::Unavailable {
            debug!(error = %error, "upstream still unavailable");
            return Vec::new();
        }
        warn!(error = %error, kind = error.error_kind(), "upstream unavailable");
        self.availability = Availability::Unavailable;
        vec![
            Event::new(
                event_types::RUNTIME,
                json!({ "state": "unavailable" }),
            ),
            Event::new(
                event_types::ERROR,
                json!({
                    "kind": error.error_kind(),
                    "message": error.to_string(),
                    "circuitOpen": error.is_circuit_open(),
                }),
            ),
        ]
    }

    /// Poll until `token` is cancelled. The first poll runs immediately.
    pub async fn run(mut self, token: CancellationToken) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(poll_ms = self.poll_interval.as_millis() as u64, "event listener started");

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = self.poll_once() => {}
                    }
                }
            }
        }
        info!("event listener stopped");
    }

    /// Spawn the listener on the hub's shutdown token and tie it to the hub.
    pub fn spawn(self) -> JoinHandle<()> {
        let hub = Arc::clone(&self.hub);
        let handle = tokio::spawn(self.run(hub.shutdown_token()));
        hub.track_task(handle.abort_handle());
        handle
    }
}

#[cfg(test)]
mod tests {
    use flowcast_upstream::mock::{MockFlowSource, MockResponse};

    use super::*;
    use crate::connection::ClientInfo;
    use crate::hub::HubConfig;

    fn base_flows() -> Vec<FlowNode> {
        vec![
            FlowNode::tab("t1", "Main"),
            FlowNode::node("n1", "inject", "t1"),
            FlowNode::node("n2", "debug", "t1"),
        ]
    }

    fn field<'a>(event: &'a Event, key: &str) -> &'a str {
        event.data.get(key).and_then(|v| v.as_str()).unwrap_or_default()
    }

    #[test]
    fn snapshot_groups_nodes_by_tab() {
        let mut nodes = base_flows();
        nodes.push(FlowNode {
            z: None,
            ..FlowNode::node("cfg", "mqtt-broker", "")
        });
        let snapshot = FlowSnapshot::from_nodes(nodes);
        assert_eq!(snapshot.flow_count(), 1);
        assert_eq!(snapshot.node_count(), 2);
        assert_eq!(snapshot.flows["t1"].nodes.len(), 2);
    }

    #[test]
    fn diff_reports_added_updated_removed() {
        let prev = FlowSnapshot::from_nodes(base_flows());
        let next = FlowSnapshot::from_nodes(vec![
            FlowNode::tab("t1", "Main (renamed)"),
            FlowNode::node("n1", "inject", "t1"),
            FlowNode::node("n3", "function", "t1"),
            FlowNode::tab("t2", "Second"),
        ]);

        let events = diff_snapshots(&prev, &next);
        let summary: Vec<(String, String, String)> = events
            .iter()
            .map(|e| {
                let id = if e.event_type == "flow" {
                    field(e, "flowId")
                } else {
                    field(e, "nodeId")
                };
                (e.event_type.clone(), field(e, "action").to_string(), id.to_string())
            })
            .collect();

        assert_eq!(
            summary,
            vec![
                ("flow".into(), "updated".into(), "t1".into()),
                ("flow".into(), "added".into(), "t2".into()),
                ("node".into(), "added".into(), "n3".into()),
                ("node".into(), "removed".into(), "n2".into()),
            ]
        );
        assert_eq!(events[0].data["label"], "Main (renamed)");
        assert_eq!(events[0].data["nodeCount"], 2);
        assert_eq!(events[2].flow_id(), Some("t1"));
    }

    #[test]
    fn identical_snapshots_produce_nothing() {
        let a = FlowSnapshot::from_nodes(base_flows());
        let b = FlowSnapshot::from_nodes(base_flows());
        assert!(diff_snapshots(&a, &b).is_empty());
    }

    #[test]
    fn removed_flow_is_reported() {
        let prev = FlowSnapshot::from_nodes(vec![FlowNode::tab("t1", "Main")]);
        let events = diff_snapshots(&prev, &FlowSnapshot::default());
        assert_eq!(events.len(), 1);
        assert_eq!(field(&events[0], "action"), "removed");
    }

    #[tokio::test]
    async fn first_poll_is_baseline_then_changes_are_broadcast() {
        let hub = Arc::new(SseHub::new(HubConfig::default()));
        let (id, mut rx) = hub.connect(ClientInfo::anonymous()).unwrap();
        hub.subscribe(&id, ["flow", "runtime"]).unwrap();
        let _connected = rx.try_recv().unwrap();

        let source = Arc::new(MockFlowSource::new(vec![
            MockResponse::Flows(base_flows()),
            MockResponse::Flows(vec![FlowNode::tab("t1", "Main")]),
        ]));
        let mut listener = EventListener::new(source.clone(), Arc::clone(&hub), Duration::from_secs(10));

        let first = listener.poll_once().await;
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].event_type, "runtime");
        assert_eq!(field(&first[0], "state"), "available");

        let second = listener.poll_once().await;
        let types: Vec<&str> = second.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(types, vec!["flow", "node", "node"]);

        let mut received = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            received.push(frame);
        }
        // runtime + flow updated; node events are not subscribed.
        assert_eq!(received.len(), 2);
        assert_eq!(source.call_count(), 2);
    }

    #[tokio::test]
    async fn one_error_event_per_failure_streak() {
        let hub = Arc::new(SseHub::new(HubConfig::default()));
        let source = Arc::new(MockFlowSource::new(vec![
            MockResponse::Flows(base_flows()),
            MockResponse::Error(UpstreamError::Http {
                status: 502,
                body: "bad gateway".into(),
            }),
            MockResponse::Error(UpstreamError::CircuitOpen {
                retry_in: Duration::from_secs(30),
            }),
            MockResponse::Flows(base_flows()),
        ]));
        let mut listener = EventListener::new(source, hub, Duration::from_secs(10));

        listener.poll_once().await;
        let failed = listener.poll_once().await;
        assert_eq!(failed.len(), 2);
        assert_eq!(field(&failed[0], "state"), "unavailable");
        assert_eq!(failed[1].event_type, "error");
        assert_eq!(field(&failed[1], "kind"), "server_error");
        assert_eq!(failed[1].data["circuitOpen"], false);

        assert!(listener.poll_once().await.is_empty());

        let recovered = listener.poll_once().await;
        assert_eq!(recovered.len(), 1);
        assert_eq!(field(&recovered[0], "state"), "available");
    }

    #[tokio::test(start_paused = true)]
    async fn zero_poll_interval_still_runs() {
        let hub = SseHub::start(HubConfig::default());
        let source = Arc::new(MockFlowSource::new(vec![MockResponse::Flows(base_flows())]));
        let handle = EventListener::new(source.clone(), Arc::clone(&hub), Duration::ZERO).spawn();

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(source.call_count() >= 2);
        hub.destroy();
        let _ = handle.await;
    }

    #[tokio::test(start_paused = true)]
    async fn spawned_listener_stops_with_hub() {
        let hub = SseHub::start(HubConfig::default());
        let source = Arc::new(MockFlowSource::new(vec![MockResponse::Flows(base_flows())]));
        let listener = EventListener::new(source.clone(), Arc::clone(&hub), Duration::from_secs(1));
        let handle = listener.spawn();

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(source.call_count(), 3);

        hub.destroy();
        let joined = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("listener task finishes");
        assert!(joined.is_ok() || joined.unwrap_err().is_cancelled());

        let calls = source.call_count();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(source.call_count(), calls);
    }
}
