use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use flowcast_core::settings::UpstreamSettings;
use flowcast_core::UpstreamError;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, instrument};

use crate::resilient::ResilientClient;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// One entry of the upstream flow configuration: either a tab (a flow) or a
/// node living on a tab.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FlowNode {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: String,
    /// Id of the tab this node belongs to. Unset for tabs and config nodes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub z: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl FlowNode {
    pub fn tab(id: &str, label: &str) -> Self {
        Self {
            id: id.to_string(),
            node_type: "tab".to_string(),
            z: None,
            label: Some(label.to_string()),
            name: None,
            extra: Map::new(),
        }
    }

    pub fn node(id: &str, node_type: &str, flow_id: &str) -> Self {
        Self {
            id: id.to_string(),
            node_type: node_type.to_string(),
            z: Some(flow_id.to_string()),
            label: None,
            name: None,
            extra: Map::new(),
        }
    }

    pub fn is_tab(&self) -> bool {
        self.node_type == "tab"
    }

    pub fn flow_id(&self) -> Option<&str> {
        self.z.as_deref()
    }

    pub fn display_name(&self) -> Option<&str> {
        self.label.as_deref().or(self.name.as_deref())
    }
}

/// Source of the upstream flow configuration.
#[async_trait]
pub trait FlowSource: Send + Sync {
    async fn fetch_flows(&self) -> Result<Vec<FlowNode>, UpstreamError>;
}

/// The admin API answers either with a bare array or, for v2 clients, with
/// `{ "rev": ..., "flows": [...] }`.
#[derive(Deserialize)]
#[serde(untagged)]
enum FlowsResponse {
    Bare(Vec<FlowNode>),
    Versioned { flows: Vec<FlowNode> },
}

impl FlowsResponse {
    fn into_nodes(self) -> Vec<FlowNode> {
        match self {
            Self::Bare(nodes) | Self::Versioned { flows: nodes } => nodes,
        }
    }
}

/// Reads flows from the upstream admin API through a [`ResilientClient`].
pub struct HttpFlowSource {
    client: Client,
    base_url: String,
    token: Option<String>,
    request_timeout: Duration,
    resilient: Arc<ResilientClient>,
}

impl HttpFlowSource {
    pub fn new(
        settings: &UpstreamSettings,
        resilient: Arc<ResilientClient>,
    ) -> Result<Self, UpstreamError> {
        let request_timeout = Duration::from_millis(settings.request_timeout_ms);
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(request_timeout)
            .build()
            .map_err(|e| UpstreamError::Network(e.to_string()))?;

        Ok(Self {
            client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            token: settings.token.clone(),
            request_timeout,
            resilient,
        })
    }

    pub fn resilient(&self) -> &Arc<ResilientClient> {
        &self.resilient
    }

    async fn get_flows_once(&self) -> Result<Vec<FlowNode>, UpstreamError> {
        let mut req = self
            .client
            .get(format!("{}/flows", self.base_url))
            .header("accept", "application/json");
        if let Some(token) = &self.token {
            req = req.header("Authorization", format!("Bearer {token}"));
        }

        let on_error = |e| map_reqwest_error(e, self.request_timeout);
        let resp = req.send().await.map_err(on_error)?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(UpstreamError::from_status(status, body));
        }

        let parsed: FlowsResponse = resp.json().await.map_err(on_error)?;
        Ok(parsed.into_nodes())
    }
}

#[async_trait]
impl FlowSource for HttpFlowSource {
    #[instrument(skip(self), fields(base_url = %self.base_url))]
    async fn fetch_flows(&self) -> Result<Vec<FlowNode>, UpstreamError> {
        let nodes = self.resilient.execute(|| self.get_flows_once()).await?;
        debug!(count = nodes.len(), "fetched flows");
        Ok(nodes)
    }
}

fn map_reqwest_error(e: reqwest::Error, timeout: Duration) -> UpstreamError {
    if e.is_timeout() {
        UpstreamError::Timeout(timeout)
    } else if e.is_decode() {
        UpstreamError::Decode(e.to_string())
    } else {
        UpstreamError::Network(e.to_string())
    }
}
