use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::sse::{KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use flowcast_core::settings::ServerSettings;
use flowcast_core::{event_types, ConnectionId, Event, HubError, UpstreamError};
use flowcast_upstream::{FlowSource, ResilientClient};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::connection::ClientInfo;
use crate::filter::EventFilter;
use crate::hub::SseHub;

/// Header carrying the authenticated user id, set by the fronting proxy.
pub const USER_ID_HEADER: &str = "x-user-id";

/// Listener settings.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3001,
        }
    }
}

impl ServerConfig {
    pub fn from_settings(settings: &ServerSettings) -> Self {
        Self {
            host: settings.host.clone(),
            port: settings.port,
        }
    }
}

/// Shared application state passed to axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<SseHub>,
    /// Breaker guarding upstream calls, when an upstream is configured.
    pub upstream: Option<Arc<ResilientClient>>,
    pub flows: Option<Arc<dyn FlowSource>>,
}

impl AppState {
    pub fn new(hub: Arc<SseHub>) -> Self {
        Self {
            hub,
            upstream: None,
            flows: None,
        }
    }

    pub fn with_upstream(mut self, upstream: Arc<ResilientClient>, flows: Arc<dyn FlowSource>) -> Self {
        self.upstream = Some(upstream);
        self.flows = Some(flows);
        self
    }
}

/// JSON error body: `{ "error": "...", "code": "..." }`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
    retry_after_secs: Option<u64>,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            retry_after_secs: None,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "BAD_REQUEST", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "NOT_FOUND", message)
    }
}

impl From<HubError> for ApiError {
    fn from(e: HubError) -> Self {
        let status = match e {
            HubError::CapacityExceeded { .. } | HubError::ShuttingDown => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            HubError::ConnectionNotFound(_) => StatusCode::NOT_FOUND,
        };
        Self::new(status, e.code(), e.to_string())
    }
}

impl From<UpstreamError> for ApiError {
    fn from(e: UpstreamError) -> Self {
        match &e {
            UpstreamError::CircuitOpen { retry_in } => Self {
                retry_after_secs: Some(retry_in.as_secs().max(1)),
                ..Self::new(StatusCode::SERVICE_UNAVAILABLE, "CIRCUIT_OPEN", e.to_string())
            },
            UpstreamError::Timeout(_) => {
                Self::new(StatusCode::GATEWAY_TIMEOUT, "UPSTREAM_TIMEOUT", e.to_string())
            }
            _ => Self::new(StatusCode::BAD_GATEWAY, "UPSTREAM_ERROR", e.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({ "error": self.message, "code": self.code }));
        let mut response = (self.status, body).into_response();
        if let Some(secs) = self.retry_after_secs {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Build the axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/events", get(events_handler))
        .route("/events/stats", get(stats_handler))
        .route("/events/clients", get(clients_handler))
        .route("/events/clients/{id}", delete(disconnect_handler))
        .route("/events/broadcast", post(broadcast_handler))
        .route("/events/{id}/subscribe", post(subscribe_handler))
        .route("/events/{id}/unsubscribe", post(unsubscribe_handler))
        .route("/events/{id}/subscriptions", get(subscriptions_handler))
        .route("/events/{id}/ping", post(ping_handler))
        .route("/events/{id}/send", post(send_handler))
        .route("/upstream/circuit", get(circuit_handler))
        .route("/upstream/circuit/reset", post(circuit_reset_handler))
        .route("/upstream/flows", get(flows_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Bind and serve. Returns once the listener is bound.
pub async fn start(config: ServerConfig, state: AppState) -> Result<ServerHandle, std::io::Error> {
    let router = build_router(state);
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    info!(addr = %local_addr, "flowcast server started");

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    let server = tokio::spawn(async move {
        let service = router.into_make_service_with_connect_info::<SocketAddr>();
        if let Err(e) = axum::serve(listener, service)
            .with_graceful_shutdown(signal.cancelled_owned())
            .await
        {
            tracing::error!(error = %e, "server error");
        }
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        addr: local_addr,
        shutdown,
        server,
    })
}

/// Handle returned by `start()`.
pub struct ServerHandle {
    pub port: u16,
    pub addr: SocketAddr,
    shutdown: CancellationToken,
    server: JoinHandle<()>,
}

impl ServerHandle {
    /// Stop accepting connections and wait for in-flight requests. Open
    /// event streams only finish once the hub has closed them.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        let _ = self.server.await;
    }
}

#[derive(Debug, Default, Deserialize)]
struct EventsQuery {
    /// Comma-separated event types to subscribe to on connect.
    types: Option<String>,
}

/// Removes the connection from the hub when the response body is dropped.
struct DisconnectGuard {
    hub: Arc<SseHub>,
    id: ConnectionId,
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        self.hub.disconnect(&self.id);
    }
}

fn header_str(headers: &HeaderMap, name: impl header::AsHeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn parse_types(raw: Option<&str>) -> Vec<String> {
    match raw {
        Some(raw) => raw
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect(),
        // Heartbeats keep an otherwise idle stream alive through health checks.
        None => vec![event_types::HEARTBEAT.to_string()],
    }
}

/// GET /events - open an event stream.
async fn events_handler(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Query(query): Query<EventsQuery>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let info = ClientInfo {
        owner: header_str(&headers, USER_ID_HEADER),
        user_agent: header_str(&headers, header::USER_AGENT),
        remote_addr: Some(remote.to_string()),
    };

    let (id, rx) = state.hub.connect(info)?;
    let guard = DisconnectGuard {
        hub: Arc::clone(&state.hub),
        id: id.clone(),
    };
    let types = parse_types(query.types.as_deref());
    if !types.is_empty() {
        state.hub.subscribe(&id, types)?;
    }

    // The guard lives as long as the stream, so dropping the response
    // body unregisters the connection.
    let stream = ReceiverStream::new(rx).map(move |frame| {
        let _guard = &guard;
        Ok::<_, Infallible>(frame.to_sse_event())
    });

    Ok(Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubscribeRequest {
    event_types: Vec<String>,
    #[serde(default)]
    filter: Option<EventFilter>,
}

/// POST /events/{id}/subscribe
async fn subscribe_handler(
    State(state): State<AppState>,
    Path(id): Path<ConnectionId>,
    Json(req): Json<SubscribeRequest>,
) -> ApiResult<impl IntoResponse> {
    if req.event_types.is_empty() {
        return Err(ApiError::bad_request("eventTypes must not be empty"));
    }
    match req.filter {
        Some(filter) => {
            for event_type in &req.event_types {
                state.hub.subscribe_with_filter(&id, event_type, filter.clone())?;
            }
        }
        None => state.hub.subscribe(&id, req.event_types)?,
    }
    Ok(Json(state.hub.subscriptions(&id)?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UnsubscribeRequest {
    event_types: Vec<String>,
}

/// POST /events/{id}/unsubscribe
async fn unsubscribe_handler(
    State(state): State<AppState>,
    Path(id): Path<ConnectionId>,
    Json(req): Json<UnsubscribeRequest>,
) -> ApiResult<impl IntoResponse> {
    state.hub.unsubscribe(&id, &req.event_types)?;
    Ok(Json(state.hub.subscriptions(&id)?))
}

/// GET /events/{id}/subscriptions
async fn subscriptions_handler(
    State(state): State<AppState>,
    Path(id): Path<ConnectionId>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.hub.subscriptions(&id)?))
}

/// POST /events/{id}/ping - heartbeat acknowledgement from the client.
async fn ping_handler(
    State(state): State<AppState>,
    Path(id): Path<ConnectionId>,
) -> ApiResult<impl IntoResponse> {
    state.hub.touch(&id)?;
    Ok(Json(json!({ "ok": true })))
}

#[derive(Debug, Deserialize)]
struct EventRequest {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    data: Value,
    #[serde(default)]
    filter: Option<EventFilter>,
}

fn event_from_request(req: EventRequest) -> ApiResult<(Event, Option<EventFilter>)> {
    if req.event_type.is_empty() || req.event_type.contains(['\r', '\n']) {
        return Err(ApiError::bad_request("type must be a non-empty single line"));
    }
    Ok((Event::new(req.event_type, req.data), req.filter))
}

#[derive(Debug, Serialize)]
struct DeliveryResponse {
    delivered: usize,
}

/// POST /events/{id}/send - deliver to one connection, ignoring subscriptions.
async fn send_handler(
    State(state): State<AppState>,
    Path(id): Path<ConnectionId>,
    Json(req): Json<EventRequest>,
) -> ApiResult<impl IntoResponse> {
    let (event, _) = event_from_request(req)?;
    let delivered = state.hub.send_to_connection(&id, &event)?;
    Ok(Json(DeliveryResponse {
        delivered: usize::from(delivered),
    }))
}

/// POST /events/broadcast
async fn broadcast_handler(
    State(state): State<AppState>,
    Json(req): Json<EventRequest>,
) -> ApiResult<impl IntoResponse> {
    let (event, filter) = event_from_request(req)?;
    let delivered = state.hub.broadcast(&event, filter.as_ref());
    Ok(Json(DeliveryResponse { delivered }))
}

/// GET /events/stats
async fn stats_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.hub.stats())
}

/// GET /events/clients
async fn clients_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.hub.clients())
}

#[derive(Debug, Default, Deserialize)]
struct DisconnectQuery {
    reason: Option<String>,
}

/// DELETE /events/clients/{id}
async fn disconnect_handler(
    State(state): State<AppState>,
    Path(id): Path<ConnectionId>,
    Query(query): Query<DisconnectQuery>,
) -> ApiResult<impl IntoResponse> {
    let reason = query.reason.as_deref().unwrap_or("disconnected by operator");
    state.hub.force_disconnect(&id, reason)?;
    Ok(StatusCode::NO_CONTENT)
}

fn upstream(state: &AppState) -> ApiResult<&Arc<ResilientClient>> {
    state
        .upstream
        .as_ref()
        .ok_or_else(|| ApiError::not_found("no upstream configured"))
}

/// GET /upstream/circuit
async fn circuit_handler(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(upstream(&state)?.stats()))
}

/// POST /upstream/circuit/reset
async fn circuit_reset_handler(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let client = upstream(&state)?;
    client.reset();
    Ok(Json(client.stats()))
}

/// GET /upstream/flows - current flow configuration, through the breaker.
async fn flows_handler(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let source = state
        .flows
        .as_ref()
        .ok_or_else(|| ApiError::not_found("no upstream configured"))?;
    Ok(Json(source.fetch_flows().await?))
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let shutting_down = state.hub.is_shutting_down();
    let status = if shutting_down {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    let body = json!({
        "status": if shutting_down { "shutting_down" } else { "healthy" },
        "connections": state.hub.active_connections(),
        "upstream": state.upstream.as_ref().map(|u| u.state()),
    });
    (status, Json(body))
}
