//! Server-sent event broadcast hub.
//!
//! [`SseHub`] owns the connection registry and dispatches events to
//! subscribers; [`EventListener`] turns upstream flow changes into events;
//! [`server`] exposes both over HTTP.

pub mod connection;
pub mod filter;
pub mod frame;
pub mod hub;
pub mod listener;
mod monitor;
pub mod server;

pub use connection::{ClientInfo, ConnectionSummary, SubscriptionSet};
pub use filter::EventFilter;
pub use frame::{FrameError, FrameReceiver, SseFrame};
pub use hub::{BroadcastStats, HubConfig, SseHub};
pub use listener::{diff_snapshots, EventListener, FlowSnapshot};
pub use server::{build_router, start, ApiError, AppState, ServerConfig, ServerHandle};
