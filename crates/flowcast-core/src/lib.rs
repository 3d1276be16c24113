//! Shared types for flowcast: identifiers, the event model, the error
//! taxonomy and layered settings.

pub mod errors;
pub mod events;
pub mod ids;
pub mod settings;

pub use errors::{HubError, UpstreamError};
pub use events::{event_types, Event};
pub use ids::{ConnectionId, MessageId};
