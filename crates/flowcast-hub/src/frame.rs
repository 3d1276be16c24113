use std::sync::Arc;
use std::time::Duration;

use axum::response::sse;
use flowcast_core::{Event, MessageId};
use tokio::sync::mpsc;

/// Receiving side of a connection's send queue.
pub type FrameReceiver = mpsc::Receiver<Arc<SseFrame>>;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("event type {0:?} cannot contain line breaks")]
    InvalidEventType(String),
    #[error("failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),
}

/// One server-sent-events message, encoded once and shared by every
/// recipient of a broadcast.
///
/// On the wire it becomes `id:`, `event:`, optional `retry:` and `data:`
/// lines followed by a blank line (see [`SseFrame::to_sse_event`]).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SseFrame {
    pub id: MessageId,
    pub event: String,
    pub retry: Option<Duration>,
    /// JSON encoding of the whole [`Event`].
    pub data: String,
}

impl SseFrame {
    /// Frame carrying the JSON encoding of `event` under a fresh message id.
    pub fn from_event(event: &Event) -> Result<Self, FrameError> {
        if event.event_type.contains(['\r', '\n']) {
            return Err(FrameError::InvalidEventType(event.event_type.clone()));
        }
        Ok(Self {
            id: MessageId::new(),
            event: event.event_type.clone(),
            retry: None,
            data: serde_json::to_string(event)?,
        })
    }

    pub fn with_retry(mut self, retry: Duration) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Build the axum event. Field order follows call order.
    pub fn to_sse_event(&self) -> sse::Event {
        let event = sse::Event::default().id(self.id.as_str()).event(&self.event);
        let event = match self.retry {
            Some(retry) => event.retry(retry),
            None => event,
        };
        event.data(&self.data)
    }
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;

    use axum::response::sse::Sse;
    use axum::response::IntoResponse;
    use flowcast_core::event_types;
    use serde_json::json;

    use super::*;

    async fn wire(frames: Vec<SseFrame>) -> String {
        let stream = futures::stream::iter(
            frames
                .into_iter()
                .map(|frame| Ok::<_, Infallible>(frame.to_sse_event())),
        );
        let body = Sse::new(stream).into_response().into_body();
        let bytes = axum::body::to_bytes(body, usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn wire_format_is_id_event_retry_data() {
        let frame = SseFrame {
            id: MessageId::from_raw("msg_1"),
            event: "flow".into(),
            retry: Some(Duration::from_millis(5000)),
            data: r#"{"type":"flow"}"#.into(),
        };
        assert_eq!(
            wire(vec![frame]).await,
            "id: msg_1\nevent: flow\nretry: 5000\ndata: {\"type\":\"flow\"}\n\n"
        );
    }

    #[tokio::test]
    async fn retry_line_is_omitted_when_unset() {
        let frame = SseFrame {
            id: MessageId::from_raw("msg_2"),
            event: "heartbeat".into(),
            retry: None,
            data: "{}".into(),
        };
        assert_eq!(
            wire(vec![frame]).await,
            "id: msg_2\nevent: heartbeat\ndata: {}\n\n"
        );
    }

    #[test]
    fn from_event_encodes_whole_event() {
        let event = Event::new(event_types::FLOW, json!({"flowId": "f1"}));
        let frame = SseFrame::from_event(&event).unwrap();
        assert_eq!(frame.event, "flow");
        assert!(frame.id.as_str().starts_with("msg_"));
        assert_eq!(frame.retry, None);

        let decoded: Event = serde_json::from_str(&frame.data).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn each_message_gets_a_fresh_id() {
        let event = Event::heartbeat(1);
        let a = SseFrame::from_event(&event).unwrap();
        let b = SseFrame::from_event(&event).unwrap();
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn line_breaks_in_event_type_are_rejected() {
        let event = Event::new("flow\nevent: spoofed", json!({}));
        assert!(matches!(
            SseFrame::from_event(&event),
            Err(FrameError::InvalidEventType(_))
        ));
    }
}
